use axum::routing::get;
use axum::Router;
use http::header::CACHE_CONTROL;
use http::HeaderValue;
use std::sync::Arc;
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::autologin::AutoLogin;
use crate::config::Config;
use crate::cookies::CookieOptions;
use crate::crypto::{self, Crypter};
use crate::handlers::{self, AppState, Handler};
use crate::metrics;
use crate::oidc::client::RelyingParty;
use crate::oidc::provider::Provider;
use crate::proxy::Upstream;
use crate::session::manager::SessionManager;
use crate::session::store::{MemorySessionStore, RedisSessionStore, SessionStore};

const IDP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const UPSTREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the full application router: the `/oauth2/*` endpoints under the
/// ingress context path, everything else falling through to the proxy.
pub fn router(state: AppState) -> Router {
	let oauth2 = Router::new()
		.route("/oauth2/login", get(handlers::login::login))
		.route("/oauth2/callback", get(handlers::callback::callback))
		.route("/oauth2/logout", get(handlers::logout::logout))
		.route("/oauth2/logout/callback", get(handlers::logout::logout_callback))
		.route(
			"/oauth2/logout/frontchannel",
			get(handlers::logout::front_channel_logout),
		)
		.route("/oauth2/session", get(handlers::session_api::session_info))
		.route(
			"/oauth2/session/refresh",
			get(handlers::session_api::session_refresh).post(handlers::session_api::session_refresh),
		)
		.layer(SetResponseHeaderLayer::overriding(
			CACHE_CONTROL,
			HeaderValue::from_static("no-store"),
		));

	let prefix = state.config.ingress_path();
	let routed = if prefix.is_empty() {
		oauth2
	} else {
		Router::new().nest(&prefix, oauth2)
	};

	routed
		.fallback(handlers::default::default)
		.layer(PropagateRequestIdLayer::x_request_id())
		.layer(TraceLayer::new_for_http())
		.layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
		.with_state(state)
}

/// Wires up every component from configuration. Fails fast on anything that
/// would leave the proxy unable to authenticate traffic.
pub async fn build_state(config: Config) -> anyhow::Result<AppState> {
	let key = crypto::key_from_config(
		config
			.encryption_key
			.as_ref()
			.map(|k| secrecy::ExposeSecret::expose_secret(k)),
	)?;
	let crypter = Arc::new(Crypter::new(&key)?);

	let idp_http = reqwest::Client::builder()
		.timeout(IDP_REQUEST_TIMEOUT)
		.build()?;
	let provider = Provider::discover(idp_http.clone(), &config.openid.well_known_url).await?;
	provider.spawn_jwks_refresh();
	info!(issuer = %provider.metadata().issuer, "discovered identity provider");

	let relying_party = Arc::new(RelyingParty::new(&config, provider, idp_http));

	let store: Arc<dyn SessionStore> = match &config.redis {
		Some(redis) => Arc::new(RedisSessionStore::new(redis)?),
		None => {
			warn!("no redis configured; sessions are process-local and do not survive restarts");
			Arc::new(MemorySessionStore::new())
		},
	};

	let sessions = Arc::new(SessionManager::new(
		&config,
		store,
		crypter.clone(),
		relying_party.clone(),
	));

	let auto_login = AutoLogin::new(config.auto_login, &config.auto_login_ignore_paths)?;

	// A proxy must never follow redirects on the upstream's behalf.
	let upstream_http = reqwest::Client::builder()
		.redirect(reqwest::redirect::Policy::none())
		.timeout(UPSTREAM_REQUEST_TIMEOUT)
		.build()?;
	let upstream = Upstream::new(upstream_http, config.upstream.clone());

	Ok(Arc::new(Handler {
		config,
		crypter,
		relying_party,
		sessions,
		auto_login,
		upstream,
		cookie_options: CookieOptions::default(),
	}))
}

/// Runs the proxy and the metrics listener until SIGINT/SIGTERM.
pub async fn run(config: Config) -> anyhow::Result<()> {
	metrics::init();

	let metrics_bind = config.metrics_bind_address;
	let bind = config.bind_address;
	let state = build_state(config).await?;
	let app = router(state);

	let metrics_listener = tokio::net::TcpListener::bind(metrics_bind).await?;
	info!(address = %metrics_bind, "serving metrics");
	tokio::spawn(async move {
		let metrics_app = Router::new().route("/metrics", get(serve_metrics));
		if let Err(e) = axum::serve(metrics_listener, metrics_app).await {
			warn!(error = %e, "metrics server terminated");
		}
	});

	let listener = tokio::net::TcpListener::bind(bind).await?;
	info!(address = %bind, "serving requests");
	axum::serve(listener, app)
		.with_graceful_shutdown(shutdown_signal())
		.await?;
	info!("shutdown complete");
	Ok(())
}

async fn serve_metrics() -> String {
	metrics::render().unwrap_or_default()
}

async fn shutdown_signal() {
	let ctrl_c = async {
		let _ = tokio::signal::ctrl_c().await;
	};
	#[cfg(unix)]
	let terminate = async {
		match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
			Ok(mut signal) => {
				signal.recv().await;
			},
			Err(_) => std::future::pending::<()>().await,
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
	info!("shutdown signal received");
}
