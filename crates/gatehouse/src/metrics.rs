//! Prometheus metrics: session-store latency, identity-provider call
//! outcomes, and login/logout flow counters.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
	pub const STORE_OPERATION_DURATION_SECONDS: &str = "gatehouse_store_operation_duration_seconds";
	pub const IDP_REQUESTS_TOTAL: &str = "gatehouse_idp_requests_total";
	pub const LOGINS_TOTAL: &str = "gatehouse_logins_total";
	pub const LOGOUTS_TOTAL: &str = "gatehouse_logouts_total";
	pub const TOKEN_REFRESHES_TOTAL: &str = "gatehouse_token_refreshes_total";
}

/// Installs the Prometheus recorder. Call once at startup; later calls are
/// no-ops so tests can initialise freely.
pub fn init() {
	if PROMETHEUS_HANDLE.get().is_some() {
		return;
	}
	match PrometheusBuilder::new().install_recorder() {
		Ok(handle) => {
			let _ = PROMETHEUS_HANDLE.set(handle);
		},
		Err(e) => {
			tracing::warn!(error = %e, "prometheus recorder already installed");
		},
	}
}

/// Renders all metrics in Prometheus text format. `None` before [`init`].
pub fn render() -> Option<String> {
	PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Times a session-store operation and records its latency under the
/// operation label, regardless of outcome.
pub async fn observe_store<T, E, F>(operation: &'static str, f: F) -> Result<T, E>
where
	F: Future<Output = Result<T, E>>,
{
	let start = Instant::now();
	let result = f.await;
	histogram!(names::STORE_OPERATION_DURATION_SECONDS, "operation" => operation)
		.record(start.elapsed().as_secs_f64());
	result
}

pub fn record_idp_request(operation: &'static str, outcome: &'static str) {
	counter!(names::IDP_REQUESTS_TOTAL, "operation" => operation, "outcome" => outcome).increment(1);
}

pub fn record_login() {
	counter!(names::LOGINS_TOTAL).increment(1);
}

pub fn record_logout(kind: &'static str) {
	counter!(names::LOGOUTS_TOTAL, "kind" => kind).increment(1);
}

pub fn record_refresh(outcome: &'static str) {
	counter!(names::TOKEN_REFRESHES_TOTAL, "outcome" => outcome).increment(1);
}
