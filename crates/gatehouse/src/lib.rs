//! gatehouse is a sidecar reverse proxy that performs OpenID Connect login
//! on behalf of an upstream web application: it drives the Authorization
//! Code Flow with PKCE, keeps the resulting tokens in an encrypted
//! server-side session, and forwards authenticated requests upstream with a
//! bearer access token.

pub mod autologin;
pub mod config;
pub mod cookies;
pub mod crypto;
pub mod handlers;
pub mod metrics;
pub mod oidc;
pub mod proxy;
pub mod redirect;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod token;
