//! Pages Dev Proxy
//!
//! HTTPS listener on a fixed local port that forwards HTTP and WebSocket
//! traffic to a project's local dev server, adding a permissive CORS header
//! so the hosted web app can embed locally served assets.
//!
//! - **Proxy**: [`ReverseProxy`] and its disposable [`ProxyHandle`]
//! - **TLS**: loading the `{cert, key}` pair the listener presents
//! - **Certificates**: generating a local development CA and leaf pair

mod cert;
mod error;
mod proxy;
mod tls;

pub use cert::{CertificatePair, DevCertificates, TlsFiles, generate_dev_certificates};
pub use error::*;
pub use proxy::{ProxyHandle, ReverseProxy};
pub use tls::server_config;
