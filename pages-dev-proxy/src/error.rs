use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the local reverse proxy
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Dev proxy could not bind on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS certificate not found at {0} (run `pages certs` to create one)")]
    MissingCertificate(PathBuf),

    #[error("Invalid TLS material: {0}")]
    Tls(String),

    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
}

/// Errors from generating or storing development certificates
#[derive(Debug, Error)]
pub enum CertError {
    #[error("Failed to generate keypair: {0}")]
    KeypairGeneration(String),

    #[error("Failed to generate certificate: {0}")]
    CertificateGeneration(String),

    #[error("Invalid certificate name '{0}'")]
    InvalidName(String),

    #[error("Failed to write file {0}: {1}")]
    FileWrite(PathBuf, std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
