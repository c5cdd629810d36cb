use std::io::BufReader;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::cert::CertificatePair;
use crate::error::{ProxyError, Result};

/// Build the rustls server configuration the proxy listener presents.
///
/// The proxy speaks HTTP/1.1 only so WebSocket upgrades keep working.
pub fn server_config(pair: &CertificatePair) -> Result<Arc<ServerConfig>> {
    let certs = parse_certs(&pair.cert_pem)?;
    let key = parse_key(&pair.key_pem)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls("no certificate found in PEM".to_string()));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::Tls(format!("invalid private key PEM: {e}")))?
        .ok_or_else(|| ProxyError::Tls("no private key found in PEM".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::generate_dev_certificates;

    #[test]
    fn builds_config_from_generated_pair() {
        let certs = generate_dev_certificates(&["localhost"]).unwrap();
        let config = server_config(&certs.leaf).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn rejects_pem_without_certificate() {
        let certs = generate_dev_certificates(&["localhost"]).unwrap();
        let pair = CertificatePair {
            cert_pem: String::new(),
            key_pem: certs.leaf.key_pem,
        };
        assert!(matches!(server_config(&pair), Err(ProxyError::Tls(_))));
    }

    #[test]
    fn rejects_pem_without_key() {
        let certs = generate_dev_certificates(&["localhost"]).unwrap();
        let pair = CertificatePair {
            cert_pem: certs.leaf.cert_pem,
            key_pem: "not a key".to_string(),
        };
        assert!(matches!(server_config(&pair), Err(ProxyError::Tls(_))));
    }
}
