//! Local development certificates.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::fs;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};

use crate::error::{CertError, ProxyError};

/// Root CA certificate validity period (10 years)
const CA_VALIDITY_DAYS: i64 = 3650;
/// Leaf certificate validity period (1 year)
const LEAF_VALIDITY_DAYS: i64 = 365;

const CA_COMMON_NAME: &str = "Connected Pages Local Development CA";
const ORGANIZATION: &str = "Connected Pages";

const CERT_FILENAME: &str = "fullchain.pem";
const KEY_FILENAME: &str = "privkey.pem";
const CA_FILENAME: &str = "ca.crt";

/// PEM-encoded certificate (chain) and private key.
#[derive(Clone)]
pub struct CertificatePair {
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for CertificatePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificatePair")
            .field("cert_pem", &self.cert_pem.len())
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// A freshly generated CA and the leaf it signed.
#[derive(Debug, Clone)]
pub struct DevCertificates {
    pub ca: CertificatePair,
    /// `cert_pem` holds the leaf followed by the CA certificate
    pub leaf: CertificatePair,
}

fn ca_params(now: OffsetDateTime) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
    params
}

/// Generate a development CA and a leaf certificate for `names`.
///
/// Names that parse as IP addresses become IP SANs, everything else DNS SANs.
pub fn generate_dev_certificates(names: &[&str]) -> Result<DevCertificates, CertError> {
    let primary = names
        .first()
        .ok_or_else(|| CertError::InvalidName(String::new()))?;
    let now = OffsetDateTime::now_utc();

    let ca_key = KeyPair::generate().map_err(|e| CertError::KeypairGeneration(e.to_string()))?;
    let ca_cert = ca_params(now)
        .self_signed(&ca_key)
        .map_err(|e| CertError::CertificateGeneration(e.to_string()))?;
    let ca = CertificatePair {
        cert_pem: ca_cert.pem(),
        key_pem: ca_key.serialize_pem(),
    };
    let issuer = Issuer::new(ca_params(now), ca_key);

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, *primary);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut sans = Vec::new();
    for name in names {
        if let Ok(ip) = name.parse::<std::net::IpAddr>() {
            sans.push(SanType::IpAddress(ip));
        } else {
            let dns = (*name)
                .try_into()
                .map_err(|_| CertError::InvalidName((*name).to_string()))?;
            sans.push(SanType::DnsName(dns));
        }
    }
    params.subject_alt_names = sans;
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    let leaf_key = KeyPair::generate().map_err(|e| CertError::KeypairGeneration(e.to_string()))?;
    let leaf_cert = params
        .signed_by(&leaf_key, &issuer)
        .map_err(|e| CertError::CertificateGeneration(format!("Failed to sign leaf: {e}")))?;

    Ok(DevCertificates {
        leaf: CertificatePair {
            cert_pem: format!("{}{}", leaf_cert.pem(), ca.cert_pem),
            key_pem: leaf_key.serialize_pem(),
        },
        ca,
    })
}

/// Fixed on-disk location of the proxy's TLS material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
}

impl TlsFiles {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert_path: dir.join(CERT_FILENAME),
            key_path: dir.join(KEY_FILENAME),
            ca_path: dir.join(CA_FILENAME),
        }
    }

    pub fn exists(&self) -> bool {
        self.cert_path.is_file() && self.key_path.is_file()
    }

    /// Load the certificate chain and key.
    ///
    /// Missing files are reported as [`ProxyError::MissingCertificate`] so
    /// callers can fail before any orchestration begins.
    pub fn load(&self) -> Result<CertificatePair, ProxyError> {
        for path in [&self.cert_path, &self.key_path] {
            if !path.is_file() {
                return Err(ProxyError::MissingCertificate(path.clone()));
            }
        }
        let cert_pem = fs::read_to_string(&self.cert_path)
            .map_err(|e| ProxyError::FileRead(self.cert_path.clone(), e))?;
        let key_pem = fs::read_to_string(&self.key_path)
            .map_err(|e| ProxyError::FileRead(self.key_path.clone(), e))?;
        Ok(CertificatePair { cert_pem, key_pem })
    }

    /// Write generated certificates. The private key is only readable by
    /// the current user.
    pub fn write(&self, certs: &DevCertificates) -> Result<(), CertError> {
        if let Some(parent) = self.cert_path.parent() {
            fs::create_dir_all(parent).map_err(|e| CertError::FileWrite(parent.to_path_buf(), e))?;
        }
        fs::write(&self.cert_path, certs.leaf.cert_pem.as_bytes())
            .map_err(|e| CertError::FileWrite(self.cert_path.clone(), e))?;
        fs::write(&self.key_path, certs.leaf.key_pem.as_bytes())
            .map_err(|e| CertError::FileWrite(self.key_path.clone(), e))?;
        fs::write(&self.ca_path, certs.ca.cert_pem.as_bytes())
            .map_err(|e| CertError::FileWrite(self.ca_path.clone(), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.key_path, fs::Permissions::from_mode(0o600))
                .map_err(|e| CertError::FileWrite(self.key_path.clone(), e))?;
        }

        Ok(())
    }
}
