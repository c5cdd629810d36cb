use pages_dev_proxy::{TlsFiles, generate_dev_certificates};

use crate::output;
use crate::paths;

/// Names the dev proxy certificate is valid for.
const CERT_NAMES: &[&str] = &["localhost", "127.0.0.1", "::1"];

pub fn run(force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let dir = paths::certs_dir()?;
    let files = TlsFiles::in_dir(&dir);

    if files.exists() && !force {
        output::warning(&format!(
            "TLS material already exists in {} (use --force to replace it)",
            dir.display()
        ));
        return Ok(());
    }

    let certs = generate_dev_certificates(CERT_NAMES)?;
    files.write(&certs)?;

    output::success(&format!("Wrote dev proxy certificate to {}", files.cert_path.display()));
    output::muted(&format!(
        "Trust {} in your browser or OS keychain to avoid certificate warnings.",
        files.ca_path.display()
    ));
    Ok(())
}
