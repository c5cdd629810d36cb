use std::path::PathBuf;
#[cfg(test)]
use std::sync::{Mutex, MutexGuard, OnceLock};

pub const HOME_ENV: &str = "PAGES_HOME";

/// Get the global Connected Pages home directory.
///
/// `PAGES_HOME` wins when set; otherwise `~/.pages`.
pub fn pages_home_dir() -> Result<PathBuf, std::io::Error> {
    if let Ok(v) = std::env::var(HOME_ENV)
        && !v.trim().is_empty()
    {
        return Ok(PathBuf::from(v));
    }

    let home = dirs::home_dir().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine home directory",
        )
    })?;

    Ok(home.join(".pages"))
}

/// Directory holding the dev proxy's TLS material.
pub fn certs_dir() -> Result<PathBuf, std::io::Error> {
    Ok(pages_home_dir()?.join("certs"))
}

/// Directory of the running executable; bundled assets live next to it.
pub fn exe_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()?
        .parent()
        .map(|p| p.to_path_buf())
}

#[cfg(test)]
pub(crate) fn test_home_env_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
