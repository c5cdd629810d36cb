use std::path::{Path, PathBuf};

use super::TunnelError;

/// Bundled tunnel executable relative to the assets directory, by OS.
pub fn bundled_binary(os: &str) -> Option<&'static str> {
    match os {
        "windows" => Some("ngrok/win32/ngrok.exe"),
        "macos" => Some("ngrok/darwin/ngrok"),
        "linux" => Some("ngrok/linux/ngrok"),
        _ => None,
    }
}

/// Where the tunnel executable comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelBinary {
    /// Explicit executable, bypassing the bundled table
    pub binary: Option<PathBuf>,
    /// Directory holding bundled assets; defaults to `<exe dir>/assets`
    pub assets_dir: Option<PathBuf>,
}

impl TunnelBinary {
    #[cfg(test)]
    pub fn explicit(path: impl Into<PathBuf>) -> Self {
        Self {
            binary: Some(path.into()),
            assets_dir: None,
        }
    }

    /// Resolve the executable for the host platform.
    pub fn resolve(&self) -> Result<PathBuf, TunnelError> {
        self.resolve_for(std::env::consts::OS, crate::paths::exe_dir().as_deref())
    }

    /// Fails with [`TunnelError::UnsupportedPlatform`] before anything is
    /// spawned when `os` has no bundled binary, even if an explicit binary
    /// is configured.
    pub(crate) fn resolve_for(
        &self,
        os: &str,
        exe_dir: Option<&Path>,
    ) -> Result<PathBuf, TunnelError> {
        let relative =
            bundled_binary(os).ok_or_else(|| TunnelError::UnsupportedPlatform(os.to_string()))?;

        if let Some(binary) = &self.binary {
            return Ok(binary.clone());
        }

        let assets = match (&self.assets_dir, exe_dir) {
            (Some(dir), _) => dir.clone(),
            (None, Some(exe_dir)) => exe_dir.join("assets"),
            (None, None) => PathBuf::from("assets"),
        };
        let path = assets.join(relative);
        if !path.is_file() {
            return Err(TunnelError::BinaryNotFound(path));
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bundled_table_covers_three_platforms() {
        assert_eq!(bundled_binary("windows"), Some("ngrok/win32/ngrok.exe"));
        assert_eq!(bundled_binary("macos"), Some("ngrok/darwin/ngrok"));
        assert_eq!(bundled_binary("linux"), Some("ngrok/linux/ngrok"));
        assert_eq!(bundled_binary("freebsd"), None);
    }

    #[test]
    fn unsupported_platform_fails_even_with_explicit_binary() {
        let binary = TunnelBinary::explicit("/opt/ngrok");
        let err = binary.resolve_for("freebsd", None).unwrap_err();
        assert!(matches!(err, TunnelError::UnsupportedPlatform(os) if os == "freebsd"));
    }

    #[test]
    fn explicit_binary_is_used_as_is() {
        let binary = TunnelBinary::explicit("/opt/ngrok");
        assert_eq!(
            binary.resolve_for("linux", None).unwrap(),
            PathBuf::from("/opt/ngrok")
        );
    }

    #[test]
    fn bundled_binary_resolves_under_exe_assets() {
        let exe_dir = TempDir::new().unwrap();
        let path = exe_dir.path().join("assets/ngrok/darwin/ngrok");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "").unwrap();

        let got = TunnelBinary::default()
            .resolve_for("macos", Some(exe_dir.path()))
            .unwrap();
        assert_eq!(got, path);
    }

    #[test]
    fn missing_bundled_binary_is_reported() {
        let assets = TempDir::new().unwrap();
        let binary = TunnelBinary {
            binary: None,
            assets_dir: Some(assets.path().to_path_buf()),
        };
        let err = binary.resolve_for("windows", None).unwrap_err();
        match err {
            TunnelError::BinaryNotFound(path) => {
                assert_eq!(path, assets.path().join("ngrok/win32/ngrok.exe"))
            }
            other => panic!("expected BinaryNotFound, got {other:?}"),
        }
    }
}
