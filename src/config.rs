//! Sandbox configuration
//!
//! All knobs the driver exposes are collected into a single immutable
//! [`SandboxConfig`] before any runtime exists. The configuration is shared
//! read-only across renders via `Arc`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// Errors produced while validating sandbox configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The chunks directory does not exist or cannot be canonicalized
    #[error("invalid chunks directory '{path}': {source}")]
    BadRoot {
        /// The directory as given on the command line
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The chunks directory is not a directory
    #[error("chunks path '{0}' is not a directory")]
    RootNotDirectory(String),

    /// An `--allow-origin` value could not be parsed as `scheme://host[:port]`
    #[error("invalid origin '{0}'")]
    BadOrigin(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Immutable sandbox configuration
///
/// Constructed once by the driver and shared read-only with the host, the
/// resolver and the fetch op. A limit of `0` means unlimited.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Canonical absolute directory bounding module resolution
    pub root_dir: PathBuf,
    /// Maximum V8 heap size in bytes (0 = unlimited)
    pub max_heap_bytes: usize,
    /// Wall-clock deadline per render in milliseconds (0 = unlimited)
    pub max_render_ms: u64,
    /// Normalized `scheme://host[:port]` origins the fetch op may address
    pub allowed_origins: HashSet<String>,
}

impl SandboxConfig {
    /// Validate and build a configuration.
    ///
    /// The chunks directory is canonicalized up front so every containment
    /// check later compares against a symlink-free root. Origins are
    /// normalized so that e.g. `https://h` and `https://h:443` compare equal.
    pub fn new(
        root_dir: &Path,
        max_heap_bytes: usize,
        max_render_ms: u64,
        origins: &[String],
    ) -> ConfigResult<Arc<Self>> {
        let root_dir = root_dir
            .canonicalize()
            .map_err(|source| ConfigError::BadRoot {
                path: root_dir.display().to_string(),
                source,
            })?;

        if !root_dir.is_dir() {
            return Err(ConfigError::RootNotDirectory(
                root_dir.display().to_string(),
            ));
        }

        let mut allowed_origins = HashSet::new();
        for origin in origins {
            allowed_origins.insert(normalize_origin(origin)?);
        }

        Ok(Arc::new(Self {
            root_dir,
            max_heap_bytes,
            max_render_ms,
            allowed_origins,
        }))
    }

    /// Check whether a parsed URL's origin is on the allowlist.
    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        let origin = url.origin();
        origin.is_tuple() && self.allowed_origins.contains(&origin.ascii_serialization())
    }
}

/// Normalize an `--allow-origin` value into its canonical ASCII form.
///
/// Default ports are elided and hosts are lowercased, matching what
/// [`url::Origin::ascii_serialization`] produces for request URLs.
fn normalize_origin(origin: &str) -> ConfigResult<String> {
    let url = Url::parse(origin).map_err(|_| ConfigError::BadOrigin(origin.to_string()))?;
    let parsed = url.origin();
    if !parsed.is_tuple() {
        return Err(ConfigError::BadOrigin(origin.to_string()));
    }
    Ok(parsed.ascii_serialization())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_with_origins(origins: &[&str]) -> Arc<SandboxConfig> {
        let dir = TempDir::new().unwrap();
        let origins: Vec<String> = origins.iter().map(|s| s.to_string()).collect();
        SandboxConfig::new(dir.path(), 0, 0, &origins).unwrap()
    }

    #[test]
    fn test_root_must_exist() {
        let result = SandboxConfig::new(Path::new("/no/such/dir/anywhere"), 0, 0, &[]);
        assert!(matches!(result, Err(ConfigError::BadRoot { .. })));
    }

    #[test]
    fn test_root_canonicalized() {
        let dir = TempDir::new().unwrap();
        let config = SandboxConfig::new(dir.path(), 0, 0, &[]).unwrap();
        assert!(config.root_dir.is_absolute());
    }

    #[test]
    fn test_origin_default_port_elided() {
        let config = config_with_origins(&["https://api.example.com:443"]);
        assert!(config.allowed_origins.contains("https://api.example.com"));
    }

    #[test]
    fn test_origin_case_normalized() {
        let config = config_with_origins(&["https://API.Example.COM"]);
        assert!(config.allowed_origins.contains("https://api.example.com"));
    }

    #[test]
    fn test_origin_explicit_port_kept() {
        let config = config_with_origins(&["http://localhost:8080"]);
        assert!(config.allowed_origins.contains("http://localhost:8080"));
    }

    #[test]
    fn test_bad_origin_rejected() {
        let dir = TempDir::new().unwrap();
        let result = SandboxConfig::new(dir.path(), 0, 0, &["not an origin".to_string()]);
        assert!(matches!(result, Err(ConfigError::BadOrigin(_))));
    }

    #[test]
    fn test_opaque_origin_rejected() {
        let dir = TempDir::new().unwrap();
        let result = SandboxConfig::new(dir.path(), 0, 0, &["data:text/plain".to_string()]);
        assert!(matches!(result, Err(ConfigError::BadOrigin(_))));
    }

    #[test]
    fn test_is_origin_allowed() {
        let config = config_with_origins(&["https://api.example.com"]);

        let allowed = Url::parse("https://api.example.com/v1/data?q=1").unwrap();
        assert!(config.is_origin_allowed(&allowed));

        let denied = Url::parse("https://evil.example.com/v1/data").unwrap();
        assert!(!config.is_origin_allowed(&denied));

        let wrong_scheme = Url::parse("http://api.example.com/v1").unwrap();
        assert!(!config.is_origin_allowed(&wrong_scheme));
    }
}
