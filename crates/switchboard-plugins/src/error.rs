//! Error types crossing the crate boundary.
//!
//! [`PolicyError`] is the `(domain, code, message)` triple the broker hands
//! back to IPC callers when a plugin vetoes something. [`LoadError`] covers
//! plugin-module discovery and is only ever logged and collected into a
//! [`crate::LoadReport`]; it never reaches dispatch.

use std::path::PathBuf;

use thiserror::Error;

use crate::constants::ACCESS_DENIED_CODE;
use crate::constants::ACCESS_DENIED_DOMAIN;

/// Structured denial returned to the original caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{domain} ({code}): {message}")]
pub struct PolicyError {
    pub domain: String,
    pub code: i32,
    pub message: String,
}

impl PolicyError {
    pub fn new(domain: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            code,
            message: message.into(),
        }
    }

    /// Denial in the uniform `access-denied` domain.
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ACCESS_DENIED_DOMAIN, ACCESS_DENIED_CODE, message)
    }

    pub fn is_access_denied(&self) -> bool {
        self.domain == ACCESS_DENIED_DOMAIN
    }
}

/// Failure to load one plugin candidate.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read plugin directory `{path}`: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot open plugin module `{path}`: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
    #[error("plugin module `{path}` has no entry point `{symbol}`: {source}")]
    MissingEntryPoint {
        path: PathBuf,
        symbol: String,
        #[source]
        source: libloading::Error,
    },
    #[error("plugin module `{path}` exposes no objects")]
    Empty { path: PathBuf },
}

impl LoadError {
    /// Path of the candidate (or directory) the error refers to.
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::Directory { path, .. }
            | Self::Open { path, .. }
            | Self::MissingEntryPoint { path, .. }
            | Self::Empty { path } => path,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_denied_uses_uniform_domain() {
        let err = PolicyError::access_denied("nope");
        assert_eq!(err.domain, "access-denied");
        assert_eq!(err.code, ACCESS_DENIED_CODE);
        assert!(err.is_access_denied());
        assert_eq!(err.to_string(), "access-denied (9): nope");
    }

    #[test]
    fn plugin_supplied_domain_is_preserved() {
        let err = PolicyError::new("permission-denied", 3, "forbidden channel type");
        assert!(!err.is_access_denied());
        assert_eq!(err.message, "forbidden channel type");
    }

    #[test]
    fn load_error_reports_path() {
        let err = LoadError::Empty {
            path: PathBuf::from("/tmp/sb-plugin-x.so"),
        };
        assert_eq!(err.path(), std::path::Path::new("/tmp/sb-plugin-x.so"));
        assert!(err.to_string().contains("exposes no objects"));
    }
}
