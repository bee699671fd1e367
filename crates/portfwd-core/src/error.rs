use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while configuring or running the forwarder.
///
/// Only [`FwdError::Config`] and [`FwdError::Bind`] are fatal. Everything
/// else is scoped to a single session and is logged at the session boundary.
#[derive(Debug, Error)]
pub enum FwdError {
    #[error("config error: {0}")]
    Config(String),

    #[error("connection to {addr} failed: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection from {0} denied by allowlist")]
    Denied(IpAddr),

    #[error("no valid target: {0}")]
    NoValidTarget(String),

    #[error("cannot read target file {}: {source}", path.display())]
    TargetFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FwdError {
    /// Whether this error should abort startup rather than a single session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FwdError::Config(_) | FwdError::Bind { .. })
    }
}

pub type FwdResult<T> = Result<T, FwdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_startup_errors_are_fatal() {
        assert!(FwdError::Config("bad".into()).is_fatal());
        assert!(!FwdError::Denied("10.0.0.1".parse().unwrap()).is_fatal());
        assert!(!FwdError::NoValidTarget("empty".into()).is_fatal());
        let bind = FwdError::Bind {
            addr: "0.0.0.0:80".into(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(bind.is_fatal());
    }

    #[test]
    fn target_file_error_names_path() {
        let err = FwdError::TargetFile {
            path: PathBuf::from("/nope/targets.txt"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("/nope/targets.txt"));
    }
}
