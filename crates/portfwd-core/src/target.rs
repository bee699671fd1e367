//! Upstream targets and the target list file.
//!
//! A target file holds one candidate per line in the form
//! `[#|+|*]<host>:<port>`. Blank lines are ignored; lines whose port is not
//! a decimal number in `1..=65535` are skipped with a warning. The leading
//! marker character is stripped and carries no meaning.
//!
//! The list is meant to be re-read on every cache miss so that edits take
//! effect without a restart. Nothing here caches it.

use crate::error::{FwdError, FwdResult};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

/// Characters that may prefix the host half of a target line.
pub const TARGET_MARKERS: [char; 3] = ['#', '+', '*'];

/// An upstream `host:port` destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetSpec {
    pub host: String,
    pub port: u16,
}

impl TargetSpec {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Check the invariants a target must hold before it is dialed.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("empty host".to_string());
        }
        if self.port == 0 {
            return Err(format!("port 0 is not valid for {}", self.host));
        }
        Ok(())
    }
}

impl fmt::Display for TargetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse a decimal port in `1..=65535`.
///
/// Only ASCII digits are accepted, so `+80` or `0x50` are rejected even
/// though `u16::from_str` would take the former.
pub fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match s.parse::<u32>() {
        Ok(p) if (1..=65535).contains(&p) => Some(p as u16),
        _ => None,
    }
}

/// Parse a single target line.
///
/// Returns `Ok(None)` for blank lines and `Err(reason)` for lines that
/// cannot be used.
pub fn parse_target_line(line: &str) -> Result<Option<TargetSpec>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (host, port) = line
        .split_once(':')
        .ok_or_else(|| format!("missing ':' in {line:?}"))?;

    let host = host.trim();
    let host = host
        .strip_prefix(|c: char| TARGET_MARKERS.contains(&c))
        .unwrap_or(host)
        .trim();
    if host.is_empty() {
        return Err(format!("empty host in {line:?}"));
    }

    let port = parse_port(port.trim()).ok_or_else(|| format!("invalid port in {line:?}"))?;

    Ok(Some(TargetSpec::new(host, port)))
}

/// Parse the contents of a target file, skipping blank and invalid lines.
pub fn parse_target_list(contents: &str) -> Vec<TargetSpec> {
    contents
        .lines()
        .enumerate()
        .filter_map(|(idx, line)| match parse_target_line(line) {
            Ok(spec) => spec,
            Err(reason) => {
                warn!(line = idx + 1, %reason, "skipping invalid target line");
                None
            }
        })
        .collect()
}

/// Read and parse a target file.
///
/// # Errors
///
/// Returns [`FwdError::TargetFile`] if the file cannot be read. An empty
/// result is not an error here; the resolver decides what that means.
pub fn load_targets(path: &Path) -> FwdResult<Vec<TargetSpec>> {
    let contents = std::fs::read_to_string(path).map_err(|source| FwdError::TargetFile {
        path: path.to_path_buf(),
        source,
    })?;
    let targets = parse_target_list(&contents);
    debug!(path = %path.display(), count = targets.len(), "loaded target list");
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn marker_is_stripped() {
        for line in ["#host1:9001", "+host1:9001", "*host1:9001", "host1:9001"] {
            assert_eq!(
                parse_target_line(line).unwrap(),
                Some(TargetSpec::new("host1", 9001)),
                "line {line:?}"
            );
        }
    }

    #[test]
    fn only_one_marker_is_stripped() {
        assert_eq!(
            parse_target_line("##host:80").unwrap(),
            Some(TargetSpec::new("#host", 80))
        );
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse_target_line("").unwrap(), None);
        assert_eq!(parse_target_line("   \t").unwrap(), None);
    }

    #[test]
    fn bad_ports_are_rejected() {
        assert!(parse_target_line("host:abc").is_err());
        assert!(parse_target_line("host:0").is_err());
        assert!(parse_target_line("host:65536").is_err());
        assert!(parse_target_line("host:+80").is_err());
        assert!(parse_target_line("host:").is_err());
        assert!(parse_target_line("host").is_err());
        assert!(parse_target_line("#:80").is_err());
    }

    #[test]
    fn port_bounds() {
        assert_eq!(parse_port("1"), Some(1));
        assert_eq!(parse_port("65535"), Some(65535));
        assert_eq!(parse_port("0"), None);
        assert_eq!(parse_port("99999999999"), None);
    }

    #[test]
    fn list_keeps_order_and_drops_bad_lines() {
        let targets = parse_target_list("#host1:9001\nhost2:abc\n\nhost3:9003\n");
        assert_eq!(
            targets,
            vec![TargetSpec::new("host1", 9001), TargetSpec::new("host3", 9003)]
        );
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "*a.example:443").unwrap();
        writeln!(file, "b.example:8080").unwrap();
        let targets = load_targets(file.path()).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].to_string(), "a.example:443");
    }

    #[test]
    fn load_missing_file_fails() {
        let err = load_targets(Path::new("/definitely/not/here.txt")).unwrap_err();
        assert!(matches!(err, FwdError::TargetFile { .. }));
    }

    #[test]
    fn validate_rejects_zero_port() {
        assert!(TargetSpec::new("h", 0).validate().is_err());
        assert!(TargetSpec::new(" ", 1).validate().is_err());
        assert!(TargetSpec::new("h", 1).validate().is_ok());
    }
}
