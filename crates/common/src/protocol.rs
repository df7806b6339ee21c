//! Worker to parent wire protocol
//!
//! A worker reports completion by writing a single line to stdout:
//!
//! ```text
//! @@tunnelrun-report {"failureCount":3}
//! ```
//!
//! Everything else a worker prints is ordinary log output. The prefix keeps a
//! test suite that happens to print JSON from being mistaken for a report.

use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::error::{Error, Result};

/// Marker that starts a completion report line
pub const REPORT_PREFIX: &str = "@@tunnelrun-report ";

/// Final message a worker sends once all its test files have run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    pub failure_count: u32,
}

impl CompletionReport {
    pub fn new(failure_count: u32) -> Self {
        Self { failure_count }
    }

    /// Render as a protocol line (no trailing newline)
    pub fn to_line(&self) -> Result<String> {
        Ok(format!("{}{}", REPORT_PREFIX, serde_json::to_string(self)?))
    }

    /// Parse a line of worker output.
    ///
    /// Returns `Ok(None)` for ordinary output and an error for a line that
    /// carries the prefix but a malformed payload.
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        let Some(payload) = line.trim_end().strip_prefix(REPORT_PREFIX) else {
            return Ok(None);
        };
        serde_json::from_str(payload)
            .map(Some)
            .map_err(|e| Error::Protocol(format!("malformed completion report {:?}: {}", payload, e)))
    }

    /// Write the report to a stream and flush it
    pub fn send<W: Write>(&self, mut out: W) -> Result<()> {
        writeln!(out, "{}", self.to_line()?)?;
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_line_shape() {
        let line = CompletionReport::new(3).to_line().unwrap();
        assert_eq!(line, r#"@@tunnelrun-report {"failureCount":3}"#);
    }

    #[test]
    fn test_parse_ignores_ordinary_output() {
        assert_eq!(CompletionReport::parse_line("  3 passing (2s)").unwrap(), None);
        assert_eq!(CompletionReport::parse_line(r#"{"failureCount":1}"#).unwrap(), None);
    }

    #[test]
    fn test_parse_report_with_crlf() {
        let parsed = CompletionReport::parse_line("@@tunnelrun-report {\"failureCount\":0}\r\n").unwrap();
        assert_eq!(parsed, Some(CompletionReport::new(0)));
    }

    #[test]
    fn test_parse_malformed_report() {
        let err = CompletionReport::parse_line("@@tunnelrun-report {\"failures\":2}").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_send_writes_one_line() {
        let mut buf = Vec::new();
        CompletionReport::new(7).send(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.ends_with('\n'));
    }
}
