//! Line-oriented stderr diagnostics from a worker subprocess.
//!
//! Workers report faults on stderr as `DEBUG: `/`ERROR: ` lines. A debug
//! line is sticky metadata: it attaches to the next error line and is
//! then cleared.

use std::fmt;
use std::mem;

const PREFIX_DEBUG: &str = "DEBUG: ";
const PREFIX_ERROR: &str = "ERROR: ";

/// A fault reported by a worker subprocess.
///
/// `panic` is true for faults scanned off stderr (the process is gone)
/// and false for in-band error-map replies (the process stays healthy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerError {
    pub msg: String,
    pub debug: String,
    pub panic: bool,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.debug.is_empty() {
            write!(f, "{}", self.msg)
        } else {
            write!(f, "{} [{}]", self.msg, self.debug)
        }
    }
}

impl std::error::Error for WorkerError {}

/// Incremental parser for the stderr stream.
///
/// Feed it raw read chunks in any split; it buffers partial lines across
/// feeds and emits exactly one [`WorkerError`] per `ERROR: ` line.
#[derive(Debug, Default)]
pub struct DiagnosticScanner {
    debug: String,
    partial: Vec<u8>,
}

impl DiagnosticScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<WorkerError> {
        let mut records = Vec::new();

        for &b in chunk {
            if b == b'\n' {
                self.end_line(&mut records);
            } else {
                self.partial.push(b);
            }
        }

        records
    }

    fn end_line(&mut self, records: &mut Vec<WorkerError>) {
        let line = String::from_utf8_lossy(&self.partial);

        if let Some(suffix) = line.strip_prefix(PREFIX_DEBUG) {
            self.debug = suffix.to_string();
        } else if let Some(suffix) = line.strip_prefix(PREFIX_ERROR) {
            records.push(WorkerError {
                msg: suffix.to_string(),
                debug: mem::take(&mut self.debug),
                panic: true,
            });
        }

        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_line_emits_record() {
        let mut s = DiagnosticScanner::new();
        let recs = s.feed(b"ERROR: something broke\n");
        assert_eq!(
            recs,
            vec![WorkerError {
                msg: "something broke".to_string(),
                debug: String::new(),
                panic: true,
            }]
        );
    }

    #[test]
    fn test_debug_attaches_to_next_error() {
        let mut s = DiagnosticScanner::new();
        assert!(s.feed(b"DEBUG: func=test_crash\n").is_empty());

        let recs = s.feed(b"ERROR: test_crash called\n");
        assert_eq!(
            recs,
            vec![WorkerError {
                msg: "test_crash called".to_string(),
                debug: "func=test_crash".to_string(),
                panic: true,
            }]
        );
    }

    #[test]
    fn test_debug_cleared_after_error() {
        let mut s = DiagnosticScanner::new();
        s.feed(b"DEBUG: first\nERROR: one\n");

        let recs = s.feed(b"ERROR: two\n");
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].debug, "");
    }

    #[test]
    fn test_later_debug_overwrites_pending() {
        let mut s = DiagnosticScanner::new();
        let recs = s.feed(b"DEBUG: stale\nDEBUG: fresh\nERROR: boom\n");
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].debug, "fresh");
    }

    #[test]
    fn test_partial_lines_across_feeds() {
        let mut s = DiagnosticScanner::new();
        assert!(s.feed(b"DEBUG: fu").is_empty());
        assert!(s.feed(b"nc=test_crash\nERROR: test_cra").is_empty());

        let recs = s.feed(b"sh called\n");
        assert_eq!(
            recs,
            vec![WorkerError {
                msg: "test_crash called".to_string(),
                debug: "func=test_crash".to_string(),
                panic: true,
            }]
        );
    }

    #[test]
    fn test_one_record_per_error_line() {
        let mut s = DiagnosticScanner::new();
        let recs = s.feed(b"ERROR: one\nERROR: two\nERROR: three\n");
        let msgs: Vec<_> = recs.iter().map(|r| r.msg.as_str()).collect();
        assert_eq!(msgs, ["one", "two", "three"]);
    }

    #[test]
    fn test_other_lines_ignored() {
        let mut s = DiagnosticScanner::new();
        let recs = s.feed(b"some noise\nWARN: not ours\nDEBUG:missing space\n");
        assert!(recs.is_empty());
    }

    #[test]
    fn test_partial_line_without_newline_not_emitted() {
        let mut s = DiagnosticScanner::new();
        assert!(s.feed(b"ERROR: incomplete").is_empty());
    }

    #[test]
    fn test_display_with_and_without_debug() {
        let plain = WorkerError {
            msg: "boom".to_string(),
            debug: String::new(),
            panic: true,
        };
        assert_eq!(plain.to_string(), "boom");

        let detailed = WorkerError {
            msg: "boom".to_string(),
            debug: "func=boom".to_string(),
            panic: true,
        };
        assert_eq!(detailed.to_string(), "boom [func=boom]");
    }
}
