use thiserror::Error;

use crate::diag::WorkerError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("frame: no length")]
    NoLength,

    #[error("frame: invalid open marker")]
    InvalidOpenMarker,

    #[error("frame: invalid close marker")]
    InvalidCloseMarker,

    #[error("frame: length {0} exceeds the reader limit")]
    MaxLength(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode payload: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("catalog holds {0} functions, outside the 8-bit index space")]
    CatalogSize(usize),

    #[error("worker sent no initial function catalog")]
    NoFuncs(#[source] Box<Error>),

    #[error("worker process has exited")]
    ProcessExited,

    #[error("worker exited unexpectedly: {cause}")]
    UnexpectedExit { cause: String },

    #[error("worker exited with error: {0}")]
    WorkerExit(String),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("unimplemented function {0}")]
    Unimplemented(u8),

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(&'static str),

    #[error("dispatcher is closed")]
    Closed,
}

impl Error {
    /// True if this error means the worker subprocess is gone and must be
    /// replaced. In-band RPC errors and calls rejected before any bytes
    /// were written are not crashes.
    pub fn is_crash(&self) -> bool {
        match self {
            Error::Worker(e) => e.panic,
            Error::UnexpectedExit { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_frame_errors() {
        assert_eq!(format!("{}", Error::NoLength), "frame: no length");
        assert_eq!(
            format!("{}", Error::InvalidOpenMarker),
            "frame: invalid open marker"
        );
        assert_eq!(
            format!("{}", Error::InvalidCloseMarker),
            "frame: invalid close marker"
        );

        let msg = format!("{}", Error::MaxLength(18446744073709551615));
        assert!(msg.contains("18446744073709551615"));
    }

    #[test]
    fn test_error_display_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "pipe gone");
        let err = Error::Io(io_err);
        let msg = format!("{}", err);
        assert!(msg.contains("IO error"));
        assert!(msg.contains("pipe gone"));
    }

    #[test]
    fn test_error_display_unimplemented() {
        let msg = format!("{}", Error::Unimplemented(42));
        assert!(msg.contains("unimplemented function"));
        assert!(msg.contains("42"));
    }

    #[test]
    fn test_error_display_no_funcs_carries_source() {
        let err = Error::NoFuncs(Box::new(Error::ProcessExited));
        assert_eq!(format!("{}", err), "worker sent no initial function catalog");

        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("process has exited"));
    }

    #[test]
    fn test_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_is_crash_classification() {
        let panic = Error::Worker(WorkerError {
            msg: "boom".to_string(),
            debug: String::new(),
            panic: true,
        });
        assert!(panic.is_crash());

        let rpc = Error::Worker(WorkerError {
            msg: "bad argument".to_string(),
            debug: "func=swe_calc_ut".to_string(),
            panic: false,
        });
        assert!(!rpc.is_crash());

        let exit = Error::UnexpectedExit {
            cause: "exit status: 1".to_string(),
        };
        assert!(exit.is_crash());

        assert!(!Error::ProcessExited.is_crash());
        assert!(!Error::NoLength.is_crash());
        assert!(!Error::Closed.is_crash());
    }

    #[test]
    fn test_result_type_alias() {
        let ok_result: Result<i32> = Ok(7);
        assert!(ok_result.is_ok());

        let err_result: Result<i32> = Err(Error::Closed);
        assert!(err_result.is_err());
    }
}
