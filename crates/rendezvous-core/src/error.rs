use std::fmt;

/// Failure classes surfaced by the rendezvous table and the transfer drivers.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed key, bad configuration, mismatched value.
    InvalidArgument = 3,
    /// A receive did not complete before its timeout.
    DeadlineExceeded = 4,
    /// An external cancellation was observed while waiting.
    Canceled = 1,
    /// The table has been aborted.
    Aborted = 10,
    /// A protocol invariant was violated.
    Internal = 13,
}

impl ErrorCode {
    /// Canonical upper-snake-case name of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::Canceled => "CANCELLED",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A non-OK status: a code plus a human-readable message.
///
/// There is no "OK" value; success is `Ok(..)` of a [`Result`]. This is what
/// makes [`Rendezvous::start_abort`](crate::Rendezvous::start_abort) unable
/// to receive a success status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    code: ErrorCode,
    message: String,
}

/// Result type used throughout the rendezvous crates.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// An error with an explicit code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The caller supplied a bad value or configuration.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    /// A receive was not matched within its timeout.
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeadlineExceeded, message)
    }

    /// A receive was withdrawn through its cancellation manager.
    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, message)
    }

    /// The table was aborted; carries the abort status message.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Aborted, message)
    }

    /// The peers disagree about the messages of a transfer.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns a copy of this error with `context` prepended to the message.
    pub fn context(&self, context: impl fmt::Display) -> Self {
        Self {
            code: self.code,
            message: format!("{}: {}", context, self.message),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let err = Error::deadline_exceeded("timed out after 5ms");
        let s = err.to_string();
        assert!(s.starts_with("DEADLINE_EXCEEDED"));
        assert!(s.contains("timed out after 5ms"));
    }

    #[test]
    fn context_keeps_code() {
        let err = Error::aborted("worker restarted").context("recv shape");
        assert_eq!(err.code(), ErrorCode::Aborted);
        assert_eq!(err.message(), "recv shape: worker restarted");
    }
}
