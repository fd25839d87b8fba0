//! Error types for continuations.

use std::panic::Location;

/// Function name recorded for the synthetic frame added when an error is
/// packaged across a fiber boundary.
pub const TRANSFER_FRAME: &str = "<continuation transfer>";

/// Single frame in an exception traceback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub func_name: String,
    pub source_file: String,
    pub source_line: u32,
}

impl TraceFrame {
    /// Frame for `func_name` located at the caller.
    #[track_caller]
    pub fn here(func_name: impl Into<String>) -> Self {
        let location = Location::caller();
        TraceFrame {
            func_name: func_name.into(),
            source_file: location.file().to_string(),
            source_line: location.line(),
        }
    }

    pub(crate) fn transfer() -> Self {
        TraceFrame {
            func_name: TRANSFER_FRAME.to_string(),
            source_file: file!().to_string(),
            source_line: line!(),
        }
    }

    pub fn is_transfer(&self) -> bool {
        self.func_name == TRANSFER_FRAME
    }
}

/// User-level error raised inside (or thrown into) a continuation.
///
/// The traceback is ordered outermost first: frames are prepended as the
/// error propagates outward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    pub kind: String,
    pub message: String,
    pub traceback: Vec<TraceFrame>,
}

impl Exception {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Exception {
            kind: kind.into(),
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    /// Record that this error propagated out of `func_name`.
    #[track_caller]
    pub fn traced(mut self, func_name: impl Into<String>) -> Self {
        self.traceback.insert(0, TraceFrame::here(func_name));
        self
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

impl std::fmt::Display for Exception {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Exception {}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContinuationError {
    /// `init` called on an object that already carries an entry.
    #[error("continuation already initialized")]
    Reinitialized,
    /// Violation of the switch/throw calling contract.
    #[error("protocol error: {message}")]
    Protocol { message: String },
    /// Switch or throw targeting a continuation that already returned.
    #[error("continuation already finished")]
    Finished,
    /// A host call lost both its resumer and its host event before settling.
    #[error("host call abandoned before it settled")]
    HostDropped,
    /// Error raised by user code, propagated verbatim.
    #[error(transparent)]
    Raised(#[from] Exception),
}

impl ContinuationError {
    pub fn protocol(message: impl Into<String>) -> Self {
        ContinuationError::Protocol {
            message: message.into(),
        }
    }

    pub fn raised(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ContinuationError::Raised(Exception::new(kind, message))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, ContinuationError::Protocol { .. })
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, ContinuationError::Finished)
    }

    pub fn exception(&self) -> Option<&Exception> {
        match self {
            ContinuationError::Raised(exc) => Some(exc),
            _ => None,
        }
    }

    /// Traceback of a raised error; empty for protocol-level errors.
    pub fn traceback(&self) -> &[TraceFrame] {
        match self.exception() {
            Some(exc) => &exc.traceback,
            None => &[],
        }
    }

    /// Record that this error propagated out of `func_name`. No-op for
    /// protocol-level errors, which carry no traceback.
    #[track_caller]
    pub fn traced(self, func_name: impl Into<String>) -> Self {
        match self {
            ContinuationError::Raised(exc) => ContinuationError::Raised(exc.traced(func_name)),
            other => other,
        }
    }

    pub(crate) fn with_transfer_frame(self) -> Self {
        match self {
            ContinuationError::Raised(mut exc) => {
                exc.traceback.insert(0, TraceFrame::transfer());
                ContinuationError::Raised(exc)
            }
            other => other,
        }
    }

    /// Drop the outermost frame if it is the synthetic transfer frame.
    pub(crate) fn trim_transfer_frame(self) -> Self {
        match self {
            ContinuationError::Raised(mut exc) => {
                if exc.traceback.first().is_some_and(TraceFrame::is_transfer) {
                    exc.traceback.remove(0);
                }
                ContinuationError::Raised(exc)
            }
            other => other,
        }
    }
}
