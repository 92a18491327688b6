//! Public error taxonomy.
//!
//! Every fallible frontend operation returns one of these kinds (never an
//! exception, never a panic) per the propagation rule in the design notes.
//! Programmer errors (null handles, wrong frame state) are asserted, not
//! encoded here; only conditions that depend on device/driver state, file
//! I/O, or caller-supplied parameters become a reportable `ErrorKind`.

use thiserror::Error;

/// Stable, orderable error kind returned by the public API.
///
/// Order is significant: it mirrors the source specification's taxonomy so
/// that a numeric/FFI projection of this enum (if one is ever needed) stays
/// stable across versions.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    #[error("no error")]
    None,
    #[error("unknown error")]
    Unknown,
    #[error("requested backend is not supported on this platform")]
    BackendNotSupported,
    #[error("GPU resource creation failed")]
    ResourceCreationFailed,
    #[error("handle does not refer to a live resource")]
    InvalidHandle,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("shader compilation failed")]
    ShaderCompilationFailed,
    #[error("out of memory")]
    OutOfMemory,
    #[error("command recording failed")]
    CommandRecordingFailed,
    #[error("frame preparation failed")]
    FramePreparationFailed,
    #[error("presentation failed")]
    PresentationFailed,
    #[error("a frame is already in progress")]
    FrameInProgress,
    #[error("device error")]
    DeviceError,
    #[error("pipeline state update failed")]
    PipelineStateUpdateFailed,
    #[error("file not found")]
    FileNotFound,
    #[error("resource not loaded")]
    ResourceNotLoaded,
}

impl ErrorKind {
    /// Human-readable string, stable across versions (matches the `Display`
    /// impl but exposed as an explicit method for callers that want a
    /// non-allocating `&'static str`).
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::None => "no error",
            ErrorKind::Unknown => "unknown error",
            ErrorKind::BackendNotSupported => "requested backend is not supported on this platform",
            ErrorKind::ResourceCreationFailed => "GPU resource creation failed",
            ErrorKind::InvalidHandle => "handle does not refer to a live resource",
            ErrorKind::InvalidParameter => "invalid parameter",
            ErrorKind::ShaderCompilationFailed => "shader compilation failed",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::CommandRecordingFailed => "command recording failed",
            ErrorKind::FramePreparationFailed => "frame preparation failed",
            ErrorKind::PresentationFailed => "presentation failed",
            ErrorKind::FrameInProgress => "a frame is already in progress",
            ErrorKind::DeviceError => "device error",
            ErrorKind::PipelineStateUpdateFailed => "pipeline state update failed",
            ErrorKind::FileNotFound => "file not found",
            ErrorKind::ResourceNotLoaded => "resource not loaded",
        }
    }

    /// True for conditions that are locally recoverable by the backend
    /// (swapchain out-of-date/suboptimal) and therefore should never be
    /// seen by a caller that goes through the frontend.
    pub const fn is_internal_only(self) -> bool {
        matches!(self, ErrorKind::None)
    }
}

pub type Result<T> = std::result::Result<T, ErrorKind>;

/// Structural parser error, collapsed to [`ErrorKind::ResourceCreationFailed`]
/// (or [`ErrorKind::FileNotFound`] for a missing file) at the frontend
/// boundary, but kept in full for anything that wants to report it precisely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} at {}:{}: {}", self.kind, self.line, self.column, self.message)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    FileNotFound,
    FileReadFailed,
    InvalidFormat,
    MissingRequiredField,
    InvalidValue,
    BufferOverflow,
    MemoryAllocation,
    ParseFailed,
    DuplicateKey,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, line: usize, column: usize, message: impl Into<String>) -> Self {
        ParseError { kind, line, column, message: message.into() }
    }

    /// Collapse to the public error taxonomy at the frontend boundary.
    pub fn to_error_kind(&self) -> ErrorKind {
        match self.kind {
            ParseErrorKind::FileNotFound => ErrorKind::FileNotFound,
            _ => ErrorKind::ResourceCreationFailed,
        }
    }
}
