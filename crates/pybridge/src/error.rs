use crate::{host::BoxError, value::ValType};
use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// No builtin or invokable module is registered under this name.
    #[error("unknown module `{module}`")]
    UnknownModule { module: String },

    /// The module exists but has no function with this name.
    #[error("unknown function `{function}` in module `{module}`")]
    UnknownFunction { module: String, function: String },

    #[error("`{module}.{function}` expects {expected} argument(s), got {actual}")]
    ArityMismatch {
        module: String,
        function: String,
        expected: usize,
        actual: usize,
    },

    /// A value did not conform to its declared semantic type.
    #[error("type mismatch at {site}: expected {expected}, found {found}")]
    TypeMismatch {
        site: String,
        expected: ValType,
        found: String,
    },

    #[error("invalid handle {handle} (reference table holds {len})")]
    InvalidHandle { handle: i64, len: usize },

    #[error("guest memory access out of bounds: offset {offset}, length {len}")]
    OutOfBounds { offset: u64, len: u64 },

    #[error("guest allocation of {len} bytes failed: {reason}")]
    AllocationFailed { len: u32, reason: String },

    /// A host function body returned an error.
    #[error("`{module}.{function}` failed: {source}")]
    InvocationError {
        module: String,
        function: String,
        #[source]
        source: BoxError,
    },

    /// The guest trapped during `exec`; carries everything it printed.
    #[error("guest execution failed: {trap}\nstderr: {stderr}\nstdout: {stdout}")]
    GuestExecutionFailed {
        trap: String,
        stdout: String,
        stderr: String,
        /// Bridge error raised by the dispatcher that caused the trap, if any.
        #[source]
        cause: Option<Box<Error>>,
    },

    #[error("module `{module}` registered more than once")]
    DuplicateModule { module: String },

    #[error("function `{function}` registered more than once in module `{module}`")]
    DuplicateFunction { module: String, function: String },

    /// Module and function names are spliced into the prelude and must be
    /// plain identifiers.
    #[error("`{name}` is not a valid guest identifier")]
    InvalidName { name: String },

    #[error("failed to release {resource}")]
    ResourceCloseFailed {
        resource: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {what}")]
    Decode {
        what: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("failed to encode {what}")]
    Encode {
        what: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("session is closed")]
    SessionClosed,

    /// Wasmtime engine error (compilation, linking, instantiation).
    #[error("wasm error: {0}")]
    Wasm(#[source] anyhow::Error),

    /// Filesystem I/O error (cache, scratch directory).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The dispatcher error behind a [`Error::GuestExecutionFailed`], or the
    /// error itself for every other variant.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::GuestExecutionFailed {
                cause: Some(cause), ..
            } => cause.root_cause(),
            other => other,
        }
    }
}
