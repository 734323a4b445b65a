//! Error taxonomy of the native boundary
//!
//! Four channels with distinct handling:
//! - defects: internal invariant violations, fatal (`crate::defect!`)
//! - unimplemented operations: structured errors propagated across the
//!   boundary like any language error
//! - language errors: detectable misuse, unwound through `Result`
//! - warnings: recoverable, collected without aborting
//!
//! Trace and log failures never affect call semantics.

use crate::heap::EnvError;
use std::cell::RefCell;

/// Language-level error crossing the native boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Wrong handle kind for the operation
    Type {
        expected: &'static str,
        actual: &'static str,
    },
    /// Deprecated null/root-environment use
    NullEnvironment,
    LockedBinding(String),
    LockedEnvironment,
    NotFound(String),
    MissingArgument(String),
    /// Operation exists in the ABI catalogue but has no implementation;
    /// propagated as a language error rather than terminating the process
    Unimplemented(&'static str),
    Coerce(String),
    Io(String),
    Parse(String),
    /// Error raised explicitly by native code
    Raised(String),
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Type { expected, actual } => {
                write!(f, "invalid argument: expected {}, got {}", expected, actual)
            }
            Self::NullEnvironment => write!(f, "use of NULL environment is defunct"),
            Self::LockedBinding(name) => {
                write!(f, "cannot change value of locked binding for '{}'", name)
            }
            Self::LockedEnvironment => write!(f, "cannot add bindings to a locked environment"),
            Self::NotFound(name) => write!(f, "object '{}' not found", name),
            Self::MissingArgument(name) => {
                write!(f, "argument '{}' is missing, with no default", name)
            }
            Self::Unimplemented(op) => write!(f, "'{}' is not implemented", op),
            Self::Coerce(msg) => write!(f, "{}", msg),
            Self::Io(msg) => write!(f, "{}", msg),
            Self::Parse(msg) => write!(f, "parse error: {}", msg),
            Self::Raised(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<EnvError> for RuntimeError {
    fn from(err: EnvError) -> Self {
        match err {
            EnvError::LockedBinding(name) => Self::LockedBinding(name),
            EnvError::LockedEnvironment => Self::LockedEnvironment,
            EnvError::RootEnvironment => Self::NullEnvironment,
            EnvError::NotFound(name) => Self::NotFound(name),
        }
    }
}

impl From<crate::heap::CoerceError> for RuntimeError {
    fn from(err: crate::heap::CoerceError) -> Self {
        Self::Coerce(err.to_string())
    }
}

/// Result alias for upcall operations
pub type UpcallResult<T> = Result<T, RuntimeError>;

/// What to do when native code hits an unimplemented operation
///
/// `Propagate` is the redesigned default; `Abort` restores the original
/// production behavior for embedders that want the hard stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPolicy {
    Propagate,
    Abort,
}

// ============================================================================
// Per-thread error and warning channels for the C surface
// ============================================================================

thread_local! {
    static LAST_ERROR: RefCell<Option<RuntimeError>> = const { RefCell::new(None) };
    static WARNINGS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Record the error behind a failed ABI entry point
pub fn set_last_error(err: RuntimeError) {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = Some(err);
    });
}

/// Take (and clear) the most recent error
pub fn take_last_error() -> Option<RuntimeError> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}

/// Collect a recoverable warning without aborting
pub fn push_warning(message: &str) {
    crate::logging::warn!(event = "native_warning", message = message);
    WARNINGS.with(|buf| buf.borrow_mut().push(message.to_string()));
}

/// Drain every pending warning
pub fn drain_warnings() -> Vec<String> {
    WARNINGS.with(|buf| std::mem::take(&mut *buf.borrow_mut()))
}
