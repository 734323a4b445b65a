//! Interoperability - the native boundary of the managed runtime
//!
//! Architecture:
//! - `types.rs` - wire-level values and the opaque address newtype
//! - `registry.rs` - library handles, routine tables, cross-library entries
//! - `bridge.rs` - two-backend call bridge with memoized resolution
//! - `memory.rs` - bulk copies, spill table, foreign-value unwrapping

mod bridge;
mod registry;
mod types;

pub mod memory;

#[cfg(test)]
mod tests;

pub use bridge::{
    BoundTarget, BridgeError, CallBridge, DirectBackend, HostedBackend, HostedEntry,
    NativeBackend, NativeFunction, WrappedArgs, MAX_DIRECT_ARGS,
};
pub use registry::{
    BatchKind, Library, LibraryRegistry, LoadError, NativeSymbol, RegistryError, RegistryStats,
    RoutineEntry, SharedObject,
};
pub use types::{BackendKind, BufferArg, HostFn, NativeAddress, NativeValue};

use crate::logging::info;
use once_cell::sync::{Lazy, OnceCell};
use std::sync::Arc;

/// Signal an internal invariant violation
///
/// Defects are not user-recoverable: a failure here means the bridge or
/// its caller is wrong, not the extension author.
#[macro_export]
macro_rules! defect {
    ($($arg:tt)*) => {
        panic!("internal defect: {}", format_args!($($arg)*))
    };
}

static HOSTED: Lazy<Arc<HostedBackend>> = Lazy::new(|| Arc::new(HostedBackend::new()));
static ACTIVE: OnceCell<Arc<dyn NativeBackend>> = OnceCell::new();
static REGISTRY: Lazy<Arc<LibraryRegistry>> = Lazy::new(|| Arc::new(LibraryRegistry::new()));
static BRIDGE: Lazy<CallBridge> = Lazy::new(|| CallBridge::new(active_backend(), registry()));

fn backend_for(kind: BackendKind) -> Arc<dyn NativeBackend> {
    match kind {
        BackendKind::Direct => Arc::new(DirectBackend),
        BackendKind::Hosted => HOSTED.clone(),
    }
}

/// Select the process-wide backend; first selection wins
///
/// Returns the backend actually active, which may differ from the
/// request if selection already happened.
pub fn select_backend(kind: BackendKind) -> Arc<dyn NativeBackend> {
    ACTIVE
        .get_or_init(|| {
            let backend = backend_for(kind);
            info!(event = "backend_selected", backend = backend.name());
            backend
        })
        .clone()
}

/// The active backend, selecting from the environment on first use
///
/// `RHEA_NATIVE_BACKEND=direct` opts into raw-pointer execution; the
/// hosted backend is the default.
pub fn active_backend() -> Arc<dyn NativeBackend> {
    ACTIVE
        .get_or_init(|| {
            let kind = match std::env::var("RHEA_NATIVE_BACKEND").ok().as_deref() {
                Some("direct") => BackendKind::Direct,
                _ => BackendKind::Hosted,
            };
            let backend = backend_for(kind);
            info!(event = "backend_selected", backend = backend.name());
            backend
        })
        .clone()
}

/// The hosted backend's registration table
///
/// Host callables may be registered regardless of which backend is
/// active; they only become reachable under hosted execution.
pub fn hosted() -> Arc<HostedBackend> {
    HOSTED.clone()
}

/// Process-wide library registry
pub fn registry() -> Arc<LibraryRegistry> {
    REGISTRY.clone()
}

/// Process-wide call bridge
pub fn call_bridge() -> &'static CallBridge {
    &BRIDGE
}

/// Initialize interop subsystem
pub fn init() {
    Lazy::force(&REGISTRY);
    let backend = active_backend();
    info!(
        event = "interop_init",
        backend = backend.name(),
        "Interop subsystem ready"
    );
}

/// Get interop statistics
pub fn stats() -> InteropStats {
    let registry = REGISTRY.stats();
    InteropStats {
        backend: active_backend().kind(),
        libraries: registry.libraries,
        symbols: registry.symbols,
        ccallables: registry.ccallables,
    }
}

/// Interop statistics for monitoring
#[derive(Debug, Clone, Copy)]
pub struct InteropStats {
    pub backend: BackendKind,
    pub libraries: usize,
    pub symbols: usize,
    pub ccallables: usize,
}
