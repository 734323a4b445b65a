//! Upcall surface - the embedding API native extensions call into
//!
//! Design: Small capability tables grouped by concern (allocation,
//! coercion, environments, attributes, pairlists, pointers, I/O, RNG,
//! context reflection, registration, delegated numerics), composed into
//! one `Upcalls` façade only for ABI purposes. An optional tracing
//! decorator observes every operation without altering semantics.
//!
//! Architecture:
//! - `value.rs` - alloc/coerce/attr/pairlist/pointer tables
//! - `env.rs` - environment and context tables
//! - `io.rs` - connections, parsing, RNG, graphics, numeric delegation
//! - `error.rs` - the boundary error taxonomy and per-thread channels
//! - `trace.rs` - the decorator and its sink
//! - `abi.rs` - the `extern "C" rhea_*` entry-point catalogue

mod abi;
mod env;
mod error;
mod io;
mod trace;
mod value;

#[cfg(test)]
mod tests;

pub use env::{CtxOps, EnvOps};
pub use error::{
    drain_warnings, push_warning, set_last_error, take_last_error, FaultPolicy, RuntimeError,
    UpcallResult,
};
pub use io::{
    BasicNumeric, Connections, DocTool, ExpressionParser, GraphicsDelegate, IoOps, LogGraphics,
    NoConnections, NoDocTool, NoParser, NumOps, NumericDelegate, RngOps,
};
pub use trace::{synopsis, LogSink, MemorySink, TraceSink, Tracer};
pub use value::{AllocOps, AttrOps, CoerceOps, ListOps, PtrOps};

use crate::altrep::{self, AltrepClass, MethodDescriptor, MethodKind};
use crate::heap::Value;
use crate::interop::{self, BatchKind, NativeAddress, RoutineEntry};
use crate::logging::{error, info};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// Load-time registration entry points (libraries and ALTREP classes)
#[derive(Default)]
pub struct RegOps;

impl RegOps {
    /// `registerRoutines`: resolve a native table into one batch
    pub fn register_routines(
        &self,
        library: &str,
        kind_index: i32,
        entries: &[RoutineEntry],
    ) -> UpcallResult<()> {
        let kind = BatchKind::from_index(kind_index).ok_or(RuntimeError::Type {
            expected: "routine batch kind",
            actual: "unknown kind",
        })?;
        let lib = interop::registry().open_library(library, None);
        lib.register_routines(kind, entries);
        Ok(())
    }

    /// `registerCCallable`: unknown libraries are defects by contract
    pub fn register_ccallable(&self, library: &str, function: &str, address: NativeAddress) {
        interop::registry().register_ccallable(library, function, address);
    }

    /// `getCCallable`: a missing entry is a plain not-found failure
    pub fn get_ccallable(&self, library: &str, function: &str) -> UpcallResult<NativeAddress> {
        interop::registry()
            .get_ccallable(library, function)
            .map_err(|e| RuntimeError::NotFound(e.to_string()))
    }

    pub fn use_dynamic_symbols(&self, library: &str, flag: bool) -> UpcallResult<()> {
        interop::registry()
            .get_library(library)
            .ok_or_else(|| RuntimeError::NotFound(library.to_string()))?
            .set_use_dynamic_symbols(flag);
        Ok(())
    }

    pub fn force_symbols(&self, library: &str, flag: bool) -> UpcallResult<()> {
        interop::registry()
            .get_library(library)
            .ok_or_else(|| RuntimeError::NotFound(library.to_string()))?
            .set_force_symbols(flag);
        Ok(())
    }

    /// `setDotSymbolValues`: patch one routine entry in place
    pub fn set_dot_symbol_values(
        &self,
        library: &str,
        kind_index: i32,
        index: usize,
        name: &str,
        address: NativeAddress,
        arity: i32,
    ) -> UpcallResult<()> {
        let kind = BatchKind::from_index(kind_index).ok_or(RuntimeError::Type {
            expected: "routine batch kind",
            actual: "unknown kind",
        })?;
        interop::registry()
            .get_library(library)
            .ok_or_else(|| RuntimeError::NotFound(library.to_string()))?
            .set_dot_symbol_values(kind, index, name, address, arity)
            .map_err(|e| RuntimeError::Raised(e.to_string()))
    }

    /// ALTREP class creation entry point
    pub fn altrep_make_class(
        &self,
        tag: i32,
        name: &str,
        package: &str,
    ) -> UpcallResult<Arc<AltrepClass>> {
        let kind = crate::heap::ElemKind::from_tag(tag).ok_or(RuntimeError::Type {
            expected: "vector type tag",
            actual: "unknown tag",
        })?;
        Ok(altrep::make_class(kind, name, package))
    }

    /// ALTREP method installation entry point
    pub fn altrep_register_method(
        &self,
        class: &Arc<AltrepClass>,
        kind: MethodKind,
        descriptor: MethodDescriptor,
    ) -> UpcallResult<()> {
        class
            .register_method(kind, descriptor)
            .map_err(|e| RuntimeError::Raised(e.to_string()))
    }

    /// ALTREP instance construction entry point
    pub fn altrep_new(&self, class: Arc<AltrepClass>, data1: Value, data2: Value) -> Value {
        Value::Altrep(altrep::new_instance(class, data1, data2))
    }
}

/// The composed upcall façade
///
/// One instance serves one execution context; the tables are the real
/// surface, the façade exists so the ABI catalogue has a single root.
pub struct Upcalls {
    pub alloc: AllocOps,
    pub coerce: CoerceOps,
    pub attrs: AttrOps,
    pub lists: ListOps,
    pub ptrs: PtrOps,
    pub envs: EnvOps,
    pub ctx: CtxOps,
    pub reg: RegOps,
    pub io: IoOps,
    pub rng: RngOps,
    pub num: NumOps,
    fault_policy: FaultPolicy,
    tracer: Option<Rc<Tracer>>,
}

impl Upcalls {
    pub fn builder() -> UpcallsBuilder {
        UpcallsBuilder::default()
    }

    #[inline]
    pub fn tracing_enabled(&self) -> bool {
        self.tracer.is_some()
    }

    /// Run one operation under the tracing decorator
    ///
    /// Pure observation: the operation's result is returned untouched,
    /// and a sink failure cannot affect it.
    pub fn traced<R>(
        &self,
        name: &'static str,
        args: &[&Value],
        op: impl FnOnce(&Self) -> UpcallResult<R>,
    ) -> UpcallResult<R> {
        let Some(tracer) = &self.tracer else {
            return op(self);
        };
        tracer.enter(name, args);
        let result = op(self);
        tracer.exit(name, if result.is_ok() { "ok" } else { "error" });
        result
    }

    /// Signal an operation the port does not implement
    ///
    /// Default policy propagates a structured error across the boundary.
    /// Under the legacy `Abort` policy the process terminates unless the
    /// tracer is attached, in which case the fault is logged and
    /// propagated for inspection.
    pub fn unimplemented(&self, op: &'static str) -> RuntimeError {
        error!(event = "unimplemented_upcall", operation = op);
        if self.fault_policy == FaultPolicy::Abort && self.tracer.is_none() {
            std::process::abort();
        }
        RuntimeError::Unimplemented(op)
    }
}

impl Default for Upcalls {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder wiring collaborators and the decorator into a façade
#[derive(Default)]
pub struct UpcallsBuilder {
    io: Option<IoOps>,
    num: Option<NumOps>,
    tracer: Option<Rc<Tracer>>,
    fault_policy: Option<FaultPolicy>,
}

impl UpcallsBuilder {
    pub fn io(mut self, io: IoOps) -> Self {
        self.io = Some(io);
        self
    }

    pub fn numeric(mut self, num: NumOps) -> Self {
        self.num = Some(num);
        self
    }

    /// Attach the tracing decorator with the given sink
    pub fn tracer(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.tracer = Some(Rc::new(Tracer::new(sink)));
        self
    }

    pub fn fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault_policy = Some(policy);
        self
    }

    pub fn build(self) -> Upcalls {
        Upcalls {
            alloc: AllocOps,
            coerce: CoerceOps,
            attrs: AttrOps,
            lists: ListOps,
            ptrs: PtrOps,
            envs: EnvOps,
            ctx: CtxOps,
            reg: RegOps,
            io: self.io.unwrap_or_default(),
            rng: RngOps::default(),
            num: self.num.unwrap_or_default(),
            fault_policy: self.fault_policy.unwrap_or(FaultPolicy::Propagate),
            tracer: self.tracer,
        }
    }
}

// ============================================================================
// Per-thread façade installation
// ============================================================================

thread_local! {
    static UPCALLS: RefCell<Option<Rc<Upcalls>>> = const { RefCell::new(None) };
}

/// Install the façade serving this execution context
pub fn install(upcalls: Upcalls) {
    UPCALLS.with(|slot| {
        *slot.borrow_mut() = Some(Rc::new(upcalls));
    });
}

/// Run `f` against the installed façade, installing the default first
/// when none exists
pub fn with_upcalls<R>(f: impl FnOnce(&Upcalls) -> R) -> R {
    let facade = UPCALLS.with(|slot| {
        let mut slot = slot.borrow_mut();
        slot.get_or_insert_with(|| Rc::new(Upcalls::default())).clone()
    });
    f(&facade)
}

/// Initialize upcall subsystem
pub fn init() {
    with_upcalls(|facade| {
        info!(
            event = "upcall_init",
            tracing = facade.tracing_enabled(),
            "Upcall surface ready"
        );
    });
}

/// Cleanup upcall subsystem
pub fn cleanup() {
    let dropped = drain_warnings();
    if !dropped.is_empty() {
        info!(
            event = "upcall_cleanup",
            pending_warnings = dropped.len(),
            "Dropping undelivered warnings"
        );
    }
    UPCALLS.with(|slot| {
        *slot.borrow_mut() = None;
    });
    abi::release_all_handles();
}
