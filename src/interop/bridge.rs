//! Backend selection & call bridge - managed-to-native invocation
//!
//! Design: Two sealed backends behind one trait, selected once at process
//! start and injected; no per-call backend branching.
//! - `DirectBackend` invokes raw function pointers with word-sized
//!   argument passing.
//! - `HostedBackend` invokes table-registered host functions after an
//!   explicit signature-bound step.
//!
//! Per-call argument wrappers are released unconditionally by a scope
//! guard, success or failure. Target resolution is lazy and memoized per
//! `NativeFunction` descriptor.

use super::memory;
use super::registry::{LibraryRegistry, NativeSymbol};
use super::types::{BackendKind, BufferArg, HostFn, NativeAddress, NativeValue};
use crate::logging::{debug, log_native_call, log_native_return};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Most word arguments the direct trampoline can pass
pub const MAX_DIRECT_ARGS: usize = 6;

/// A callable bound to the active backend
#[derive(Clone)]
pub enum BoundTarget {
    Direct(NativeAddress),
    Hosted(HostFn),
}

impl std::fmt::Debug for BoundTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(addr) => write!(f, "Direct({:#x})", addr.raw()),
            Self::Hosted(_) => write!(f, "Hosted(..)"),
        }
    }
}

/// Bridge-layer failures
///
/// Anything surfacing from an actual invocation indicates an internal
/// defect (arity and representation are validated at bind time); callers
/// escalate accordingly.
#[derive(Debug)]
pub enum BridgeError {
    UnresolvedSymbol(String),
    SignatureMismatch {
        name: String,
        want: String,
        have: String,
    },
    UnsupportedArity(usize),
    UnwrappedArgument(&'static str),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnresolvedSymbol(name) => write!(f, "cannot resolve native symbol '{}'", name),
            Self::SignatureMismatch { name, want, have } => {
                write!(f, "signature mismatch for '{}': want {}, have {}", name, want, have)
            }
            Self::UnsupportedArity(n) => write!(f, "direct call with {} arguments unsupported", n),
            Self::UnwrappedArgument(kind) => {
                write!(f, "argument of kind {} reached invoke unwrapped", kind)
            }
        }
    }
}

impl std::error::Error for BridgeError {}

/// One of the two native execution strategies
///
/// Implementations are sealed: exactly `DirectBackend` and
/// `HostedBackend` exist, and exactly one is active per process.
pub trait NativeBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &'static str;

    /// Bind a resolved registry symbol into an invocable target
    fn bind(&self, symbol: &NativeSymbol) -> Result<BoundTarget, BridgeError>;

    /// Wrap call arguments into the representation this backend requires;
    /// the guard releases wrapper resources when dropped
    fn wrap(&self, args: &[NativeValue]) -> WrappedArgs;

    /// Invoke a bound target with wrapped arguments
    fn invoke(
        &self,
        target: &BoundTarget,
        args: &mut WrappedArgs,
    ) -> Result<NativeValue, BridgeError>;
}

// ============================================================================
// Per-call argument wrappers with guaranteed release
// ============================================================================

/// Backend-wrapped arguments plus their release actions
///
/// Dropping the guard releases every wrapper resource unconditionally:
/// spilled handles are unspilled and writable buffers are copied back,
/// whether the call succeeded or failed.
pub struct WrappedArgs {
    values: Vec<NativeValue>,
    releases: Vec<ReleaseAction>,
}

enum ReleaseAction {
    Unspill(NativeAddress),
    CopyBack(DirectBuffer),
}

/// Contiguous native-side copy of a managed vector's cells
struct DirectBuffer {
    bytes: Vec<u8>,
    source: BufferArg,
}

impl DirectBuffer {
    /// Flatten the vector's cells into native layout
    fn from_arg(arg: BufferArg) -> Self {
        let kind = arg.kind();
        let len = arg.len();
        let mut bytes = vec![0u8; len * kind.elem_size()];
        if len > 0 {
            // Vector cells are contiguous per kind; reuse the adapter copy.
            let dst = NativeAddress::new(bytes.as_mut_ptr() as usize);
            // Kind was just taken from the vector itself, so this cannot fail.
            unsafe {
                memory::copy_from_managed(&arg.vector, dst, len).ok();
            }
        }
        Self { bytes, source: arg }
    }

    fn addr(&self) -> NativeAddress {
        NativeAddress::new(self.bytes.as_ptr() as usize)
    }
}

impl WrappedArgs {
    #[inline]
    pub fn values(&mut self) -> &mut [NativeValue] {
        &mut self.values
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Drop for WrappedArgs {
    fn drop(&mut self) {
        for action in self.releases.drain(..) {
            match action {
                ReleaseAction::Unspill(addr) => memory::release_spilled(addr),
                ReleaseAction::CopyBack(buffer) => {
                    if buffer.source.writable && buffer.source.len() > 0 {
                        let src = NativeAddress::new(buffer.bytes.as_ptr() as usize);
                        unsafe {
                            memory::copy_to_managed(src, &buffer.source.vector, buffer.source.len())
                                .ok();
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// Direct backend: raw function-pointer invocation
// ============================================================================

/// Raw-pointer backend: targets are machine addresses, arguments are
/// passed as C words
pub struct DirectBackend;

impl NativeBackend for DirectBackend {
    #[inline]
    fn kind(&self) -> BackendKind {
        BackendKind::Direct
    }

    #[inline]
    fn name(&self) -> &'static str {
        "direct"
    }

    fn bind(&self, symbol: &NativeSymbol) -> Result<BoundTarget, BridgeError> {
        if symbol.address.is_null() {
            return Err(BridgeError::UnresolvedSymbol(symbol.name.clone()));
        }
        Ok(BoundTarget::Direct(symbol.address))
    }

    fn wrap(&self, args: &[NativeValue]) -> WrappedArgs {
        let mut values = Vec::with_capacity(args.len());
        let mut releases = Vec::new();
        for arg in args {
            match arg {
                NativeValue::Obj(v) => {
                    let addr = memory::spill(v.clone());
                    releases.push(ReleaseAction::Unspill(addr));
                    values.push(NativeValue::Ptr(addr));
                }
                NativeValue::Buf(buf) => {
                    let buffer = DirectBuffer::from_arg(buf.clone());
                    values.push(NativeValue::Ptr(buffer.addr()));
                    releases.push(ReleaseAction::CopyBack(buffer));
                }
                other => values.push(other.clone()),
            }
        }
        WrappedArgs { values, releases }
    }

    fn invoke(
        &self,
        target: &BoundTarget,
        args: &mut WrappedArgs,
    ) -> Result<NativeValue, BridgeError> {
        let addr = match target {
            BoundTarget::Direct(addr) => *addr,
            BoundTarget::Hosted(_) => {
                crate::defect!("hosted target reached the direct backend")
            }
        };
        let mut words = [0u64; MAX_DIRECT_ARGS];
        let values = args.values();
        if values.len() > MAX_DIRECT_ARGS {
            return Err(BridgeError::UnsupportedArity(values.len()));
        }
        for (i, value) in values.iter().enumerate() {
            if value.is_obj() || matches!(value, NativeValue::Buf(_)) {
                return Err(BridgeError::UnwrappedArgument(match value {
                    NativeValue::Obj(_) => "object",
                    _ => "buffer",
                }));
            }
            words[i] = value.as_word();
        }
        let ret = unsafe { call_words(addr, &words[..values.len()]) }?;
        Ok(NativeValue::Int(ret as i64))
    }
}

/// Word-passing trampoline into a raw C function pointer
///
/// # Safety
/// `addr` must be the address of an `extern "C"` function taking
/// `words.len()` word-sized arguments and returning at most one word.
unsafe fn call_words(addr: NativeAddress, words: &[u64]) -> Result<u64, BridgeError> {
    use std::mem::transmute;

    let a = addr.raw();
    Ok(match words {
        [] => transmute::<usize, extern "C" fn() -> u64>(a)(),
        [w0] => transmute::<usize, extern "C" fn(u64) -> u64>(a)(*w0),
        [w0, w1] => transmute::<usize, extern "C" fn(u64, u64) -> u64>(a)(*w0, *w1),
        [w0, w1, w2] => {
            transmute::<usize, extern "C" fn(u64, u64, u64) -> u64>(a)(*w0, *w1, *w2)
        }
        [w0, w1, w2, w3] => {
            transmute::<usize, extern "C" fn(u64, u64, u64, u64) -> u64>(a)(*w0, *w1, *w2, *w3)
        }
        [w0, w1, w2, w3, w4] => transmute::<usize, extern "C" fn(u64, u64, u64, u64, u64) -> u64>(
            a,
        )(*w0, *w1, *w2, *w3, *w4),
        [w0, w1, w2, w3, w4, w5] => transmute::<
            usize,
            extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64,
        >(a)(*w0, *w1, *w2, *w3, *w4, *w5),
        more => return Err(BridgeError::UnsupportedArity(more.len())),
    })
}

// ============================================================================
// Hosted backend: table-registered host functions
// ============================================================================

/// One registered host callable
#[derive(Clone)]
pub struct HostedEntry {
    pub func: HostFn,
    pub signature: &'static str,
    pub arity: usize,
}

/// Hosted backend: callables are looked up by name in a registration
/// table and signature-checked before they become invocable
pub struct HostedBackend {
    table: DashMap<String, HostedEntry>,
}

impl HostedBackend {
    pub fn new() -> Self {
        Self {
            table: DashMap::new(),
        }
    }

    /// Register a host callable under a symbol name
    pub fn register(&self, name: &str, func: HostFn, signature: &'static str, arity: usize) {
        self.table.insert(
            name.to_string(),
            HostedEntry {
                func,
                signature,
                arity,
            },
        );
    }

    pub fn entry(&self, name: &str) -> Option<HostedEntry> {
        self.table.get(name).map(|e| e.value().clone())
    }
}

impl Default for HostedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeBackend for HostedBackend {
    #[inline]
    fn kind(&self) -> BackendKind {
        BackendKind::Hosted
    }

    #[inline]
    fn name(&self) -> &'static str {
        "hosted"
    }

    fn bind(&self, symbol: &NativeSymbol) -> Result<BoundTarget, BridgeError> {
        let entry = self
            .entry(&symbol.name)
            .ok_or_else(|| BridgeError::UnresolvedSymbol(symbol.name.clone()))?;
        // The signature-bound step: declared arity must agree before the
        // callable becomes invocable.
        if symbol.arity >= 0 && entry.arity != symbol.arity as usize {
            return Err(BridgeError::SignatureMismatch {
                name: symbol.name.clone(),
                want: format!("{} args", symbol.arity),
                have: format!("{} args", entry.arity),
            });
        }
        Ok(BoundTarget::Hosted(entry.func))
    }

    fn wrap(&self, args: &[NativeValue]) -> WrappedArgs {
        // Host callables consume wire values as-is; managed handles and
        // buffers pass through untouched.
        WrappedArgs {
            values: args.to_vec(),
            releases: Vec::new(),
        }
    }

    fn invoke(
        &self,
        target: &BoundTarget,
        args: &mut WrappedArgs,
    ) -> Result<NativeValue, BridgeError> {
        let func = match target {
            BoundTarget::Hosted(func) => *func,
            BoundTarget::Direct(_) => {
                crate::defect!("direct target reached the hosted backend")
            }
        };
        Ok(func(args.values()))
    }
}

// ============================================================================
// NativeFunction descriptor and the bridge
// ============================================================================

/// Descriptor of one native entry point callable from managed code
///
/// Immutable once created; the bound target is resolved lazily, exactly
/// once, and cached for every later call.
pub struct NativeFunction {
    pub name: String,
    pub arity: usize,
    pub call_name: String,
    target: OnceCell<BoundTarget>,
    resolutions: AtomicUsize,
}

impl NativeFunction {
    pub fn new(name: &str, arity: usize) -> Self {
        Self {
            name: name.to_string(),
            arity,
            call_name: format!(".Native({})", name),
            target: OnceCell::new(),
            resolutions: AtomicUsize::new(0),
        }
    }

    /// Times the target was resolved (instrumentation hook; stays at one
    /// after the first successful call)
    #[inline]
    pub fn resolution_count(&self) -> usize {
        self.resolutions.load(Ordering::Relaxed)
    }
}

/// The managed-to-native call bridge
pub struct CallBridge {
    backend: Arc<dyn NativeBackend>,
    registry: Arc<LibraryRegistry>,
}

impl CallBridge {
    pub fn new(backend: Arc<dyn NativeBackend>, registry: Arc<LibraryRegistry>) -> Self {
        debug!(
            event = "bridge_init",
            backend = backend.name(),
            "Call bridge constructed"
        );
        Self { backend, registry }
    }

    #[inline]
    pub fn backend(&self) -> &dyn NativeBackend {
        self.backend.as_ref()
    }

    #[inline]
    pub fn registry(&self) -> &Arc<LibraryRegistry> {
        &self.registry
    }

    /// Invoke a native function with managed arguments
    ///
    /// Failures here are internal defects by contract: arity and
    /// representation were fixed when the extension registered itself.
    /// The result is still surfaced as `Result` so the upcall layer owns
    /// the escalation policy.
    pub fn call(
        &self,
        function: &NativeFunction,
        args: &[NativeValue],
    ) -> Result<NativeValue, BridgeError> {
        let target = function.target.get_or_try_init(|| {
            function.resolutions.fetch_add(1, Ordering::Relaxed);
            let symbol = self
                .registry
                .find_symbol(&function.name)
                .ok_or_else(|| BridgeError::UnresolvedSymbol(function.name.clone()))?;
            self.backend.bind(&symbol)
        })?;

        log_native_call(&function.name, args.len());
        let mut wrapped = self.backend.wrap(args);
        let result = self.backend.invoke(target, &mut wrapped);
        drop(wrapped); // release wrappers before surfacing the outcome
        log_native_return(&function.name);
        result
    }
}
