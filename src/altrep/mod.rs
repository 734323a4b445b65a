//! ALTREP - alternative representations for vector objects
//!
//! Design: A class descriptor per exported native vector type, holding a
//! struct of *optional* method slots. Every generic vector operation
//! first consults the slot for that exact operation and otherwise falls
//! back to materializing the instance - a per-operation override table
//! with one universal fallback, not a virtual-method hierarchy.
//!
//! Methods are registered as raw callables tagged with the backend they
//! bind under: direct callables are plain addresses, hosted callables go
//! through an explicit signature-bound step at install time.

pub mod dispatch;


use crate::heap::{ElemKind, Value, Vector};
use crate::interop::{BackendKind, BoundTarget, HostFn, NativeAddress};
use crate::logging::debug;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

/// The operation kinds a class may override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Length,
    Elt,
    GetRegion,
    Dataptr,
    DataptrOrNull,
    ExtractSubset,
    IsSorted,
    NoNa,
    Sum,
    Min,
    Max,
    Duplicate,
    DuplicateEx,
    Coerce,
    Inspect,
    SerializedState,
    Unserialize,
    UnserializeEx,
    SetElt,
}

impl MethodKind {
    pub const ALL: [MethodKind; 19] = [
        Self::Length,
        Self::Elt,
        Self::GetRegion,
        Self::Dataptr,
        Self::DataptrOrNull,
        Self::ExtractSubset,
        Self::IsSorted,
        Self::NoNa,
        Self::Sum,
        Self::Min,
        Self::Max,
        Self::Duplicate,
        Self::DuplicateEx,
        Self::Coerce,
        Self::Inspect,
        Self::SerializedState,
        Self::Unserialize,
        Self::UnserializeEx,
        Self::SetElt,
    ];

    /// Decode the ABI method-kind index
    pub fn from_index(index: i32) -> Option<Self> {
        if (0..Self::ALL.len() as i32).contains(&index) {
            Some(Self::ALL[index as usize])
        } else {
            None
        }
    }

    /// The fixed textual signature used during hosted method binding
    pub const fn signature(self) -> &'static str {
        match self {
            Self::Length => "(instance) -> length",
            Self::Elt => "(instance, index) -> scalar",
            Self::GetRegion => "(instance, start, count, buffer) -> copied",
            Self::Dataptr => "(instance, writable) -> address",
            Self::DataptrOrNull => "(instance) -> address",
            Self::ExtractSubset => "(instance, indices) -> vector",
            Self::IsSorted => "(instance) -> code",
            Self::NoNa => "(instance) -> flag",
            Self::Sum => "(instance) -> scalar",
            Self::Min => "(instance) -> scalar",
            Self::Max => "(instance) -> scalar",
            Self::Duplicate => "(instance, deep) -> vector",
            Self::DuplicateEx => "(instance, deep) -> vector",
            Self::Coerce => "(instance, kind) -> vector",
            Self::Inspect => "(instance) -> flag",
            Self::SerializedState => "(instance) -> state",
            Self::Unserialize => "(class, state) -> instance",
            Self::UnserializeEx => "(class, state, attributes, flags) -> instance",
            Self::SetElt => "(instance, index, value) -> void",
        }
    }
}

/// Raw callable as the extension registered it
#[derive(Clone)]
pub enum MethodCallable {
    /// Machine address, invocable directly under the direct backend
    Address(NativeAddress),
    /// Host function plus its declared signature, bindable under the
    /// hosted backend after the signature check
    Host {
        func: HostFn,
        signature: &'static str,
    },
}

/// A registered method: raw callable plus the backend it binds under
#[derive(Clone)]
pub struct MethodDescriptor {
    pub callable: MethodCallable,
    pub backend: BackendKind,
}

impl MethodDescriptor {
    pub fn direct(address: NativeAddress) -> Self {
        Self {
            callable: MethodCallable::Address(address),
            backend: BackendKind::Direct,
        }
    }

    pub fn hosted(func: HostFn, signature: &'static str) -> Self {
        Self {
            callable: MethodCallable::Host { func, signature },
            backend: BackendKind::Hosted,
        }
    }
}

/// A method slot after install-time binding
#[derive(Clone)]
pub struct BoundMethod {
    pub target: BoundTarget,
    pub backend: BackendKind,
}

/// Struct of optional bound methods, one named slot per operation kind
#[derive(Default)]
pub struct MethodTable {
    pub length: Option<BoundMethod>,
    pub elt: Option<BoundMethod>,
    pub get_region: Option<BoundMethod>,
    pub dataptr: Option<BoundMethod>,
    pub dataptr_or_null: Option<BoundMethod>,
    pub extract_subset: Option<BoundMethod>,
    pub is_sorted: Option<BoundMethod>,
    pub no_na: Option<BoundMethod>,
    pub sum: Option<BoundMethod>,
    pub min: Option<BoundMethod>,
    pub max: Option<BoundMethod>,
    pub duplicate: Option<BoundMethod>,
    pub duplicate_ex: Option<BoundMethod>,
    pub coerce: Option<BoundMethod>,
    pub inspect: Option<BoundMethod>,
    pub serialized_state: Option<BoundMethod>,
    pub unserialize: Option<BoundMethod>,
    pub unserialize_ex: Option<BoundMethod>,
    pub set_elt: Option<BoundMethod>,
}

impl MethodTable {
    fn slot(&self, kind: MethodKind) -> &Option<BoundMethod> {
        match kind {
            MethodKind::Length => &self.length,
            MethodKind::Elt => &self.elt,
            MethodKind::GetRegion => &self.get_region,
            MethodKind::Dataptr => &self.dataptr,
            MethodKind::DataptrOrNull => &self.dataptr_or_null,
            MethodKind::ExtractSubset => &self.extract_subset,
            MethodKind::IsSorted => &self.is_sorted,
            MethodKind::NoNa => &self.no_na,
            MethodKind::Sum => &self.sum,
            MethodKind::Min => &self.min,
            MethodKind::Max => &self.max,
            MethodKind::Duplicate => &self.duplicate,
            MethodKind::DuplicateEx => &self.duplicate_ex,
            MethodKind::Coerce => &self.coerce,
            MethodKind::Inspect => &self.inspect,
            MethodKind::SerializedState => &self.serialized_state,
            MethodKind::Unserialize => &self.unserialize,
            MethodKind::UnserializeEx => &self.unserialize_ex,
            MethodKind::SetElt => &self.set_elt,
        }
    }

    fn slot_mut(&mut self, kind: MethodKind) -> &mut Option<BoundMethod> {
        match kind {
            MethodKind::Length => &mut self.length,
            MethodKind::Elt => &mut self.elt,
            MethodKind::GetRegion => &mut self.get_region,
            MethodKind::Dataptr => &mut self.dataptr,
            MethodKind::DataptrOrNull => &mut self.dataptr_or_null,
            MethodKind::ExtractSubset => &mut self.extract_subset,
            MethodKind::IsSorted => &mut self.is_sorted,
            MethodKind::NoNa => &mut self.no_na,
            MethodKind::Sum => &mut self.sum,
            MethodKind::Min => &mut self.min,
            MethodKind::Max => &mut self.max,
            MethodKind::Duplicate => &mut self.duplicate,
            MethodKind::DuplicateEx => &mut self.duplicate_ex,
            MethodKind::Coerce => &mut self.coerce,
            MethodKind::Inspect => &mut self.inspect,
            MethodKind::SerializedState => &mut self.serialized_state,
            MethodKind::Unserialize => &mut self.unserialize,
            MethodKind::UnserializeEx => &mut self.unserialize_ex,
            MethodKind::SetElt => &mut self.set_elt,
        }
    }

    fn registered(&self) -> usize {
        MethodKind::ALL
            .iter()
            .filter(|kind| self.slot(**kind).is_some())
            .count()
    }
}

/// ALTREP registration failures (load-time, recoverable)
#[derive(Debug)]
pub enum AltrepError {
    BackendMismatch {
        registered: BackendKind,
        active: BackendKind,
    },
    SignatureMismatch {
        kind: MethodKind,
        want: &'static str,
        have: &'static str,
    },
    NullAddress(MethodKind),
}

impl std::fmt::Display for AltrepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BackendMismatch { registered, active } => write!(
                f,
                "method registered for backend {:?} but {:?} is active",
                registered, active
            ),
            Self::SignatureMismatch { kind, want, have } => write!(
                f,
                "signature mismatch for {:?}: want '{}', have '{}'",
                kind, want, have
            ),
            Self::NullAddress(kind) => write!(f, "null method address for {:?}", kind),
        }
    }
}

impl std::error::Error for AltrepError {}

/// Class descriptor for one exported native vector type
///
/// Created once per (element kind, class name, package) and alive for the
/// process lifetime. Methods are attached incrementally during load.
pub struct AltrepClass {
    name: String,
    package: String,
    elem: ElemKind,
    methods: RwLock<MethodTable>,
}

impl AltrepClass {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn package(&self) -> &str {
        &self.package
    }

    #[inline]
    pub fn elem_kind(&self) -> ElemKind {
        self.elem
    }

    /// Bind and install one method implementation
    pub fn register_method(
        &self,
        kind: MethodKind,
        descriptor: MethodDescriptor,
    ) -> Result<(), AltrepError> {
        let active = crate::interop::active_backend().kind();
        if descriptor.backend != active {
            return Err(AltrepError::BackendMismatch {
                registered: descriptor.backend,
                active,
            });
        }
        let target = match descriptor.callable {
            MethodCallable::Address(addr) => {
                if addr.is_null() {
                    return Err(AltrepError::NullAddress(kind));
                }
                BoundTarget::Direct(addr)
            }
            MethodCallable::Host { func, signature } => {
                // The explicit signature-bound step hosted callables need.
                if signature != kind.signature() {
                    return Err(AltrepError::SignatureMismatch {
                        kind,
                        want: kind.signature(),
                        have: signature,
                    });
                }
                BoundTarget::Hosted(func)
            }
        };
        *self.methods.write().slot_mut(kind) = Some(BoundMethod {
            target,
            backend: descriptor.backend,
        });
        debug!(
            event = "altrep_method_registered",
            class = %self.name,
            kind = ?kind,
        );
        Ok(())
    }

    /// The bound method for an operation, if one was registered
    pub fn method(&self, kind: MethodKind) -> Option<BoundMethod> {
        self.methods.read().slot(kind).clone()
    }

    pub fn method_count(&self) -> usize {
        self.methods.read().registered()
    }
}

/// Vector-shaped instance backed by a class descriptor
///
/// The two data slots are opaque to generic code; only the owning
/// descriptor's methods interpret them. The materialized cache is filled
/// at most once.
pub struct AltrepInstance {
    class: Arc<AltrepClass>,
    data1: RefCell<Value>,
    data2: RefCell<Value>,
    cache: RefCell<Option<Rc<Vector>>>,
    materializations: Cell<usize>,
}

impl std::fmt::Debug for AltrepInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AltrepInstance")
            .field("class", &self.class.name)
            .field("materialized", &self.cache.borrow().is_some())
            .finish()
    }
}

impl AltrepInstance {
    #[inline]
    pub fn class(&self) -> &Arc<AltrepClass> {
        &self.class
    }

    pub fn data1(&self) -> Value {
        self.data1.borrow().clone()
    }

    pub fn set_data1(&self, value: Value) {
        self.data1.replace(value);
    }

    pub fn data2(&self) -> Value {
        self.data2.borrow().clone()
    }

    pub fn set_data2(&self, value: Value) {
        self.data2.replace(value);
    }

    /// Class membership check against a class name (optionally qualified
    /// by package as `"package:class"`)
    pub fn inherits(&self, class_name: &str) -> bool {
        match class_name.split_once(':') {
            Some((package, name)) => self.class.package == package && self.class.name == name,
            None => self.class.name == class_name,
        }
    }

    /// Times the materialization fallback ran (at most one by contract)
    #[inline]
    pub fn materialize_count(&self) -> usize {
        self.materializations.get()
    }

    pub(crate) fn cached(&self) -> Option<Rc<Vector>> {
        self.cache.borrow().clone()
    }

    pub(crate) fn fill_cache(&self, vector: Rc<Vector>) {
        self.materializations.set(self.materializations.get() + 1);
        self.cache.replace(Some(vector));
    }
}

/// Construct a vector-shaped instance over a class descriptor
pub fn new_instance(class: Arc<AltrepClass>, data1: Value, data2: Value) -> Rc<AltrepInstance> {
    Rc::new(AltrepInstance {
        class,
        data1: RefCell::new(data1),
        data2: RefCell::new(data2),
        cache: RefCell::new(None),
        materializations: Cell::new(0),
    })
}

// ============================================================================
// Class registry
// ============================================================================

static CLASSES: Lazy<DashMap<(ElemKind, String, String), Arc<AltrepClass>>> =
    Lazy::new(DashMap::new);

/// Create (or fetch) the class descriptor for a native vector type
pub fn make_class(elem: ElemKind, name: &str, package: &str) -> Arc<AltrepClass> {
    CLASSES
        .entry((elem, name.to_string(), package.to_string()))
        .or_insert_with(|| {
            debug!(event = "altrep_class_created", class = name, package = package);
            Arc::new(AltrepClass {
                name: name.to_string(),
                package: package.to_string(),
                elem,
                methods: RwLock::new(MethodTable::default()),
            })
        })
        .value()
        .clone()
}

/// Look up a registered class descriptor
pub fn find_class(elem: ElemKind, name: &str, package: &str) -> Option<Arc<AltrepClass>> {
    CLASSES
        .get(&(elem, name.to_string(), package.to_string()))
        .map(|entry| entry.value().clone())
}

/// Get ALTREP statistics
pub fn stats() -> AltrepStats {
    AltrepStats {
        classes: CLASSES.len(),
        methods: CLASSES
            .iter()
            .map(|entry| entry.value().method_count())
            .sum(),
    }
}

/// ALTREP registry statistics for monitoring
#[derive(Debug, Clone, Copy)]
pub struct AltrepStats {
    pub classes: usize,
    pub methods: usize,
}
