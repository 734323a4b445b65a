//! Value operations - allocation, coercion, attributes, pairlists
//!
//! The capability tables native code reaches for anything that creates
//! or inspects managed values. Operations act directly on opaque heap
//! handles; anything exposing raw storage forces ALTREP materialization
//! first (native code expects contiguous memory).

use super::error::{RuntimeError, UpcallResult};
use crate::altrep;
use crate::heap::{self, Cells, ElemKind, Pairlist, Scalar, Value, Vector};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Allocation and construction operations
#[derive(Default)]
pub struct AllocOps;

impl AllocOps {
    /// Allocate a default-initialized vector of the tagged kind
    pub fn alloc_vector(&self, tag: i32, len: usize) -> UpcallResult<Value> {
        let kind = ElemKind::from_tag(tag).ok_or(RuntimeError::Type {
            expected: "vector type tag",
            actual: "unknown tag",
        })?;
        Ok(Value::Vector(Vector::alloc(kind, len)))
    }

    /// Allocate a matrix: a vector with a `dim` attribute
    pub fn alloc_matrix(&self, tag: i32, nrow: usize, ncol: usize) -> UpcallResult<Value> {
        let value = self.alloc_vector(tag, nrow * ncol)?;
        if let Value::Vector(v) = &value {
            v.set_attr(
                heap::install("dim"),
                Value::Vector(Vector::from_cells(Cells::Int(vec![nrow as i32, ncol as i32]))),
            );
        }
        Ok(value)
    }

    /// One-element integer vector
    pub fn scalar_int(&self, value: i32) -> Value {
        heap::scalar_to_value(Scalar::Int(value))
    }

    /// One-element double vector
    pub fn scalar_real(&self, value: f64) -> Value {
        heap::scalar_to_value(Scalar::Real(value))
    }

    /// One-element logical vector
    pub fn scalar_logical(&self, value: i32) -> Value {
        heap::scalar_to_value(Scalar::Logical(value))
    }

    /// Interned character data
    pub fn mk_char(&self, text: &str) -> Value {
        Value::Char(heap::intern_char(text))
    }

    /// One-element character vector
    pub fn mk_string(&self, text: &str) -> Value {
        heap::scalar_to_value(Scalar::Str(heap::intern_char(text)))
    }

    /// Interned symbol
    pub fn install(&self, name: &str) -> Value {
        Value::Symbol(heap::install(name))
    }

    /// External pointer; tag and protected stay reachable with it
    pub fn new_extptr(&self, addr: usize, tag: Value, protected: Value) -> Value {
        Value::ExternalPtr(Rc::new(heap::ExternalPtr {
            addr: Cell::new(addr),
            tag: RefCell::new(tag),
            protected: RefCell::new(protected),
        }))
    }

    /// Weak reference cell
    pub fn new_weakref(&self, key: Value, value: Value, finalizer: Value) -> Value {
        Value::WeakRef(Rc::new(heap::WeakRef {
            key: RefCell::new(key),
            value: RefCell::new(value),
            finalizer: RefCell::new(finalizer),
            cleared: Cell::new(false),
        }))
    }
}

/// Coercion and predicate operations
#[derive(Default)]
pub struct CoerceOps;

impl CoerceOps {
    /// ABI type tag of a value
    pub fn type_tag(&self, value: &Value) -> i32 {
        value.type_tag()
    }

    /// Length as native code observes it (ALTREP-aware)
    pub fn length(&self, value: &Value) -> usize {
        value.length()
    }

    /// Coerce to the kind named by an ABI tag
    pub fn coerce(&self, value: &Value, tag: i32) -> UpcallResult<Value> {
        let kind = ElemKind::from_tag(tag).ok_or(RuntimeError::Type {
            expected: "vector type tag",
            actual: "unknown tag",
        })?;
        match value {
            Value::Altrep(inst) => altrep::dispatch::coerce(inst, kind).ok_or_else(|| {
                RuntimeError::Coerce(format!("cannot coerce altrep to {:?}", kind))
            }),
            other => Ok(heap::coerce(other, kind)?),
        }
    }

    /// Raw storage of a vector value, materializing ALTREP instances
    ///
    /// The returned pointer aliases managed storage; transient use only.
    pub fn dataptr(&self, value: &Value, writable: bool) -> UpcallResult<*mut core::ffi::c_void> {
        match value {
            Value::Altrep(inst) => Ok(altrep::dispatch::dataptr(inst, writable)),
            Value::Vector(v) => Ok(vector_cells_ptr(v)),
            other => Err(RuntimeError::Type {
                expected: "vector",
                actual: other.type_name(),
            }),
        }
    }

    /// One element of a vector value (ALTREP-aware)
    pub fn elt(&self, value: &Value, index: usize) -> UpcallResult<Scalar> {
        match value {
            Value::Altrep(inst) => Ok(altrep::dispatch::elt(inst, index)),
            Value::Vector(v) if index < v.len() => Ok(v.get(index)),
            Value::Vector(_) => Err(RuntimeError::Type {
                expected: "index in range",
                actual: "out of range",
            }),
            other => Err(RuntimeError::Type {
                expected: "vector",
                actual: other.type_name(),
            }),
        }
    }

    /// Write one element of a vector value (ALTREP-aware)
    pub fn set_elt(&self, value: &Value, index: usize, elem: Scalar) -> UpcallResult<()> {
        match value {
            Value::Altrep(inst) => {
                altrep::dispatch::set_elt(inst, index, elem);
                Ok(())
            }
            Value::Vector(v) if index < v.len() => {
                v.set(index, elem);
                Ok(())
            }
            Value::Vector(_) => Err(RuntimeError::Type {
                expected: "index in range",
                actual: "out of range",
            }),
            other => Err(RuntimeError::Type {
                expected: "vector",
                actual: other.type_name(),
            }),
        }
    }

    pub fn is_null(&self, value: &Value) -> bool {
        value.is_null()
    }

    pub fn is_vector(&self, value: &Value) -> bool {
        value.is_vector()
    }

    pub fn is_environment(&self, value: &Value) -> bool {
        value.is_environment()
    }

    pub fn is_string(&self, value: &Value) -> bool {
        matches!(value, Value::Vector(v) if v.kind() == ElemKind::Str)
    }

    /// Duplicate a value (deep for vectors, ALTREP-aware)
    pub fn duplicate(&self, value: &Value, deep: bool) -> Value {
        match value {
            Value::Altrep(inst) => altrep::dispatch::duplicate(inst, deep),
            Value::Vector(v) => Value::Vector(v.duplicate()),
            other => other.clone(),
        }
    }
}

fn vector_cells_ptr(vector: &Vector) -> *mut core::ffi::c_void {
    let mut cells = vector.cells_mut();
    match &mut *cells {
        Cells::Int(v) => v.as_mut_ptr() as *mut core::ffi::c_void,
        Cells::Logical(v) => v.as_mut_ptr() as *mut core::ffi::c_void,
        Cells::Real(v) => v.as_mut_ptr() as *mut core::ffi::c_void,
        Cells::Complex(v) => v.as_mut_ptr() as *mut core::ffi::c_void,
        Cells::Raw(v) => v.as_mut_ptr() as *mut core::ffi::c_void,
        Cells::Str(_) | Cells::List(_) => std::ptr::null_mut(),
    }
}

/// Attribute and object-flag operations
#[derive(Default)]
pub struct AttrOps;

impl AttrOps {
    fn vector_of(value: &Value) -> UpcallResult<Rc<Vector>> {
        match value {
            Value::Vector(v) => Ok(v.clone()),
            Value::Altrep(inst) => Ok(altrep::dispatch::materialize(inst)),
            other => Err(RuntimeError::Type {
                expected: "vector",
                actual: other.type_name(),
            }),
        }
    }

    pub fn get_attr(&self, value: &Value, name: &str) -> UpcallResult<Value> {
        Ok(Self::vector_of(value)?.get_attr(&heap::install(name)))
    }

    pub fn set_attr(&self, value: &Value, name: &str, attr: Value) -> UpcallResult<()> {
        Self::vector_of(value)?.set_attr(heap::install(name), attr);
        Ok(())
    }

    pub fn get_class(&self, value: &Value) -> UpcallResult<Value> {
        self.get_attr(value, "class")
    }

    pub fn set_class(&self, value: &Value, class: Value) -> UpcallResult<()> {
        self.set_attr(value, "class", class)
    }

    /// S4 object flag
    pub fn is_s4(&self, value: &Value) -> bool {
        matches!(value, Value::Vector(v) if v.is_s4())
    }

    pub fn set_s4(&self, value: &Value, flag: bool) -> UpcallResult<()> {
        Self::vector_of(value)?.set_s4(flag);
        Ok(())
    }
}

/// Pairlist traversal and mutation operations
#[derive(Default)]
pub struct ListOps;

impl ListOps {
    fn node_of(value: &Value) -> UpcallResult<Rc<RefCell<Pairlist>>> {
        match value {
            Value::Pairlist(node) => Ok(node.clone()),
            other => Err(RuntimeError::Type {
                expected: "pairlist",
                actual: other.type_name(),
            }),
        }
    }

    /// Construct one node in front of `cdr`
    pub fn cons(&self, car: Value, cdr: Value) -> Value {
        Value::Pairlist(Rc::new(RefCell::new(Pairlist {
            car,
            cdr,
            tag: Value::Null,
        })))
    }

    pub fn car(&self, value: &Value) -> UpcallResult<Value> {
        Ok(Self::node_of(value)?.borrow().car.clone())
    }

    pub fn cdr(&self, value: &Value) -> UpcallResult<Value> {
        Ok(Self::node_of(value)?.borrow().cdr.clone())
    }

    pub fn tag(&self, value: &Value) -> UpcallResult<Value> {
        Ok(Self::node_of(value)?.borrow().tag.clone())
    }

    pub fn set_car(&self, value: &Value, car: Value) -> UpcallResult<()> {
        Self::node_of(value)?.borrow_mut().car = car;
        Ok(())
    }

    pub fn set_cdr(&self, value: &Value, cdr: Value) -> UpcallResult<()> {
        Self::node_of(value)?.borrow_mut().cdr = cdr;
        Ok(())
    }

    pub fn set_tag(&self, value: &Value, tag: Value) -> UpcallResult<()> {
        Self::node_of(value)?.borrow_mut().tag = tag;
        Ok(())
    }

    /// The nth node's car, zero-based
    pub fn nth(&self, value: &Value, n: usize) -> UpcallResult<Value> {
        let mut cursor = value.clone();
        for _ in 0..n {
            cursor = self.cdr(&cursor)?;
        }
        self.car(&cursor)
    }
}

/// External pointer and weak reference operations
#[derive(Default)]
pub struct PtrOps;

impl PtrOps {
    fn extptr_of(value: &Value) -> UpcallResult<Rc<heap::ExternalPtr>> {
        match value {
            Value::ExternalPtr(ptr) => Ok(ptr.clone()),
            other => Err(RuntimeError::Type {
                expected: "externalptr",
                actual: other.type_name(),
            }),
        }
    }

    fn weakref_of(value: &Value) -> UpcallResult<Rc<heap::WeakRef>> {
        match value {
            Value::WeakRef(w) => Ok(w.clone()),
            other => Err(RuntimeError::Type {
                expected: "weakref",
                actual: other.type_name(),
            }),
        }
    }

    pub fn extptr_addr(&self, value: &Value) -> UpcallResult<usize> {
        Ok(Self::extptr_of(value)?.addr.get())
    }

    pub fn extptr_tag(&self, value: &Value) -> UpcallResult<Value> {
        Ok(Self::extptr_of(value)?.tag.borrow().clone())
    }

    pub fn extptr_protected(&self, value: &Value) -> UpcallResult<Value> {
        Ok(Self::extptr_of(value)?.protected.borrow().clone())
    }

    /// Clear the address (native resource released)
    pub fn extptr_clear(&self, value: &Value) -> UpcallResult<()> {
        Self::extptr_of(value)?.addr.set(0);
        Ok(())
    }

    pub fn weakref_key(&self, value: &Value) -> UpcallResult<Value> {
        Ok(Self::weakref_of(value)?.key.borrow().clone())
    }

    pub fn weakref_value(&self, value: &Value) -> UpcallResult<Value> {
        Ok(Self::weakref_of(value)?.value.borrow().clone())
    }

    /// Clear the cell and hand back the finalizer to run, if any
    pub fn weakref_clear(&self, value: &Value) -> UpcallResult<Value> {
        let weak = Self::weakref_of(value)?;
        let finalizer = weak.finalizer.borrow().clone();
        weak.clear();
        Ok(finalizer)
    }
}
