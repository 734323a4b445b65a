//! Managed value handles - the heap-side face of the native boundary
//!
//! Design: Cheap-to-clone reference handles over interior-mutable payloads:
//! - One `Value` handle kind per embedding-API type tag
//! - Vectors carry their cells, attribute list, and S4 flag
//! - Symbols and character data are interned process-wide
//!
//! The full heap (allocator, collector, evaluator) lives outside this
//! crate; this module is the minimal model the boundary contract needs.

mod env;

#[cfg(test)]
mod tests;

pub use env::{Binding, Env, EnvError};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Element kind of a vector payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElemKind {
    Int,
    Real,
    Logical,
    Complex,
    Raw,
    Str,
    List,
}

impl ElemKind {
    /// Numeric type tag used on the embedding ABI
    #[inline]
    pub const fn type_tag(self) -> i32 {
        match self {
            Self::Logical => 6,
            Self::Int => 7,
            Self::Real => 8,
            Self::Complex => 9,
            Self::Str => 10,
            Self::Raw => 11,
            Self::List => 12,
        }
    }

    /// Decode an ABI type tag into an element kind
    pub const fn from_tag(tag: i32) -> Option<Self> {
        match tag {
            6 => Some(Self::Logical),
            7 => Some(Self::Int),
            8 => Some(Self::Real),
            9 => Some(Self::Complex),
            10 => Some(Self::Str),
            11 => Some(Self::Raw),
            12 => Some(Self::List),
            _ => None,
        }
    }

    /// Width of one element in bytes as seen by native code
    #[inline]
    pub const fn elem_size(self) -> usize {
        match self {
            Self::Raw => 1,
            Self::Int | Self::Logical => 4,
            Self::Real | Self::Str | Self::List => 8,
            Self::Complex => 16,
        }
    }
}

/// Complex element, matching the C layout native code expects
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[repr(C)]
pub struct Cplx {
    pub re: f64,
    pub im: f64,
}

/// One scalar element read out of (or written into) a vector
#[derive(Debug, Clone)]
pub enum Scalar {
    Int(i32),
    Real(f64),
    Logical(i32),
    Complex(Cplx),
    Raw(u8),
    Str(Rc<str>),
    Value(Value),
}

impl Scalar {
    /// The default-allocated element for a kind (zero / empty / null)
    pub fn zero(kind: ElemKind) -> Self {
        match kind {
            ElemKind::Int => Self::Int(0),
            ElemKind::Real => Self::Real(0.0),
            ElemKind::Logical => Self::Logical(0),
            ElemKind::Complex => Self::Complex(Cplx::default()),
            ElemKind::Raw => Self::Raw(0),
            ElemKind::Str => Self::Str(intern_char("")),
            ElemKind::List => Self::Value(Value::Null),
        }
    }
}

/// Typed cell storage for a vector
#[derive(Debug, Clone)]
pub enum Cells {
    Int(Vec<i32>),
    Real(Vec<f64>),
    Logical(Vec<i32>),
    Complex(Vec<Cplx>),
    Raw(Vec<u8>),
    Str(Vec<Rc<str>>),
    List(Vec<Value>),
}

impl Cells {
    /// Default-allocated cells of the given kind and length
    pub fn zeroed(kind: ElemKind, len: usize) -> Self {
        match kind {
            ElemKind::Int => Self::Int(vec![0; len]),
            ElemKind::Real => Self::Real(vec![0.0; len]),
            ElemKind::Logical => Self::Logical(vec![0; len]),
            ElemKind::Complex => Self::Complex(vec![Cplx::default(); len]),
            ElemKind::Raw => Self::Raw(vec![0; len]),
            ElemKind::Str => Self::Str(vec![intern_char(""); len]),
            ElemKind::List => Self::List(vec![Value::Null; len]),
        }
    }

    #[inline]
    pub fn kind(&self) -> ElemKind {
        match self {
            Self::Int(_) => ElemKind::Int,
            Self::Real(_) => ElemKind::Real,
            Self::Logical(_) => ElemKind::Logical,
            Self::Complex(_) => ElemKind::Complex,
            Self::Raw(_) => ElemKind::Raw,
            Self::Str(_) => ElemKind::Str,
            Self::List(_) => ElemKind::List,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Real(v) => v.len(),
            Self::Logical(v) => v.len(),
            Self::Complex(v) => v.len(),
            Self::Raw(v) => v.len(),
            Self::Str(v) => v.len(),
            Self::List(v) => v.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read one element; panics on out-of-range index (caller validates)
    pub fn get(&self, index: usize) -> Scalar {
        match self {
            Self::Int(v) => Scalar::Int(v[index]),
            Self::Real(v) => Scalar::Real(v[index]),
            Self::Logical(v) => Scalar::Logical(v[index]),
            Self::Complex(v) => Scalar::Complex(v[index]),
            Self::Raw(v) => Scalar::Raw(v[index]),
            Self::Str(v) => Scalar::Str(v[index].clone()),
            Self::List(v) => Scalar::Value(v[index].clone()),
        }
    }

    /// Write one element; ignores a kind mismatch in release builds
    pub fn set(&mut self, index: usize, value: Scalar) {
        match (self, value) {
            (Self::Int(v), Scalar::Int(x)) => v[index] = x,
            (Self::Real(v), Scalar::Real(x)) => v[index] = x,
            (Self::Logical(v), Scalar::Logical(x)) => v[index] = x,
            (Self::Complex(v), Scalar::Complex(x)) => v[index] = x,
            (Self::Raw(v), Scalar::Raw(x)) => v[index] = x,
            (Self::Str(v), Scalar::Str(x)) => v[index] = x,
            (Self::List(v), Scalar::Value(x)) => v[index] = x,
            _ => debug_assert!(false, "element kind mismatch"),
        }
    }
}

/// Standard contiguous vector with attributes
#[derive(Debug)]
pub struct Vector {
    cells: RefCell<Cells>,
    attrs: RefCell<Vec<(Rc<Symbol>, Value)>>,
    s4: Cell<bool>,
}

impl Vector {
    /// Allocate a default-initialized vector
    pub fn alloc(kind: ElemKind, len: usize) -> Rc<Self> {
        Rc::new(Self {
            cells: RefCell::new(Cells::zeroed(kind, len)),
            attrs: RefCell::new(Vec::new()),
            s4: Cell::new(false),
        })
    }

    /// Wrap existing cells
    pub fn from_cells(cells: Cells) -> Rc<Self> {
        Rc::new(Self {
            cells: RefCell::new(cells),
            attrs: RefCell::new(Vec::new()),
            s4: Cell::new(false),
        })
    }

    #[inline]
    pub fn kind(&self) -> ElemKind {
        self.cells.borrow().kind()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cells.borrow().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> Scalar {
        self.cells.borrow().get(index)
    }

    #[inline]
    pub fn set(&self, index: usize, value: Scalar) {
        self.cells.borrow_mut().set(index, value);
    }

    /// Borrow the raw cells (transient; native storage exposure goes
    /// through the memory adapter)
    pub fn cells(&self) -> std::cell::Ref<'_, Cells> {
        self.cells.borrow()
    }

    pub fn cells_mut(&self) -> std::cell::RefMut<'_, Cells> {
        self.cells.borrow_mut()
    }

    /// Attribute lookup by symbol
    pub fn get_attr(&self, name: &Rc<Symbol>) -> Value {
        self.attrs
            .borrow()
            .iter()
            .find(|(s, _)| Rc::ptr_eq(s, name))
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null)
    }

    /// Attribute set/replace; setting Null removes
    pub fn set_attr(&self, name: Rc<Symbol>, value: Value) {
        let mut attrs = self.attrs.borrow_mut();
        if value.is_null() {
            attrs.retain(|(s, _)| !Rc::ptr_eq(s, &name));
            return;
        }
        if let Some(slot) = attrs.iter_mut().find(|(s, _)| Rc::ptr_eq(s, &name)) {
            slot.1 = value;
        } else {
            attrs.push((name, value));
        }
    }

    pub fn attr_names(&self) -> Vec<Rc<Symbol>> {
        self.attrs.borrow().iter().map(|(s, _)| s.clone()).collect()
    }

    #[inline]
    pub fn is_s4(&self) -> bool {
        self.s4.get()
    }

    #[inline]
    pub fn set_s4(&self, flag: bool) {
        self.s4.set(flag);
    }

    /// Deep copy, dropping nothing (attributes included)
    pub fn duplicate(&self) -> Rc<Self> {
        Rc::new(Self {
            cells: RefCell::new(self.cells.borrow().clone()),
            attrs: RefCell::new(self.attrs.borrow().clone()),
            s4: Cell::new(self.s4.get()),
        })
    }
}

/// Interned language symbol
#[derive(Debug)]
pub struct Symbol {
    name: Rc<str>,
}

impl Symbol {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Pairlist node (car/cdr/tag), the linked argument-list form
#[derive(Debug)]
pub struct Pairlist {
    pub car: Value,
    pub cdr: Value,
    pub tag: Value,
}

/// Lazily evaluated argument slot
#[derive(Debug)]
pub struct Promise {
    pub expr: Value,
    pub env: Rc<Env>,
    pub value: RefCell<Option<Value>>,
}

/// Opaque native pointer with protected companions
///
/// The tag and protected values are owned by the handle, which keeps them
/// reachable for as long as the pointer itself is alive.
#[derive(Debug)]
pub struct ExternalPtr {
    pub addr: Cell<usize>,
    pub tag: RefCell<Value>,
    pub protected: RefCell<Value>,
}

/// Weak reference cell with optional finalizer
///
/// Weakness is cooperative at this layer: the collector (out of scope
/// here) clears the key; `clear` models that transition for native code.
#[derive(Debug)]
pub struct WeakRef {
    pub key: RefCell<Value>,
    pub value: RefCell<Value>,
    pub finalizer: RefCell<Value>,
    pub cleared: Cell<bool>,
}

impl WeakRef {
    pub fn clear(&self) {
        self.key.replace(Value::Null);
        self.value.replace(Value::Null);
        self.cleared.set(true);
    }
}

/// Universal managed value handle crossing the native boundary
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    /// Lookup sentinel: no binding exists
    Unbound,
    /// Sentinel for a missing argument slot
    Missing,
    Vector(Rc<Vector>),
    Altrep(Rc<crate::altrep::AltrepInstance>),
    Symbol(Rc<Symbol>),
    Pairlist(Rc<RefCell<Pairlist>>),
    Env(Rc<Env>),
    Promise(Rc<Promise>),
    Char(Rc<str>),
    ExternalPtr(Rc<ExternalPtr>),
    WeakRef(Rc<WeakRef>),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[inline]
    pub fn is_environment(&self) -> bool {
        matches!(self, Self::Env(_))
    }

    #[inline]
    pub fn is_vector(&self) -> bool {
        matches!(self, Self::Vector(_) | Self::Altrep(_))
    }

    /// Numeric type tag on the embedding ABI
    pub fn type_tag(&self) -> i32 {
        match self {
            Self::Null => 0,
            Self::Symbol(_) => 1,
            Self::Pairlist(_) => 2,
            Self::Promise(_) => 3,
            Self::Env(_) => 4,
            Self::Char(_) => 5,
            Self::Vector(v) => v.kind().type_tag(),
            Self::Altrep(a) => a.class().elem_kind().type_tag(),
            Self::ExternalPtr(_) => 13,
            Self::WeakRef(_) => 14,
            Self::Unbound | Self::Missing => 15,
        }
    }

    /// Human-readable type name (trace synopsis, error messages)
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Unbound => "unbound",
            Self::Missing => "missing",
            Self::Symbol(_) => "symbol",
            Self::Pairlist(_) => "pairlist",
            Self::Promise(_) => "promise",
            Self::Env(_) => "environment",
            Self::Char(_) => "char",
            Self::ExternalPtr(_) => "externalptr",
            Self::WeakRef(_) => "weakref",
            Self::Vector(v) => match v.kind() {
                ElemKind::Int => "integer",
                ElemKind::Real => "double",
                ElemKind::Logical => "logical",
                ElemKind::Complex => "complex",
                ElemKind::Raw => "raw",
                ElemKind::Str => "character",
                ElemKind::List => "list",
            },
            Self::Altrep(_) => "altrep",
        }
    }

    /// Stable identity for trace synopses (payload address)
    pub fn identity(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::Unbound => 1,
            Self::Missing => 2,
            Self::Vector(v) => Rc::as_ptr(v) as usize,
            Self::Altrep(a) => Rc::as_ptr(a) as usize,
            Self::Symbol(s) => Rc::as_ptr(s) as usize,
            Self::Pairlist(p) => Rc::as_ptr(p) as usize,
            Self::Env(e) => Rc::as_ptr(e) as usize,
            Self::Promise(p) => Rc::as_ptr(p) as usize,
            Self::Char(c) => c.as_ptr() as usize,
            Self::ExternalPtr(p) => Rc::as_ptr(p) as usize,
            Self::WeakRef(w) => Rc::as_ptr(w) as usize,
        }
    }

    /// Length as native code observes it
    pub fn length(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::Vector(v) => v.len(),
            Self::Altrep(a) => crate::altrep::dispatch::length(a),
            Self::Char(c) => c.len(),
            Self::Pairlist(p) => {
                let mut n = 1;
                let mut cdr = p.borrow().cdr.clone();
                while let Self::Pairlist(next) = cdr {
                    n += 1;
                    cdr = next.borrow().cdr.clone();
                }
                n
            }
            _ => 1,
        }
    }

    /// Pointer-identity equality (the ABI's handle comparison)
    pub fn same_object(&self, other: &Value) -> bool {
        self.identity() == other.identity() && self.type_tag() == other.type_tag()
    }
}

// ============================================================================
// Interning tables
// ============================================================================

thread_local! {
    static SYMBOLS: RefCell<HashMap<String, Rc<Symbol>>> = RefCell::new(HashMap::new());
    static CHARS: RefCell<HashMap<String, Rc<str>>> = RefCell::new(HashMap::new());
}

/// Intern a symbol by name (one handle per distinct name)
pub fn install(name: &str) -> Rc<Symbol> {
    SYMBOLS.with(|table| {
        let mut table = table.borrow_mut();
        if let Some(sym) = table.get(name) {
            return sym.clone();
        }
        let sym = Rc::new(Symbol {
            name: Rc::from(name),
        });
        table.insert(name.to_string(), sym.clone());
        sym
    })
}

/// Intern character data (one shared allocation per distinct string)
pub fn intern_char(text: &str) -> Rc<str> {
    CHARS.with(|table| {
        let mut table = table.borrow_mut();
        if let Some(chars) = table.get(text) {
            return chars.clone();
        }
        let chars: Rc<str> = Rc::from(text);
        table.insert(text.to_string(), chars.clone());
        chars
    })
}

/// Coercion failure
#[derive(Debug)]
pub enum CoerceError {
    Unsupported { from: &'static str, to: ElemKind },
}

impl std::fmt::Display for CoerceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsupported { from, to } => {
                write!(f, "cannot coerce {} to kind {:?}", from, to)
            }
        }
    }
}

impl std::error::Error for CoerceError {}

/// Coerce a vector value to another element kind, copying cells
///
/// Only the conversions native extensions rely on are supported; anything
/// else reports `Unsupported` for the caller to surface as a language error.
pub fn coerce(value: &Value, to: ElemKind) -> Result<Value, CoerceError> {
    let src = match value {
        Value::Vector(v) => v.clone(),
        Value::Altrep(a) => crate::altrep::dispatch::materialize(a),
        Value::Null => return Ok(Value::Vector(Vector::alloc(to, 0))),
        other => {
            return Err(CoerceError::Unsupported {
                from: other.type_name(),
                to,
            })
        }
    };
    if src.kind() == to {
        return Ok(Value::Vector(src));
    }

    let n = src.len();
    let out = Vector::alloc(to, n);
    for i in 0..n {
        let elem = match (src.get(i), to) {
            (Scalar::Int(x), ElemKind::Real) => Scalar::Real(x as f64),
            (Scalar::Int(x), ElemKind::Logical) => Scalar::Logical((x != 0) as i32),
            (Scalar::Logical(x), ElemKind::Int) => Scalar::Int(x),
            (Scalar::Logical(x), ElemKind::Real) => Scalar::Real(x as f64),
            (Scalar::Real(x), ElemKind::Int) => Scalar::Int(x as i32),
            (Scalar::Real(x), ElemKind::Logical) => Scalar::Logical((x != 0.0) as i32),
            (Scalar::Raw(x), ElemKind::Int) => Scalar::Int(x as i32),
            (Scalar::Int(x), ElemKind::Raw) => Scalar::Raw(x as u8),
            (Scalar::Int(x), ElemKind::Str) => Scalar::Str(intern_char(&x.to_string())),
            (Scalar::Real(x), ElemKind::Str) => Scalar::Str(intern_char(&x.to_string())),
            (s, ElemKind::List) => match s {
                Scalar::Value(v) => Scalar::Value(v),
                s => Scalar::Value(scalar_to_value(s)),
            },
            _ => {
                return Err(CoerceError::Unsupported {
                    from: value.type_name(),
                    to,
                })
            }
        };
        out.set(i, elem);
    }
    Ok(Value::Vector(out))
}

/// Box a scalar into a one-element vector value
pub fn scalar_to_value(scalar: Scalar) -> Value {
    let cells = match scalar {
        Scalar::Int(x) => Cells::Int(vec![x]),
        Scalar::Real(x) => Cells::Real(vec![x]),
        Scalar::Logical(x) => Cells::Logical(vec![x]),
        Scalar::Complex(x) => Cells::Complex(vec![x]),
        Scalar::Raw(x) => Cells::Raw(vec![x]),
        Scalar::Str(x) => Cells::Str(vec![x]),
        Scalar::Value(v) => return v,
    };
    Value::Vector(Vector::from_cells(cells))
}
