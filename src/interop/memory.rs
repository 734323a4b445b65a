//! Native memory adapter - bulk copies and foreign-value unwrapping
//!
//! Design: Connection I/O and array arguments move between raw native
//! addresses and managed vectors as bulk element copies, never one boxed
//! element at a time. Managed handles handed to native code as plain
//! words are spilled into a table of marked pseudo-addresses so the
//! direct backend can resolve them back.

use super::types::{BackendKind, NativeAddress, NativeValue};
use crate::heap::{self, Cells, Cplx, ElemKind, Value, Vector};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Adapter failures (misuse surfaced as language errors upstream)
#[derive(Debug)]
pub enum AdapterError {
    NotRawCopyable(ElemKind),
    LengthMismatch { want: usize, have: usize },
    NullAddress,
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRawCopyable(kind) => {
                write!(f, "element kind {:?} has no raw representation", kind)
            }
            Self::LengthMismatch { want, have } => {
                write!(f, "copy of {} elements into vector of length {}", want, have)
            }
            Self::NullAddress => write!(f, "null native address"),
        }
    }
}

impl std::error::Error for AdapterError {}

/// Copy `count` elements from a raw native address into a managed vector
///
/// # Safety
/// `src` must point at `count` valid elements of the vector's kind.
pub unsafe fn copy_to_managed(
    src: NativeAddress,
    dst: &Vector,
    count: usize,
) -> Result<(), AdapterError> {
    if src.is_null() {
        return Err(AdapterError::NullAddress);
    }
    if dst.len() < count {
        return Err(AdapterError::LengthMismatch {
            want: count,
            have: dst.len(),
        });
    }
    let mut cells = dst.cells_mut();
    let kind = cells.kind();
    match &mut *cells {
        Cells::Int(v) => {
            std::ptr::copy_nonoverlapping(src.raw() as *const i32, v.as_mut_ptr(), count)
        }
        Cells::Logical(v) => {
            std::ptr::copy_nonoverlapping(src.raw() as *const i32, v.as_mut_ptr(), count)
        }
        Cells::Real(v) => {
            std::ptr::copy_nonoverlapping(src.raw() as *const f64, v.as_mut_ptr(), count)
        }
        Cells::Complex(v) => {
            std::ptr::copy_nonoverlapping(src.raw() as *const Cplx, v.as_mut_ptr(), count)
        }
        Cells::Raw(v) => {
            std::ptr::copy_nonoverlapping(src.raw() as *const u8, v.as_mut_ptr(), count)
        }
        Cells::Str(_) | Cells::List(_) => return Err(AdapterError::NotRawCopyable(kind)),
    }
    Ok(())
}

/// Copy `count` elements from a managed vector out to a raw native address
///
/// # Safety
/// `dst` must have room for `count` elements of the vector's kind.
pub unsafe fn copy_from_managed(
    src: &Vector,
    dst: NativeAddress,
    count: usize,
) -> Result<(), AdapterError> {
    if dst.is_null() {
        return Err(AdapterError::NullAddress);
    }
    if src.len() < count {
        return Err(AdapterError::LengthMismatch {
            want: count,
            have: src.len(),
        });
    }
    let cells = src.cells();
    let kind = cells.kind();
    match &*cells {
        Cells::Int(v) => {
            std::ptr::copy_nonoverlapping(v.as_ptr(), dst.raw() as *mut i32, count)
        }
        Cells::Logical(v) => {
            std::ptr::copy_nonoverlapping(v.as_ptr(), dst.raw() as *mut i32, count)
        }
        Cells::Real(v) => {
            std::ptr::copy_nonoverlapping(v.as_ptr(), dst.raw() as *mut f64, count)
        }
        Cells::Complex(v) => {
            std::ptr::copy_nonoverlapping(v.as_ptr(), dst.raw() as *mut Cplx, count)
        }
        Cells::Raw(v) => {
            std::ptr::copy_nonoverlapping(v.as_ptr(), dst.raw() as *mut u8, count)
        }
        Cells::Str(_) | Cells::List(_) => return Err(AdapterError::NotRawCopyable(kind)),
    }
    Ok(())
}

// ============================================================================
// Spill table: managed handles stored to native memory as marked words
// ============================================================================

// Spilled handles get odd pseudo-addresses; real code/data pointers are
// always aligned, so the low bit doubles as the stored-pointer marker.
const SPILL_BASE: usize = 0x1000_0001;

thread_local! {
    static SPILLED: RefCell<SpillTable> = RefCell::new(SpillTable::new());
}

struct SpillTable {
    entries: HashMap<usize, Value>,
    next: usize,
}

impl SpillTable {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next: SPILL_BASE,
        }
    }
}

/// Spill a managed handle into native-visible memory, returning the
/// marked pseudo-address native code will carry around
pub fn spill(value: Value) -> NativeAddress {
    SPILLED.with(|table| {
        let mut table = table.borrow_mut();
        let addr = table.next;
        table.next += 2;
        table.entries.insert(addr, value);
        NativeAddress::new(addr)
    })
}

/// Resolve a marked pseudo-address back to its managed handle
pub fn resolve_spilled(addr: NativeAddress) -> Option<Value> {
    if addr.raw() & 1 == 0 {
        return None;
    }
    SPILLED.with(|table| table.borrow().entries.get(&addr.raw()).cloned())
}

/// Drop a spill entry once the per-call wrapper releases it
pub fn release_spilled(addr: NativeAddress) {
    SPILLED.with(|table| {
        table.borrow_mut().entries.remove(&addr.raw());
    });
}

/// Entries currently spilled (test instrumentation)
pub fn spilled_count() -> usize {
    SPILLED.with(|table| table.borrow().entries.len())
}

// ============================================================================
// Foreign-value unwrapping
// ============================================================================

/// Resolve a foreign value to its managed-understood form
///
/// Pass through if already managed; unbox a boxed scalar; under the
/// direct backend only, resolve stored-pointer markers through the spill
/// table; otherwise pass the raw pointer through unchanged.
pub fn unwrap(value: NativeValue, backend: BackendKind) -> Value {
    match value {
        NativeValue::Obj(v) => v,
        NativeValue::Buf(buf) => Value::Vector(buf.vector),
        NativeValue::Int(x) => heap::scalar_to_value(heap::Scalar::Int(x as i32)),
        NativeValue::Real(x) => heap::scalar_to_value(heap::Scalar::Real(x)),
        NativeValue::Ptr(addr) => {
            if backend == BackendKind::Direct {
                if let Some(resolved) = resolve_spilled(addr) {
                    return resolved;
                }
            }
            Value::ExternalPtr(Rc::new(heap::ExternalPtr {
                addr: std::cell::Cell::new(addr.raw()),
                tag: RefCell::new(Value::Null),
                protected: RefCell::new(Value::Null),
            }))
        }
        NativeValue::Void => Value::Null,
    }
}
