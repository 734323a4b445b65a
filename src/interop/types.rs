//! Wire-level types crossing the native boundary
//!
//! Defines the value representation the call bridge passes to and from
//! native code, and the opaque address newtype the registry stores.

use crate::heap::{ElemKind, Value};
use std::rc::Rc;

/// Opaque native code address
///
/// Wraps the raw address so registries and descriptors never handle bare
/// integers; tests may fabricate addresses freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct NativeAddress(pub usize);

impl NativeAddress {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Which of the two execution backends a callable binds under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendKind {
    /// Raw function-pointer invocation
    Direct,
    /// Table-registered host function, signature-bound at install time
    Hosted,
}

/// Host-side callable signature used by the hosted backend
///
/// Arguments arrive in wire form; the result is returned in wire form.
/// Plain function pointers keep hosted tables `Send + Sync`.
pub type HostFn = fn(&mut [NativeValue]) -> NativeValue;

/// A value in the form the bridge moves across the boundary
#[derive(Debug, Clone)]
pub enum NativeValue {
    Void,
    Int(i64),
    Real(f64),
    /// Raw pointer word (addresses, C strings, device handles)
    Ptr(NativeAddress),
    /// Managed handle passed through the boundary
    Obj(Value),
    /// Primitive-array argument to be wrapped per backend
    Buf(BufferArg),
}

impl NativeValue {
    /// Integer view of the wire word (defect on kind mismatch is the
    /// caller's concern; this is a lossy accessor for bridge internals)
    #[inline]
    pub fn as_word(&self) -> u64 {
        match self {
            Self::Void => 0,
            Self::Int(x) => *x as u64,
            Self::Real(x) => x.to_bits(),
            Self::Ptr(p) => p.raw() as u64,
            Self::Obj(_) | Self::Buf(_) => 0,
        }
    }

    #[inline]
    pub fn is_obj(&self) -> bool {
        matches!(self, Self::Obj(_))
    }
}

/// A managed vector exposed to a native call as a contiguous buffer
///
/// `writable` buffers are copied back into the vector when the per-call
/// wrapper is released.
#[derive(Debug, Clone)]
pub struct BufferArg {
    pub vector: Rc<crate::heap::Vector>,
    pub writable: bool,
}

impl BufferArg {
    pub fn new(vector: Rc<crate::heap::Vector>, writable: bool) -> Self {
        Self { vector, writable }
    }

    #[inline]
    pub fn kind(&self) -> ElemKind {
        self.vector.kind()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.vector.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vector.is_empty()
    }
}
