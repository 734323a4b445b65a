//! Generic vector operations over ALTREP instances
//!
//! One dispatch helper per operation: consult the class's method slot,
//! invoke it through the active backend when present, otherwise force
//! materialization and serve the operation from the cached standard
//! vector. Materialization runs at most once per instance.

use super::{AltrepClass, AltrepInstance, BoundMethod, MethodKind};
use crate::heap::{self, Cells, ElemKind, Scalar, Value, Vector};
use crate::interop::{memory, BufferArg, NativeAddress, NativeValue};
use crate::logging::{debug, trace};
use std::rc::Rc;
use std::sync::Arc;

/// Invoke a bound method through the active backend
///
/// Method invocation failures are bridge-layer defects: the callable was
/// validated when it was installed.
fn invoke(method: &BoundMethod, args: &[NativeValue]) -> NativeValue {
    let backend = crate::interop::active_backend();
    let mut wrapped = backend.wrap(args);
    match backend.invoke(&method.target, &mut wrapped) {
        Ok(result) => result,
        Err(err) => crate::defect!("altrep method invocation failed: {}", err),
    }
}

#[inline]
fn instance_arg(inst: &Rc<AltrepInstance>) -> NativeValue {
    NativeValue::Obj(Value::Altrep(inst.clone()))
}

/// Interpret a wire result as a managed value
///
/// Direct-backend methods return handle words; resolve them through the
/// spill table. Hosted methods return managed handles directly.
fn wire_value(ret: NativeValue) -> Value {
    match ret {
        NativeValue::Obj(v) => v,
        NativeValue::Void => Value::Null,
        NativeValue::Real(x) => heap::scalar_to_value(Scalar::Real(x)),
        NativeValue::Ptr(addr) => memory::resolve_spilled(addr)
            .unwrap_or_else(|| crate::defect!("unresolvable handle word {:#x}", addr.raw())),
        NativeValue::Int(word) => {
            let addr = NativeAddress::new(word as usize);
            memory::resolve_spilled(addr)
                .unwrap_or_else(|| crate::defect!("unresolvable handle word {:#x}", word))
        }
        NativeValue::Buf(buf) => Value::Vector(buf.vector),
    }
}

/// Interpret a wire result as a nonnegative length
fn wire_len(ret: NativeValue) -> usize {
    match ret {
        NativeValue::Int(x) if x >= 0 => x as usize,
        other => crate::defect!("length method returned {:?}", other),
    }
}

/// Interpret a wire result as one element of the given kind
fn wire_scalar(ret: NativeValue, kind: ElemKind) -> Scalar {
    match (kind, ret) {
        (ElemKind::Int, NativeValue::Int(x)) => Scalar::Int(x as i32),
        (ElemKind::Logical, NativeValue::Int(x)) => Scalar::Logical(x as i32),
        (ElemKind::Raw, NativeValue::Int(x)) => Scalar::Raw(x as u8),
        (ElemKind::Real, NativeValue::Real(x)) => Scalar::Real(x),
        // Direct methods return doubles as raw bit words.
        (ElemKind::Real, NativeValue::Int(bits)) => Scalar::Real(f64::from_bits(bits as u64)),
        (ElemKind::Complex, ret) => match wire_value(ret) {
            Value::Vector(v) if v.kind() == ElemKind::Complex && !v.is_empty() => v.get(0),
            other => crate::defect!("complex element method returned {:?}", other),
        },
        (ElemKind::Str, ret) => match wire_value(ret) {
            Value::Char(c) => Scalar::Str(c),
            other => crate::defect!("string element method returned {:?}", other),
        },
        (ElemKind::List, ret) => Scalar::Value(wire_value(ret)),
        (kind, other) => crate::defect!("element method returned {:?} for {:?}", other, kind),
    }
}

/// Encode one element for a method argument
fn scalar_arg(value: Scalar) -> NativeValue {
    match value {
        Scalar::Int(x) => NativeValue::Int(x as i64),
        Scalar::Logical(x) => NativeValue::Int(x as i64),
        Scalar::Raw(x) => NativeValue::Int(x as i64),
        Scalar::Real(x) => NativeValue::Real(x),
        Scalar::Complex(x) => {
            NativeValue::Obj(heap::scalar_to_value(Scalar::Complex(x)))
        }
        Scalar::Str(c) => NativeValue::Obj(Value::Char(c)),
        Scalar::Value(v) => NativeValue::Obj(v),
    }
}

/// Raw pointer into a standard vector's cells
///
/// Only primitive kinds have a contiguous native layout; string and list
/// vectors yield null. The pointer is valid only while the vector's cells
/// are not reallocated (transient use, the documented hazard).
fn cells_ptr(vector: &Vector) -> *mut core::ffi::c_void {
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

/// Force the instance into a cached standard vector (at most once)
pub fn materialize(inst: &Rc<AltrepInstance>) -> Rc<Vector> {
    if let Some(cached) = inst.cached() {
        return cached;
    }

    let class = inst.class().clone();
    let kind = class.elem_kind();
    let n = class
        .method(MethodKind::Length)
        .map(|m| wire_len(invoke(&m, &[instance_arg(inst)])))
        .unwrap_or(0);
    trace!(
        event = "altrep_materialize",
        class = class.name(),
        length = n
    );

    let vector = Vector::alloc(kind, n);
    if n > 0 {
        if let (Some(region), false) = (
            class.method(MethodKind::GetRegion),
            matches!(kind, ElemKind::Str | ElemKind::List),
        ) {
            invoke(
                &region,
                &[
                    instance_arg(inst),
                    NativeValue::Int(0),
                    NativeValue::Int(n as i64),
                    NativeValue::Buf(BufferArg::new(vector.clone(), true)),
                ],
            );
        } else if let Some(elt_method) = class.method(MethodKind::Elt) {
            for i in 0..n {
                let ret = invoke(&elt_method, &[instance_arg(inst), NativeValue::Int(i as i64)]);
                vector.set(i, wire_scalar(ret, kind));
            }
        }
        // With neither method the default-allocated cells stand.
    }
    inst.fill_cache(vector.clone());
    vector
}

/// Length query
pub fn length(inst: &Rc<AltrepInstance>) -> usize {
    match inst.class().method(MethodKind::Length) {
        Some(m) => wire_len(invoke(&m, &[instance_arg(inst)])),
        None => materialize(inst).len(),
    }
}

/// Single-element read
pub fn elt(inst: &Rc<AltrepInstance>, index: usize) -> Scalar {
    let kind = inst.class().elem_kind();
    match inst.class().method(MethodKind::Elt) {
        Some(m) => wire_scalar(
            invoke(&m, &[instance_arg(inst), NativeValue::Int(index as i64)]),
            kind,
        ),
        None => {
            let vector = materialize(inst);
            if index < vector.len() {
                vector.get(index)
            } else {
                Scalar::zero(kind)
            }
        }
    }
}

/// Single-element write
pub fn set_elt(inst: &Rc<AltrepInstance>, index: usize, value: Scalar) {
    match inst.class().method(MethodKind::SetElt) {
        Some(m) => {
            invoke(
                &m,
                &[
                    instance_arg(inst),
                    NativeValue::Int(index as i64),
                    scalar_arg(value),
                ],
            );
        }
        None => {
            let vector = materialize(inst);
            if index < vector.len() {
                vector.set(index, value);
            }
        }
    }
}

/// Raw storage request; forces materialization without a Dataptr method
pub fn dataptr(inst: &Rc<AltrepInstance>, writable: bool) -> *mut core::ffi::c_void {
    match inst.class().method(MethodKind::Dataptr) {
        Some(m) => {
            let ret = invoke(
                &m,
                &[instance_arg(inst), NativeValue::Int(writable as i64)],
            );
            wire_ptr(ret)
        }
        None => cells_ptr(&materialize(inst)),
    }
}

/// Raw storage if already available, null otherwise (never forces)
pub fn dataptr_or_null(inst: &Rc<AltrepInstance>) -> *const core::ffi::c_void {
    match inst.class().method(MethodKind::DataptrOrNull) {
        Some(m) => wire_ptr(invoke(&m, &[instance_arg(inst)])) as *const core::ffi::c_void,
        None => match inst.cached() {
            Some(vector) => cells_ptr(&vector) as *const core::ffi::c_void,
            None => std::ptr::null(),
        },
    }
}

fn wire_ptr(ret: NativeValue) -> *mut core::ffi::c_void {
    match ret {
        NativeValue::Ptr(addr) => addr.raw() as *mut core::ffi::c_void,
        NativeValue::Int(word) => word as usize as *mut core::ffi::c_void,
        other => crate::defect!("pointer method returned {:?}", other),
    }
}

/// Subset by 1-based integer indices
pub fn extract_subset(inst: &Rc<AltrepInstance>, indices: &Rc<Vector>) -> Value {
    if let Some(m) = inst.class().method(MethodKind::ExtractSubset) {
        let ret = invoke(
            &m,
            &[
                instance_arg(inst),
                NativeValue::Obj(Value::Vector(indices.clone())),
            ],
        );
        return wire_value(ret);
    }

    let kind = inst.class().elem_kind();
    let source = materialize(inst);
    let out = Vector::alloc(kind, indices.len());
    for pos in 0..indices.len() {
        let index = match indices.get(pos) {
            Scalar::Int(i) => i,
            _ => 0,
        };
        let elem = if index >= 1 && (index as usize) <= source.len() {
            source.get(index as usize - 1)
        } else {
            Scalar::zero(kind)
        };
        out.set(pos, elem);
    }
    Value::Vector(out)
}

/// Sortedness code (0 = unknown without a method)
pub fn is_sorted(inst: &Rc<AltrepInstance>) -> i32 {
    match inst.class().method(MethodKind::IsSorted) {
        Some(m) => match invoke(&m, &[instance_arg(inst)]) {
            NativeValue::Int(x) => x as i32,
            other => crate::defect!("is_sorted returned {:?}", other),
        },
        None => 0,
    }
}

/// Known-NA-free flag (0 = unknown without a method)
pub fn no_na(inst: &Rc<AltrepInstance>) -> i32 {
    match inst.class().method(MethodKind::NoNa) {
        Some(m) => match invoke(&m, &[instance_arg(inst)]) {
            NativeValue::Int(x) => x as i32,
            other => crate::defect!("no_na returned {:?}", other),
        },
        None => 0,
    }
}

fn reduce(
    inst: &Rc<AltrepInstance>,
    kind: MethodKind,
    fold: impl Fn(f64, f64) -> f64,
) -> Option<Scalar> {
    if let Some(m) = inst.class().method(kind) {
        return Some(wire_scalar(invoke(&m, &[instance_arg(inst)]), ElemKind::Real));
    }
    let vector = materialize(inst);
    if vector.is_empty() {
        return None;
    }
    let mut acc = None;
    for i in 0..vector.len() {
        let x = match vector.get(i) {
            Scalar::Int(v) => v as f64,
            Scalar::Logical(v) => v as f64,
            Scalar::Real(v) => v,
            Scalar::Raw(v) => v as f64,
            _ => return None,
        };
        acc = Some(match acc {
            None => x,
            Some(a) => fold(a, x),
        });
    }
    acc.map(Scalar::Real)
}

/// Numeric sum, method-first
pub fn sum(inst: &Rc<AltrepInstance>) -> Option<Scalar> {
    reduce(inst, MethodKind::Sum, |a, b| a + b)
}

/// Numeric minimum, method-first
pub fn min(inst: &Rc<AltrepInstance>) -> Option<Scalar> {
    reduce(inst, MethodKind::Min, f64::min)
}

/// Numeric maximum, method-first
pub fn max(inst: &Rc<AltrepInstance>) -> Option<Scalar> {
    reduce(inst, MethodKind::Max, f64::max)
}

/// Copy the instance; falls back to duplicating the materialized vector
pub fn duplicate(inst: &Rc<AltrepInstance>, deep: bool) -> Value {
    if let Some(m) = inst.class().method(MethodKind::Duplicate) {
        let ret = invoke(&m, &[instance_arg(inst), NativeValue::Int(deep as i64)]);
        return wire_value(ret);
    }
    Value::Vector(materialize(inst).duplicate())
}

/// Extended copy; falls back to the plain duplicate path
pub fn duplicate_ex(inst: &Rc<AltrepInstance>, deep: bool) -> Value {
    if let Some(m) = inst.class().method(MethodKind::DuplicateEx) {
        let ret = invoke(&m, &[instance_arg(inst), NativeValue::Int(deep as i64)]);
        return wire_value(ret);
    }
    duplicate(inst, deep)
}

/// Kind coercion, method-first
pub fn coerce(inst: &Rc<AltrepInstance>, to: ElemKind) -> Option<Value> {
    if let Some(m) = inst.class().method(MethodKind::Coerce) {
        let ret = invoke(
            &m,
            &[instance_arg(inst), NativeValue::Int(to.type_tag() as i64)],
        );
        return Some(wire_value(ret));
    }
    heap::coerce(&Value::Vector(materialize(inst)), to).ok()
}

/// Debug inspection hook
pub fn inspect(inst: &Rc<AltrepInstance>) {
    if let Some(m) = inst.class().method(MethodKind::Inspect) {
        invoke(&m, &[instance_arg(inst)]);
        return;
    }
    debug!(
        event = "altrep_inspect",
        class = inst.class().name(),
        materialized = inst.cached().is_some(),
    );
}

/// Serialization state, if the class provides one
pub fn serialized_state(inst: &Rc<AltrepInstance>) -> Option<Value> {
    inst.class()
        .method(MethodKind::SerializedState)
        .map(|m| wire_value(invoke(&m, &[instance_arg(inst)])))
}

/// Rebuild an instance from serialized state via the class methods
pub fn unserialize(class: &Arc<AltrepClass>, state: &Value) -> Option<Value> {
    let method = class
        .method(MethodKind::UnserializeEx)
        .or_else(|| class.method(MethodKind::Unserialize))?;
    let class_tag = Value::Char(heap::intern_char(&format!(
        "{}:{}",
        class.package(),
        class.name()
    )));
    Some(wire_value(invoke(
        &method,
        &[NativeValue::Obj(class_tag), NativeValue::Obj(state.clone())],
    )))
}
