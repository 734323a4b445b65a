//! Test suite for the registry, bridge, and memory adapter

use super::*;
use crate::heap::{Cells, ElemKind, Scalar, Value, Vector};
use std::sync::Arc;

fn addr_of(f: extern "C" fn(u64, u64) -> u64) -> NativeAddress {
    NativeAddress::new(f as usize)
}

// Native test routines for the direct backend
extern "C" fn native_add(a: u64, b: u64) -> u64 {
    a + b
}

extern "C" fn native_sum_buffer(ptr: u64, len: u64) -> u64 {
    let slice = unsafe { std::slice::from_raw_parts(ptr as *const i32, len as usize) };
    slice.iter().map(|&x| x as i64).sum::<i64>() as u64
}

extern "C" fn native_fill_buffer(ptr: u64, len: u64) -> u64 {
    let slice = unsafe { std::slice::from_raw_parts_mut(ptr as *mut i32, len as usize) };
    for (i, slot) in slice.iter_mut().enumerate() {
        *slot = (i as i32 + 1) * 10;
    }
    0
}

extern "C" fn native_reads_spilled(handle: u64) -> u64 {
    let value = memory::resolve_spilled(NativeAddress::new(handle as usize))
        .expect("handle must resolve during the call");
    value.length() as u64
}

// Host routines for the hosted backend
fn host_add(args: &mut [NativeValue]) -> NativeValue {
    let a = match args[0] {
        NativeValue::Int(x) => x,
        _ => 0,
    };
    let b = match args[1] {
        NativeValue::Int(x) => x,
        _ => 0,
    };
    NativeValue::Int(a + b)
}

fn host_vector_len(args: &mut [NativeValue]) -> NativeValue {
    match &args[0] {
        NativeValue::Obj(v) => NativeValue::Int(v.length() as i64),
        _ => NativeValue::Int(-1),
    }
}

fn demo_registry() -> Arc<LibraryRegistry> {
    let registry = Arc::new(LibraryRegistry::new());
    let lib = registry.open_library("demo", None);
    lib.register_routines(
        BatchKind::Call,
        &[
            RoutineEntry {
                name: "foo".into(),
                address: NativeAddress::new(0x1000),
                arity: 1,
            },
            RoutineEntry {
                name: "bar".into(),
                address: NativeAddress::new(0x2000),
                arity: 2,
            },
        ],
    );
    registry
}

#[test]
fn test_symbol_round_trip() {
    let registry = Arc::new(LibraryRegistry::new());
    let lib = registry.open_library("pkg", Some("/lib/pkg.so"));

    let entries: Vec<RoutineEntry> = (0..16)
        .map(|i| RoutineEntry {
            name: format!("routine_{}", i),
            address: NativeAddress::new(0x4000 + i * 8),
            arity: (i % 4) as i32,
        })
        .collect();
    lib.register_routines(BatchKind::C, &entries);

    for entry in &entries {
        let symbol = lib.find_symbol(&entry.name).expect("registered symbol");
        assert_eq!(symbol.name, entry.name);
        assert_eq!(symbol.address, entry.address);
        assert_eq!(symbol.arity, entry.arity);
        assert_eq!(symbol.library, "pkg");
    }
}

#[test]
fn test_unregistered_symbol_is_not_found() {
    let registry = demo_registry();
    let lib = registry.get_library("demo").unwrap();
    assert!(lib.find_symbol("quux").is_none());
    assert!(registry.find_symbol("quux").is_none());
}

#[test]
fn test_batch_replacement_is_not_a_merge() {
    let registry = Arc::new(LibraryRegistry::new());
    let lib = registry.open_library("pkg", None);

    lib.register_routines(
        BatchKind::Call,
        &[RoutineEntry {
            name: "old".into(),
            address: NativeAddress::new(0x10),
            arity: 0,
        }],
    );
    lib.register_routines(
        BatchKind::Call,
        &[RoutineEntry {
            name: "new".into(),
            address: NativeAddress::new(0x20),
            arity: 0,
        }],
    );

    assert!(lib.find_in_batch(BatchKind::Call, "old").is_none());
    assert!(lib.find_in_batch(BatchKind::Call, "new").is_some());
    assert_eq!(lib.symbol_count(), 1);
}

#[test]
fn test_batches_are_independent_per_kind() {
    let registry = Arc::new(LibraryRegistry::new());
    let lib = registry.open_library("pkg", None);

    lib.register_routines(
        BatchKind::C,
        &[RoutineEntry {
            name: "c_routine".into(),
            address: NativeAddress::new(0x10),
            arity: 1,
        }],
    );
    lib.register_routines(
        BatchKind::Fortran,
        &[RoutineEntry {
            name: "f_routine".into(),
            address: NativeAddress::new(0x20),
            arity: 1,
        }],
    );

    assert!(lib.find_in_batch(BatchKind::C, "c_routine").is_some());
    assert!(lib.find_in_batch(BatchKind::C, "f_routine").is_none());
    assert_eq!(lib.symbol_count(), 2);
}

#[test]
fn test_ccallable_scenario() {
    let registry = demo_registry();
    registry.register_ccallable("demo", "foo", NativeAddress::new(0x1000));

    assert_eq!(
        registry.get_ccallable("demo", "foo").unwrap(),
        NativeAddress::new(0x1000)
    );
    let err = registry.get_ccallable("demo", "baz").unwrap_err();
    assert!(matches!(err, RegistryError::SymbolNotFound { .. }));
}

#[test]
#[should_panic(expected = "internal defect")]
fn test_ccallable_for_unloaded_library_is_a_defect() {
    let registry = Arc::new(LibraryRegistry::new());
    registry.register_ccallable("ghost", "fn", NativeAddress::new(0x1));
}

#[test]
fn test_loader_flags() {
    let registry = Arc::new(LibraryRegistry::new());
    let lib = registry.open_library("pkg", None);

    assert!(lib.use_dynamic_symbols());
    lib.set_use_dynamic_symbols(false);
    assert!(!lib.use_dynamic_symbols());

    assert!(!lib.force_symbols());
    lib.set_force_symbols(true);
    assert!(lib.force_symbols());
}

#[test]
fn test_set_dot_symbol_values_updates_in_place() {
    let registry = demo_registry();
    let lib = registry.get_library("demo").unwrap();

    lib.set_dot_symbol_values(BatchKind::Call, 0, "foo2", NativeAddress::new(0x3000), 3)
        .unwrap();
    let symbol = lib.find_in_batch(BatchKind::Call, "foo2").unwrap();
    assert_eq!(symbol.address, NativeAddress::new(0x3000));
    assert_eq!(symbol.arity, 3);
    assert!(lib.find_in_batch(BatchKind::Call, "foo").is_none());

    let err = lib
        .set_dot_symbol_values(BatchKind::External, 0, "x", NativeAddress::new(0x1), 0)
        .unwrap_err();
    assert!(matches!(err, RegistryError::BatchNotRegistered { .. }));
}

#[test]
fn test_close_library_drops_ccallables() {
    let registry = demo_registry();
    registry.register_ccallable("demo", "foo", NativeAddress::new(0x1000));
    registry.close_library("demo");
    assert!(registry.get_library("demo").is_none());
    assert!(registry.get_ccallable("demo", "foo").is_err());
}

#[test]
fn test_direct_call_and_memoized_resolution() {
    let registry = Arc::new(LibraryRegistry::new());
    let lib = registry.open_library("native", None);
    lib.register_routines(
        BatchKind::Call,
        &[RoutineEntry {
            name: "add".into(),
            address: addr_of(native_add),
            arity: 2,
        }],
    );

    let bridge = CallBridge::new(Arc::new(DirectBackend), registry);
    let function = NativeFunction::new("add", 2);
    assert_eq!(function.resolution_count(), 0);

    let first = bridge
        .call(&function, &[NativeValue::Int(2), NativeValue::Int(3)])
        .unwrap();
    assert!(matches!(first, NativeValue::Int(5)));

    let second = bridge
        .call(&function, &[NativeValue::Int(40), NativeValue::Int(2)])
        .unwrap();
    assert!(matches!(second, NativeValue::Int(42)));

    // Resolved exactly once across both calls.
    assert_eq!(function.resolution_count(), 1);
}

#[test]
fn test_hosted_call_and_memoized_resolution() {
    let registry = Arc::new(LibraryRegistry::new());
    let lib = registry.open_library("hostlib", None);
    lib.register_routines(
        BatchKind::Call,
        &[RoutineEntry {
            name: "hadd".into(),
            address: NativeAddress::new(0),
            arity: 2,
        }],
    );

    let hosted = HostedBackend::new();
    hosted.register("hadd", host_add, "(a, b) -> sum", 2);

    let bridge = CallBridge::new(Arc::new(hosted), registry);
    let function = NativeFunction::new("hadd", 2);

    for _ in 0..3 {
        let out = bridge
            .call(&function, &[NativeValue::Int(20), NativeValue::Int(1)])
            .unwrap();
        assert!(matches!(out, NativeValue::Int(21)));
    }
    assert_eq!(function.resolution_count(), 1);
}

#[test]
fn test_unresolved_function_fails_without_defect() {
    let registry = Arc::new(LibraryRegistry::new());
    let bridge = CallBridge::new(Arc::new(DirectBackend), registry);
    let function = NativeFunction::new("missing", 0);
    let err = bridge.call(&function, &[]).unwrap_err();
    assert!(matches!(err, BridgeError::UnresolvedSymbol(_)));
    // A failed resolution is not cached; the next call retries.
    let err = bridge.call(&function, &[]).unwrap_err();
    assert!(matches!(err, BridgeError::UnresolvedSymbol(_)));
}

#[test]
fn test_hosted_bind_checks_arity() {
    let registry = Arc::new(LibraryRegistry::new());
    let lib = registry.open_library("hostlib", None);
    lib.register_routines(
        BatchKind::Call,
        &[RoutineEntry {
            name: "hadd".into(),
            address: NativeAddress::new(0),
            arity: 3,
        }],
    );

    let hosted = HostedBackend::new();
    hosted.register("hadd", host_add, "(a, b) -> sum", 2);

    let bridge = CallBridge::new(Arc::new(hosted), registry);
    let function = NativeFunction::new("hadd", 3);
    let err = bridge.call(&function, &[]).unwrap_err();
    assert!(matches!(err, BridgeError::SignatureMismatch { .. }));
}

#[test]
fn test_direct_wrap_spills_and_releases_objects() {
    let registry = Arc::new(LibraryRegistry::new());
    let lib = registry.open_library("native", None);
    lib.register_routines(
        BatchKind::Call,
        &[RoutineEntry {
            name: "spill_len".into(),
            address: NativeAddress::new(native_reads_spilled as usize),
            arity: 1,
        }],
    );

    let before = memory::spilled_count();
    let bridge = CallBridge::new(Arc::new(DirectBackend), registry);
    let function = NativeFunction::new("spill_len", 1);
    let vector = Value::Vector(Vector::alloc(ElemKind::Real, 7));

    let out = bridge
        .call(&function, &[NativeValue::Obj(vector)])
        .unwrap();
    assert!(matches!(out, NativeValue::Int(7)));

    // Per-call wrappers are released unconditionally after the call.
    assert_eq!(memory::spilled_count(), before);
}

#[test]
fn test_direct_buffer_argument_read() {
    let registry = Arc::new(LibraryRegistry::new());
    let lib = registry.open_library("native", None);
    lib.register_routines(
        BatchKind::Call,
        &[RoutineEntry {
            name: "sum_buffer".into(),
            address: NativeAddress::new(native_sum_buffer as usize),
            arity: 2,
        }],
    );

    let bridge = CallBridge::new(Arc::new(DirectBackend), registry);
    let function = NativeFunction::new("sum_buffer", 2);
    let vector = Vector::from_cells(Cells::Int(vec![1, 2, 3, 4]));

    let out = bridge
        .call(
            &function,
            &[
                NativeValue::Buf(BufferArg::new(vector, false)),
                NativeValue::Int(4),
            ],
        )
        .unwrap();
    assert!(matches!(out, NativeValue::Int(10)));
}

#[test]
fn test_direct_writable_buffer_copies_back() {
    let registry = Arc::new(LibraryRegistry::new());
    let lib = registry.open_library("native", None);
    lib.register_routines(
        BatchKind::Call,
        &[RoutineEntry {
            name: "fill_buffer".into(),
            address: NativeAddress::new(native_fill_buffer as usize),
            arity: 2,
        }],
    );

    let bridge = CallBridge::new(Arc::new(DirectBackend), registry);
    let function = NativeFunction::new("fill_buffer", 2);
    let vector = Vector::from_cells(Cells::Int(vec![0, 0, 0]));

    bridge
        .call(
            &function,
            &[
                NativeValue::Buf(BufferArg::new(vector.clone(), true)),
                NativeValue::Int(3),
            ],
        )
        .unwrap();

    for i in 0..3 {
        assert!(matches!(vector.get(i), Scalar::Int(x) if x == (i as i32 + 1) * 10));
    }
}

#[test]
fn test_hosted_wrap_passes_handles_through() {
    let registry = Arc::new(LibraryRegistry::new());
    let lib = registry.open_library("hostlib", None);
    lib.register_routines(
        BatchKind::Call,
        &[RoutineEntry {
            name: "vlen".into(),
            address: NativeAddress::new(0),
            arity: 1,
        }],
    );

    let hosted = HostedBackend::new();
    hosted.register("vlen", host_vector_len, "(vector) -> length", 1);

    let bridge = CallBridge::new(Arc::new(hosted), registry);
    let function = NativeFunction::new("vlen", 1);
    let vector = Value::Vector(Vector::alloc(ElemKind::Int, 9));

    let out = bridge
        .call(&function, &[NativeValue::Obj(vector)])
        .unwrap();
    assert!(matches!(out, NativeValue::Int(9)));
}

#[test]
fn test_adapter_copy_round_trip() {
    let source = Vector::from_cells(Cells::Real(vec![1.5, 2.5, 3.5]));
    let mut raw = [0f64; 3];
    unsafe {
        memory::copy_from_managed(&source, NativeAddress::new(raw.as_mut_ptr() as usize), 3)
            .unwrap();
    }
    assert_eq!(raw, [1.5, 2.5, 3.5]);

    raw[1] = 9.5;
    let dest = Vector::alloc(ElemKind::Real, 3);
    unsafe {
        memory::copy_to_managed(NativeAddress::new(raw.as_ptr() as usize), &dest, 3).unwrap();
    }
    assert!(matches!(dest.get(1), Scalar::Real(x) if x == 9.5));
}

#[test]
fn test_adapter_rejects_string_cells() {
    let source = Vector::alloc(ElemKind::Str, 2);
    let mut raw = [0u8; 16];
    let err = unsafe {
        memory::copy_from_managed(&source, NativeAddress::new(raw.as_mut_ptr() as usize), 2)
    }
    .unwrap_err();
    assert!(matches!(err, memory::AdapterError::NotRawCopyable(_)));
}

#[test]
fn test_unwrap_passes_managed_through() {
    let value = Value::Vector(Vector::alloc(ElemKind::Int, 2));
    let out = memory::unwrap(NativeValue::Obj(value.clone()), BackendKind::Hosted);
    assert!(out.same_object(&value));
}

#[test]
fn test_unwrap_boxes_scalars() {
    let out = memory::unwrap(NativeValue::Real(2.5), BackendKind::Hosted);
    match out {
        Value::Vector(v) => {
            assert_eq!(v.kind(), ElemKind::Real);
            assert_eq!(v.len(), 1);
        }
        other => panic!("expected boxed scalar, got {:?}", other),
    }
}

#[test]
fn test_unwrap_resolves_spilled_only_under_direct() {
    let value = Value::Vector(Vector::alloc(ElemKind::Int, 3));
    let addr = memory::spill(value.clone());

    let direct = memory::unwrap(NativeValue::Ptr(addr), BackendKind::Direct);
    assert!(direct.same_object(&value));

    let hosted = memory::unwrap(NativeValue::Ptr(addr), BackendKind::Hosted);
    assert!(matches!(hosted, Value::ExternalPtr(_)));

    memory::release_spilled(addr);
}
