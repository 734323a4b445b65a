//! Benchmarks for the hot boundary paths: bridge calls and ALTREP dispatch

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rhea_runtime::altrep::{self, dispatch, MethodDescriptor, MethodKind};
use rhea_runtime::heap::{ElemKind, Value};
use rhea_runtime::interop::{
    select_backend, BackendKind, BatchKind, CallBridge, HostedBackend, LibraryRegistry,
    NativeAddress, NativeFunction, NativeValue, RoutineEntry,
};
use std::sync::Arc;

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

fn seq_length(_args: &mut [NativeValue]) -> NativeValue {
    NativeValue::Int(1024)
}

fn seq_elt(args: &mut [NativeValue]) -> NativeValue {
    match args[1] {
        NativeValue::Int(i) => NativeValue::Int(i),
        _ => NativeValue::Int(0),
    }
}

fn bench_bridge_call(c: &mut Criterion) {
    let registry = Arc::new(LibraryRegistry::new());
    let lib = registry.open_library("bench", None);
    lib.register_routines(
        BatchKind::Call,
        &[RoutineEntry {
            name: "add".into(),
            address: NativeAddress::new(0),
            arity: 2,
        }],
    );
    let hosted = HostedBackend::new();
    hosted.register("add", host_add, "(a, b) -> sum", 2);
    let bridge = CallBridge::new(Arc::new(hosted), registry);
    let function = NativeFunction::new("add", 2);

    c.bench_function("bridge_hosted_call", |b| {
        b.iter(|| {
            bridge
                .call(
                    &function,
                    &[
                        NativeValue::Int(black_box(2)),
                        NativeValue::Int(black_box(3)),
                    ],
                )
                .unwrap()
        })
    });
}

fn bench_altrep_elt(c: &mut Criterion) {
    select_backend(BackendKind::Hosted);
    let class = altrep::make_class(ElemKind::Int, "bench_seq", "bench");
    class
        .register_method(
            MethodKind::Length,
            MethodDescriptor::hosted(seq_length, MethodKind::Length.signature()),
        )
        .unwrap();
    class
        .register_method(
            MethodKind::Elt,
            MethodDescriptor::hosted(seq_elt, MethodKind::Elt.signature()),
        )
        .unwrap();
    let inst = altrep::new_instance(class, Value::Null, Value::Null);

    c.bench_function("altrep_elt_method", |b| {
        b.iter(|| dispatch::elt(&inst, black_box(512)))
    });

    let bare = altrep::make_class(ElemKind::Int, "bench_bare", "bench");
    let materialized = altrep::new_instance(bare, Value::Null, Value::Null);
    dispatch::materialize(&materialized);

    c.bench_function("altrep_elt_materialized", |b| {
        b.iter(|| dispatch::elt(&materialized, black_box(0)))
    });
}

criterion_group!(benches, bench_bridge_call, bench_altrep_elt);
criterion_main!(benches);
