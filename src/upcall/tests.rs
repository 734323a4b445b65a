//! Test suite for the upcall surface and its ABI catalogue

use super::*;
use crate::heap::{Cells, Scalar, Value, Vector};
use std::ffi::CString;
use std::sync::Arc;

fn global_env() -> Value {
    Value::Env(crate::heap::Env::child(crate::heap::Env::root()))
}

#[test]
fn test_get_var_walks_enclosing_frames() {
    let u = Upcalls::default();
    let global = global_env();
    let local = u.envs.new_env(&global).unwrap();

    u.envs
        .define_var(&global, "x", u.alloc.scalar_int(7))
        .unwrap();
    let found = u.envs.get_var(&local, "x").unwrap();
    assert_eq!(found.length(), 1);
}

#[test]
fn test_get_var_distinguishes_sentinels() {
    let u = Upcalls::default();
    let env = global_env();

    let err = u.envs.get_var(&env, "absent").unwrap_err();
    assert_eq!(err, RuntimeError::NotFound("absent".into()));

    u.envs
        .define_var(&env, "arg", Value::Missing)
        .unwrap();
    let err = u.envs.get_var(&env, "arg").unwrap_err();
    assert_eq!(err, RuntimeError::MissingArgument("arg".into()));

    // find_var passes sentinels through untouched.
    assert!(matches!(
        u.envs.find_var(&env, "absent").unwrap(),
        Value::Unbound
    ));
}

#[test]
fn test_env_ops_reject_wrong_handles() {
    let u = Upcalls::default();
    let not_env = u.alloc.scalar_int(1);

    let err = u.envs.get_var(&not_env, "x").unwrap_err();
    assert!(matches!(err, RuntimeError::Type { .. }));

    let err = u.envs.get_var(&Value::Null, "x").unwrap_err();
    assert_eq!(err, RuntimeError::NullEnvironment);
}

#[test]
fn test_locked_binding_raises_language_error() {
    let u = Upcalls::default();
    let env = global_env();

    u.envs.define_var(&env, "x", u.alloc.scalar_int(1)).unwrap();
    u.envs.lock_binding(&env, "x").unwrap();
    assert!(u.envs.binding_is_locked(&env, "x").unwrap());

    let err = u
        .envs
        .set_var(&env, "x", u.alloc.scalar_int(2))
        .unwrap_err();
    assert_eq!(err, RuntimeError::LockedBinding("x".into()));
}

#[test]
fn test_attr_ops_materialize_altrep() {
    crate::interop::select_backend(crate::interop::BackendKind::Hosted);
    let u = Upcalls::default();
    let class = u.reg.altrep_make_class(7, "attr_target", "testpkg").unwrap();
    let inst = u.reg.altrep_new(class, Value::Null, Value::Null);

    u.attrs
        .set_attr(&inst, "names", u.alloc.mk_string("n"))
        .unwrap();
    assert!(!u.attrs.get_attr(&inst, "names").unwrap().is_null());
}

#[test]
fn test_pairlist_ops() {
    let u = Upcalls::default();
    let tail = u.lists.cons(u.alloc.scalar_int(2), Value::Null);
    let head = u.lists.cons(u.alloc.scalar_int(1), tail);

    assert_eq!(head.length(), 2);
    assert_eq!(u.lists.nth(&head, 1).unwrap().length(), 1);

    u.lists.set_tag(&head, u.alloc.install("first")).unwrap();
    assert!(matches!(u.lists.tag(&head).unwrap(), Value::Symbol(_)));

    let err = u.lists.car(&Value::Null).unwrap_err();
    assert!(matches!(err, RuntimeError::Type { .. }));
}

#[test]
fn test_extptr_keeps_tag_reachable() {
    let u = Upcalls::default();
    let tag = u.alloc.mk_string("tag");
    let ptr = u.alloc.new_extptr(0xdead, tag.clone(), Value::Null);

    assert_eq!(u.ptrs.extptr_addr(&ptr).unwrap(), 0xdead);
    assert!(u.ptrs.extptr_tag(&ptr).unwrap().same_object(&tag));

    u.ptrs.extptr_clear(&ptr).unwrap();
    assert_eq!(u.ptrs.extptr_addr(&ptr).unwrap(), 0);
    // Tag survives the address being cleared.
    assert!(u.ptrs.extptr_tag(&ptr).unwrap().same_object(&tag));
}

#[test]
fn test_weakref_clear_hands_back_finalizer() {
    let u = Upcalls::default();
    let weak = u.alloc.new_weakref(
        u.alloc.scalar_int(1),
        u.alloc.scalar_int(2),
        u.alloc.mk_string("fin"),
    );
    let finalizer = u.ptrs.weakref_clear(&weak).unwrap();
    assert!(!finalizer.is_null());
    assert!(u.ptrs.weakref_key(&weak).unwrap().is_null());
}

#[test]
fn test_tracer_observes_without_altering_results() {
    let sink = Arc::new(MemorySink::new());
    let traced = Upcalls::builder().tracer(sink.clone()).build();

    let out = traced
        .traced("alloc_vector", &[], |u| u.alloc.alloc_vector(7, 3))
        .unwrap();
    assert_eq!(out.length(), 3);

    let lines = sink.lines();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("> alloc_vector("));
    assert!(lines[1].contains("< alloc_vector -> ok"));
}

#[test]
fn test_tracer_records_error_outcomes() {
    let sink = Arc::new(MemorySink::new());
    let traced = Upcalls::builder().tracer(sink.clone()).build();

    let env = global_env();
    let err = traced
        .traced("get_var", &[&env], |u| u.envs.get_var(&env, "missing"))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::NotFound(_)));
    assert!(sink.lines()[1].contains("-> error"));
}

#[test]
fn test_unimplemented_propagates_by_default() {
    let u = Upcalls::default();
    let err = u.unimplemented("serialize");
    assert_eq!(err, RuntimeError::Unimplemented("serialize"));
}

#[test]
fn test_unimplemented_under_abort_policy_with_tracer_is_logged_fault() {
    // With the tracer attached the legacy policy logs and propagates
    // instead of terminating, so it stays testable.
    let sink = Arc::new(MemorySink::new());
    let u = Upcalls::builder()
        .tracer(sink)
        .fault_policy(FaultPolicy::Abort)
        .build();
    let err = u.unimplemented("serialize");
    assert_eq!(err, RuntimeError::Unimplemented("serialize"));
}

#[test]
fn test_numeric_delegation_uses_scoped_scratch() {
    let u = Upcalls::default();
    let out = u.num.apply("cumsum", &[1.0, 2.0, 3.0]).unwrap();
    assert_eq!(out, vec![1.0, 3.0, 6.0]);
    assert_eq!(u.num.outstanding_scratch(), 0);

    let out = u.num.apply("sum", &[1.5, 2.5]).unwrap();
    assert_eq!(out, vec![4.0]);

    let err = u.num.apply("fft", &[1.0]).unwrap_err();
    assert!(matches!(err, RuntimeError::Unimplemented(_)));
}

#[test]
fn test_numeric_precision_warning_is_recoverable() {
    let u = Upcalls::default();
    drain_warnings();
    let big = 2f64.powi(60);
    let out = u.num.apply("sum", &[big, big]).unwrap();
    assert_eq!(out.len(), 1);
    let warnings = drain_warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("precision"));
}

struct FixedConnections;

impl Connections for FixedConnections {
    fn read(&self, _id: i32, buf: &mut [u8]) -> UpcallResult<usize> {
        let data = b"payload";
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn write(&self, _id: i32, buf: &[u8]) -> UpcallResult<usize> {
        Ok(buf.len())
    }
}

#[test]
fn test_connection_read_copies_through_adapter() {
    let u = Upcalls::builder()
        .io(IoOps::new(
            Box::new(FixedConnections),
            Box::new(NoParser),
            Box::new(NoDocTool),
            Box::new(LogGraphics),
        ))
        .build();

    let mut raw = [0u8; 16];
    let got = u
        .io
        .read_bytes(
            1,
            crate::interop::NativeAddress::new(raw.as_mut_ptr() as usize),
            16,
        )
        .unwrap();
    assert_eq!(&raw[..got], b"payload");

    let put = u
        .io
        .write_bytes(
            1,
            crate::interop::NativeAddress::new(raw.as_ptr() as usize),
            got,
        )
        .unwrap();
    assert_eq!(put, got);
}

#[test]
fn test_default_io_collaborators_fail_recoverably() {
    let u = Upcalls::default();
    let mut raw = [0u8; 4];
    let err = u
        .io
        .read_bytes(
            9,
            crate::interop::NativeAddress::new(raw.as_mut_ptr() as usize),
            4,
        )
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Io(_)));

    assert!(matches!(
        u.io.parse("1 + 1").unwrap_err(),
        RuntimeError::Unimplemented(_)
    ));
    assert!(matches!(
        u.io.parse_docs("\\title{}").unwrap_err(),
        RuntimeError::Unimplemented(_)
    ));
    assert!(u.io.forward_graphics("resize", &Value::Null).is_ok());
}

#[test]
fn test_rng_state_round_trip() {
    let u = Upcalls::default();
    let state = Value::Vector(Vector::from_cells(Cells::Int(vec![1, 2, 3])));
    u.rng.put_state(&state).unwrap();

    let out = u.rng.get_state();
    assert_eq!(out.length(), 3);
    match out {
        Value::Vector(v) => assert!(matches!(v.get(2), Scalar::Int(3))),
        other => panic!("expected vector, got {:?}", other),
    }

    let err = u.rng.put_state(&Value::Null).unwrap_err();
    assert!(matches!(err, RuntimeError::Type { .. }));
}

#[test]
fn test_reg_ops_scenario() {
    let u = Upcalls::default();
    u.reg
        .register_routines(
            "demo_upcall",
            1,
            &[crate::interop::RoutineEntry {
                name: "foo".into(),
                address: crate::interop::NativeAddress::new(0x1000),
                arity: 1,
            }],
        )
        .unwrap();
    u.reg
        .register_ccallable("demo_upcall", "foo", crate::interop::NativeAddress::new(0x1000));

    assert_eq!(
        u.reg.get_ccallable("demo_upcall", "foo").unwrap(),
        crate::interop::NativeAddress::new(0x1000)
    );
    assert!(matches!(
        u.reg.get_ccallable("demo_upcall", "baz").unwrap_err(),
        RuntimeError::NotFound(_)
    ));

    u.reg.use_dynamic_symbols("demo_upcall", false).unwrap();
    u.reg.force_symbols("demo_upcall", true).unwrap();
    let lib = crate::interop::registry().get_library("demo_upcall").unwrap();
    assert!(!lib.use_dynamic_symbols());
    assert!(lib.force_symbols());
}

// ============================================================================
// ABI catalogue
// ============================================================================

#[test]
fn test_abi_vector_lifecycle() {
    let h = super::abi::rhea_alloc_vector(7, 4);
    assert_ne!(h, 0);
    assert_eq!(super::abi::rhea_type_tag(h), 7);
    assert_eq!(super::abi::rhea_length(h), 4);

    assert_eq!(super::abi::rhea_set_integer_elt(h, 2, 42), 1);
    assert_eq!(super::abi::rhea_integer_elt(h, 2), 42);

    let copy = super::abi::rhea_duplicate(h, 1);
    assert_ne!(copy, 0);
    assert_eq!(super::abi::rhea_set_integer_elt(copy, 2, 7), 1);
    assert_eq!(super::abi::rhea_integer_elt(h, 2), 42);

    super::abi::rhea_release(h);
    super::abi::rhea_release(copy);
}

#[test]
fn test_abi_dataptr_exposes_contiguous_storage() {
    let h = super::abi::rhea_alloc_vector(8, 3);
    assert_eq!(super::abi::rhea_set_real_elt(h, 0, 1.5), 1);

    let ptr = super::abi::rhea_dataptr(h, 0) as *const f64;
    assert!(!ptr.is_null());
    unsafe {
        assert_eq!(*ptr, 1.5);
    }
    super::abi::rhea_release(h);
}

#[test]
fn test_abi_env_and_error_protocol() {
    let env = super::abi::rhea_global_env();
    let name = CString::new("x").unwrap();
    let value = super::abi::rhea_scalar_integer(5);

    unsafe {
        assert_eq!(super::abi::rhea_define_var(env, name.as_ptr(), value), 1);
        let found = super::abi::rhea_get_var(env, name.as_ptr());
        assert_ne!(found, 0);

        let missing = CString::new("missing").unwrap();
        let not_found = super::abi::rhea_get_var(env, missing.as_ptr());
        assert_eq!(not_found, 0);
        assert_eq!(super::abi::rhea_has_error(), 1);

        let mut buf = [0 as std::os::raw::c_char; 128];
        let n = super::abi::rhea_last_error(buf.as_mut_ptr(), buf.len());
        assert!(n > 0);
        assert_eq!(super::abi::rhea_has_error(), 0);
    }
}

#[test]
fn test_abi_locked_binding_protocol() {
    let env = super::abi::rhea_global_env();
    let name = CString::new("locked").unwrap();
    let value = super::abi::rhea_scalar_integer(1);

    unsafe {
        assert_eq!(super::abi::rhea_define_var(env, name.as_ptr(), value), 1);
        assert_eq!(super::abi::rhea_lock_binding(env, name.as_ptr()), 1);
        assert_eq!(super::abi::rhea_binding_is_locked(env, name.as_ptr()), 1);

        let other = super::abi::rhea_scalar_integer(2);
        assert_eq!(super::abi::rhea_set_var(env, name.as_ptr(), other), 0);
        assert_eq!(super::abi::rhea_has_error(), 1);
        super::abi::rhea_last_error(std::ptr::null_mut(), 0);
    }
}

#[test]
fn test_abi_ccallable_scenario() {
    let lib = CString::new("abi_demo").unwrap();
    let foo = CString::new("foo").unwrap();
    let baz = CString::new("baz").unwrap();
    let routine_name = CString::new("foo").unwrap();

    let table = [super::abi::AbiRoutine {
        name: routine_name.as_ptr(),
        address: 0x1000,
        arity: 1,
    }];

    unsafe {
        assert_eq!(
            super::abi::rhea_register_routines(lib.as_ptr(), 1, 1, table.as_ptr()),
            1
        );
        assert_eq!(
            super::abi::rhea_register_ccallable(lib.as_ptr(), foo.as_ptr(), 0x1000),
            1
        );
        assert_eq!(
            super::abi::rhea_get_ccallable(lib.as_ptr(), foo.as_ptr()),
            0x1000
        );
        assert_eq!(super::abi::rhea_get_ccallable(lib.as_ptr(), baz.as_ptr()), 0);
        assert_eq!(super::abi::rhea_has_error(), 1);
        super::abi::rhea_last_error(std::ptr::null_mut(), 0);
    }
}

#[test]
fn test_abi_altrep_flow() {
    crate::interop::select_backend(crate::interop::BackendKind::Hosted);
    let name = CString::new("abi_seq").unwrap();
    let package = CString::new("abipkg").unwrap();

    unsafe {
        let class = super::abi::rhea_altrep_make_class(7, name.as_ptr(), package.as_ptr());
        assert_ne!(class, 0);

        let data1 = super::abi::rhea_null();
        let data2 = super::abi::rhea_null();
        let inst = super::abi::rhea_altrep_new(class, data1, data2);
        assert_ne!(inst, 0);

        // No Length method: materialized empty vector.
        assert_eq!(super::abi::rhea_length(inst), 0);

        let qualified = CString::new("abipkg:abi_seq").unwrap();
        assert_eq!(super::abi::rhea_altrep_inherits(inst, qualified.as_ptr()), 1);
        let wrong = CString::new("other").unwrap();
        assert_eq!(super::abi::rhea_altrep_inherits(inst, wrong.as_ptr()), 0);
    }
}

#[test]
fn test_abi_unimplemented_operation_faults_recoverably() {
    let expr = super::abi::rhea_null();
    let env = super::abi::rhea_global_env();
    assert_eq!(super::abi::rhea_eval(expr, env), 0);

    let err = take_last_error().expect("pending unimplemented error");
    assert_eq!(err, RuntimeError::Unimplemented("eval"));
}

#[test]
fn test_abi_numeric_apply() {
    let op = CString::new("cumsum").unwrap();
    let input = [1.0f64, 2.0, 3.0];
    let mut out = [0.0f64; 3];

    unsafe {
        let n = super::abi::rhea_numeric_apply(op.as_ptr(), input.as_ptr(), 3, out.as_mut_ptr());
        assert_eq!(n, 3);
    }
    assert_eq!(out, [1.0, 3.0, 6.0]);
}

#[test]
fn test_abi_context_walk() {
    use crate::context::{push_context, FrameKind};

    let env = crate::heap::Env::child(crate::heap::Env::root());
    let _outer = push_context(
        FrameKind::Function,
        env.clone(),
        Value::Char(crate::heap::intern_char("f")),
        Value::Null,
        Value::Null,
    );
    let _promise = push_context(FrameKind::Promise, env, Value::Null, Value::Null, Value::Null);

    let ctx = super::abi::rhea_current_context();
    assert_ne!(ctx, 0);

    let fun = super::abi::rhea_context_function(ctx);
    assert_ne!(fun, 0);

    assert_eq!(super::abi::rhea_previous_context(ctx), 0);
}

#[test]
fn test_abi_extptr_and_weakref() {
    let tag = super::abi::rhea_scalar_integer(1);
    let null = super::abi::rhea_null();
    let ptr = super::abi::rhea_new_extptr(0xbeef, tag, null);
    assert_ne!(ptr, 0);
    assert_eq!(super::abi::rhea_extptr_addr(ptr), 0xbeef);
    assert_eq!(super::abi::rhea_extptr_clear(ptr), 1);
    assert_eq!(super::abi::rhea_extptr_addr(ptr), 0);

    let key = super::abi::rhea_scalar_integer(2);
    let value = super::abi::rhea_scalar_integer(3);
    let fin = super::abi::rhea_null();
    let weak = super::abi::rhea_new_weakref(key, value, fin);
    assert_ne!(super::abi::rhea_weakref_key(weak), 0);
    assert_ne!(super::abi::rhea_weakref_value(weak), 0);
}

#[test]
fn test_abi_tracing_decorator_is_installable() {
    let sink = Arc::new(MemorySink::new());
    install(Upcalls::builder().tracer(sink.clone()).build());

    let h = super::abi::rhea_alloc_vector(7, 2);
    assert_ne!(h, 0);
    assert!(!sink.lines().is_empty());

    // Restore the plain façade for other assertions on this thread.
    install(Upcalls::default());
}
