//! Tests for the managed value model and environment semantics

use super::*;
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn test_type_tags_round_trip() {
    for kind in [
        ElemKind::Int,
        ElemKind::Real,
        ElemKind::Logical,
        ElemKind::Complex,
        ElemKind::Raw,
        ElemKind::Str,
        ElemKind::List,
    ] {
        assert_eq!(ElemKind::from_tag(kind.type_tag()), Some(kind));
    }
    assert_eq!(ElemKind::from_tag(99), None);
}

#[test]
fn test_vector_alloc_is_zeroed() {
    let v = Vector::alloc(ElemKind::Int, 4);
    assert_eq!(v.len(), 4);
    for i in 0..4 {
        match v.get(i) {
            Scalar::Int(x) => assert_eq!(x, 0),
            other => panic!("expected int, got {:?}", other),
        }
    }
}

#[test]
fn test_vector_set_get() {
    let v = Vector::alloc(ElemKind::Real, 2);
    v.set(1, Scalar::Real(2.5));
    match v.get(1) {
        Scalar::Real(x) => assert_eq!(x, 2.5),
        other => panic!("expected real, got {:?}", other),
    }
}

#[test]
fn test_symbol_interning_is_identity_stable() {
    let a = install("alpha");
    let b = install("alpha");
    let c = install("beta");
    assert!(Rc::ptr_eq(&a, &b));
    assert!(!Rc::ptr_eq(&a, &c));
}

#[test]
fn test_char_interning() {
    let a = intern_char("shared");
    let b = intern_char("shared");
    assert_eq!(a.as_ptr(), b.as_ptr());
}

#[test]
fn test_attributes_set_get_remove() {
    let v = Vector::alloc(ElemKind::Int, 1);
    let names = install("names");
    assert!(v.get_attr(&names).is_null());

    v.set_attr(names.clone(), Value::Char(intern_char("x")));
    assert!(matches!(v.get_attr(&names), Value::Char(_)));

    v.set_attr(names.clone(), Value::Null);
    assert!(v.get_attr(&names).is_null());
}

#[test]
fn test_env_find_walks_to_root() {
    let root = Env::root();
    let global = Env::child(root);
    let local = Env::child(global.clone());

    let x = install("x");
    global.define(x.clone(), Value::Char(intern_char("top"))).unwrap();

    assert!(matches!(local.find(&x), Value::Char(_)));
    let y = install("y");
    assert!(matches!(local.find(&y), Value::Unbound));
}

#[test]
fn test_root_env_rejects_definition() {
    let root = Env::root();
    let x = install("x");
    assert_eq!(
        root.define(x, Value::Null),
        Err(EnvError::RootEnvironment)
    );
}

#[test]
fn test_locked_binding_rejects_write() {
    let env = Env::child(Env::root());
    let x = install("x");
    env.define(x.clone(), Value::Char(intern_char("v"))).unwrap();
    env.lock_binding(&x);

    let err = env.define(x.clone(), Value::Null).unwrap_err();
    assert!(matches!(err, EnvError::LockedBinding(_)));
    assert!(env.binding_is_locked(&x));

    env.unlock_binding(&x);
    assert!(env.define(x, Value::Null).is_ok());
}

#[test]
fn test_locked_env_rejects_new_bindings() {
    let env = Env::child(Env::root());
    env.lock(false);
    let err = env.define(install("fresh"), Value::Null).unwrap_err();
    assert_eq!(err, EnvError::LockedEnvironment);
}

#[test]
fn test_pairlist_length() {
    let tail = Value::Pairlist(Rc::new(RefCell::new(Pairlist {
        car: Value::Null,
        cdr: Value::Null,
        tag: Value::Null,
    })));
    let head = Value::Pairlist(Rc::new(RefCell::new(Pairlist {
        car: Value::Null,
        cdr: tail,
        tag: Value::Null,
    })));
    assert_eq!(head.length(), 2);
}

#[test]
fn test_coerce_int_to_real() {
    let v = Vector::from_cells(Cells::Int(vec![1, 2, 3]));
    let out = coerce(&Value::Vector(v), ElemKind::Real).unwrap();
    match out {
        Value::Vector(r) => {
            assert_eq!(r.kind(), ElemKind::Real);
            assert!(matches!(r.get(2), Scalar::Real(x) if x == 3.0));
        }
        other => panic!("expected vector, got {:?}", other),
    }
}

#[test]
fn test_coerce_rejects_environment() {
    let env = Value::Env(Env::child(Env::root()));
    assert!(coerce(&env, ElemKind::Int).is_err());
}

#[test]
fn test_same_object_identity() {
    let v = Value::Vector(Vector::alloc(ElemKind::Int, 1));
    let w = v.clone();
    assert!(v.same_object(&w));
    let other = Value::Vector(Vector::alloc(ElemKind::Int, 1));
    assert!(!v.same_object(&other));
}
