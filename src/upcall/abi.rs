//! The `rhea_*` C entry-point catalogue
//!
//! The fixed ABI native extensions are compiled against: names, argument
//! order, and numeric encodings (0/1 status flags, type-tag integers)
//! are frozen. Handles crossing this boundary are opaque integers backed
//! by a per-thread export table; 0 is never a valid handle and doubles
//! as the failure return.

use super::error::{push_warning, set_last_error, take_last_error, RuntimeError};
use super::with_upcalls;
use crate::altrep::{AltrepClass, MethodDescriptor, MethodKind};
use crate::context::CallContext;
use crate::heap::{Scalar, Value};
use crate::interop::{NativeAddress, RoutineEntry};
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::raw::c_char;
use std::rc::Rc;
use std::sync::Arc;

// ============================================================================
// Handle export table
// ============================================================================

const FIRST_HANDLE: usize = 0x10;

struct HandleTable {
    values: HashMap<usize, Value>,
    contexts: HashMap<usize, Rc<CallContext>>,
    classes: HashMap<usize, Arc<AltrepClass>>,
    next: usize,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            values: HashMap::new(),
            contexts: HashMap::new(),
            classes: HashMap::new(),
            next: FIRST_HANDLE,
        }
    }

    fn fresh(&mut self) -> usize {
        let h = self.next;
        self.next += 1;
        h
    }
}

thread_local! {
    static HANDLES: RefCell<HandleTable> = RefCell::new(HandleTable::new());
}

fn export(value: Value) -> usize {
    HANDLES.with(|table| {
        let mut table = table.borrow_mut();
        let h = table.fresh();
        table.values.insert(h, value);
        h
    })
}

fn resolve(handle: usize) -> Option<Value> {
    HANDLES.with(|table| table.borrow().values.get(&handle).cloned())
}

fn export_context(context: Rc<CallContext>) -> usize {
    HANDLES.with(|table| {
        let mut table = table.borrow_mut();
        let h = table.fresh();
        table.contexts.insert(h, context);
        h
    })
}

fn resolve_context(handle: usize) -> Option<Rc<CallContext>> {
    HANDLES.with(|table| table.borrow().contexts.get(&handle).cloned())
}

fn export_class(class: Arc<AltrepClass>) -> usize {
    HANDLES.with(|table| {
        let mut table = table.borrow_mut();
        let h = table.fresh();
        table.classes.insert(h, class);
        h
    })
}

fn resolve_class(handle: usize) -> Option<Arc<AltrepClass>> {
    HANDLES.with(|table| table.borrow().classes.get(&handle).cloned())
}

pub(super) fn release_all_handles() {
    HANDLES.with(|table| {
        let mut table = table.borrow_mut();
        table.values.clear();
        table.contexts.clear();
        table.classes.clear();
    });
}

// ============================================================================
// Shim helpers
// ============================================================================

/// Borrow a C string; null or invalid UTF-8 is argument misuse
unsafe fn cstr<'a>(ptr: *const c_char) -> Result<&'a str, RuntimeError> {
    if ptr.is_null() {
        return Err(RuntimeError::Type {
            expected: "string",
            actual: "null pointer",
        });
    }
    std::ffi::CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| RuntimeError::Type {
            expected: "utf-8 string",
            actual: "invalid bytes",
        })
}

fn arg(handle: usize) -> Result<Value, RuntimeError> {
    resolve(handle).ok_or(RuntimeError::Type {
        expected: "live handle",
        actual: "stale handle",
    })
}

/// Encode a value-producing operation: handle on success, 0 on failure
fn ret_handle(result: Result<Value, RuntimeError>) -> usize {
    match result {
        Ok(value) => export(value),
        Err(err) => {
            set_last_error(err);
            0
        }
    }
}

/// Encode a status operation: 1 on success, 0 on failure
fn ret_status(result: Result<(), RuntimeError>) -> i32 {
    match result {
        Ok(()) => 1,
        Err(err) => {
            set_last_error(err);
            0
        }
    }
}

// ============================================================================
// Handle lifecycle
// ============================================================================

/// Release one exported handle
#[no_mangle]
pub extern "C" fn rhea_release(handle: usize) {
    HANDLES.with(|table| {
        let mut table = table.borrow_mut();
        table.values.remove(&handle);
        table.contexts.remove(&handle);
        table.classes.remove(&handle);
    });
}

/// Fresh handle to the null value
#[no_mangle]
pub extern "C" fn rhea_null() -> usize {
    export(Value::Null)
}

// ============================================================================
// Allocation and construction
// ============================================================================

#[no_mangle]
pub extern "C" fn rhea_alloc_vector(type_tag: i32, len: usize) -> usize {
    with_upcalls(|u| {
        ret_handle(u.traced("alloc_vector", &[], |u| u.alloc.alloc_vector(type_tag, len)))
    })
}

#[no_mangle]
pub extern "C" fn rhea_alloc_matrix(type_tag: i32, nrow: usize, ncol: usize) -> usize {
    with_upcalls(|u| {
        ret_handle(u.traced("alloc_matrix", &[], |u| {
            u.alloc.alloc_matrix(type_tag, nrow, ncol)
        }))
    })
}

#[no_mangle]
pub extern "C" fn rhea_scalar_integer(value: i32) -> usize {
    with_upcalls(|u| ret_handle(u.traced("scalar_integer", &[], |u| Ok(u.alloc.scalar_int(value)))))
}

#[no_mangle]
pub extern "C" fn rhea_scalar_real(value: f64) -> usize {
    with_upcalls(|u| ret_handle(u.traced("scalar_real", &[], |u| Ok(u.alloc.scalar_real(value)))))
}

#[no_mangle]
pub extern "C" fn rhea_scalar_logical(value: i32) -> usize {
    with_upcalls(|u| {
        ret_handle(u.traced("scalar_logical", &[], |u| Ok(u.alloc.scalar_logical(value))))
    })
}

/// # Safety
/// `text` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_mk_char(text: *const c_char) -> usize {
    let text = match cstr(text) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| ret_handle(u.traced("mk_char", &[], |u| Ok(u.alloc.mk_char(text)))))
}

/// # Safety
/// `text` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_mk_string(text: *const c_char) -> usize {
    let text = match cstr(text) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| ret_handle(u.traced("mk_string", &[], |u| Ok(u.alloc.mk_string(text)))))
}

/// # Safety
/// `name` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_install(name: *const c_char) -> usize {
    let name = match cstr(name) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| ret_handle(u.traced("install", &[], |u| Ok(u.alloc.install(name)))))
}

// ============================================================================
// Type queries, coercion, element access
// ============================================================================

#[no_mangle]
pub extern "C" fn rhea_type_tag(handle: usize) -> i32 {
    with_upcalls(|u| match arg(handle) {
        Ok(value) => u
            .traced("type_tag", &[&value], |u| Ok(u.coerce.type_tag(&value)))
            .unwrap_or(-1),
        Err(err) => {
            set_last_error(err);
            -1
        }
    })
}

#[no_mangle]
pub extern "C" fn rhea_length(handle: usize) -> usize {
    with_upcalls(|u| match arg(handle) {
        Ok(value) => u
            .traced("length", &[&value], |u| Ok(u.coerce.length(&value)))
            .unwrap_or(0),
        Err(err) => {
            set_last_error(err);
            0
        }
    })
}

#[no_mangle]
pub extern "C" fn rhea_coerce(handle: usize, type_tag: i32) -> usize {
    with_upcalls(|u| {
        ret_handle(arg(handle).and_then(|value| {
            u.traced("coerce", &[&value], |u| u.coerce.coerce(&value, type_tag))
        }))
    })
}

#[no_mangle]
pub extern "C" fn rhea_duplicate(handle: usize, deep: i32) -> usize {
    with_upcalls(|u| {
        ret_handle(arg(handle).and_then(|value| {
            u.traced("duplicate", &[&value], |u| {
                Ok(u.coerce.duplicate(&value, deep != 0))
            })
        }))
    })
}

#[no_mangle]
pub extern "C" fn rhea_is_null(handle: usize) -> i32 {
    resolve(handle).map(|v| v.is_null() as i32).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn rhea_is_vector(handle: usize) -> i32 {
    resolve(handle).map(|v| v.is_vector() as i32).unwrap_or(0)
}

#[no_mangle]
pub extern "C" fn rhea_is_environment(handle: usize) -> i32 {
    resolve(handle)
        .map(|v| v.is_environment() as i32)
        .unwrap_or(0)
}

/// Raw storage pointer; forces ALTREP materialization
#[no_mangle]
pub extern "C" fn rhea_dataptr(handle: usize, writable: i32) -> *mut core::ffi::c_void {
    with_upcalls(|u| {
        let result = arg(handle).and_then(|value| {
            u.traced("dataptr", &[&value], |u| {
                u.coerce.dataptr(&value, writable != 0)
            })
        });
        match result {
            Ok(ptr) => ptr,
            Err(err) => {
                set_last_error(err);
                std::ptr::null_mut()
            }
        }
    })
}

#[no_mangle]
pub extern "C" fn rhea_integer_elt(handle: usize, index: usize) -> i32 {
    with_upcalls(|u| {
        let result = arg(handle)
            .and_then(|value| u.traced("integer_elt", &[&value], |u| u.coerce.elt(&value, index)));
        match result {
            Ok(Scalar::Int(x)) | Ok(Scalar::Logical(x)) => x,
            Ok(_) => {
                set_last_error(RuntimeError::Type {
                    expected: "integer element",
                    actual: "other element",
                });
                0
            }
            Err(err) => {
                set_last_error(err);
                0
            }
        }
    })
}

#[no_mangle]
pub extern "C" fn rhea_real_elt(handle: usize, index: usize) -> f64 {
    with_upcalls(|u| {
        let result = arg(handle)
            .and_then(|value| u.traced("real_elt", &[&value], |u| u.coerce.elt(&value, index)));
        match result {
            Ok(Scalar::Real(x)) => x,
            Ok(Scalar::Int(x)) => x as f64,
            Ok(_) => {
                set_last_error(RuntimeError::Type {
                    expected: "numeric element",
                    actual: "other element",
                });
                0.0
            }
            Err(err) => {
                set_last_error(err);
                0.0
            }
        }
    })
}

#[no_mangle]
pub extern "C" fn rhea_set_integer_elt(handle: usize, index: usize, value: i32) -> i32 {
    with_upcalls(|u| {
        ret_status(arg(handle).and_then(|v| {
            u.traced("set_integer_elt", &[&v], |u| {
                u.coerce.set_elt(&v, index, Scalar::Int(value))
            })
        }))
    })
}

#[no_mangle]
pub extern "C" fn rhea_set_real_elt(handle: usize, index: usize, value: f64) -> i32 {
    with_upcalls(|u| {
        ret_status(arg(handle).and_then(|v| {
            u.traced("set_real_elt", &[&v], |u| {
                u.coerce.set_elt(&v, index, Scalar::Real(value))
            })
        }))
    })
}

// ============================================================================
// Environments
// ============================================================================

#[no_mangle]
pub extern "C" fn rhea_new_env(parent: usize) -> usize {
    with_upcalls(|u| {
        ret_handle(
            arg(parent).and_then(|p| u.traced("new_env", &[&p], |u| u.envs.new_env(&p))),
        )
    })
}

/// Handle to a fresh global environment chain (root + one frame)
#[no_mangle]
pub extern "C" fn rhea_global_env() -> usize {
    export(Value::Env(crate::heap::Env::child(crate::heap::Env::root())))
}

/// # Safety
/// `name` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_get_var(env: usize, name: *const c_char) -> usize {
    let name = match cstr(name) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| {
        ret_handle(
            arg(env).and_then(|e| u.traced("get_var", &[&e], |u| u.envs.get_var(&e, name))),
        )
    })
}

/// # Safety
/// `name` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_define_var(env: usize, name: *const c_char, value: usize) -> i32 {
    let name = match cstr(name) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| {
        ret_status(arg(env).and_then(|e| {
            let v = arg(value)?;
            u.traced("define_var", &[&e, &v], |u| u.envs.define_var(&e, name, v.clone()))
        }))
    })
}

/// # Safety
/// `name` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_set_var(env: usize, name: *const c_char, value: usize) -> i32 {
    let name = match cstr(name) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| {
        ret_status(arg(env).and_then(|e| {
            let v = arg(value)?;
            u.traced("set_var", &[&e, &v], |u| u.envs.set_var(&e, name, v.clone()))
        }))
    })
}

/// # Safety
/// `name` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_remove_var(env: usize, name: *const c_char) -> i32 {
    let name = match cstr(name) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| {
        ret_status(
            arg(env).and_then(|e| u.traced("remove_var", &[&e], |u| u.envs.remove_var(&e, name))),
        )
    })
}

#[no_mangle]
pub extern "C" fn rhea_parent_env(env: usize) -> usize {
    with_upcalls(|u| {
        ret_handle(
            arg(env).and_then(|e| u.traced("parent_env", &[&e], |u| u.envs.parent_env(&e))),
        )
    })
}

#[no_mangle]
pub extern "C" fn rhea_lock_environment(env: usize, lock_bindings: i32) -> i32 {
    with_upcalls(|u| {
        ret_status(arg(env).and_then(|e| {
            u.traced("lock_environment", &[&e], |u| {
                u.envs.lock_environment(&e, lock_bindings != 0)
            })
        }))
    })
}

/// # Safety
/// `name` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_lock_binding(env: usize, name: *const c_char) -> i32 {
    let name = match cstr(name) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| {
        ret_status(
            arg(env)
                .and_then(|e| u.traced("lock_binding", &[&e], |u| u.envs.lock_binding(&e, name))),
        )
    })
}

/// # Safety
/// `name` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_binding_is_locked(env: usize, name: *const c_char) -> i32 {
    let name = match cstr(name) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| match arg(env)
        .and_then(|e| u.traced("binding_is_locked", &[&e], |u| u.envs.binding_is_locked(&e, name)))
    {
        Ok(locked) => locked as i32,
        Err(err) => {
            set_last_error(err);
            0
        }
    })
}

#[no_mangle]
pub extern "C" fn rhea_env_names(env: usize) -> usize {
    with_upcalls(|u| {
        ret_handle(arg(env).and_then(|e| u.traced("env_names", &[&e], |u| u.envs.env_names(&e))))
    })
}

// ============================================================================
// Attributes
// ============================================================================

/// # Safety
/// `name` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_get_attrib(handle: usize, name: *const c_char) -> usize {
    let name = match cstr(name) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| {
        ret_handle(
            arg(handle)
                .and_then(|v| u.traced("get_attrib", &[&v], |u| u.attrs.get_attr(&v, name))),
        )
    })
}

/// # Safety
/// `name` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_set_attrib(handle: usize, name: *const c_char, attr: usize) -> i32 {
    let name = match cstr(name) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| {
        ret_status(arg(handle).and_then(|v| {
            let a = arg(attr)?;
            u.traced("set_attrib", &[&v, &a], |u| u.attrs.set_attr(&v, name, a.clone()))
        }))
    })
}

#[no_mangle]
pub extern "C" fn rhea_is_s4(handle: usize) -> i32 {
    with_upcalls(|u| {
        resolve(handle)
            .map(|v| u.attrs.is_s4(&v) as i32)
            .unwrap_or(0)
    })
}

#[no_mangle]
pub extern "C" fn rhea_set_s4(handle: usize, flag: i32) -> i32 {
    with_upcalls(|u| {
        ret_status(
            arg(handle)
                .and_then(|v| u.traced("set_s4", &[&v], |u| u.attrs.set_s4(&v, flag != 0))),
        )
    })
}

// ============================================================================
// Pairlists
// ============================================================================

#[no_mangle]
pub extern "C" fn rhea_cons(car: usize, cdr: usize) -> usize {
    with_upcalls(|u| {
        ret_handle(arg(car).and_then(|car| {
            let cdr = arg(cdr)?;
            u.traced("cons", &[&car, &cdr], |u| Ok(u.lists.cons(car.clone(), cdr.clone())))
        }))
    })
}

#[no_mangle]
pub extern "C" fn rhea_car(handle: usize) -> usize {
    with_upcalls(|u| {
        ret_handle(arg(handle).and_then(|v| u.traced("car", &[&v], |u| u.lists.car(&v))))
    })
}

#[no_mangle]
pub extern "C" fn rhea_cdr(handle: usize) -> usize {
    with_upcalls(|u| {
        ret_handle(arg(handle).and_then(|v| u.traced("cdr", &[&v], |u| u.lists.cdr(&v))))
    })
}

#[no_mangle]
pub extern "C" fn rhea_tag(handle: usize) -> usize {
    with_upcalls(|u| {
        ret_handle(arg(handle).and_then(|v| u.traced("tag", &[&v], |u| u.lists.tag(&v))))
    })
}

#[no_mangle]
pub extern "C" fn rhea_set_car(handle: usize, car: usize) -> i32 {
    with_upcalls(|u| {
        ret_status(arg(handle).and_then(|v| {
            let car = arg(car)?;
            u.traced("set_car", &[&v, &car], |u| u.lists.set_car(&v, car.clone()))
        }))
    })
}

#[no_mangle]
pub extern "C" fn rhea_set_tag(handle: usize, tag: usize) -> i32 {
    with_upcalls(|u| {
        ret_status(arg(handle).and_then(|v| {
            let tag = arg(tag)?;
            u.traced("set_tag", &[&v, &tag], |u| u.lists.set_tag(&v, tag.clone()))
        }))
    })
}

// ============================================================================
// Error and warning signaling
// ============================================================================

/// Raise a language-level error from native code
///
/// # Safety
/// `message` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_error(message: *const c_char) -> i32 {
    let message = match cstr(message) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    set_last_error(RuntimeError::Raised(message.to_string()));
    0
}

/// Report a recoverable warning from native code
///
/// # Safety
/// `message` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_warning(message: *const c_char) -> i32 {
    match cstr(message) {
        Ok(s) => {
            push_warning(s);
            1
        }
        Err(e) => {
            set_last_error(e);
            0
        }
    }
}

/// Whether an error is pending on this thread
#[no_mangle]
pub extern "C" fn rhea_has_error() -> i32 {
    let pending = take_last_error();
    let has = pending.is_some() as i32;
    if let Some(err) = pending {
        set_last_error(err);
    }
    has
}

/// Copy (and clear) the pending error message; returns bytes written
///
/// # Safety
/// `buf` must point at `cap` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn rhea_last_error(buf: *mut c_char, cap: usize) -> usize {
    let Some(err) = take_last_error() else {
        return 0;
    };
    if buf.is_null() || cap == 0 {
        return 0;
    }
    let message = err.to_string();
    let bytes = message.as_bytes();
    let n = bytes.len().min(cap - 1);
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf as *mut u8, n);
    *buf.add(n) = 0;
    n
}

/// An operation the port does not implement (kept in the catalogue for
/// ABI completeness; exercises the fault policy)
#[no_mangle]
pub extern "C" fn rhea_eval(_expr: usize, _env: usize) -> usize {
    with_upcalls(|u| {
        set_last_error(u.unimplemented("eval"));
        0
    })
}

// ============================================================================
// External pointers and weak references
// ============================================================================

#[no_mangle]
pub extern "C" fn rhea_new_extptr(addr: usize, tag: usize, protected: usize) -> usize {
    with_upcalls(|u| {
        ret_handle(arg(tag).and_then(|tag| {
            let protected = arg(protected)?;
            u.traced("new_extptr", &[&tag, &protected], |u| {
                Ok(u.alloc.new_extptr(addr, tag.clone(), protected.clone()))
            })
        }))
    })
}

#[no_mangle]
pub extern "C" fn rhea_extptr_addr(handle: usize) -> usize {
    with_upcalls(|u| {
        match arg(handle)
            .and_then(|v| u.traced("extptr_addr", &[&v], |u| u.ptrs.extptr_addr(&v)))
        {
            Ok(addr) => addr,
            Err(err) => {
                set_last_error(err);
                0
            }
        }
    })
}

#[no_mangle]
pub extern "C" fn rhea_extptr_tag(handle: usize) -> usize {
    with_upcalls(|u| {
        ret_handle(
            arg(handle).and_then(|v| u.traced("extptr_tag", &[&v], |u| u.ptrs.extptr_tag(&v))),
        )
    })
}

#[no_mangle]
pub extern "C" fn rhea_extptr_clear(handle: usize) -> i32 {
    with_upcalls(|u| {
        ret_status(
            arg(handle).and_then(|v| u.traced("extptr_clear", &[&v], |u| u.ptrs.extptr_clear(&v))),
        )
    })
}

#[no_mangle]
pub extern "C" fn rhea_new_weakref(key: usize, value: usize, finalizer: usize) -> usize {
    with_upcalls(|u| {
        ret_handle(arg(key).and_then(|key| {
            let value = arg(value)?;
            let finalizer = arg(finalizer)?;
            u.traced("new_weakref", &[&key, &value], |u| {
                Ok(u.alloc.new_weakref(key.clone(), value.clone(), finalizer.clone()))
            })
        }))
    })
}

#[no_mangle]
pub extern "C" fn rhea_weakref_key(handle: usize) -> usize {
    with_upcalls(|u| {
        ret_handle(
            arg(handle).and_then(|v| u.traced("weakref_key", &[&v], |u| u.ptrs.weakref_key(&v))),
        )
    })
}

#[no_mangle]
pub extern "C" fn rhea_weakref_value(handle: usize) -> usize {
    with_upcalls(|u| {
        ret_handle(
            arg(handle)
                .and_then(|v| u.traced("weakref_value", &[&v], |u| u.ptrs.weakref_value(&v))),
        )
    })
}

// ============================================================================
// Connections, parsing, RNG, graphics
// ============================================================================

/// Read from a connection into native memory; -1 on failure
#[no_mangle]
pub extern "C" fn rhea_read_connection(id: i32, buf: usize, count: usize) -> isize {
    with_upcalls(|u| {
        match u.traced("read_connection", &[], |u| {
            u.io.read_bytes(id, NativeAddress::new(buf), count)
        }) {
            Ok(n) => n as isize,
            Err(err) => {
                set_last_error(err);
                -1
            }
        }
    })
}

/// Write from native memory to a connection; -1 on failure
#[no_mangle]
pub extern "C" fn rhea_write_connection(id: i32, buf: usize, count: usize) -> isize {
    with_upcalls(|u| {
        match u.traced("write_connection", &[], |u| {
            u.io.write_bytes(id, NativeAddress::new(buf), count)
        }) {
            Ok(n) => n as isize,
            Err(err) => {
                set_last_error(err);
                -1
            }
        }
    })
}

/// # Safety
/// `text` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_parse(text: *const c_char) -> usize {
    let text = match cstr(text) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| ret_handle(u.traced("parse", &[], |u| u.io.parse(text))))
}

/// # Safety
/// `text` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_parse_docs(text: *const c_char) -> usize {
    let text = match cstr(text) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| ret_handle(u.traced("parse_docs", &[], |u| u.io.parse_docs(text))))
}

/// # Safety
/// `event` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_graphics_forward(event: *const c_char, payload: usize) -> i32 {
    let event = match cstr(event) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| {
        ret_status(arg(payload).and_then(|p| {
            u.traced("graphics_forward", &[&p], |u| u.io.forward_graphics(event, &p))
        }))
    })
}

#[no_mangle]
pub extern "C" fn rhea_get_rng_state() -> usize {
    with_upcalls(|u| ret_handle(u.traced("get_rng_state", &[], |u| Ok(u.rng.get_state()))))
}

#[no_mangle]
pub extern "C" fn rhea_put_rng_state(handle: usize) -> i32 {
    with_upcalls(|u| {
        ret_status(
            arg(handle)
                .and_then(|v| u.traced("put_rng_state", &[&v], |u| u.rng.put_state(&v))),
        )
    })
}

/// Delegated numeric primitive over raw buffers; returns outputs
/// written, or -1 on failure
///
/// # Safety
/// `op` must be a valid C string; `input` holds `count` doubles; `out`
/// has room for `count.max(1)` doubles.
#[no_mangle]
pub unsafe extern "C" fn rhea_numeric_apply(
    op: *const c_char,
    input: *const f64,
    count: usize,
    out: *mut f64,
) -> isize {
    let op = match cstr(op) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return -1;
        }
    };
    if input.is_null() || out.is_null() {
        set_last_error(RuntimeError::Type {
            expected: "buffer",
            actual: "null pointer",
        });
        return -1;
    }
    let input = std::slice::from_raw_parts(input, count);
    with_upcalls(|u| match u.traced("numeric_apply", &[], |u| u.num.apply(op, input)) {
        Ok(result) => {
            std::ptr::copy_nonoverlapping(result.as_ptr(), out, result.len());
            result.len() as isize
        }
        Err(err) => {
            set_last_error(err);
            -1
        }
    })
}

// ============================================================================
// Call contexts
// ============================================================================

/// Nearest real frame, or 0 at top level
#[no_mangle]
pub extern "C" fn rhea_current_context() -> usize {
    with_upcalls(|u| match u.ctx.current_context() {
        Some(context) => export_context(context),
        None => 0,
    })
}

#[no_mangle]
pub extern "C" fn rhea_previous_context(handle: usize) -> usize {
    with_upcalls(|u| {
        match resolve_context(handle).and_then(|c| u.ctx.previous_context(&c)) {
            Some(context) => export_context(context),
            None => 0,
        }
    })
}

#[no_mangle]
pub extern "C" fn rhea_context_env(handle: usize) -> usize {
    with_upcalls(|u| match resolve_context(handle) {
        Some(context) => export(u.ctx.context_environment(&context)),
        None => 0,
    })
}

#[no_mangle]
pub extern "C" fn rhea_context_function(handle: usize) -> usize {
    with_upcalls(|u| match resolve_context(handle) {
        Some(context) => export(u.ctx.context_function(&context)),
        None => 0,
    })
}

#[no_mangle]
pub extern "C" fn rhea_context_call(handle: usize) -> usize {
    with_upcalls(|u| match resolve_context(handle) {
        Some(context) => export(u.ctx.context_call(&context)),
        None => 0,
    })
}

// ============================================================================
// Load-time registration
// ============================================================================

/// One row of a native registration table
#[repr(C)]
pub struct AbiRoutine {
    pub name: *const c_char,
    pub address: usize,
    pub arity: i32,
}

/// `registerRoutines(library, kind, count, table)`
///
/// # Safety
/// `library` must be a valid C string; `table` must point at `count`
/// valid rows whose names are valid C strings.
#[no_mangle]
pub unsafe extern "C" fn rhea_register_routines(
    library: *const c_char,
    kind: i32,
    count: usize,
    table: *const AbiRoutine,
) -> i32 {
    let library = match cstr(library) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    if table.is_null() && count > 0 {
        set_last_error(RuntimeError::Type {
            expected: "routine table",
            actual: "null pointer",
        });
        return 0;
    }
    let rows = std::slice::from_raw_parts(table, count);
    let mut entries = Vec::with_capacity(count);
    for row in rows {
        let name = match cstr(row.name) {
            Ok(s) => s,
            Err(e) => {
                set_last_error(e);
                return 0;
            }
        };
        entries.push(RoutineEntry {
            name: name.to_string(),
            address: NativeAddress::new(row.address),
            arity: row.arity,
        });
    }
    with_upcalls(|u| {
        ret_status(u.traced("register_routines", &[], |u| {
            u.reg.register_routines(library, kind, &entries)
        }))
    })
}

/// # Safety
/// `library` and `function` must be valid C strings.
#[no_mangle]
pub unsafe extern "C" fn rhea_register_ccallable(
    library: *const c_char,
    function: *const c_char,
    address: usize,
) -> i32 {
    let (library, function) = match (cstr(library), cstr(function)) {
        (Ok(l), Ok(f)) => (l, f),
        _ => {
            set_last_error(RuntimeError::Type {
                expected: "string",
                actual: "null pointer",
            });
            return 0;
        }
    };
    with_upcalls(|u| {
        u.reg
            .register_ccallable(library, function, NativeAddress::new(address));
        1
    })
}

/// Stored address, or 0 with a pending not-found error
///
/// # Safety
/// `library` and `function` must be valid C strings.
#[no_mangle]
pub unsafe extern "C" fn rhea_get_ccallable(
    library: *const c_char,
    function: *const c_char,
) -> usize {
    let (library, function) = match (cstr(library), cstr(function)) {
        (Ok(l), Ok(f)) => (l, f),
        _ => {
            set_last_error(RuntimeError::Type {
                expected: "string",
                actual: "null pointer",
            });
            return 0;
        }
    };
    with_upcalls(|u| match u.reg.get_ccallable(library, function) {
        Ok(address) => address.raw(),
        Err(err) => {
            set_last_error(err);
            0
        }
    })
}

/// # Safety
/// `library` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_use_dynamic_symbols(library: *const c_char, flag: i32) -> i32 {
    let library = match cstr(library) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| ret_status(u.reg.use_dynamic_symbols(library, flag != 0)))
}

/// # Safety
/// `library` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_force_symbols(library: *const c_char, flag: i32) -> i32 {
    let library = match cstr(library) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    with_upcalls(|u| ret_status(u.reg.force_symbols(library, flag != 0)))
}

/// # Safety
/// `library` and `name` must be valid C strings.
#[no_mangle]
pub unsafe extern "C" fn rhea_set_dot_symbol_values(
    library: *const c_char,
    kind: i32,
    index: usize,
    name: *const c_char,
    address: usize,
    arity: i32,
) -> i32 {
    let (library, name) = match (cstr(library), cstr(name)) {
        (Ok(l), Ok(n)) => (l, n),
        _ => {
            set_last_error(RuntimeError::Type {
                expected: "string",
                actual: "null pointer",
            });
            return 0;
        }
    };
    with_upcalls(|u| {
        ret_status(u.reg.set_dot_symbol_values(
            library,
            kind,
            index,
            name,
            NativeAddress::new(address),
            arity,
        ))
    })
}

// ============================================================================
// ALTREP registration
// ============================================================================

/// Create an ALTREP class; returns a class handle
///
/// # Safety
/// `name` and `package` must be valid C strings.
#[no_mangle]
pub unsafe extern "C" fn rhea_altrep_make_class(
    type_tag: i32,
    name: *const c_char,
    package: *const c_char,
) -> usize {
    let (name, package) = match (cstr(name), cstr(package)) {
        (Ok(n), Ok(p)) => (n, p),
        _ => {
            set_last_error(RuntimeError::Type {
                expected: "string",
                actual: "null pointer",
            });
            return 0;
        }
    };
    with_upcalls(|u| match u.reg.altrep_make_class(type_tag, name, package) {
        Ok(class) => export_class(class),
        Err(err) => {
            set_last_error(err);
            0
        }
    })
}

/// Install a direct-backend method on a class
#[no_mangle]
pub extern "C" fn rhea_altrep_set_method(class: usize, kind: i32, address: usize) -> i32 {
    let Some(class) = resolve_class(class) else {
        set_last_error(RuntimeError::Type {
            expected: "altrep class handle",
            actual: "stale handle",
        });
        return 0;
    };
    let Some(kind) = MethodKind::from_index(kind) else {
        set_last_error(RuntimeError::Type {
            expected: "method kind",
            actual: "unknown kind",
        });
        return 0;
    };
    with_upcalls(|u| {
        ret_status(u.reg.altrep_register_method(
            &class,
            kind,
            MethodDescriptor::direct(NativeAddress::new(address)),
        ))
    })
}

/// Construct an instance over a class with two data slots
#[no_mangle]
pub extern "C" fn rhea_altrep_new(class: usize, data1: usize, data2: usize) -> usize {
    let Some(class) = resolve_class(class) else {
        set_last_error(RuntimeError::Type {
            expected: "altrep class handle",
            actual: "stale handle",
        });
        return 0;
    };
    with_upcalls(|u| {
        ret_handle(arg(data1).and_then(|d1| {
            let d2 = arg(data2)?;
            u.traced("altrep_new", &[&d1, &d2], |u| {
                Ok(u.reg.altrep_new(class.clone(), d1.clone(), d2.clone()))
            })
        }))
    })
}

/// Real class-membership check
///
/// # Safety
/// `class_name` must be a valid C string.
#[no_mangle]
pub unsafe extern "C" fn rhea_altrep_inherits(handle: usize, class_name: *const c_char) -> i32 {
    let class_name = match cstr(class_name) {
        Ok(s) => s,
        Err(e) => {
            set_last_error(e);
            return 0;
        }
    };
    match resolve(handle) {
        Some(Value::Altrep(inst)) => inst.inherits(class_name) as i32,
        Some(_) | None => 0,
    }
}
