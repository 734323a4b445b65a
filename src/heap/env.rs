//! Environments - frame chains with lockable bindings
//!
//! Lookup and definition replicate the embedding semantics exactly: walk
//! enclosing frames until the name is found or the root environment is
//! reached; mutation honors binding and environment locks.

use super::{Symbol, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// One name/value slot in a frame
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: Rc<Symbol>,
    pub value: Value,
    pub locked: bool,
}

/// Environment frame with an optional enclosing parent
///
/// A frame with no parent is the root (empty) environment: lookups stop
/// there and definitions into it are rejected.
#[derive(Debug)]
pub struct Env {
    parent: Option<Rc<Env>>,
    frame: RefCell<Vec<Binding>>,
    locked: Cell<bool>,
}

/// Environment operation failures surfaced as language-level errors
#[derive(Debug, PartialEq, Eq)]
pub enum EnvError {
    LockedBinding(String),
    LockedEnvironment,
    RootEnvironment,
    NotFound(String),
}

impl std::fmt::Display for EnvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LockedBinding(name) => {
                write!(f, "cannot change value of locked binding for '{}'", name)
            }
            Self::LockedEnvironment => write!(f, "cannot add bindings to a locked environment"),
            Self::RootEnvironment => write!(f, "cannot assign values in the root environment"),
            Self::NotFound(name) => write!(f, "object '{}' not found", name),
        }
    }
}

impl std::error::Error for EnvError {}

impl Env {
    /// The root (empty) environment terminating every parent chain
    pub fn root() -> Rc<Self> {
        Rc::new(Self {
            parent: None,
            frame: RefCell::new(Vec::new()),
            locked: Cell::new(true),
        })
    }

    /// New child frame enclosed by `parent`
    pub fn child(parent: Rc<Env>) -> Rc<Self> {
        Rc::new(Self {
            parent: Some(parent),
            frame: RefCell::new(Vec::new()),
            locked: Cell::new(false),
        })
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    #[inline]
    pub fn parent(&self) -> Option<Rc<Env>> {
        self.parent.clone()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.get()
    }

    /// Lock the environment against new bindings; optionally lock every
    /// current binding as well
    pub fn lock(&self, lock_bindings: bool) {
        self.locked.set(true);
        if lock_bindings {
            for binding in self.frame.borrow_mut().iter_mut() {
                binding.locked = true;
            }
        }
    }

    pub fn lock_binding(&self, name: &Rc<Symbol>) {
        if let Some(b) = self
            .frame
            .borrow_mut()
            .iter_mut()
            .find(|b| Rc::ptr_eq(&b.name, name))
        {
            b.locked = true;
        }
    }

    pub fn unlock_binding(&self, name: &Rc<Symbol>) {
        if let Some(b) = self
            .frame
            .borrow_mut()
            .iter_mut()
            .find(|b| Rc::ptr_eq(&b.name, name))
        {
            b.locked = false;
        }
    }

    pub fn binding_is_locked(&self, name: &Rc<Symbol>) -> bool {
        self.frame
            .borrow()
            .iter()
            .find(|b| Rc::ptr_eq(&b.name, name))
            .map(|b| b.locked)
            .unwrap_or(false)
    }

    /// Value bound in this frame only; `Unbound` when absent
    pub fn get_local(&self, name: &Rc<Symbol>) -> Value {
        self.frame
            .borrow()
            .iter()
            .find(|b| Rc::ptr_eq(&b.name, name))
            .map(|b| b.value.clone())
            .unwrap_or(Value::Unbound)
    }

    /// Walk enclosing frames until found or the root is reached
    pub fn find(&self, name: &Rc<Symbol>) -> Value {
        let found = self.get_local(name);
        if !matches!(found, Value::Unbound) {
            return found;
        }
        let mut cursor = self.parent();
        while let Some(env) = cursor {
            let found = env.get_local(name);
            if !matches!(found, Value::Unbound) {
                return found;
            }
            cursor = env.parent();
        }
        Value::Unbound
    }

    /// Define (or overwrite) a binding in this frame
    pub fn define(&self, name: Rc<Symbol>, value: Value) -> Result<(), EnvError> {
        if self.is_root() {
            return Err(EnvError::RootEnvironment);
        }
        let mut frame = self.frame.borrow_mut();
        if let Some(b) = frame.iter_mut().find(|b| Rc::ptr_eq(&b.name, &name)) {
            if b.locked {
                return Err(EnvError::LockedBinding(name.name().to_string()));
            }
            b.value = value;
            return Ok(());
        }
        if self.locked.get() {
            return Err(EnvError::LockedEnvironment);
        }
        frame.push(Binding {
            name,
            value,
            locked: false,
        });
        Ok(())
    }

    /// Assign to an existing binding, walking enclosing frames; defines in
    /// the starting frame if never found (embedding semantics)
    pub fn set(&self, name: Rc<Symbol>, value: Value) -> Result<(), EnvError> {
        if !matches!(self.get_local(&name), Value::Unbound) {
            return self.define(name, value);
        }
        let mut cursor = self.parent();
        while let Some(env) = cursor {
            if env.is_root() {
                break;
            }
            if !matches!(env.get_local(&name), Value::Unbound) {
                return env.define(name, value);
            }
            cursor = env.parent();
        }
        self.define(name, value)
    }

    /// Remove a binding from this frame
    pub fn remove(&self, name: &Rc<Symbol>) -> Result<(), EnvError> {
        let mut frame = self.frame.borrow_mut();
        if let Some(pos) = frame.iter().position(|b| Rc::ptr_eq(&b.name, name)) {
            if frame[pos].locked {
                return Err(EnvError::LockedBinding(name.name().to_string()));
            }
            frame.remove(pos);
            Ok(())
        } else {
            Err(EnvError::NotFound(name.name().to_string()))
        }
    }

    /// Bound symbols of this frame, in definition order
    pub fn names(&self) -> Vec<Rc<Symbol>> {
        self.frame.borrow().iter().map(|b| b.name.clone()).collect()
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.frame.borrow().len()
    }
}
