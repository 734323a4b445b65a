//! Environment and context operations for native code
//!
//! Variable lookup and definition replicate the embedding semantics
//! exactly: walk enclosing environments until found or the root is
//! reached, special-case the missing/unbound sentinels, and respect
//! locked bindings. Context operations hand out live references into
//! the call stack for transient use.

use super::error::{RuntimeError, UpcallResult};
use crate::context::{self, CallContext};
use crate::heap::{self, Env, Value};
use std::rc::Rc;

/// Environment lookup and mutation operations
#[derive(Default)]
pub struct EnvOps;

impl EnvOps {
    fn env_of(value: &Value) -> UpcallResult<Rc<Env>> {
        match value {
            Value::Env(env) => Ok(env.clone()),
            // The historical "NULL means global" calling convention is
            // defunct on this surface.
            Value::Null => Err(RuntimeError::NullEnvironment),
            other => Err(RuntimeError::Type {
                expected: "environment",
                actual: other.type_name(),
            }),
        }
    }

    /// New environment enclosed by `parent`
    pub fn new_env(&self, parent: &Value) -> UpcallResult<Value> {
        Ok(Value::Env(Env::child(Self::env_of(parent)?)))
    }

    /// Enclosing environment; the root encloses itself
    pub fn parent_env(&self, env: &Value) -> UpcallResult<Value> {
        let env = Self::env_of(env)?;
        Ok(match env.parent() {
            Some(parent) => Value::Env(parent),
            None => Value::Env(env),
        })
    }

    /// Find a variable, walking enclosing environments
    ///
    /// Unbound names and missing-argument sentinels surface as the
    /// distinct language errors native code expects.
    pub fn get_var(&self, env: &Value, name: &str) -> UpcallResult<Value> {
        let env = Self::env_of(env)?;
        let symbol = heap::install(name);
        match env.find(&symbol) {
            Value::Unbound => Err(RuntimeError::NotFound(name.to_string())),
            Value::Missing => Err(RuntimeError::MissingArgument(name.to_string())),
            found => Ok(found),
        }
    }

    /// Find without the error conversion: sentinels pass through
    pub fn find_var(&self, env: &Value, name: &str) -> UpcallResult<Value> {
        let env = Self::env_of(env)?;
        Ok(env.find(&heap::install(name)))
    }

    /// Variable bound in this frame only
    pub fn get_var_in_frame(&self, env: &Value, name: &str) -> UpcallResult<Value> {
        let env = Self::env_of(env)?;
        Ok(env.get_local(&heap::install(name)))
    }

    /// Define (or overwrite) in the given frame; locked bindings and
    /// locked environments raise language errors
    pub fn define_var(&self, env: &Value, name: &str, value: Value) -> UpcallResult<()> {
        let env = Self::env_of(env)?;
        env.define(heap::install(name), value)?;
        Ok(())
    }

    /// Assign walking enclosing frames (embedding `setVar` semantics)
    pub fn set_var(&self, env: &Value, name: &str, value: Value) -> UpcallResult<()> {
        let env = Self::env_of(env)?;
        env.set(heap::install(name), value)?;
        Ok(())
    }

    pub fn remove_var(&self, env: &Value, name: &str) -> UpcallResult<()> {
        let env = Self::env_of(env)?;
        env.remove(&heap::install(name))?;
        Ok(())
    }

    pub fn lock_environment(&self, env: &Value, lock_bindings: bool) -> UpcallResult<()> {
        Self::env_of(env)?.lock(lock_bindings);
        Ok(())
    }

    pub fn environment_is_locked(&self, env: &Value) -> UpcallResult<bool> {
        Ok(Self::env_of(env)?.is_locked())
    }

    pub fn lock_binding(&self, env: &Value, name: &str) -> UpcallResult<()> {
        Self::env_of(env)?.lock_binding(&heap::install(name));
        Ok(())
    }

    pub fn unlock_binding(&self, env: &Value, name: &str) -> UpcallResult<()> {
        Self::env_of(env)?.unlock_binding(&heap::install(name));
        Ok(())
    }

    pub fn binding_is_locked(&self, env: &Value, name: &str) -> UpcallResult<bool> {
        Ok(Self::env_of(env)?.binding_is_locked(&heap::install(name)))
    }

    /// Frame symbols as a character vector
    pub fn env_names(&self, env: &Value) -> UpcallResult<Value> {
        let env = Self::env_of(env)?;
        let names = env.names();
        let cells: Vec<std::rc::Rc<str>> = names
            .iter()
            .map(|s| heap::intern_char(s.name()))
            .collect();
        Ok(Value::Vector(crate::heap::Vector::from_cells(
            crate::heap::Cells::Str(cells),
        )))
    }
}

/// Call-context reflection operations
#[derive(Default)]
pub struct CtxOps;

impl CtxOps {
    /// Nearest enclosing real frame, skipping promise/browser frames
    pub fn current_context(&self) -> Option<Rc<CallContext>> {
        context::current_function_context()
    }

    /// One real frame further out
    pub fn previous_context(&self, ctx: &Rc<CallContext>) -> Option<Rc<CallContext>> {
        context::previous_context(ctx)
    }

    pub fn context_environment(&self, ctx: &Rc<CallContext>) -> Value {
        Value::Env(ctx.environment())
    }

    pub fn context_function(&self, ctx: &Rc<CallContext>) -> Value {
        ctx.function()
    }

    pub fn context_call(&self, ctx: &Rc<CallContext>) -> Value {
        ctx.call()
    }

    pub fn context_srcref(&self, ctx: &Rc<CallContext>) -> Value {
        ctx.srcref()
    }
}
