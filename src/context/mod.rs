//! Call-context reflection - native-visible view of the managed stack
//!
//! Reconstructs the logical call-context chain on demand. Contexts are
//! pushed on frame entry and popped on return by an RAII guard; the
//! handles given to native code are live references into the stack and
//! must only be used within the call's dynamic extent (documented
//! hazard, not an ownership transfer).

use crate::heap::{Env, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// One logical frame record in the context chain
#[derive(Debug)]
pub struct CallContext {
    prev: Option<Rc<CallContext>>,
    kind: FrameKind,
    env: Rc<Env>,
    function: Value,
    call: Value,
    srcref: Value,
}

/// What kind of frame a context describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A real function activation
    Function,
    /// Promise-evaluation pseudo-frame, skipped by reflection
    Promise,
    /// Debugger/browser pseudo-frame, skipped by reflection
    Browser,
}

impl CallContext {
    #[inline]
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    #[inline]
    pub fn previous(&self) -> Option<Rc<CallContext>> {
        self.prev.clone()
    }

    /// The frame's evaluation environment
    #[inline]
    pub fn environment(&self) -> Rc<Env> {
        self.env.clone()
    }

    /// The function being applied in this frame
    #[inline]
    pub fn function(&self) -> Value {
        self.function.clone()
    }

    /// The syntactic call that created this frame
    #[inline]
    pub fn call(&self) -> Value {
        self.call.clone()
    }

    /// Source reference for the call, when recorded
    #[inline]
    pub fn srcref(&self) -> Value {
        self.srcref.clone()
    }
}

thread_local! {
    static STACK: RefCell<Option<Rc<CallContext>>> = const { RefCell::new(None) };
}

/// Scope guard pairing one context push with its pop
///
/// Contexts never outlive the call's dynamic extent; dropping the guard
/// restores the chain to the enclosing frame.
pub struct ContextGuard {
    restore: Option<Rc<CallContext>>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        STACK.with(|stack| {
            *stack.borrow_mut() = self.restore.take();
        });
    }
}

/// Push a frame onto the context chain for the extent of the guard
pub fn push_context(
    kind: FrameKind,
    env: Rc<Env>,
    function: Value,
    call: Value,
    srcref: Value,
) -> ContextGuard {
    STACK.with(|stack| {
        let mut top = stack.borrow_mut();
        let prev = top.clone();
        let context = Rc::new(CallContext {
            prev: prev.clone(),
            kind,
            env,
            function,
            call,
            srcref,
        });
        *top = Some(context);
        ContextGuard { restore: prev }
    })
}

/// Skip promise and browser pseudo-frames from `start` downward
fn skip_pseudo_frames(start: Option<Rc<CallContext>>) -> Option<Rc<CallContext>> {
    let mut cursor = start;
    while let Some(context) = cursor {
        if context.kind == FrameKind::Function {
            return Some(context);
        }
        cursor = context.previous();
    }
    None
}

/// The nearest enclosing real function frame, or the absent sentinel
///
/// Promise-evaluation and browser pseudo-frames are skipped; with only
/// the top-level sentinel on the stack there is no current context.
pub fn current_function_context() -> Option<Rc<CallContext>> {
    STACK.with(|stack| skip_pseudo_frames(stack.borrow().clone()))
}

/// One real frame further out from `context`, under the same skip rule
pub fn previous_context(context: &Rc<CallContext>) -> Option<Rc<CallContext>> {
    skip_pseudo_frames(context.previous())
}

/// Depth of the raw chain, pseudo-frames included (trace synopsis)
pub fn context_depth() -> usize {
    STACK.with(|stack| {
        let mut n = 0;
        let mut cursor = stack.borrow().clone();
        while let Some(context) = cursor {
            n += 1;
            cursor = context.previous();
        }
        n
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap;

    fn frame(kind: FrameKind, tag: &str) -> ContextGuard {
        let env = Env::child(Env::root());
        push_context(
            kind,
            env,
            Value::Char(heap::intern_char(tag)),
            Value::Null,
            Value::Null,
        )
    }

    #[test]
    fn test_empty_stack_has_no_context() {
        assert!(current_function_context().is_none());
    }

    #[test]
    fn test_current_skips_promise_and_browser_frames() {
        let _outer = frame(FrameKind::Function, "outer");
        let _promise = frame(FrameKind::Promise, "promise");
        let _browser = frame(FrameKind::Browser, "browser");

        let found = current_function_context().expect("real frame below pseudo-frames");
        match found.function() {
            Value::Char(name) => assert_eq!(&*name, "outer"),
            other => panic!("expected char, got {:?}", other),
        }
    }

    #[test]
    fn test_previous_context_walks_real_frames() {
        let _a = frame(FrameKind::Function, "a");
        let _p = frame(FrameKind::Promise, "p");
        let _b = frame(FrameKind::Function, "b");

        let current = current_function_context().unwrap();
        match current.function() {
            Value::Char(name) => assert_eq!(&*name, "b"),
            other => panic!("expected char, got {:?}", other),
        }

        let previous = previous_context(&current).expect("enclosing real frame");
        match previous.function() {
            Value::Char(name) => assert_eq!(&*name, "a"),
            other => panic!("expected char, got {:?}", other),
        }
        assert!(previous_context(&previous).is_none());
    }

    #[test]
    fn test_only_pseudo_frames_yield_absent() {
        let _p = frame(FrameKind::Promise, "p");
        let _q = frame(FrameKind::Promise, "q");
        assert!(current_function_context().is_none());
    }

    #[test]
    fn test_guard_restores_on_drop() {
        {
            let _a = frame(FrameKind::Function, "scoped");
            assert!(current_function_context().is_some());
        }
        assert!(current_function_context().is_none());
    }

    #[test]
    fn test_context_exposes_environment() {
        let env = Env::child(Env::root());
        let x = heap::install("x");
        env.define(x.clone(), Value::Char(heap::intern_char("v"))).unwrap();

        let _guard = push_context(
            FrameKind::Function,
            env.clone(),
            Value::Null,
            Value::Null,
            Value::Null,
        );
        let context = current_function_context().unwrap();
        assert!(matches!(context.environment().find(&x), Value::Char(_)));
    }
}
