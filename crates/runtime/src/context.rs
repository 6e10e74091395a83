//! The call-frame type (component C3).
//!
//! A `Context` is created on function entry (including the implicit global
//! context) and destroyed on return. Locals are a shared, mutable map so a
//! closure capturing the frame's variables at `BindAssignA` time observes
//! later mutations, per the "dynamic-scoping flavor of closure" design note.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use miniscript_core::value::VarScope;
use miniscript_core::{Error, Line, Result, Value};

/// Reserved identifiers that are resolved specially rather than through the
/// ordinary local/outer/global lookup chain.
pub const RESERVED_LOCALS: &str = "locals";
pub const RESERVED_GLOBALS: &str = "globals";
pub const RESERVED_OUTER: &str = "outer";
pub const RESERVED_SELF: &str = "self";
pub const RESERVED_SUPER: &str = "super";

pub struct Context {
    pub code: Rc<RefCell<Vec<Line>>>,
    pub pc: usize,
    pub locals: VarScope,
    pub outer: Option<VarScope>,
    pub self_value: Option<Value>,
    pub super_value: Option<Value>,
    temps: Vec<Value>,
    pending_args: Vec<Value>,
    /// Where to store this frame's return value once it completes, as an
    /// L-value (`Temp`/`Var`/`SeqElem`) in the *caller's* frame.
    pub result_storage: Option<Value>,
    /// Stashed in-progress state for a resumable intrinsic at the current
    /// line; re-passed to the intrinsic on the next execution of that line.
    pub partial_result: Option<Value>,
    /// Counts top-level expression-statements whose result wasn't assigned
    /// anywhere, so the REPL can echo them.
    pub implicit_result_count: usize,
    /// Name used in error locations (a function name, or `"<global>"`).
    pub context_name: String,
}

impl Context {
    pub fn new(code: Rc<RefCell<Vec<Line>>>, context_name: impl Into<String>) -> Self {
        Context {
            code,
            pc: 0,
            locals: Rc::new(RefCell::new(IndexMap::new())),
            outer: None,
            self_value: None,
            super_value: None,
            temps: vec![Value::Null],
            pending_args: Vec::new(),
            result_storage: None,
            partial_result: None,
            implicit_result_count: 0,
            context_name: context_name.into(),
        }
    }

    pub fn at_end(&self) -> bool {
        self.pc >= self.code.borrow().len()
    }

    pub fn current_line(&self) -> Option<Line> {
        self.code.borrow().get(self.pc).cloned()
    }

    pub fn set_temp(&mut self, i: usize, v: Value) {
        if i >= self.temps.len() {
            self.temps.resize(i + 1, Value::Null);
        }
        self.temps[i] = v;
    }

    pub fn get_temp(&self, i: usize) -> Value {
        self.temps.get(i).cloned().unwrap_or(Value::Null)
    }

    /// Slot 0 always holds the value a `ReturnA` most recently stored.
    pub fn return_value(&self) -> Value {
        self.get_temp(0)
    }

    pub fn push_param_argument(&mut self, v: Value, limit: usize) -> Result<()> {
        if self.pending_args.len() >= limit {
            return Err(Error::limit_exceeded("too many pending call arguments"));
        }
        self.pending_args.push(v);
        Ok(())
    }

    pub fn pending_arg_count(&self) -> usize {
        self.pending_args.len()
    }

    pub fn take_pending_args(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.pending_args)
    }

    /// §4.3 `set_var`: writes to `locals`/`globals` are forbidden; writing
    /// `self` mirrors into the context's dedicated self slot too.
    pub fn set_var(&mut self, name: &str, v: Value) -> Result<()> {
        if name == RESERVED_LOCALS || name == RESERVED_GLOBALS {
            return Err(Error::runtime(format!("cannot assign to reserved identifier '{name}'")));
        }
        if name == RESERVED_SELF {
            self.self_value = Some(v.clone());
        }
        self.locals.borrow_mut().insert(Rc::from(name), v);
        Ok(())
    }

    /// §4.3 `get_var` resolution order: `self`/`locals`/`globals`/`outer`
    /// shortcuts, then local, then outer-capture, then (for non-global
    /// frames) globals, then the intrinsic registry — the last two are
    /// resolved by the `Machine`, which calls `get_var_local_only` first.
    pub fn get_var_local_only(&self, name: &str) -> Option<Value> {
        if name == RESERVED_SELF {
            return self.self_value.clone().or(Some(Value::Null));
        }
        if name == RESERVED_SUPER {
            return self.super_value.clone().or(Some(Value::Null));
        }
        if let Some(v) = self.locals.borrow().get(name).cloned() {
            return Some(v);
        }
        if let Some(outer) = &self.outer {
            if let Some(v) = outer.borrow().get(name).cloned() {
                return Some(v);
            }
        }
        None
    }

    pub fn store_temp(&mut self, i: usize, v: Value) {
        self.set_temp(i, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_writes_are_rejected() {
        let mut ctx = Context::new(Rc::new(RefCell::new(vec![])), "<global>");
        assert!(ctx.set_var(RESERVED_LOCALS, Value::Null).is_err());
        assert!(ctx.set_var(RESERVED_GLOBALS, Value::Null).is_err());
        assert!(ctx.set_var("x", Value::Number(1.0)).is_ok());
    }

    #[test]
    fn self_write_mirrors_into_slot() {
        let mut ctx = Context::new(Rc::new(RefCell::new(vec![])), "<global>");
        ctx.set_var(RESERVED_SELF, Value::Number(3.0)).unwrap();
        assert_eq!(ctx.self_value, Some(Value::Number(3.0)));
    }
}
