//! Core value model and instruction set for MiniScript.
//!
//! This crate is the leaf of the workspace: it has no knowledge of parsing
//! or execution, only of what a MiniScript value *is* (`value`), how one
//! instruction is shaped (`opcode`), the size/recursion caps those types
//! respect (`limits`), and the error taxonomy both the compiler and the
//! runtime report through (`error`).

pub mod arithmetic;
pub mod error;
pub mod limits;
pub mod opcode;
pub mod value;

pub use error::{Error, ErrorKind, Location, Result};
pub use opcode::{Line, Opcode};
pub use value::{FunctionValue, ListRef, MapKey, MapRef, MsMap, Param, TypePrototypes, Value, VarScope};

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn truthiness_matches_spec() {
        assert!(!Value::Null.truth());
        assert!(!Value::Number(0.0).truth());
        assert!(Value::Number(0.5).truth());
        assert!(!Value::string("").truth());
        assert!(Value::string("x").truth());
        assert!(!Value::list(vec![]).truth());
        assert!(Value::list(vec![Value::Null]).truth());
    }

    #[test]
    fn equality_is_reflexive_and_deterministic() {
        let v = Value::list(vec![Value::Number(1.0), Value::string("a")]);
        assert_eq!(v.equality(&v, 16), 1.0);
        assert_eq!(v.hash_value(16), v.hash_value(16));
    }

    #[test]
    fn number_formatting_matches_spec() {
        assert_eq!(value::format_number(15.0), "15");
        assert_eq!(value::format_number(0.5), "0.5");
        assert_eq!(value::format_number(1.0 / 3.0), "0.333333");
    }

    #[test]
    fn distinct_list_literals_are_distinct_objects() {
        let a = Value::list(vec![]);
        let b = Value::list(vec![]);
        if let (Value::List(ra), Value::List(rb)) = (&a, &b) {
            assert!(!Rc::ptr_eq(ra, rb));
        } else {
            panic!("expected lists");
        }
    }

    #[test]
    fn isa_chain_cap_fails_on_cycle() {
        let protos = TypePrototypes::default();
        let a = Rc::new(std::cell::RefCell::new(MsMap::new()));
        let b = Rc::new(std::cell::RefCell::new(MsMap::new()));
        a.borrow_mut().set_isa(Value::Map(Rc::clone(&b)));
        b.borrow_mut().set_isa(Value::Map(Rc::clone(&a)));
        let result = Value::Map(Rc::clone(&a)).is_a(&Value::Map(Rc::new(std::cell::RefCell::new(MsMap::new()))), &protos);
        assert!(result.is_err());
    }

    /// §9: a list/map containing itself must not crash printing — recursion
    /// bottoms out at `PRINT_RECURSION_LIMIT` rather than looping forever.
    #[test]
    fn self_referential_list_does_not_overflow_the_stack() {
        let list = Value::list(vec![]);
        if let Value::List(l) = &list {
            l.borrow_mut().push(list.clone());
        }
        let printed = list.to_ms_string();
        assert!(printed.contains("..."), "expected an ellipsis placeholder, got: {printed}");
    }

    /// Ordinary nesting well within the recursion limit still prints fully;
    /// the depth cap should never truncate a non-cyclic structure.
    #[test]
    fn ordinary_nested_list_prints_in_full() {
        let v = Value::list(vec![Value::list(vec![Value::Number(1.0), Value::Number(2.0)])]);
        assert_eq!(v.to_ms_string(), "[[1, 2]]");
    }

    /// §4.1/§9: once a cycle is reachable by name from `globals`, the
    /// printer names the alias instead of falling back to `...`.
    #[test]
    fn self_referential_list_reachable_by_name_prints_that_name() {
        let list = Value::list(vec![]);
        if let Value::List(l) = &list {
            l.borrow_mut().push(list.clone());
        }
        let globals: VarScope = Rc::new(std::cell::RefCell::new(indexmap::IndexMap::new()));
        globals.borrow_mut().insert(Rc::from("a"), list.clone());
        let printed = list.to_ms_string_with_globals(&globals);
        assert!(!printed.contains("..."), "expected the named alias, got: {printed}");
        assert!(printed.contains('a'), "expected the global name 'a' in the output, got: {printed}");
    }
}
