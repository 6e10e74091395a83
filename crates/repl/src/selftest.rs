//! The CLI's built-in "run a unit-test pass" mode (spec §6 "CLI (minimal)"):
//! compiles and runs the §8 end-to-end scenarios and reports a pass/fail
//! count, the same battery exercised by `tests/end_to_end.rs`.

use std::cell::RefCell;
use std::rc::Rc;

use miniscript_compiler::Parser;
use miniscript_runtime::{HostIo, Machine, MachineLimits};

struct CaptureIo(Rc<RefCell<Vec<String>>>);

impl HostIo for CaptureIo {
    fn print(&mut self, text: &str) {
        self.0.borrow_mut().push(text.to_string());
    }
}

struct Case {
    name: &'static str,
    source: &'static str,
    expected: &'static [&'static str],
}

const CASES: &[Case] = &[
    Case {
        name: "sum 1..4",
        source: "x = 0\nfor i in range(1,5)\n  x = x + i\nend for\nprint x\n",
        expected: &["15"],
    },
    Case {
        name: "recursive fibonacci",
        source: "f = function(n)\n  if n < 2 then return n\n  return f(n-1) + f(n-2)\nend function\nprint f(10)\n",
        expected: &["55"],
    },
    Case {
        name: "new instance method dispatch",
        source: "Dog = {}\nDog.bark = function\n  return \"woof\"\nend function\nd = new Dog\nprint d.bark\n",
        expected: &["woof"],
    },
    Case {
        name: "string/list method chain",
        source: "s = \"Hello, World\"\nprint s.upper.split(\", \").join(\" / \")\n",
        expected: &["HELLO / WORLD"],
    },
    Case {
        name: "map iteration order",
        source: "m = {1:\"a\", 2:\"b\"}\nt = \"\"\nfor kv in m\n  t = t + kv.key + \"=\" + kv.value + \";\"\nend for\nprint t\n",
        expected: &["1=a;2=b;"],
    },
    Case {
        name: "string replicate then concat",
        source: "print \"ab\" * 3 + \"c\"\n",
        expected: &["abababc"],
    },
];

/// Runs every case, printing `ok`/`FAIL` per case, and returns `(passed, failed)`.
pub fn run() -> (usize, usize) {
    let mut passed = 0;
    let mut failed = 0;
    for case in CASES {
        match run_case(case) {
            Ok(()) => {
                println!("ok   {}", case.name);
                passed += 1;
            }
            Err(reason) => {
                println!("FAIL {} - {reason}", case.name);
                failed += 1;
            }
        }
    }
    (passed, failed)
}

fn run_case(case: &Case) -> Result<(), String> {
    let outcome = Parser::parse_source(case.source, "<selftest>").map_err(|e| e.to_string())?;
    if outcome.incomplete {
        return Err("incomplete parse".to_string());
    }
    let mut machine = Machine::new(MachineLimits::default());
    let out = Rc::new(RefCell::new(Vec::new()));
    machine.set_io(Box::new(CaptureIo(Rc::clone(&out))));
    machine.run_code(outcome.lines).map_err(|e| e.to_string())?;
    let actual = out.borrow();
    if actual.as_slice() == case.expected {
        Ok(())
    } else {
        Err(format!("expected {:?}, got {:?}", case.expected, actual))
    }
}
