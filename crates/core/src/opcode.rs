//! The opcode enumeration and instruction record (component C2).
//!
//! A `Line` is three-address code: up to one destination and two source
//! operands, all held as `Value` (numeric operands that are really line
//! indices, e.g. jump targets, are stored as `Value::Number`). Lines are
//! immutable once the statement they belong to is fully parsed, except for
//! backpatched jump targets, which the parser rewrites in place before
//! that point.

use crate::error::Location;
use crate::value::Value;

/// The full MiniScript opcode set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Noop,
    AssignA,
    AssignImplicit,

    APlusB,
    AMinusB,
    ATimesB,
    ADividedByB,
    AModB,
    APowB,

    AEqualB,
    ANotEqualB,
    AGreaterThanB,
    AGreatOrEqualB,
    ALessThanB,
    ALessOrEqualB,

    AAndB,
    AOrB,

    AisaB,

    BindAssignA,
    CopyA,
    NotA,

    GotoA,
    GotoAifB,
    GotoAifTrulyB,
    GotoAifNotB,

    PushParam,
    CallFunctionA,
    CallIntrinsicA,
    ReturnA,

    ElemBofA,
    ElemBofIterA,
    LengthOfA,
}

/// One instruction: `lhs = op(rhsA, rhsB)`, annotated with the source
/// location it was compiled from (used solely for error reporting).
#[derive(Debug, Clone)]
pub struct Line {
    pub lhs: Option<Value>,
    pub op: Opcode,
    pub rhs_a: Option<Value>,
    pub rhs_b: Option<Value>,
    pub location: Option<Location>,
}

impl Line {
    pub fn new(lhs: Option<Value>, op: Opcode, rhs_a: Option<Value>, rhs_b: Option<Value>) -> Self {
        Line {
            lhs,
            op,
            rhs_a,
            rhs_b,
            location: None,
        }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// A deterministic hash over all four fields, treating a missing
    /// operand as a fixed component rather than dereferencing a null
    /// (the Open Question §9 flags about the source implementation).
    pub fn line_hash(&self) -> i32 {
        let mut acc: i32 = 23;
        let mut mix = |h: i32| acc = acc.wrapping_mul(31).wrapping_add(h);
        mix(self.op as i32 ^ 0x5151);
        mix(self.lhs.as_ref().map(|v| v.hash_value(4)).unwrap_or(-1));
        mix(self.rhs_a.as_ref().map(|v| v.hash_value(4)).unwrap_or(-2));
        mix(self.rhs_b.as_ref().map(|v| v.hash_value(4)).unwrap_or(-3));
        acc
    }
}
