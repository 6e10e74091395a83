//! The MiniScript value model (component C1).
//!
//! `Value` is a tagged variant covering every runtime type MiniScript
//! scripts can talk about, plus the three reference/L-value forms
//! (`Temp`, `Var`, `SeqElem`) the parser emits as instruction operands.
//! Lists and maps are reference types: cloning a `Value::List` clones the
//! handle, not the backing storage, so aliasing introduced by a script is
//! visible the way the specification requires.

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::limits::{EQUALITY_RECURSION_LIMIT, ISA_KEY};
use crate::opcode::Line;

/// A shared, mutable list of values.
pub type ListRef = Rc<RefCell<Vec<Value>>>;

/// A shared, mutable map of values, insertion-ordered.
pub type MapRef = Rc<RefCell<MsMap>>;

/// A shared, mutable variable scope, used both for a `Context`'s locals and
/// for a closure's captured `outerVars`. Sharing by reference rather than by
/// value is deliberate: the specification calls for a dynamic-scoping
/// flavor of closure where mutations after capture remain visible.
pub type VarScope = Rc<RefCell<IndexMap<Rc<str>, Value>>>;

/// One parameter of a `Function`: a name and an optional default-value
/// expression (evaluated in the *enclosing* scope at parse time, so by the
/// time the `Function` exists the default is already a plain `Value`).
#[derive(Debug, Clone)]
pub struct Param {
    pub name: Rc<str>,
    pub default: Option<Value>,
}

/// A compiled function: its parameter list, its code, and (once captured by
/// `BindAssignA`) a handle to the defining scope's variable map.
#[derive(Debug)]
pub struct FunctionValue {
    pub params: Vec<Param>,
    /// Filled in incrementally as the parser reads the function body, which
    /// follows the `Value::Function` object's own construction in source
    /// order (it may already be referenced as an operand before its last
    /// line is known), so it can't be an immutable `Rc<Vec<Line>>`.
    pub code: Rc<RefCell<Vec<Line>>>,
    pub outer_vars: RefCell<Option<VarScope>>,
}

impl PartialEq for FunctionValue {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

/// The tagged value type MiniScript scripts operate on.
#[derive(Debug, Clone)]
pub enum Value {
    /// The absence of a value; distinct from a missing map key.
    Null,
    /// An IEEE-754 double; also used to encode booleans and fuzzy truth.
    Number(f64),
    /// An immutable, size-bounded UTF-8 string.
    String(Rc<str>),
    /// A mutable, ordered, size-bounded sequence, shared by reference.
    List(ListRef),
    /// An insertion-ordered mapping, shared by reference.
    Map(MapRef),
    /// A bytecode function, optionally bound to a captured outer scope.
    Function(Rc<FunctionValue>),
    /// An L-value/R-value handle to a numbered temporary in the current
    /// context. Appears only as an instruction operand, never as data a
    /// script can store in a list or map.
    Temp(usize),
    /// A name reference. `no_invoke` is set by the `@` address-of form so
    /// the evaluator returns the function itself rather than calling it.
    Var(Rc<str>, bool),
    /// A two-part reference used as both an L-value (indexed assignment
    /// target) and an R-value (index/dot lookup).
    SeqElem(Box<Value>, Box<Value>, bool),
}

/// Identity-flavored equality for operand/test comparisons (distinct from
/// the fuzzy, depth-limited `equality` scripts observe): collections and
/// functions compare by reference, scalars by value.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Temp(a), Value::Temp(b)) => a == b,
            (Value::Var(a, an), Value::Var(b, bn)) => a == b && an == bn,
            (Value::SeqElem(sa, ia, na), Value::SeqElem(sb, ib, nb)) => sa == sb && ia == ib && na == nb,
            _ => false,
        }
    }
}

impl Value {
    pub fn string(s: impl Into<Rc<str>>) -> Value {
        Value::String(s.into())
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn map(map: MsMap) -> Value {
        Value::Map(Rc::new(RefCell::new(map)))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Function(_) => "function",
            Value::Temp(_) | Value::Var(_, _) | Value::SeqElem(_, _, _) => "reference",
        }
    }

    /// §3 truthiness: numbers are truthy when non-zero; strings/lists/maps
    /// when non-empty; functions always; null never.
    pub fn truth(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Map(m) => !m.borrow().is_empty(),
            Value::Function(_) => true,
            Value::Temp(_) | Value::Var(_, _) | Value::SeqElem(_, _, _) => false,
        }
    }

    /// Integer-truthy per `GotoAifTrulyB`: `int(value) != 0`.
    pub fn truly(&self) -> bool {
        match self {
            Value::Number(n) => (*n as i64) != 0,
            other => other.truth(),
        }
    }

    /// §4.1 structural equality, returning a number in `{0, 0.5, 1}`.
    /// `0.5` ("inconclusive") is returned when recursion into nested
    /// lists/maps hits `depth_limit`.
    pub fn equality(&self, other: &Value, depth_limit: usize) -> f64 {
        match (self, other) {
            (Value::Null, Value::Null) => 1.0,
            (Value::Null, _) | (_, Value::Null) => 0.0,
            (Value::Number(a), Value::Number(b)) => {
                if a == b {
                    1.0
                } else {
                    0.0
                }
            }
            (Value::String(a), Value::String(b)) => {
                if a == b {
                    1.0
                } else {
                    0.0
                }
            }
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return 1.0;
                }
                if depth_limit == 0 {
                    return 0.5;
                }
                let a = a.borrow();
                let b = b.borrow();
                if a.len() != b.len() {
                    return 0.0;
                }
                let mut inconclusive = false;
                for (x, y) in a.iter().zip(b.iter()) {
                    let e = x.equality(y, depth_limit - 1);
                    if e == 0.0 {
                        return 0.0;
                    }
                    if e == 0.5 {
                        inconclusive = true;
                    }
                }
                if inconclusive {
                    0.5
                } else {
                    1.0
                }
            }
            (Value::Map(a), Value::Map(b)) => {
                if Rc::ptr_eq(a, b) {
                    return 1.0;
                }
                if depth_limit == 0 {
                    return 0.5;
                }
                let a = a.borrow();
                let b = b.borrow();
                if a.entries.len() != b.entries.len() {
                    return 0.0;
                }
                let mut inconclusive = false;
                for (k, v) in a.entries.iter() {
                    match b.get(&k.0) {
                        Some(bv) => {
                            let e = v.equality(bv, depth_limit - 1);
                            if e == 0.0 {
                                return 0.0;
                            }
                            if e == 0.5 {
                                inconclusive = true;
                            }
                        }
                        None => return 0.0,
                    }
                }
                if inconclusive {
                    0.5
                } else {
                    1.0
                }
            }
            (Value::Function(a), Value::Function(b)) => {
                if Rc::ptr_eq(a, b) {
                    1.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// §4.1 structural hash; collections combine element hashes up to
    /// `depth_limit`. Null operands (which occur when hashing a `Line`
    /// whose operands may be absent) contribute a fixed component.
    pub fn hash_value(&self, depth_limit: usize) -> i32 {
        let mut acc: i32 = 17;
        let mut mix = |h: i32| acc = acc.wrapping_mul(31).wrapping_add(h);
        match self {
            Value::Null => mix(0),
            Value::Number(n) => mix(n.to_bits() as i32 ^ (n.to_bits() >> 32) as i32),
            Value::String(s) => {
                let mut h: i32 = 0;
                for b in s.bytes() {
                    h = h.wrapping_mul(31).wrapping_add(b as i32);
                }
                mix(h);
            }
            Value::List(l) => {
                if depth_limit == 0 {
                    mix(0x4C_57_00_00); // "LW" marker for depth-capped list
                } else {
                    for item in l.borrow().iter() {
                        mix(item.hash_value(depth_limit - 1));
                    }
                }
            }
            Value::Map(m) => {
                if depth_limit == 0 {
                    mix(0x4D_50_00_00); // "MP" marker for depth-capped map
                } else {
                    for (k, v) in m.borrow().entries.iter() {
                        mix(k.0.hash_value(depth_limit - 1));
                        mix(v.hash_value(depth_limit - 1));
                    }
                }
            }
            Value::Function(f) => mix(Rc::as_ptr(f) as i32),
            Value::Temp(i) => mix(*i as i32),
            Value::Var(name, _) => mix(name.bytes().fold(0i32, |a, b| a.wrapping_mul(31).wrapping_add(b as i32))),
            Value::SeqElem(seq, idx, _) => {
                mix(seq.hash_value(depth_limit.saturating_sub(1)));
                mix(idx.hash_value(depth_limit.saturating_sub(1)));
            }
        }
        acc
    }

    /// §4.1 `is_a`: true for primitives iff `type_value` is the matching
    /// prototype map; for maps, walks the `__isa` chain up to
    /// `limits::ISA_CHAIN_LIMIT` links.
    pub fn is_a(&self, type_value: &Value, protos: &TypePrototypes) -> Result<bool> {
        self.is_a_with_limit(type_value, protos, crate::limits::ISA_CHAIN_LIMIT)
    }

    pub fn is_a_with_limit(&self, type_value: &Value, protos: &TypePrototypes, chain_limit: usize) -> Result<bool> {
        let matching_proto: Option<MapRef> = match self {
            Value::Number(_) => protos.number.clone(),
            Value::String(_) => protos.string.clone(),
            Value::List(_) => protos.list.clone(),
            Value::Function(_) => protos.function.clone(),
            Value::Map(_) => None,
            _ => None,
        };
        if !matches!(self, Value::Map(_)) {
            return Ok(match (matching_proto, type_value) {
                (Some(p), Value::Map(t)) => Rc::ptr_eq(&p, t),
                _ => false,
            });
        }
        if let Value::Map(m) = self {
            let mut current = Rc::clone(m);
            for _ in 0..chain_limit {
                if let Value::Map(t) = type_value {
                    if Rc::ptr_eq(&current, t) {
                        return Ok(true);
                    }
                }
                let next = current.borrow().get_isa();
                match next {
                    Some(Value::Map(parent)) => current = parent,
                    _ => return Ok(false),
                }
            }
            return Err(Error::key_error("isa chain exceeded maximum depth"));
        }
        Ok(false)
    }

    /// User-facing stringification (`print`, string coercion in `+`). Bounds
    /// recursion into nested lists/maps at `PRINT_RECURSION_LIMIT` so a
    /// reference cycle (`a = []; a.push(a)`) prints `[...]` rather than
    /// overflowing the stack (§9).
    pub fn to_ms_string(&self) -> String {
        self.to_ms_string_at(None, crate::limits::PRINT_RECURSION_LIMIT)
    }

    /// As `to_ms_string`, but a list/map that would otherwise bottom out as
    /// `...` is first checked against `globals` for a name bound to that
    /// same object (§4.1 "a shared-name lookup to break cycles during
    /// printing"); a reachable named alias prints as that name instead.
    pub fn to_ms_string_with_globals(&self, globals: &VarScope) -> String {
        self.to_ms_string_at(Some(globals), crate::limits::PRINT_RECURSION_LIMIT)
    }

    fn to_ms_string_at(&self, globals: Option<&VarScope>, depth: usize) -> String {
        match self {
            Value::Null => String::new(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.to_string(),
            Value::List(_) if depth == 0 => alias_or_ellipsis(self, globals),
            Value::List(l) => {
                let items: Vec<String> = l.borrow().iter().map(|v| v.code_form_at(globals, depth - 1)).collect();
                format!("[{}]", items.join(", "))
            }
            Value::Map(_) if depth == 0 => alias_or_ellipsis(self, globals),
            Value::Map(m) => {
                let items: Vec<String> = m
                    .borrow()
                    .entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.0.code_form_at(globals, depth - 1), v.code_form_at(globals, depth - 1)))
                    .collect();
                format!("{{{}}}", items.join(", "))
            }
            Value::Function(f) => format!("FUNCTION({})", f.params.len()),
            Value::Temp(i) => format!("_tmp{i}"),
            Value::Var(name, _) => name.to_string(),
            Value::SeqElem(seq, idx, _) => format!("{}[{}]", seq.to_ms_string(), idx.to_ms_string()),
        }
    }

    /// Self-printing, source-like form used recursively inside list/map
    /// stringification; `depth` bounds recursion against reference cycles.
    pub fn code_form(&self, depth: usize) -> String {
        self.code_form_at(None, depth)
    }

    fn code_form_at(&self, globals: Option<&VarScope>, depth: usize) -> String {
        match self {
            Value::String(s) => format!("\"{}\"", s.replace('"', "\"\"")),
            Value::List(_) | Value::Map(_) if depth == 0 => alias_or_ellipsis(self, globals),
            _ => self.to_ms_string_at(globals, depth),
        }
    }
}

/// §4.1/§9: once recursion into a list/map bottoms out at depth 0, look for
/// a name in `globals` bound to that exact object (`Rc::ptr_eq`) before
/// falling back to the unresolved-cycle placeholder `...`.
fn alias_or_ellipsis(value: &Value, globals: Option<&VarScope>) -> String {
    if let Some(globals) = globals {
        if let Some(name) = shared_name(value, globals) {
            return name;
        }
    }
    "...".to_string()
}

fn shared_name(value: &Value, globals: &VarScope) -> Option<String> {
    let is_same = |other: &Value| match (value, other) {
        (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
        (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
        _ => false,
    };
    globals.borrow().iter().find(|(_, v)| is_same(v)).map(|(name, _)| name.to_string())
}

/// Format a number the way MiniScript prints it: integers with no decimal
/// point; magnitudes >= 1e10 or < 1e-6 (and nonzero) in 6-significant-digit
/// exponential form; otherwise fixed with up to 6 fractional digits and
/// trailing zeros stripped.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() };
    }
    if n == n.trunc() && n.abs() < 1e15 {
        return format!("{}", n as i64);
    }
    let mag = n.abs();
    if mag != 0.0 && (mag >= 1e10 || mag < 1e-6) {
        let formatted = format!("{:.5e}", n);
        return normalize_exponential(&formatted);
    }
    let s = format!("{:.6}", n);
    let trimmed = s.trim_end_matches('0');
    let trimmed = trimmed.trim_end_matches('.');
    trimmed.to_string()
}

fn normalize_exponential(s: &str) -> String {
    // Rust prints `1.23456e10`; MiniScript wants `E+10` style with a sign.
    if let Some(pos) = s.find('e') {
        let (mantissa, exp) = s.split_at(pos);
        let exp_val: i32 = exp[1..].parse().unwrap_or(0);
        format!("{}E{}{:02}", mantissa, if exp_val >= 0 { "+" } else { "-" }, exp_val.abs())
    } else {
        s.to_string()
    }
}

/// A hashable wrapper around `Value` for use as a map key: equality and
/// hashing both go through the structural, depth-limited definitions in
/// §4.1 rather than derived field-by-field comparison.
#[derive(Debug, Clone)]
pub struct MapKey(pub Value);

impl PartialEq for MapKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.equality(&other.0, EQUALITY_RECURSION_LIMIT) == 1.0
    }
}
impl Eq for MapKey {}

impl Hash for MapKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_i32(self.0.hash_value(EQUALITY_RECURSION_LIMIT));
    }
}

/// An insertion-ordered `Value -> Value` map, with the `__isa` prototype
/// hook and an optional assign-override callback a host can install to
/// intercept writes (e.g. to implement computed properties).
pub struct MsMap {
    pub entries: IndexMap<MapKey, Value>,
    assign_override: Option<Rc<dyn Fn(&Value, &Value) -> Option<Value>>>,
}

impl fmt::Debug for MsMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsMap").field("entries", &self.entries).finish()
    }
}

impl Default for MsMap {
    fn default() -> Self {
        MsMap {
            entries: IndexMap::new(),
            assign_override: None,
        }
    }
}

impl MsMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.get(&MapKey(key.clone()))
    }

    pub fn set(&mut self, key: Value, value: Value) {
        if let Some(cb) = self.assign_override.clone() {
            if let Some(overridden) = cb(&key, &value) {
                self.entries.insert(MapKey(key), overridden);
                return;
            }
        }
        self.entries.insert(MapKey(key), value);
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        self.entries.shift_remove(&MapKey(key.clone())).map(|v| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_assign_override(&mut self, cb: Rc<dyn Fn(&Value, &Value) -> Option<Value>>) {
        self.assign_override = Some(cb);
    }

    pub fn get_isa(&self) -> Option<Value> {
        self.get(&Value::string(ISA_KEY)).cloned()
    }

    pub fn set_isa(&mut self, parent: Value) {
        self.set(Value::string(ISA_KEY), parent);
    }

    /// Look up `key` by walking the `__isa` chain starting at `self`,
    /// capped at `limits::ISA_CHAIN_LIMIT` links.
    pub fn lookup_chain(start: &MapRef, key: &Value) -> Result<Option<Value>> {
        Self::lookup_chain_with_limit(start, key, crate::limits::ISA_CHAIN_LIMIT)
    }

    pub fn lookup_chain_with_limit(start: &MapRef, key: &Value, chain_limit: usize) -> Result<Option<Value>> {
        let mut current = Rc::clone(start);
        for _ in 0..chain_limit {
            if let Some(v) = current.borrow().get(key) {
                return Ok(Some(v.clone()));
            }
            let next = current.borrow().get_isa();
            match next {
                Some(Value::Map(parent)) => current = parent,
                _ => return Ok(None),
            }
        }
        Err(Error::key_error(format!("'{}' not found: __isa chain exceeded maximum depth", key.to_ms_string())))
    }

    /// Like `lookup_chain`, but also returns the map the key was actually
    /// found on, so a dot-call can bind `super` to *that* map's `__isa`
    /// parent rather than the receiver's.
    pub fn lookup_chain_with_owner(start: &MapRef, key: &Value) -> Result<Option<(Value, MapRef)>> {
        Self::lookup_chain_with_owner_and_limit(start, key, crate::limits::ISA_CHAIN_LIMIT)
    }

    pub fn lookup_chain_with_owner_and_limit(
        start: &MapRef,
        key: &Value,
        chain_limit: usize,
    ) -> Result<Option<(Value, MapRef)>> {
        let mut current = Rc::clone(start);
        for _ in 0..chain_limit {
            if let Some(v) = current.borrow().get(key) {
                return Ok(Some((v.clone(), Rc::clone(&current))));
            }
            let next = current.borrow().get_isa();
            match next {
                Some(Value::Map(parent)) => current = parent,
                _ => return Ok(None),
            }
        }
        Err(Error::key_error(format!("'{}' not found: __isa chain exceeded maximum depth", key.to_ms_string())))
    }
}

/// The five per-type prototype maps the Machine lazily materializes, per
/// §4.7 ("the `list`/`string`/`map`/`number`/`funcRef` names lazy-
/// materialize the per-type prototype maps on first access").
#[derive(Debug, Default, Clone)]
pub struct TypePrototypes {
    pub number: Option<MapRef>,
    pub string: Option<MapRef>,
    pub list: Option<MapRef>,
    pub map: Option<MapRef>,
    pub function: Option<MapRef>,
}
