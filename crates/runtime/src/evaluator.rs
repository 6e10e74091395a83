//! Per-`Line` execution (component C4): the opcode dispatch table, operand
//! resolution, and the `CallFunctionA` self/super binding logic.

use std::rc::Rc;

use miniscript_core::value::{MapRef, MsMap};
use miniscript_core::{arithmetic, Error, FunctionValue, Line, Opcode, Result, Value};

use crate::context::Context;
use crate::machine::Machine;

/// What the machine's run loop should do after executing one `Line`.
pub enum StepOutcome {
    Continue,
    Yielded,
    Finished,
}

/// Resolve any operand a `Line` can carry to a concrete value: literals pass
/// through, `Temp`/`Var` are read from the current frame (`Var` through the
/// full `self`/local/outer/global/intrinsic chain), and `SeqElem` performs
/// an index or dot lookup, including into the live `globals`/`locals`/
/// `outer` scopes when the receiver is literally that keyword.
///
/// A name or dot-chain reference that resolves to a `Function` is, per the
/// language's no-parens-call rule, immediately invoked with zero arguments
/// unless its `noInvoke` bit is set (the `@` address-of form) — so `d.bark`
/// alone yields the string the method returns, not the method itself.
pub fn eval_operand(machine: &mut Machine, v: &Value) -> Result<Value> {
    match v {
        Value::Temp(i) => Ok(machine.current().get_temp(*i)),
        Value::Var(name, no_invoke) => {
            let v = machine.get_var(name)?;
            maybe_auto_invoke(machine, v, None, None, *no_invoke)
        }
        Value::SeqElem(seq, idx, no_invoke) => {
            if let Some(scope_value) = read_scope_seq(machine, seq, idx)? {
                return Ok(scope_value);
            }
            let access = resolve_elem_access(machine, seq, idx)?;
            maybe_auto_invoke(machine, access.value, access.self_value, access.found_on, *no_invoke)
        }
        other => Ok(other.clone()),
    }
}

/// Like `eval_operand`, but never auto-invokes a resolved `Function` — used
/// only to resolve the callee operand of an explicit call, where the raw
/// function value (not its zero-arg result) is what must be called.
fn eval_operand_raw(machine: &mut Machine, v: &Value) -> Result<Value> {
    match v {
        Value::Temp(i) => Ok(machine.current().get_temp(*i)),
        Value::Var(name, _) => machine.get_var(name),
        Value::SeqElem(seq, idx, _) => {
            if let Some(scope_value) = read_scope_seq(machine, seq, idx)? {
                return Ok(scope_value);
            }
            Ok(resolve_elem_access(machine, seq, idx)?.value)
        }
        other => Ok(other.clone()),
    }
}

/// If `seq` is literally the identifier `globals`/`locals`/`outer`, reads
/// directly from the live scope it names rather than through a read-only
/// snapshot `Value::Map` (a snapshot would not write through, and for
/// `SeqElem` assignment targets it must).
fn read_scope_seq(machine: &mut Machine, seq: &Value, idx: &Value) -> Result<Option<Value>> {
    let Value::Var(name, _) = seq else { return Ok(None) };
    let scope = match name.as_ref() {
        "globals" => machine.globals().clone(),
        "locals" => machine.current().locals.clone(),
        "outer" => match machine.current().outer.clone() {
            Some(o) => o,
            None => return Ok(Some(Value::Null)),
        },
        _ => return Ok(None),
    };
    let key = eval_operand(machine, idx)?;
    let key_name = key.to_ms_string();
    Ok(Some(scope.borrow().get(key_name.as_str()).cloned().unwrap_or(Value::Null)))
}

fn write_scope_seq(machine: &mut Machine, seq: &Value, idx: &Value, value: Value) -> Result<bool> {
    let Value::Var(name, _) = seq else { return Ok(false) };
    let scope = match name.as_ref() {
        "globals" => machine.globals().clone(),
        "locals" => machine.current().locals.clone(),
        "outer" => match machine.current().outer.clone() {
            Some(o) => o,
            None => return Err(Error::runtime("no outer scope in this context")),
        },
        _ => return Ok(false),
    };
    let key = eval_operand(machine, idx)?;
    let key_name: Rc<str> = Rc::from(key.to_ms_string());
    scope.borrow_mut().insert(key_name, value);
    Ok(true)
}

/// `ElemBofA`: numeric indexing into a string/list, key lookup (walking
/// `__isa`) into a map, or dot-access into a primitive value's lazily-
/// materialized type prototype. Also returns the map the value was actually
/// found on, so a dot-bound method can have `self`/`super` set correctly
/// whether it's explicitly called or auto-invoked right here.
fn elem_of_with_owner(machine: &mut Machine, seq_val: &Value, idx_val: &Value) -> Result<(Value, Option<MapRef>)> {
    match seq_val {
        Value::Map(m) => match MsMap::lookup_chain_with_owner_and_limit(m, idx_val, machine.limits.isa_chain_limit)? {
            Some((v, owner)) => Ok((v, Some(owner))),
            None => Err(Error::key_error(format!("key '{}' not found in map", idx_val.to_ms_string()))),
        },
        Value::List(_) | Value::String(_) if matches!(idx_val, Value::Number(_)) => {
            Ok((arithmetic::index_get(seq_val, idx_val)?, None))
        }
        _ => {
            if let Some(proto) = machine.type_proto_for(seq_val) {
                if let Some((v, owner)) = MsMap::lookup_chain_with_owner_and_limit(&proto, idx_val, machine.limits.isa_chain_limit)? {
                    return Ok((v, Some(owner)));
                }
            }
            Err(Error::key_error(format!(
                "'{}' has no member '{}'",
                seq_val.type_name(),
                idx_val.to_ms_string()
            )))
        }
    }
}

/// The result of resolving a `SeqElem`'s sequence/index pair: the looked-up
/// value, plus (when it came from a map or a primitive's type prototype)
/// the receiver to bind as `self` and the map it was actually found on.
struct ElemAccess {
    value: Value,
    self_value: Option<Value>,
    found_on: Option<MapRef>,
}

/// Shared by `eval_operand`'s `SeqElem` arm and `resolve_callee`: resolves
/// `seq[idx]`/`seq.idx`, special-casing a literal `super` receiver the same
/// way `resolve_callee` always has.
fn resolve_elem_access(machine: &mut Machine, seq: &Value, idx: &Value) -> Result<ElemAccess> {
    let is_super = matches!(seq, Value::Var(n, _) if n.as_ref() == "super");
    if is_super {
        let receiver = machine.current().self_value.clone().unwrap_or(Value::Null);
        let idx_val = eval_operand(machine, idx)?;
        let start = match &receiver {
            Value::Map(m) => match m.borrow().get_isa() {
                Some(Value::Map(p)) => p,
                _ => return Err(Error::undefined_identifier(&idx_val.to_ms_string())),
            },
            _ => return Err(Error::undefined_identifier(&idx_val.to_ms_string())),
        };
        let Some((value, found_on)) = MsMap::lookup_chain_with_owner_and_limit(&start, &idx_val, machine.limits.isa_chain_limit)? else {
            return Err(Error::undefined_identifier(&idx_val.to_ms_string()));
        };
        return Ok(ElemAccess {
            value,
            self_value: machine.current().self_value.clone(),
            found_on: Some(found_on),
        });
    }

    let receiver = eval_operand(machine, seq)?;
    let idx_val = eval_operand(machine, idx)?;
    let (value, found_on) = elem_of_with_owner(machine, &receiver, &idx_val)?;
    let self_value = if found_on.is_some() { Some(receiver) } else { None };
    Ok(ElemAccess { value, self_value, found_on })
}

/// The no-parens-call rule (§4.6 "Address-of `@`"): a `Function` value
/// obtained from a name or dot-chain reference is invoked immediately with
/// no arguments, using whatever `self`/`super` binding the reference
/// resolved, unless `no_invoke` (set by `@`) suppresses it.
fn maybe_auto_invoke(
    machine: &mut Machine,
    value: Value,
    self_value: Option<Value>,
    found_on: Option<MapRef>,
    no_invoke: bool,
) -> Result<Value> {
    if no_invoke {
        return Ok(value);
    }
    let Value::Function(f) = &value else {
        return Ok(value);
    };
    call_sync(machine, Rc::clone(f), self_value, found_on, Vec::new())
}

/// Runs a function to completion synchronously by pushing a frame and
/// stepping the machine until exactly that frame returns, then extracts its
/// return value directly rather than routing it through a caller's L-value
/// (there isn't one — this backs auto-invoked bare references, not
/// `CallFunctionA`). A resumable intrinsic invoked this way is simply
/// re-polled each loop iteration rather than suspending the whole script;
/// real scripts call `wait`/`yield` as explicit statements, not through a
/// bare no-parens reference, so this is not expected to hang in practice.
fn call_sync(
    machine: &mut Machine,
    f: Rc<FunctionValue>,
    self_value: Option<Value>,
    found_on: Option<MapRef>,
    args: Vec<Value>,
) -> Result<Value> {
    let has_self_param = f.params.first().map(|p| p.name.as_ref() == "self").unwrap_or(false);
    let skip_self_param = self_value.is_some() && has_self_param;
    let param_start = if skip_self_param { 1 } else { 0 };

    let mut ctx = Context::new(Rc::clone(&f.code), "<anonymous>");
    ctx.outer = f.outer_vars.borrow().clone();
    ctx.self_value = self_value;
    ctx.super_value = found_on.and_then(|m| m.borrow().get_isa());

    for (i, param) in f.params.iter().enumerate().skip(param_start) {
        let value = args
            .get(i - param_start)
            .cloned()
            .or_else(|| param.default.clone())
            .unwrap_or(Value::Null);
        ctx.set_var(param.name.as_ref(), value)?;
    }

    let target_depth = machine.frame_depth();
    machine.push_frame(ctx);
    let mut steps = 0usize;
    loop {
        if machine.frame_depth() == target_depth + 1 && machine.current().at_end() {
            return Ok(machine.pop_top_frame_return_value());
        }
        steps += 1;
        if steps > machine.limits.step_budget_per_run {
            return Err(Error::limit_exceeded("step budget exceeded during an implicit no-parentheses call"));
        }
        machine.step()?;
    }
}

/// Store a value into an L-value: a numbered temp, a name (ordinary
/// assignment, always into the *current* frame's locals), or an indexed/dot
/// target.
pub fn store_value(machine: &mut Machine, target: &Value, value: Value) -> Result<()> {
    match target {
        Value::Temp(i) => {
            machine.current_mut().set_temp(*i, value);
            Ok(())
        }
        Value::Var(name, _) => machine.set_var(name, value),
        Value::SeqElem(seq, idx, _) => {
            if write_scope_seq(machine, seq, idx, value.clone())? {
                return Ok(());
            }
            let seq_val = eval_operand(machine, seq)?;
            let idx_val = eval_operand(machine, idx)?;
            arithmetic::index_set(&seq_val, &idx_val, value, machine.limits.size_limits())
        }
        _ => Err(Error::runtime("invalid assignment target")),
    }
}

/// `CopyA`'s core: turns a list/map *blueprint* (a literal compiled with
/// `Temp`/`Var`/`SeqElem` placeholder elements standing in for its
/// sub-expressions) into a genuinely fresh, fully concrete object. Every
/// element is resolved through `eval_operand` rather than merely cloned, so
/// `[x, f]` or `{k: expr}` picks up the current values of its pieces each
/// time it's evaluated — this is what makes each loop iteration produce a
/// distinct list/map object rather than an aliased one.
fn full_evaluate(machine: &mut Machine, v: &Value) -> Result<Value> {
    match v {
        Value::List(l) => {
            let items = l.borrow().clone();
            let mut out = Vec::with_capacity(items.len());
            for item in &items {
                out.push(full_evaluate_operand(machine, item)?);
            }
            Ok(Value::list(out))
        }
        Value::Map(m) => {
            let entries: Vec<(Value, Value)> = m.borrow().entries.iter().map(|(k, val)| (k.0.clone(), val.clone())).collect();
            let mut out = MsMap::new();
            for (k, val) in entries {
                let key = full_evaluate_operand(machine, &k)?;
                let value = full_evaluate_operand(machine, &val)?;
                out.set(key, value);
            }
            Ok(Value::map(out))
        }
        other => Ok(other.clone()),
    }
}

/// Resolves one blueprint element: placeholder operands go through the
/// normal operand-evaluation path, nested list/map blueprints recurse so
/// `[[1, x], {a: y}]` fully materializes, and already-concrete scalars pass
/// through unchanged.
fn full_evaluate_operand(machine: &mut Machine, v: &Value) -> Result<Value> {
    match v {
        Value::Temp(_) | Value::Var(_, _) | Value::SeqElem(_, _, _) => eval_operand(machine, v),
        Value::List(_) | Value::Map(_) => full_evaluate(machine, v),
        other => Ok(other.clone()),
    }
}

struct CalleeResolution {
    value: Value,
    self_value: Option<Value>,
    /// The map the callee was actually found on, so `super` in the new
    /// frame can bind to *that* map's `__isa` parent.
    found_on: Option<MapRef>,
}

fn resolve_callee(machine: &mut Machine, operand: &Value) -> Result<CalleeResolution> {
    match operand {
        Value::SeqElem(seq, idx, _) => {
            let access = resolve_elem_access(machine, seq, idx)?;
            Ok(CalleeResolution {
                value: access.value,
                self_value: access.self_value,
                found_on: access.found_on,
            })
        }
        other => Ok(CalleeResolution {
            value: eval_operand_raw(machine, other)?,
            self_value: None,
            found_on: None,
        }),
    }
}

pub fn exec(machine: &mut Machine, line: &Line) -> Result<StepOutcome> {
    match line.op {
        Opcode::Noop => {}

        Opcode::AssignA | Opcode::AssignImplicit => {
            let v = eval_operand(machine, line.rhs_a.as_ref().ok_or_else(|| Error::runtime("missing operand"))?)?;
            if matches!(line.op, Opcode::AssignImplicit) {
                machine.current_mut().implicit_result_count += 1;
            }
            if let Some(lhs) = &line.lhs {
                store_value(machine, lhs, v)?;
            }
        }

        Opcode::APlusB | Opcode::AMinusB | Opcode::ATimesB | Opcode::ADividedByB | Opcode::AModB | Opcode::APowB => {
            let a = eval_operand(machine, operand_a(line)?)?;
            let b = eval_operand(machine, operand_b(line)?)?;
            let result = match line.op {
                Opcode::APlusB => arithmetic::add(&a, &b, machine.limits.size_limits())?,
                Opcode::AMinusB => arithmetic::subtract(&a, &b)?,
                Opcode::ATimesB => arithmetic::multiply(&a, &b, machine.limits.size_limits())?,
                Opcode::ADividedByB => arithmetic::divide(&a, &b, machine.limits.size_limits())?,
                Opcode::AModB => arithmetic::modulo(&a, &b)?,
                Opcode::APowB => arithmetic::pow(&a, &b)?,
                _ => unreachable!(),
            };
            store_lhs(machine, line, result)?;
        }

        Opcode::AEqualB
        | Opcode::ANotEqualB
        | Opcode::AGreaterThanB
        | Opcode::AGreatOrEqualB
        | Opcode::ALessThanB
        | Opcode::ALessOrEqualB => {
            let a = eval_operand(machine, operand_a(line)?)?;
            let b = eval_operand(machine, operand_b(line)?)?;
            let result = match line.op {
                Opcode::AEqualB => arithmetic::equal(&a, &b),
                Opcode::ANotEqualB => arithmetic::not_equal(&a, &b),
                Opcode::AGreaterThanB => arithmetic::greater_than(&a, &b)?,
                Opcode::AGreatOrEqualB => arithmetic::greater_or_equal(&a, &b)?,
                Opcode::ALessThanB => arithmetic::less_than(&a, &b)?,
                Opcode::ALessOrEqualB => arithmetic::less_or_equal(&a, &b)?,
                _ => unreachable!(),
            };
            store_lhs(machine, line, result)?;
        }

        Opcode::AAndB | Opcode::AOrB => {
            let a = eval_operand(machine, operand_a(line)?)?;
            let b = eval_operand(machine, operand_b(line)?)?;
            let result = if matches!(line.op, Opcode::AAndB) {
                arithmetic::fuzzy_and(&a, &b)
            } else {
                arithmetic::fuzzy_or(&a, &b)
            };
            store_lhs(machine, line, result)?;
        }

        Opcode::AisaB => {
            let a = eval_operand(machine, operand_a(line)?)?;
            let b = eval_operand(machine, operand_b(line)?)?;
            let is_a = a.is_a_with_limit(&b, &machine.protos, machine.limits.isa_chain_limit)?;
            store_lhs(machine, line, Value::Number(if is_a { 1.0 } else { 0.0 }))?;
        }

        Opcode::BindAssignA => {
            let func = eval_operand(machine, operand_a(line)?)?;
            if let Value::Function(f) = &func {
                *f.outer_vars.borrow_mut() = Some(Rc::clone(&machine.current().locals));
            }
            store_lhs(machine, line, func)?;
        }

        Opcode::CopyA => {
            let operand = operand_a(line)?.clone();
            let v = full_evaluate_operand(machine, &operand)?;
            store_lhs(machine, line, v)?;
        }

        Opcode::NotA => {
            let a = eval_operand(machine, operand_a(line)?)?;
            store_lhs(machine, line, Value::Number(if a.truth() { 0.0 } else { 1.0 }))?;
        }

        Opcode::GotoA => {
            let target = line_target(machine, operand_a(line)?)?;
            machine.current_mut().pc = target;
        }
        Opcode::GotoAifB | Opcode::GotoAifTrulyB | Opcode::GotoAifNotB => {
            let target = line_target(machine, operand_a(line)?)?;
            let cond = eval_operand(machine, operand_b(line)?)?;
            let taken = match line.op {
                Opcode::GotoAifB => cond.truth(),
                Opcode::GotoAifTrulyB => cond.truly(),
                Opcode::GotoAifNotB => !cond.truth(),
                _ => unreachable!(),
            };
            if taken {
                machine.current_mut().pc = target;
            }
        }

        Opcode::PushParam => {
            let v = eval_operand(machine, operand_a(line)?)?;
            machine.current_mut().push_param_argument(v, machine.limits.max_pending_arguments)?;
        }

        Opcode::CallFunctionA => return call_function(machine, line),

        Opcode::CallIntrinsicA => return call_intrinsic(machine, line),

        Opcode::ReturnA => {
            let v = match &line.rhs_a {
                Some(operand) => eval_operand(machine, operand)?,
                None => Value::Null,
            };
            machine.current_mut().set_temp(0, v);
            let end = machine.current().code.borrow().len();
            machine.current_mut().pc = end;
        }

        Opcode::ElemBofA => {
            let a = eval_operand(machine, operand_a(line)?)?;
            let b = eval_operand(machine, operand_b(line)?)?;
            let (found, found_on) = elem_of_with_owner(machine, &a, &b)?;
            let self_value = if found_on.is_some() { Some(a) } else { None };
            let result = maybe_auto_invoke(machine, found, self_value, found_on, false)?;
            store_lhs(machine, line, result)?;
        }

        Opcode::ElemBofIterA => {
            let seq = eval_operand(machine, operand_a(line)?)?;
            let index = eval_operand(machine, operand_b(line)?)?;
            let Value::Number(i) = index else {
                return Err(Error::type_error("iteration index must be a number"));
            };
            let i = i as usize;
            let result = match &seq {
                Value::List(l) => l.borrow().get(i).cloned().unwrap_or(Value::Null),
                Value::String(s) => s.chars().nth(i).map(|c| Value::string(c.to_string())).unwrap_or(Value::Null),
                Value::Map(m) => match m.borrow().entries.get_index(i) {
                    Some((k, val)) => {
                        let mut pair = MsMap::new();
                        pair.set(Value::string("key"), k.0.clone());
                        pair.set(Value::string("value"), val.clone());
                        Value::map(pair)
                    }
                    None => Value::Null,
                },
                other => return Err(Error::type_error(format!("cannot iterate over {}", other.type_name()))),
            };
            store_lhs(machine, line, result)?;
        }

        Opcode::LengthOfA => {
            let a = eval_operand(machine, operand_a(line)?)?;
            let result = arithmetic::length_of(&a)?;
            store_lhs(machine, line, result)?;
        }
    }
    Ok(StepOutcome::Continue)
}

fn operand_a(line: &Line) -> Result<&Value> {
    line.rhs_a.as_ref().ok_or_else(|| Error::runtime("missing left operand"))
}

fn operand_b(line: &Line) -> Result<&Value> {
    line.rhs_b.as_ref().ok_or_else(|| Error::runtime("missing right operand"))
}

fn store_lhs(machine: &mut Machine, line: &Line, v: Value) -> Result<()> {
    if let Some(lhs) = &line.lhs {
        store_value(machine, lhs, v)?;
    }
    Ok(())
}

fn line_target(machine: &mut Machine, operand: &Value) -> Result<usize> {
    match eval_operand(machine, operand)? {
        Value::Number(n) => Ok(n as usize),
        _ => Err(Error::runtime("jump target must be a line index")),
    }
}

fn call_function(machine: &mut Machine, line: &Line) -> Result<StepOutcome> {
    let callee_operand = operand_a(line)?.clone();
    let resolved = resolve_callee(machine, &callee_operand)?;
    let args = machine.current_mut().take_pending_args();

    let Value::Function(f) = &resolved.value else {
        if args.is_empty() {
            store_lhs(machine, line, resolved.value)?;
            return Ok(StepOutcome::Continue);
        }
        return Err(Error::type_error(format!("cannot call a {} with arguments", resolved.value.type_name())));
    };

    if args.len() > f.params.len() {
        return Err(Error::too_many_arguments(format!(
            "function takes {} argument(s), got {}",
            f.params.len(),
            args.len()
        )));
    }

    let has_self_param = f.params.first().map(|p| p.name.as_ref() == "self").unwrap_or(false);
    let skip_self_param = resolved.self_value.is_some() && has_self_param;
    let param_start = if skip_self_param { 1 } else { 0 };

    let mut ctx = Context::new(Rc::clone(&f.code), "<anonymous>");
    ctx.outer = f.outer_vars.borrow().clone();
    ctx.self_value = resolved.self_value.clone();
    ctx.super_value = resolved.found_on.and_then(|m| m.borrow().get_isa());
    ctx.result_storage = line.lhs.clone();

    for (i, param) in f.params.iter().enumerate().skip(param_start) {
        let value = args
            .get(i - param_start)
            .cloned()
            .or_else(|| param.default.clone())
            .unwrap_or(Value::Null);
        ctx.set_var(param.name.as_ref(), value)?;
    }

    machine.push_frame(ctx);
    Ok(StepOutcome::Continue)
}

fn call_intrinsic(machine: &mut Machine, line: &Line) -> Result<StepOutcome> {
    let name = match operand_a(line)? {
        Value::String(s) => s.to_string(),
        _ => return Err(Error::runtime("intrinsic name must be a string")),
    };
    let def = machine
        .intrinsics
        .get(&name)
        .ok_or_else(|| Error::undefined_identifier(&name))?;
    let args: Vec<Value> = def
        .params
        .iter()
        .map(|p| {
            if p.name.as_ref() == "self" {
                machine.current().self_value.clone().unwrap_or(Value::Null)
            } else {
                machine.current().locals.borrow().get(p.name.as_ref()).cloned().unwrap_or(Value::Null)
            }
        })
        .collect();
    let partial = machine.current_mut().partial_result.take();
    tracing::trace!(intrinsic = %name, args = args.len(), "dispatching intrinsic");
    let outcome = (def.func)(machine, &args, partial)?;
    if outcome.done {
        machine.current_mut().set_temp(0, outcome.value);
        Ok(StepOutcome::Continue)
    } else {
        tracing::trace!(intrinsic = %name, "intrinsic yielded, will resume next step");
        machine.current_mut().partial_result = outcome.partial;
        machine.current_mut().pc -= 1;
        Ok(StepOutcome::Yielded)
    }
}
