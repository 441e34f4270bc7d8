/// Stack-based bytecode interpreter
///
/// `Vm` owns the one thing `context::EngineState` deliberately does not: the
/// call stack. A script or function body runs as a `Frame` pushed onto
/// `Vm::frames`; every frame's operand stack is a window (`stack_base..`)
/// into one shared `Vec<Value>` rather than each frame owning a private
/// stack, so `Call`/`Construct` never have to copy operands between stacks —
/// pushing a new frame just remembers where the old one's operands end.
///
/// Exception unwinding needs no separate data structure either: a thrown
/// value that finds no handler in the current frame's `protected_ranges`
/// simply returns `Err` up through the native `invoke_scripted` call that
/// pushed the frame, which is itself running inside the caller's own
/// `run_frame` loop — so crossing a call boundary on the way up is ordinary
/// Rust control flow, not a second unwinding mechanism layered on top.
use std::rc::Rc;

use crate::bytecode::{CodeFlags, CompiledCode, ConstructorKind, Op, ProtectedKind, ProtectedRange, decode_at};
use crate::context::EngineState;
use crate::cp_heap::Cp;
use crate::dispatch::{self, DispatchError};
use crate::environment::{self, EnvError};
use crate::errors::{JsErrorKind, JsResult};
use crate::exception::{Completion, PendingCompletions};
use crate::heap::{HeapRecord, HeapRecordData};
use crate::object::{ArgMapping, ObjectData, ObjectKind, PropAttrs, PropName, PropValue};
use crate::strings::MagicStr;
use crate::value::{DirectString, Value, SMALL_INT_MAX, SMALL_INT_MIN};

/// One activation record. `pending` holds completion records for `finally`
/// blocks this frame is currently inside (innermost last); everything else
/// mirrors what a native call frame would hold.
pub struct Frame {
    pub code: Rc<CompiledCode>,
    pub ip: u32,
    pub stack_base: usize,
    pub env: Cp,
    pub this_val: Value,
    pub new_target: Value,
    pub strict: bool,
    pub pending: PendingCompletions,
}

#[derive(Default)]
pub struct Vm {
    frames: Vec<Frame>,
    stack: Vec<Value>,
}

impl Vm {
    pub fn new() -> Self {
        Vm::default()
    }

    /// Every `Value` a collection run must treat as live: the shared operand
    /// stack plus each live frame's environment/`this`/`new.target`, none of
    /// which otherwise appear on the operand stack.
    pub fn roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.stack.iter().copied().chain(
            self.frames
                .iter()
                .flat_map(|f| [Value::from_cp(f.env), f.this_val, f.new_target].into_iter()),
        )
    }

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    /// Entry point for a top-level script body: runs with the engine's
    /// global environment and global object as `this`.
    pub fn run_script(&mut self, engine: &mut EngineState, code: Rc<CompiledCode>) -> JsResult<Value> {
        let global_env = engine.global_env;
        let global_this = Value::from_cp(engine.global_object);
        self.invoke_scripted(engine, code, global_env, global_this, Value::undefined(), &[])
    }

    /// `[[Call]]`: resolves bound-function chains, then dispatches to either
    /// a native function or a scripted body.
    pub fn call(&mut self, engine: &mut EngineState, callee: Value, this_arg: Value, args: &[Value]) -> JsResult<Value> {
        let Some(cp) = callee.as_cp() else {
            return Err(engine.raise(JsErrorKind::TypeError, "value is not a function"));
        };
        if !dispatch::is_callable(&engine.heap, cp) {
            return Err(engine.raise(JsErrorKind::TypeError, "value is not a function"));
        }
        let Some((target, bound_this, prefix)) = dispatch::resolve_callable(&engine.heap, cp) else {
            return Err(engine.raise(JsErrorKind::TypeError, "value is not a function"));
        };
        let is_class_constructor =
            matches!(engine.heap.get(target).and_then(|r| r.as_object()).map(|o| &o.kind), Some(ObjectKind::ConstructorFunction { .. }));
        if is_class_constructor {
            return Err(engine.raise(JsErrorKind::TypeError, "class constructor cannot be invoked without 'new'"));
        }
        let effective_this = if target != cp { bound_this } else { this_arg };
        let mut full_args = prefix;
        full_args.extend_from_slice(args);
        match callee_kind(&engine.heap, target) {
            CalleeKind::Native(id) => {
                let f = engine.native_fns[id as usize];
                f(engine, effective_this, &full_args)
            }
            CalleeKind::Scripted(code, closure_env) => {
                self.invoke_scripted(engine, code, closure_env, effective_this, Value::undefined(), &full_args)
            }
            CalleeKind::NotCallable => Err(engine.raise(JsErrorKind::TypeError, "value is not a function")),
        }
    }

    /// `[[Construct]]`: allocates the new object from the constructor's own
    /// `.prototype` property before invoking the body with it as `this`.
    pub fn construct(&mut self, engine: &mut EngineState, callee: Value, args: &[Value]) -> JsResult<Value> {
        let Some(cp) = callee.as_cp() else {
            return Err(engine.raise(JsErrorKind::TypeError, "value is not a constructor"));
        };
        if !dispatch::is_constructable(&engine.heap, cp) {
            return Err(engine.raise(JsErrorKind::TypeError, "value is not a constructor"));
        }
        let Some((target, _bound_this, prefix)) = dispatch::resolve_callable(&engine.heap, cp) else {
            return Err(engine.raise(JsErrorKind::TypeError, "value is not a constructor"));
        };
        let mut full_args = prefix;
        full_args.extend_from_slice(args);
        match callee_kind(&engine.heap, target) {
            CalleeKind::Native(id) => {
                let f = engine.native_fns[id as usize];
                f(engine, Value::undefined(), &full_args)
            }
            CalleeKind::Scripted(code, closure_env) => {
                let proto = match dispatch::get_own(&engine.heap, target, PropName::Magic(MagicStr(2))) {
                    Some(PropValue::Data(v)) => v.as_cp().unwrap_or(Cp::NULL),
                    _ => Cp::NULL,
                };
                let new_obj = engine
                    .heap
                    .alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(ObjectKind::Ordinary, proto))))
                    .map_err(|_| engine.raise(JsErrorKind::RangeError, "heap exhausted allocating object"))?;
                let this_val = Value::from_cp(new_obj);
                let new_target = Value::from_cp(target);

                // Derived classes chain to the super constructor before their
                // own body runs (spec.md §4.6). The super constructor is
                // found via the constructor function object's own
                // `[[Prototype]]` — the same slot real engines resolve
                // `super(...)` through — rather than a dedicated field, since
                // there is no `SuperCall` opcode to mark where in the body
                // the chain should happen; this crate simply runs the whole
                // super constructor first, then the derived body, on the
                // same `this`.
                if code.constructor_kind == ConstructorKind::Derived {
                    let super_cp = engine
                        .heap
                        .get(target)
                        .and_then(|r| r.as_object())
                        .map(|o| o.prototype)
                        .filter(|p| !p.is_null() && dispatch::is_constructable(&engine.heap, *p))
                        .ok_or_else(|| engine.raise(JsErrorKind::TypeError, "derived constructor has no super constructor"))?;
                    match callee_kind(&engine.heap, super_cp) {
                        CalleeKind::Scripted(super_code, super_closure_env) => {
                            self.invoke_scripted(engine, super_code, super_closure_env, this_val, new_target, &full_args)?;
                        }
                        CalleeKind::Native(id) => {
                            let f = engine.native_fns[id as usize];
                            f(engine, this_val, &full_args)?;
                        }
                        CalleeKind::NotCallable => {
                            return Err(engine.raise(JsErrorKind::TypeError, "derived constructor has no super constructor"));
                        }
                    }
                }

                let result = self.invoke_scripted(engine, code, closure_env, this_val, new_target, &full_args)?;
                if result.as_cp().is_some() {
                    Ok(result)
                } else {
                    Ok(this_val)
                }
            }
            CalleeKind::NotCallable => Err(engine.raise(JsErrorKind::TypeError, "value is not a constructor")),
        }
    }

    fn invoke_scripted(
        &mut self,
        engine: &mut EngineState,
        code: Rc<CompiledCode>,
        closure_env: Cp,
        this_val: Value,
        new_target: Value,
        args: &[Value],
    ) -> JsResult<Value> {
        if self.frames.len() >= engine.config.max_call_depth {
            return Err(engine.raise(JsErrorKind::RangeError, "call stack size exceeded"));
        }
        let call_env = environment::create_declarative_environment(&mut engine.heap, closure_env);
        for (i, name) in code.param_names.iter().enumerate() {
            let v = args.get(i).copied().unwrap_or(Value::undefined());
            environment::create_binding(&mut engine.heap, call_env, *name, false);
            environment::initialize_binding(&mut engine.heap, call_env, *name, v);
        }
        let strict = code.flags.contains(CodeFlags::STRICT);
        if !code.flags.contains(CodeFlags::ARROW) {
            let this_name = PropName::Magic(MagicStr(8));
            environment::create_binding(&mut engine.heap, call_env, this_name, true);
            environment::initialize_binding(&mut engine.heap, call_env, this_name, this_val);
        }
        if code.flags.contains(CodeFlags::HAS_ARGUMENTS_OBJECT) {
            let mapped: ArgMapping = if strict {
                vec![None; args.len()]
            } else {
                code.param_names
                    .iter()
                    .map(|p| match p {
                        PropName::Magic(m) => Some(*m),
                        _ => None,
                    })
                    .collect()
            };
            let args_obj = engine
                .heap
                .alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(
                    ObjectKind::Arguments { mapped, parent_env: call_env },
                    Cp::NULL,
                ))))
                .map_err(|_| engine.raise(JsErrorKind::RangeError, "heap exhausted allocating arguments object"))?;
            if let Some(o) = engine.heap.get_mut(args_obj).and_then(|r| r.as_object_mut()) {
                o.props.define(PropName::Magic(MagicStr(0)), PropValue::Data(Value::from_small_int(args.len() as i32)), PropAttrs::DEFAULT);
            }
            let args_name = PropName::Magic(MagicStr(6));
            environment::create_binding(&mut engine.heap, call_env, args_name, false);
            environment::initialize_binding(&mut engine.heap, call_env, args_name, Value::from_cp(args_obj));
        }

        let stack_base = self.stack.len();
        self.frames.push(Frame {
            code: code.clone(),
            ip: 0,
            stack_base,
            env: call_env,
            this_val,
            new_target,
            strict,
            pending: PendingCompletions::default(),
        });
        let frame_idx = self.frames.len() - 1;
        let result = self.run_frame(engine, frame_idx);
        self.frames.truncate(frame_idx);
        self.stack.truncate(stack_base);
        let roots: Vec<Value> = self.roots().collect();
        engine.maybe_collect(roots);
        result
    }

    fn run_frame(&mut self, engine: &mut EngineState, frame_idx: usize) -> JsResult<Value> {
        loop {
            let code = self.frames[frame_idx].code.clone();
            let ip = self.frames[frame_idx].ip as usize;
            if ip >= code.code.len() {
                let base = self.frames[frame_idx].stack_base;
                self.stack.truncate(base);
                return Ok(Value::undefined());
            }
            let (instr, next_ip) = decode_at(&code.code, ip);
            self.frames[frame_idx].ip = next_ip as u32;
            match self.execute_instr(engine, frame_idx, &code, instr, ip as u32, next_ip as u32) {
                Ok(Some(v)) => {
                    let base = self.frames[frame_idx].stack_base;
                    self.stack.truncate(base);
                    return Ok(v);
                }
                Ok(None) => continue,
                Err(thrown) => match code.handler_for(ip as u32) {
                    Some(range) if range.kind == ProtectedKind::Catch => {
                        self.frames[frame_idx].ip = range.handler_ip;
                        self.push(thrown);
                    }
                    Some(range) if range.kind == ProtectedKind::Finally => {
                        self.frames[frame_idx].ip = range.handler_ip;
                        self.frames[frame_idx].pending.push(Completion::Throw(thrown));
                    }
                    _ => {
                        let base = self.frames[frame_idx].stack_base;
                        self.stack.truncate(base);
                        return Err(thrown);
                    }
                },
            }
        }
    }

    fn execute_instr(
        &mut self,
        engine: &mut EngineState,
        frame_idx: usize,
        code: &Rc<CompiledCode>,
        instr: crate::bytecode::Instr,
        this_ip: u32,
        next_ip: u32,
    ) -> Result<Option<Value>, Value> {
        let (env, this_val, strict) = {
            let f = &self.frames[frame_idx];
            (f.env, f.this_val, f.strict)
        };

        match instr.op {
            Op::Wide | Op::Nop => Ok(None),

            Op::PushUndefined => {
                self.push(Value::undefined());
                Ok(None)
            }
            Op::PushNull => {
                self.push(Value::null());
                Ok(None)
            }
            Op::PushTrue => {
                self.push(Value::from_bool(true));
                Ok(None)
            }
            Op::PushFalse => {
                self.push(Value::from_bool(false));
                Ok(None)
            }
            Op::PushThis => {
                let this_name = PropName::Magic(MagicStr(8));
                let v = match environment::resolve_binding(&engine.heap, env, this_name) {
                    Some(owner) => environment::get_binding_value(&engine.heap, owner, this_name, strict).unwrap_or(this_val),
                    None => this_val,
                };
                self.push(v);
                Ok(None)
            }
            Op::PushEmpty => {
                self.push(Value::empty());
                Ok(None)
            }
            Op::PushSmallInt => {
                self.push(Value::from_small_int(instr.operand));
                Ok(None)
            }
            Op::PushLiteral => {
                let v = code
                    .literals
                    .get(instr.operand as usize)
                    .copied()
                    .ok_or_else(|| engine.raise(JsErrorKind::RangeError, "literal index out of bounds"))?;
                self.push(v);
                Ok(None)
            }
            Op::Pop => {
                self.pop();
                Ok(None)
            }
            Op::Dup => {
                let v = *self.stack.last().expect("operand stack underflow");
                self.push(v);
                Ok(None)
            }
            Op::Swap => {
                let len = self.stack.len();
                self.stack.swap(len - 1, len - 2);
                Ok(None)
            }

            Op::GetProp => {
                let key_v = self.pop();
                let obj = self.pop();
                let key = to_prop_name(engine, key_v)?;
                let v = self.prop_get(engine, obj, key)?;
                self.push(v);
                Ok(None)
            }
            Op::SetProp => {
                let value = self.pop();
                let key_v = self.pop();
                let obj = self.pop();
                let key = to_prop_name(engine, key_v)?;
                self.prop_set(engine, obj, key, value, strict)?;
                Ok(None)
            }
            Op::GetPropLiteral => {
                let key = literal_name(engine, code, instr.operand as usize)?;
                let obj = self.pop();
                let v = self.prop_get(engine, obj, key)?;
                self.push(v);
                Ok(None)
            }
            Op::SetPropLiteral => {
                let key = literal_name(engine, code, instr.operand as usize)?;
                let value = self.pop();
                let obj = self.pop();
                self.prop_set(engine, obj, key, value, strict)?;
                Ok(None)
            }
            Op::DeleteProp => {
                let key_v = self.pop();
                let obj = self.pop();
                let key = to_prop_name(engine, key_v)?;
                let result = match obj.as_cp() {
                    Some(cp) => dispatch::delete(&mut engine.heap, cp, key),
                    None => true,
                };
                self.push(Value::from_bool(result));
                Ok(None)
            }
            Op::HasProp => {
                let key_v = self.pop();
                let obj = self.pop();
                let key = to_prop_name(engine, key_v)?;
                let result = obj.as_cp().map(|cp| dispatch::has_property(&engine.heap, cp, key)).unwrap_or(false);
                self.push(Value::from_bool(result));
                Ok(None)
            }
            Op::DefineDataProp => {
                let value = self.pop();
                let key_v = self.pop();
                let obj = self.pop();
                let key = to_prop_name(engine, key_v)?;
                let cp = obj.as_cp().ok_or_else(|| engine.raise(JsErrorKind::TypeError, "cannot define a property on a non-object"))?;
                if let Some(o) = engine.heap.get_mut(cp).and_then(|r| r.as_object_mut()) {
                    o.props.define(key, PropValue::Data(value), PropAttrs::DEFAULT);
                }
                Ok(None)
            }
            Op::DefineAccessorProp => {
                let setter = self.pop();
                let getter = self.pop();
                let key_v = self.pop();
                let obj = self.pop();
                let key = to_prop_name(engine, key_v)?;
                let cp = obj.as_cp().ok_or_else(|| engine.raise(JsErrorKind::TypeError, "cannot define a property on a non-object"))?;
                if let Some(o) = engine.heap.get_mut(cp).and_then(|r| r.as_object_mut()) {
                    o.props.define(key, PropValue::Accessor { get: getter, set: setter }, PropAttrs::DEFAULT);
                }
                Ok(None)
            }
            Op::NewFastArray => {
                let n = instr.operand as usize;
                let len = self.stack.len();
                let elements = self.stack.split_off(len - n);
                let cp = engine
                    .heap
                    .alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(ObjectKind::FastArray { elements }, Cp::NULL))))
                    .map_err(|_| engine.raise(JsErrorKind::RangeError, "heap exhausted allocating array"))?;
                self.push(Value::from_cp(cp));
                Ok(None)
            }
            Op::NewObject => {
                let cp = engine
                    .heap
                    .alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(ObjectKind::Ordinary, Cp::NULL))))
                    .map_err(|_| engine.raise(JsErrorKind::RangeError, "heap exhausted allocating object"))?;
                self.push(Value::from_cp(cp));
                Ok(None)
            }

            Op::GetVar => {
                let name = literal_name(engine, code, instr.operand as usize)?;
                match environment::resolve_binding(&engine.heap, env, name) {
                    Some(owner) => {
                        let v = environment::get_binding_value(&engine.heap, owner, name, strict)
                            .map_err(|e| engine.raise(e.kind(), env_error_message(e)))?;
                        self.push(v);
                        Ok(None)
                    }
                    None => {
                        let desc = describe_prop_name(engine, name);
                        Err(engine.raise(JsErrorKind::ReferenceError, format!("{desc} is not defined")))
                    }
                }
            }
            Op::SetVar => {
                let name = literal_name(engine, code, instr.operand as usize)?;
                let value = self.pop();
                match environment::resolve_binding(&engine.heap, env, name) {
                    Some(owner) => {
                        environment::set_mutable_binding(&mut engine.heap, owner, name, value, strict)
                            .map_err(|e| engine.raise(e.kind(), env_error_message(e)))?;
                    }
                    None if strict => {
                        let desc = describe_prop_name(engine, name);
                        return Err(engine.raise(JsErrorKind::ReferenceError, format!("{desc} is not defined")));
                    }
                    None => {
                        let global_env = engine.global_env;
                        environment::create_binding(&mut engine.heap, global_env, name, false);
                        environment::initialize_binding(&mut engine.heap, global_env, name, value);
                    }
                }
                Ok(None)
            }
            Op::DeclareVar => {
                let name = literal_name(engine, code, instr.operand as usize)?;
                environment::create_binding(&mut engine.heap, env, name, false);
                environment::initialize_binding(&mut engine.heap, env, name, Value::undefined());
                Ok(None)
            }
            Op::DeclareLexical => {
                let raw = instr.operand as u32;
                let immutable = raw & 0x8000 != 0;
                let idx = (raw & 0x7fff) as usize;
                let lit = code
                    .literals
                    .get(idx)
                    .copied()
                    .ok_or_else(|| engine.raise(JsErrorKind::RangeError, "literal index out of bounds"))?;
                let name = to_prop_name(engine, lit)?;
                environment::create_binding(&mut engine.heap, env, name, immutable);
                Ok(None)
            }
            Op::InitVar => {
                let name = literal_name(engine, code, instr.operand as usize)?;
                let value = self.pop();
                environment::initialize_binding(&mut engine.heap, env, name, value);
                Ok(None)
            }
            Op::HasVar => {
                let name = literal_name(engine, code, instr.operand as usize)?;
                let found = environment::resolve_binding(&engine.heap, env, name).is_some();
                self.push(Value::from_bool(found));
                Ok(None)
            }

            Op::Add => {
                let b = self.pop();
                let a = self.pop();
                if is_heap_string(engine, a) || is_heap_string(engine, b) {
                    let v = concat_strings(engine, a, b)?;
                    self.push(v);
                } else {
                    let na = to_number(engine, a)?;
                    let nb = to_number(engine, b)?;
                    let v = small_int_checked(engine, na as i64 + nb as i64)?;
                    self.push(v);
                }
                Ok(None)
            }
            Op::Sub => self.binary_numeric(engine, |a, b| Ok(a as i64 - b as i64)),
            Op::Mul => self.binary_numeric(engine, |a, b| Ok(a as i64 * b as i64)),
            Op::Div => {
                let b = self.pop();
                let a = self.pop();
                let na = to_number(engine, a)?;
                let nb = to_number(engine, b)?;
                if nb == 0 {
                    return Err(engine.raise(JsErrorKind::RangeError, "division by zero is not representable"));
                }
                let v = small_int_checked(engine, (na / nb) as i64)?;
                self.push(v);
                Ok(None)
            }
            Op::Mod => {
                let b = self.pop();
                let a = self.pop();
                let na = to_number(engine, a)?;
                let nb = to_number(engine, b)?;
                if nb == 0 {
                    return Err(engine.raise(JsErrorKind::RangeError, "division by zero is not representable"));
                }
                let v = small_int_checked(engine, (na % nb) as i64)?;
                self.push(v);
                Ok(None)
            }
            Op::Neg => {
                let a = self.pop();
                let na = to_number(engine, a)?;
                let v = small_int_checked(engine, -(na as i64))?;
                self.push(v);
                Ok(None)
            }
            Op::Not => {
                let a = self.pop();
                self.push(Value::from_bool(!to_boolean(engine, a)));
                Ok(None)
            }
            Op::BitNot => {
                let a = self.pop();
                let na = to_number(engine, a)?;
                self.push(Value::from_small_int(clamp30(!na)));
                Ok(None)
            }
            Op::BitAnd => self.bitwise(engine, |a, b| a & b),
            Op::BitOr => self.bitwise(engine, |a, b| a | b),
            Op::BitXor => self.bitwise(engine, |a, b| a ^ b),
            Op::Shl => self.bitwise(engine, |a, b| a << (b & 31)),
            Op::Shr => self.bitwise(engine, |a, b| a >> (b & 31)),
            Op::UShr => self.bitwise(engine, |a, b| ((a as u32) >> ((b as u32) & 31)) as i32),
            Op::Eq => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::from_bool(strict_eq(engine, a, b)));
                Ok(None)
            }
            Op::StrictEq => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::from_bool(strict_eq(engine, a, b)));
                Ok(None)
            }
            Op::Lt => self.compare(engine, |o| o == std::cmp::Ordering::Less),
            Op::Lte => self.compare(engine, |o| o != std::cmp::Ordering::Greater),
            Op::Gt => self.compare(engine, |o| o == std::cmp::Ordering::Greater),
            Op::Gte => self.compare(engine, |o| o != std::cmp::Ordering::Less),
            Op::InstanceOf => {
                let ctor = self.pop();
                let obj = self.pop();
                let result = self.instance_of(engine, obj, ctor)?;
                self.push(Value::from_bool(result));
                Ok(None)
            }
            Op::In => {
                let key_v = self.pop();
                let obj = self.pop();
                let key = to_prop_name(engine, key_v)?;
                let cp = obj.as_cp().ok_or_else(|| engine.raise(JsErrorKind::TypeError, "cannot use 'in' on a non-object"))?;
                self.push(Value::from_bool(dispatch::has_property(&engine.heap, cp, key)));
                Ok(None)
            }
            Op::TypeOf => {
                let a = self.pop();
                let tag = dispatch::type_of_tag(&engine.heap, a);
                let v = make_string_value(engine, tag)?;
                self.push(v);
                Ok(None)
            }
            Op::ToBoolean => {
                let a = self.pop();
                self.push(Value::from_bool(to_boolean(engine, a)));
                Ok(None)
            }
            Op::ToNumber => {
                let a = self.pop();
                let n = to_number(engine, a)?;
                self.push(Value::from_small_int(n));
                Ok(None)
            }

            Op::Jump => {
                let target = (next_ip as i64 + instr.operand as i64) as u32;
                self.frames[frame_idx].ip = target;
                Ok(None)
            }
            Op::JumpIfFalse => {
                let a = self.pop();
                if !to_boolean(engine, a) {
                    let target = (next_ip as i64 + instr.operand as i64) as u32;
                    self.frames[frame_idx].ip = target;
                }
                Ok(None)
            }
            Op::JumpIfTrue => {
                let a = self.pop();
                if to_boolean(engine, a) {
                    let target = (next_ip as i64 + instr.operand as i64) as u32;
                    self.frames[frame_idx].ip = target;
                }
                Ok(None)
            }
            Op::JumpIfNullish => {
                let top = *self.stack.last().expect("operand stack underflow");
                if top.is_nullish() {
                    let target = (next_ip as i64 + instr.operand as i64) as u32;
                    self.frames[frame_idx].ip = target;
                }
                Ok(None)
            }

            Op::Call => {
                let n = instr.operand as usize;
                let len = self.stack.len();
                let args = self.stack.split_off(len - n);
                let this_arg = self.pop();
                let callee = self.pop();
                let result = self.call(engine, callee, this_arg, &args)?;
                self.push(result);
                Ok(None)
            }
            Op::Construct => {
                let n = instr.operand as usize;
                let len = self.stack.len();
                let args = self.stack.split_off(len - n);
                let callee = self.pop();
                let result = self.construct(engine, callee, &args)?;
                self.push(result);
                Ok(None)
            }
            Op::Return => {
                let value = self.pop();
                match handler_for_return(code, this_ip) {
                    Some(range) => {
                        self.frames[frame_idx].ip = range.handler_ip;
                        self.frames[frame_idx].pending.push(Completion::Return(value));
                        Ok(None)
                    }
                    None => Ok(Some(value)),
                }
            }

            Op::MakeClosure => {
                let nested = code
                    .nested
                    .get(instr.operand as usize)
                    .cloned()
                    .ok_or_else(|| engine.raise(JsErrorKind::RangeError, "nested function index out of bounds"))?;
                let kind = if nested.constructor_kind != ConstructorKind::None {
                    ObjectKind::ConstructorFunction { code: nested, closure_env: env }
                } else {
                    ObjectKind::ScriptedFunction { code: nested, closure_env: env }
                };
                let cp = engine
                    .heap
                    .alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(kind, Cp::NULL))))
                    .map_err(|_| engine.raise(JsErrorKind::RangeError, "heap exhausted allocating closure"))?;
                self.push(Value::from_cp(cp));
                Ok(None)
            }

            Op::Throw => {
                let v = self.pop();
                Err(v)
            }
            Op::FinallyEnter => {
                self.frames[frame_idx].pending.push(Completion::Normal);
                Ok(None)
            }
            Op::FinallyExit => match self.frames[frame_idx].pending.pop() {
                Some(Completion::Normal) | None => Ok(None),
                Some(Completion::Return(v)) => Ok(Some(v)),
                Some(Completion::Throw(v)) => Err(v),
            },

            Op::Yield | Op::Await => Err(engine.raise(JsErrorKind::Error, "generator/async suspension is not implemented in this execution core")),
        }
    }

    fn binary_numeric(&mut self, engine: &mut EngineState, f: impl Fn(i32, i32) -> Result<i64, ()>) -> Result<Option<Value>, Value> {
        let b = self.pop();
        let a = self.pop();
        let na = to_number(engine, a)?;
        let nb = to_number(engine, b)?;
        let n = f(na, nb).expect("binary_numeric closures never fail");
        let v = small_int_checked(engine, n)?;
        self.push(v);
        Ok(None)
    }

    fn bitwise(&mut self, engine: &mut EngineState, f: impl Fn(i32, i32) -> i32) -> Result<Option<Value>, Value> {
        let b = self.pop();
        let a = self.pop();
        let na = to_number(engine, a)?;
        let nb = to_number(engine, b)?;
        self.push(Value::from_small_int(clamp30(f(na, nb))));
        Ok(None)
    }

    fn compare(&mut self, engine: &mut EngineState, f: impl Fn(std::cmp::Ordering) -> bool) -> Result<Option<Value>, Value> {
        let b = self.pop();
        let a = self.pop();
        let ordering = if is_heap_string(engine, a) && is_heap_string(engine, b) {
            value_to_bytes(engine, a).cmp(&value_to_bytes(engine, b))
        } else {
            let na = to_number(engine, a)?;
            let nb = to_number(engine, b)?;
            na.cmp(&nb)
        };
        self.push(Value::from_bool(f(ordering)));
        Ok(None)
    }

    fn instance_of(&mut self, engine: &mut EngineState, obj: Value, ctor: Value) -> JsResult<bool> {
        let ctor_cp = ctor.as_cp().filter(|cp| dispatch::is_callable(&engine.heap, *cp));
        let Some(ctor_cp) = ctor_cp else {
            return Err(engine.raise(JsErrorKind::TypeError, "right-hand side of 'instanceof' is not callable"));
        };
        let proto = match dispatch::get_own(&engine.heap, ctor_cp, PropName::Magic(MagicStr(2))) {
            Some(PropValue::Data(v)) => v.as_cp(),
            _ => None,
        };
        let Some(proto) = proto else {
            return Ok(false);
        };
        let mut current = match obj.as_cp() {
            Some(cp) => cp,
            None => return Ok(false),
        };
        loop {
            current = match engine.heap.get(current).and_then(|r| r.as_object()) {
                Some(o) => o.prototype,
                None => return Ok(false),
            };
            if current.is_null() {
                return Ok(false);
            }
            if current == proto {
                return Ok(true);
            }
        }
    }

    /// `[[Get]]` with accessor invocation: walks the prototype chain itself
    /// (rather than delegating to `dispatch::get`) so an encountered
    /// `PropValue::Accessor` can be invoked through `self.call` instead of
    /// silently collapsing to `undefined`.
    fn get_with_receiver(&mut self, engine: &mut EngineState, cp: Cp, key: PropName, receiver: Value) -> JsResult<Value> {
        if key == PropName::Magic(MagicStr(0)) {
            if let Some(o) = engine.heap.get(cp).and_then(|r| r.as_object()) {
                match &o.kind {
                    ObjectKind::FastArray { elements } => return Ok(Value::from_small_int(elements.len() as i32)),
                    ObjectKind::Array => {
                        let max = o
                            .props
                            .own_keys_ordered()
                            .into_iter()
                            .filter_map(|k| match k {
                                PropName::Index(i) => Some(i),
                                _ => None,
                            })
                            .max();
                        return Ok(Value::from_small_int(max.map(|m| m + 1).unwrap_or(0) as i32));
                    }
                    _ => {}
                }
            }
        }
        let mut current = cp;
        loop {
            if current.is_null() {
                return Ok(Value::undefined());
            }
            if let Some(pv) = dispatch::get_own(&engine.heap, current, key) {
                return match pv {
                    PropValue::Data(v) => Ok(v),
                    PropValue::Accessor { get, .. } => {
                        if get.is_undefined() {
                            Ok(Value::undefined())
                        } else {
                            self.call(engine, get, receiver, &[])
                        }
                    }
                };
            }
            current = engine.heap.get(current).and_then(|r| r.as_object()).map(|o| o.prototype).unwrap_or(Cp::NULL);
        }
    }

    /// `[[Set]]` with accessor invocation. Walks the chain looking for an
    /// accessor before falling back to `dispatch::set`'s data-only
    /// semantics — that function reports any accessor slot as `NoSetter`
    /// regardless of whether a real setter is defined, since invoking one
    /// needs a call stack `dispatch.rs` doesn't have.
    fn set_with_receiver(&mut self, engine: &mut EngineState, cp: Cp, key: PropName, value: Value, receiver: Value, strict: bool) -> JsResult<()> {
        let mut current = cp;
        loop {
            if current.is_null() {
                break;
            }
            if let Some(pv) = dispatch::get_own(&engine.heap, current, key) {
                if let PropValue::Accessor { set, .. } = pv {
                    if set.is_undefined() {
                        if strict {
                            return Err(engine.raise(JsErrorKind::TypeError, "Cannot set property which has only a getter"));
                        }
                        return Ok(());
                    }
                    self.call(engine, set, receiver, &[value])?;
                    return Ok(());
                }
                break;
            }
            current = engine.heap.get(current).and_then(|r| r.as_object()).map(|o| o.prototype).unwrap_or(Cp::NULL);
        }
        dispatch::set(&mut engine.heap, cp, key, value, strict).map_err(|e| engine.raise(e.kind(), dispatch_error_message(e)))
    }

    fn prop_get(&mut self, engine: &mut EngineState, obj: Value, key: PropName) -> JsResult<Value> {
        if let Some(cp) = obj.as_cp() {
            if engine.heap.get(cp).and_then(|r| r.as_object()).is_some() {
                return self.get_with_receiver(engine, cp, key, obj);
            }
            if key == PropName::Magic(MagicStr(0)) {
                if let Some(len) = engine.heap.get(cp).and_then(|r| r.as_string()).map(|s| s.len()) {
                    return Ok(Value::from_small_int(len as i32));
                }
            }
            return Ok(Value::undefined());
        }
        if obj.is_nullish() {
            return Err(engine.raise(JsErrorKind::TypeError, "cannot read properties of null or undefined"));
        }
        if obj.is_direct_str() && key == PropName::Magic(MagicStr(0)) {
            return Ok(Value::from_small_int(value_to_bytes(engine, obj).len() as i32));
        }
        Ok(Value::undefined())
    }

    fn prop_set(&mut self, engine: &mut EngineState, obj: Value, key: PropName, value: Value, strict: bool) -> JsResult<()> {
        let is_object = obj.as_cp().map(|cp| engine.heap.get(cp).and_then(|r| r.as_object()).is_some()).unwrap_or(false);
        if !is_object {
            if obj.is_nullish() {
                return Err(engine.raise(JsErrorKind::TypeError, "cannot set properties of null or undefined"));
            }
            // Writes to a primitive receiver are dropped; this engine has no
            // boxed-primitive wrapper objects to define the property on.
            return Ok(());
        }
        let cp = obj.as_cp().expect("checked above");
        self.set_with_receiver(engine, cp, key, value, obj, strict)
    }
}

enum CalleeKind {
    Native(u32),
    Scripted(Rc<CompiledCode>, Cp),
    NotCallable,
}

/// Separated from `call`/`construct` so inspecting `ObjectKind` (an
/// immutable borrow of `engine.heap`) never overlaps a later `engine.raise`
/// call (a mutable borrow of the whole engine) in the same match arm.
fn callee_kind(heap: &crate::heap::RawHeap, cp: Cp) -> CalleeKind {
    match heap.get(cp).and_then(|r| r.as_object()).map(|o| &o.kind) {
        Some(ObjectKind::NativeFunction { id }) => CalleeKind::Native(*id),
        Some(ObjectKind::ScriptedFunction { code, closure_env }) | Some(ObjectKind::ConstructorFunction { code, closure_env }) => {
            CalleeKind::Scripted(code.clone(), *closure_env)
        }
        _ => CalleeKind::NotCallable,
    }
}

/// The innermost `Finally`-kind protected range containing `ip`, ignoring
/// any overlapping `Catch` range — a `return` only ever needs to be
/// intercepted by a `finally`, never by a `catch` (which only fires on
/// throw).
fn handler_for_return(code: &CompiledCode, ip: u32) -> Option<&ProtectedRange> {
    code.protected_ranges
        .iter()
        .filter(|r| r.kind == ProtectedKind::Finally && ip >= r.start_ip && ip < r.end_ip)
        .min_by_key(|r| r.end_ip - r.start_ip)
}

fn to_prop_name(engine: &mut EngineState, v: Value) -> JsResult<PropName> {
    if let Some(n) = v.as_small_int() {
        if n >= 0 {
            return Ok(PropName::Index(n as u32));
        }
    }
    if let Some(ds) = v.as_direct_str() {
        return match ds {
            DirectString::Magic(m) => Ok(PropName::Magic(m)),
            DirectString::InlineAscii { len, bytes } => {
                let cp = engine
                    .strings
                    .intern_name(&mut engine.heap, &bytes[..len])
                    .map_err(|_| engine.raise(JsErrorKind::RangeError, "heap exhausted interning property name"))?;
                Ok(PropName::Heap(cp))
            }
        };
    }
    if let Some(cp) = v.as_cp() {
        if engine.heap.get(cp).and_then(|r| r.as_symbol()).is_some() {
            return Ok(PropName::Symbol(cp));
        }
        if let Some(bytes) = engine.heap.get(cp).and_then(|r| r.as_string()).map(|s| s.bytes.clone()) {
            let interned = engine
                .strings
                .intern_name(&mut engine.heap, &bytes)
                .map_err(|_| engine.raise(JsErrorKind::RangeError, "heap exhausted interning property name"))?;
            return Ok(PropName::Heap(interned));
        }
    }
    Err(engine.raise(JsErrorKind::TypeError, "value cannot be used as a property key"))
}

fn literal_name(engine: &mut EngineState, code: &CompiledCode, idx: usize) -> JsResult<PropName> {
    let lit = code
        .literals
        .get(idx)
        .copied()
        .ok_or_else(|| engine.raise(JsErrorKind::RangeError, "literal index out of bounds"))?;
    to_prop_name(engine, lit)
}

fn to_boolean(engine: &EngineState, v: Value) -> bool {
    if v.is_undefined() || v.is_null() || v.is_empty() {
        return false;
    }
    if let Some(b) = v.as_bool() {
        return b;
    }
    if let Some(n) = v.as_small_int() {
        return n != 0;
    }
    if let Some(ds) = v.as_direct_str() {
        return match ds {
            DirectString::Magic(m) => !m.as_str().is_empty(),
            DirectString::InlineAscii { len, .. } => len != 0,
        };
    }
    if let Some(cp) = v.as_cp() {
        if let Some(s) = engine.heap.get(cp).and_then(|r| r.as_string()) {
            return !s.is_empty();
        }
        return true;
    }
    true
}

fn value_to_bytes(engine: &EngineState, v: Value) -> Vec<u8> {
    if v.is_undefined() {
        return b"undefined".to_vec();
    }
    if v.is_null() {
        return b"null".to_vec();
    }
    if let Some(b) = v.as_bool() {
        return if b { b"true".to_vec() } else { b"false".to_vec() };
    }
    if let Some(n) = v.as_small_int() {
        return n.to_string().into_bytes();
    }
    if let Some(ds) = v.as_direct_str() {
        return match ds {
            DirectString::Magic(m) => m.as_str().as_bytes().to_vec(),
            DirectString::InlineAscii { len, bytes } => bytes[..len].to_vec(),
        };
    }
    if let Some(cp) = v.as_cp() {
        if let Some(s) = engine.heap.get(cp).and_then(|r| r.as_string()) {
            return s.bytes.clone();
        }
    }
    b"[object Object]".to_vec()
}

fn is_heap_string(engine: &EngineState, v: Value) -> bool {
    v.is_direct_str() || v.as_cp().map(|cp| engine.heap.get(cp).and_then(|r| r.as_string()).is_some()).unwrap_or(false)
}

fn concat_strings(engine: &mut EngineState, a: Value, b: Value) -> JsResult<Value> {
    let mut bytes = value_to_bytes(engine, a);
    bytes.extend(value_to_bytes(engine, b));
    let cp = crate::strings::alloc_str(&mut engine.heap, bytes).map_err(|_| engine.raise(JsErrorKind::RangeError, "heap exhausted allocating string"))?;
    Ok(Value::from_cp(cp))
}

fn make_string_value(engine: &mut EngineState, s: &str) -> JsResult<Value> {
    if let Some(m) = MagicStr::lookup(s) {
        return Ok(Value::from_magic_str(m));
    }
    if let Some(v) = Value::from_inline_ascii(s.as_bytes()) {
        return Ok(v);
    }
    let cp = crate::strings::alloc_str(&mut engine.heap, s.as_bytes().to_vec())
        .map_err(|_| engine.raise(JsErrorKind::RangeError, "heap exhausted allocating string"))?;
    Ok(Value::from_cp(cp))
}

fn small_int_checked(engine: &mut EngineState, n: i64) -> JsResult<Value> {
    if n < SMALL_INT_MIN as i64 || n > SMALL_INT_MAX as i64 {
        return Err(engine.raise(JsErrorKind::RangeError, "integer result out of representable range"));
    }
    Ok(Value::from_small_int(n as i32))
}

/// Masks a 32-bit bitwise result into this engine's 30-bit small-integer
/// range, sign-extending from bit 29. A reduced-range simplification versus
/// real ECMAScript's 32-bit bitwise semantics, a consequence of having no
/// boxed-double representation to round-trip through ToInt32 first.
fn clamp30(n: i32) -> i32 {
    let masked = (n as u32) & 0x3FFF_FFFF;
    if masked & 0x2000_0000 != 0 {
        (masked | 0xC000_0000) as i32
    } else {
        masked as i32
    }
}

fn to_number(engine: &mut EngineState, v: Value) -> JsResult<i32> {
    if let Some(n) = v.as_small_int() {
        return Ok(n);
    }
    if let Some(b) = v.as_bool() {
        return Ok(if b { 1 } else { 0 });
    }
    if v.is_null() {
        return Ok(0);
    }
    Err(engine.raise(JsErrorKind::TypeError, "value cannot be converted to a number"))
}

/// Also used for the loose `Eq` operator — this engine implements no
/// abstract-equality coercion table, so `==` and `===` coincide.
fn strict_eq(engine: &EngineState, a: Value, b: Value) -> bool {
    if a.raw() == b.raw() {
        return true;
    }
    if let (Some(na), Some(nb)) = (a.as_small_int(), b.as_small_int()) {
        return na == nb;
    }
    if is_heap_string(engine, a) && is_heap_string(engine, b) {
        return value_to_bytes(engine, a) == value_to_bytes(engine, b);
    }
    false
}

fn dispatch_error_message(e: DispatchError) -> &'static str {
    match e {
        DispatchError::NotWritable => "Cannot assign to read only property",
        DispatchError::NotCallable => "value is not a function",
        DispatchError::NotConstructable => "value is not a constructor",
        DispatchError::NoSetter => "Cannot set property which has only a getter",
        DispatchError::CallStackExceeded => "call stack size exceeded",
    }
}

fn env_error_message(e: EnvError) -> &'static str {
    match e {
        EnvError::TemporalDeadZone => "Cannot access variable before initialization",
        EnvError::AssignToImmutable => "Assignment to constant variable",
        EnvError::Unresolved => "variable is not defined",
    }
}

fn describe_prop_name(engine: &EngineState, name: PropName) -> String {
    match name {
        PropName::Magic(m) => m.as_str().to_string(),
        PropName::Heap(cp) => engine.heap.get(cp).and_then(|r| r.as_string()).map(|s| s.as_str_lossy().into_owned()).unwrap_or_default(),
        PropName::Symbol(_) => "Symbol()".to_string(),
        PropName::Index(i) => i.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::emit_instr;
    use crate::conf::EngineConfig;

    fn empty_code(code_bytes: Vec<u8>, literals: Vec<Value>, protected_ranges: Vec<ProtectedRange>) -> Rc<CompiledCode> {
        Rc::new(CompiledCode {
            flags: CodeFlags::empty(),
            constructor_kind: ConstructorKind::None,
            param_names: vec![],
            literals,
            nested: vec![],
            code: code_bytes,
            protected_ranges,
            source_name: None,
            line_info: vec![],
        })
    }

    #[test]
    fn adds_two_small_ints_and_returns() {
        let mut buf = Vec::new();
        emit_instr(&mut buf, Op::PushSmallInt, 1);
        emit_instr(&mut buf, Op::PushSmallInt, 2);
        emit_instr(&mut buf, Op::Add, 0);
        emit_instr(&mut buf, Op::Return, 0);
        let code = empty_code(buf, vec![], vec![]);
        let mut engine = EngineState::new(EngineConfig::default());
        let mut vm = Vm::new();
        let result = vm.run_script(&mut engine, code).unwrap();
        assert_eq!(result.as_small_int(), Some(3));
    }

    #[test]
    fn declares_initializes_and_reads_a_var_binding() {
        let mut buf = Vec::new();
        emit_instr(&mut buf, Op::DeclareVar, 0);
        emit_instr(&mut buf, Op::PushSmallInt, 42);
        emit_instr(&mut buf, Op::InitVar, 0);
        emit_instr(&mut buf, Op::GetVar, 0);
        emit_instr(&mut buf, Op::Return, 0);
        let literals = vec![Value::from_magic_str(MagicStr(9))]; // "value"
        let code = empty_code(buf, literals, vec![]);
        let mut engine = EngineState::new(EngineConfig::default());
        let mut vm = Vm::new();
        let result = vm.run_script(&mut engine, code).unwrap();
        assert_eq!(result.as_small_int(), Some(42));
    }

    #[test]
    fn try_catch_finally_completion_runs_handler_then_returns() {
        let mut buf = Vec::new();
        emit_instr(&mut buf, Op::PushSmallInt, 7); // ip 0..2 (try body)
        emit_instr(&mut buf, Op::Throw, 0); // ip 2..3
        emit_instr(&mut buf, Op::Pop, 0); // ip 3..4 (catch body: discard the thrown value)
        emit_instr(&mut buf, Op::FinallyEnter, 0); // ip 4..5
        emit_instr(&mut buf, Op::PushSmallInt, 99); // ip 5..7 (finally body)
        emit_instr(&mut buf, Op::FinallyExit, 0); // ip 7..8
        emit_instr(&mut buf, Op::Return, 0); // ip 8..9
        let ranges = vec![
            ProtectedRange { start_ip: 0, end_ip: 3, handler_ip: 3, kind: ProtectedKind::Catch },
            ProtectedRange { start_ip: 0, end_ip: 4, handler_ip: 4, kind: ProtectedKind::Finally },
        ];
        let code = empty_code(buf, vec![], ranges);
        let mut engine = EngineState::new(EngineConfig::default());
        let mut vm = Vm::new();
        let result = vm.run_script(&mut engine, code).unwrap();
        assert_eq!(result.as_small_int(), Some(99));
    }

    #[test]
    fn throw_with_no_handler_surfaces_as_err() {
        let mut buf = Vec::new();
        emit_instr(&mut buf, Op::PushSmallInt, 5);
        emit_instr(&mut buf, Op::Throw, 0);
        let code = empty_code(buf, vec![], vec![]);
        let mut engine = EngineState::new(EngineConfig::default());
        let mut vm = Vm::new();
        let err = vm.run_script(&mut engine, code).unwrap_err();
        assert_eq!(err.as_small_int(), Some(5));
    }

    #[test]
    fn object_property_set_then_get_roundtrip() {
        let mut buf = Vec::new();
        emit_instr(&mut buf, Op::NewObject, 0); // ip 0..1
        emit_instr(&mut buf, Op::Dup, 0); // ip 1..2
        emit_instr(&mut buf, Op::PushSmallInt, 5); // ip 2..4
        emit_instr(&mut buf, Op::SetPropLiteral, 0); // ip 4..6, key literal 0 ("value")
        emit_instr(&mut buf, Op::GetPropLiteral, 0); // ip 6..8
        emit_instr(&mut buf, Op::Return, 0);
        let literals = vec![Value::from_magic_str(MagicStr(9))];
        let code = empty_code(buf, literals, vec![]);
        let mut engine = EngineState::new(EngineConfig::default());
        let mut vm = Vm::new();
        let result = vm.run_script(&mut engine, code).unwrap();
        assert_eq!(result.as_small_int(), Some(5));
    }
}
