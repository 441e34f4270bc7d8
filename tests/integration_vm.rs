/// Integration tests exercising the stack VM end to end.
///
/// These tests verify:
///   • a whole program assembled from bytecode runs to a completion value
///   • sparse array length reflects the highest defined index, not slot count
///   • duplicate non-strict parameter names bind left-to-right ("last wins")
///   • try/catch/finally runs the handler and resumes with its value
///   • a getter-only accessor on an inherited chain is honored on read
///   • an unreachable object cycle is reclaimed by the collector
///
/// There's no lexer/parser here, so every program below is built directly
/// with the bytecode assembler rather than parsed from source text.
use std::rc::Rc;

use jseng::assembler::{declare_lexical_operand, CompiledCodeBuilder};
use jseng::bytecode::{CodeFlags, CompiledCode, Op, ProtectedKind};
use jseng::conf::EngineConfig;
use jseng::context::EngineState;
use jseng::heap::{HeapRecord, HeapRecordData};
use jseng::object::{ObjectData, ObjectKind, PropAttrs, PropName, PropValue};
use jseng::strings::MagicStr;
use jseng::value::Value;
use jseng::vm::Vm;

fn run(code: CompiledCode) -> Result<Value, Value> {
    let mut engine = EngineState::new(EngineConfig::default());
    let mut vm = Vm::new();
    vm.run_script(&mut engine, Rc::new(code))
}

// ─── Arithmetic ────────────────────────────────────────────────────────────

#[test]
fn arithmetic_expression_evaluates_to_three() {
    let mut b = CompiledCodeBuilder::new().source_name("sum.demo");
    b.emit(Op::PushSmallInt, 1);
    b.emit(Op::PushSmallInt, 2);
    b.emit(Op::Add, 0);
    b.emit(Op::Return, 0);
    let result = run(b.build()).expect("should not throw");
    assert_eq!(result.as_small_int(), Some(3));
}

// ─── Sparse array length ───────────────────────────────────────────────────

#[test]
fn sparse_array_length_reflects_highest_index() {
    let mut engine = EngineState::new(EngineConfig::default());
    let array_cp = engine
        .heap
        .alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(ObjectKind::Array, jseng::cp_heap::Cp::NULL))))
        .expect("heap allocation should succeed");
    if let Some(o) = engine.heap.get_mut(array_cp).and_then(|r| r.as_object_mut()) {
        o.props.define(PropName::Index(2), PropValue::Data(Value::from_small_int(20)), PropAttrs::DEFAULT);
        o.props.define(PropName::Index(7), PropValue::Data(Value::from_small_int(70)), PropAttrs::DEFAULT);
    }

    let mut b = CompiledCodeBuilder::new().source_name("sparse_array.demo");
    let array_literal = b.push_literal(Value::from_cp(array_cp));
    let length_literal = b.push_literal(Value::from_magic_str(MagicStr(0)));
    b.emit(Op::PushLiteral, array_literal as i32);
    b.emit(Op::GetPropLiteral, length_literal as i32);
    b.emit(Op::Return, 0);

    let mut vm = Vm::new();
    let result = vm.run_script(&mut engine, Rc::new(b.build())).expect("should not throw");
    assert_eq!(result.as_small_int(), Some(8), "length should be highest index (7) + 1");
}

// ─── Duplicate non-strict parameters ───────────────────────────────────────

#[test]
fn duplicate_non_strict_param_names_bind_last_wins() {
    let name = PropName::Magic(MagicStr(9));
    let mut inner = CompiledCodeBuilder::new().param(name).param(name);
    inner.emit(Op::GetVar, 0);
    inner.emit(Op::Return, 0);
    let mut inner_code = inner.build();
    inner_code.literals.push(Value::from_magic_str(MagicStr(9)));

    let mut outer = CompiledCodeBuilder::new().source_name("dup_params.demo");
    let fn_idx = outer.push_nested(Rc::new(inner_code));
    outer.emit(Op::MakeClosure, fn_idx as i32);
    let fn_slot = outer.emit(Op::Dup, 0);
    let _ = fn_slot;
    outer.emit(Op::PushUndefined, 0); // this
    outer.emit(Op::PushSmallInt, 1); // arg 0, bound to `name` then overwritten
    outer.emit(Op::PushSmallInt, 2); // arg 1, last wins
    outer.emit(Op::Call, 2);
    outer.emit(Op::Return, 0);

    let result = run(outer.build()).expect("should not throw");
    assert_eq!(result.as_small_int(), Some(2), "second argument should win the duplicate binding");
}

// ─── Try/catch/finally completion ──────────────────────────────────────────

#[test]
fn try_catch_recovers_and_finally_still_runs() {
    let mut b = CompiledCodeBuilder::new().source_name("try_catch.demo");
    let try_start = b.emit(Op::PushSmallInt, 9);
    b.emit(Op::Throw, 0);
    let catch_start = b.here();
    b.emit(Op::Pop, 0); // drop the thrown value, recover with a fixed result
    b.emit(Op::PushSmallInt, 1);
    let finally_start = b.emit(Op::FinallyEnter, 0);
    b.emit(Op::FinallyExit, 0);
    b.emit(Op::Return, 0);
    b.protected_range(try_start, catch_start, catch_start, ProtectedKind::Catch);
    b.protected_range(try_start, finally_start, finally_start, ProtectedKind::Finally);

    let result = run(b.build()).expect("the catch handler should recover, not rethrow");
    assert_eq!(result.as_small_int(), Some(1));
}

#[test]
fn throw_past_every_handler_surfaces_to_the_caller() {
    let mut b = CompiledCodeBuilder::new().source_name("uncaught.demo");
    b.emit(Op::PushSmallInt, 42);
    b.emit(Op::Throw, 0);
    let thrown = run(b.build()).expect_err("nothing catches this");
    assert_eq!(thrown.as_small_int(), Some(42));
}

// ─── Accessor properties ───────────────────────────────────────────────────

#[test]
fn getter_only_accessor_is_honored_on_read() {
    let mut engine = EngineState::new(EngineConfig::default());

    // A getter that just returns a fixed small int, independent of `this`.
    let mut getter_builder = CompiledCodeBuilder::new();
    getter_builder.emit(Op::PushSmallInt, 11);
    getter_builder.emit(Op::Return, 0);
    let getter_cp = engine
        .heap
        .alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(
            ObjectKind::ScriptedFunction { code: Rc::new(getter_builder.build()), closure_env: engine.global_env },
            jseng::cp_heap::Cp::NULL,
        ))))
        .expect("heap allocation should succeed");

    let obj_cp = engine
        .heap
        .alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(ObjectKind::Ordinary, jseng::cp_heap::Cp::NULL))))
        .expect("heap allocation should succeed");
    let prop_name = PropName::Magic(MagicStr(9));
    if let Some(o) = engine.heap.get_mut(obj_cp).and_then(|r| r.as_object_mut()) {
        o.props.define(prop_name, PropValue::Accessor { get: Value::from_cp(getter_cp), set: Value::undefined() }, PropAttrs::DEFAULT);
    }

    let mut b = CompiledCodeBuilder::new().source_name("getter.demo");
    let obj_literal = b.push_literal(Value::from_cp(obj_cp));
    let key_literal = b.push_literal(Value::from_magic_str(MagicStr(9)));
    b.emit(Op::PushLiteral, obj_literal as i32);
    b.emit(Op::GetPropLiteral, key_literal as i32);
    b.emit(Op::Return, 0);

    let mut vm = Vm::new();
    let result = vm.run_script(&mut engine, Rc::new(b.build())).expect("reading a getter-backed property should not throw");
    assert_eq!(result.as_small_int(), Some(11));
}

// ─── Garbage collection ────────────────────────────────────────────────────

#[test]
fn unreachable_object_cycle_is_reclaimed() {
    let mut engine = EngineState::new(EngineConfig::default());
    let a = engine
        .heap
        .alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(ObjectKind::Ordinary, jseng::cp_heap::Cp::NULL))))
        .expect("heap allocation should succeed");
    let b = engine
        .heap
        .alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(ObjectKind::Ordinary, jseng::cp_heap::Cp::NULL))))
        .expect("heap allocation should succeed");
    let name = PropName::Magic(MagicStr(3)); // __proto__, repurposed here as a plain data slot
    if let Some(o) = engine.heap.get_mut(a).and_then(|r| r.as_object_mut()) {
        o.props.define(name, PropValue::Data(Value::from_cp(b)), PropAttrs::DEFAULT);
    }
    if let Some(o) = engine.heap.get_mut(b).and_then(|r| r.as_object_mut()) {
        o.props.define(name, PropValue::Data(Value::from_cp(a)), PropAttrs::DEFAULT);
    }

    let before = engine.heap.live_count();
    // Neither `a` nor `b` is reachable from any root; only the cycle between
    // them keeps them "alive" in a naive refcounting scheme, which mark-sweep
    // does not fall for.
    engine.gc.collect(&mut engine.heap, vec![Value::from_cp(engine.global_env), Value::from_cp(engine.global_object)]);
    let after = engine.heap.live_count();
    assert!(after < before, "mark-sweep should reclaim the unreachable a<->b cycle");
}

// ─── Declared bindings across a closure boundary ───────────────────────────

#[test]
fn const_binding_round_trips_through_declare_and_init() {
    let mut b = CompiledCodeBuilder::new().source_name("const_binding.demo");
    let name_literal = b.push_literal(Value::from_magic_str(MagicStr(9)));
    b.emit(Op::DeclareLexical, declare_lexical_operand(true, name_literal));
    b.emit(Op::PushSmallInt, 5);
    b.emit(Op::InitVar, name_literal as i32);
    b.emit(Op::GetVar, name_literal as i32);
    b.emit(Op::Return, 0);
    let mut code = b.build();
    code.flags.insert(CodeFlags::STRICT);
    let result = run(code).expect("reading back an initialized const binding should not throw");
    assert_eq!(result.as_small_int(), Some(5));
}
