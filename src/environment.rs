/// Lexical environments
///
/// Declarative, object, and global environment records are all represented
/// as one more heap object kind (`ObjectKind::LexicalEnv`) rather than a
/// separate type hierarchy — an environment record is, per the data model,
/// "itself an object record with kind LexicalEnv", so it participates in
/// the same GC arena and mark traversal as everything else (`gc::children_of`
/// already walks its bindings and `outer` link).
///
/// TDZ is modeled explicitly: a `let`/`const` binding is created in
/// `BindingState::Uninitialized` and reading or assigning it before
/// `initialize_binding` runs is a `ReferenceError`, exactly as
/// `CreateMutableBinding`/`InitializeBinding` prescribe.
use crate::cp_heap::Cp;
use crate::errors::JsErrorKind;
use crate::heap::{HeapRecord, HeapRecordData, RawHeap};
use crate::object::{Binding, BindingState, EnvKind, ObjectData, ObjectKind, PropName};
use crate::value::Value;

/// A binding-resolution failure, not yet materialized as a thrown heap
/// value — the VM glue (`context::EngineState::raise`) turns this into a
/// real `Error` object with a message once it has the engine state needed
/// to allocate one. Kept separate from `errors::JsResult<Value>` so this
/// module never has to fabricate a placeholder `Value` for the `Err` case.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EnvError {
    /// Accessed a `let`/`const` binding before its initializer ran.
/// `ReferenceError`.
    TemporalDeadZone,
    /// Assigned to a `const` binding in strict mode. `TypeError`.
    AssignToImmutable,
    /// Read or strict-mode-assigned a name with no binding anywhere on the
    /// chain. `ReferenceError`.
    Unresolved,
}

impl EnvError {
    pub fn kind(self) -> JsErrorKind {
        match self {
            EnvError::TemporalDeadZone | EnvError::Unresolved => JsErrorKind::ReferenceError,
            EnvError::AssignToImmutable => JsErrorKind::TypeError,
        }
    }
}

pub type EnvResult<T> = Result<T, EnvError>;

pub fn create_declarative_environment(heap: &mut RawHeap, outer: Cp) -> Cp {
    heap.alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(
        ObjectKind::LexicalEnv { kind: EnvKind::Declarative, bindings: Default::default(), outer, binding_object: Cp::NULL },
        Cp::NULL,
    ))))
    .expect("environment allocation should not exhaust a correctly sized heap")
}

pub fn create_object_environment(heap: &mut RawHeap, binding_object: Cp, outer: Cp) -> Cp {
    heap.alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(
        ObjectKind::LexicalEnv { kind: EnvKind::Object, bindings: Default::default(), outer, binding_object },
        Cp::NULL,
    ))))
    .expect("environment allocation should not exhaust a correctly sized heap")
}

pub fn create_global_environment(heap: &mut RawHeap, global_object: Cp) -> Cp {
    heap.alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(
        ObjectKind::LexicalEnv {
            kind: EnvKind::Global,
            bindings: Default::default(),
            outer: Cp::NULL,
            binding_object: global_object,
        },
        Cp::NULL,
    ))))
    .expect("environment allocation should not exhaust a correctly sized heap")
}

fn with_env<'h>(heap: &'h RawHeap, env: Cp) -> &'h ObjectData {
    heap.get(env).and_then(|r| r.as_object()).expect("Cp does not refer to a live environment")
}

fn with_env_mut<'h>(heap: &'h mut RawHeap, env: Cp) -> &'h mut ObjectData {
    heap.get_mut(env).and_then(|r| r.as_object_mut()).expect("Cp does not refer to a live environment")
}

/// `CreateMutableBinding`/`CreateImmutableBinding`: declares `name` in
/// `env` without giving it a value yet (TDZ for `let`, and for `var`
/// declarative bindings the caller immediately follows with
/// `initialize_binding(Value::undefined())`).
pub fn create_binding(heap: &mut RawHeap, env: Cp, name: PropName, immutable: bool) {
    let obj = with_env_mut(heap, env);
    match &mut obj.kind {
        ObjectKind::LexicalEnv { bindings, .. } => {
            bindings.insert(
                name,
                Binding { value: Value::undefined(), state: if immutable { BindingState::Immutable } else { BindingState::Uninitialized } },
            );
        }
        _ => unreachable!("create_binding on non-environment object"),
    }
}

pub fn initialize_binding(heap: &mut RawHeap, env: Cp, name: PropName, value: Value) {
    let obj = with_env_mut(heap, env);
    match &mut obj.kind {
        ObjectKind::LexicalEnv { bindings, .. } => {
            if let Some(b) = bindings.get_mut(&name) {
                b.value = value;
                b.state = if b.state == BindingState::Immutable { BindingState::Immutable } else { BindingState::Mutable };
            }
        }
        _ => unreachable!("initialize_binding on non-environment object"),
    }
}

pub fn has_binding(heap: &RawHeap, env: Cp, name: PropName) -> bool {
    match &with_env(heap, env).kind {
        ObjectKind::LexicalEnv { bindings, .. } => bindings.contains_key(&name),
        _ => unreachable!("has_binding on non-environment object"),
    }
}

pub fn set_mutable_binding(heap: &mut RawHeap, env: Cp, name: PropName, value: Value, strict: bool) -> EnvResult<()> {
    let obj = with_env_mut(heap, env);
    match &mut obj.kind {
        ObjectKind::LexicalEnv { bindings, .. } => match bindings.get_mut(&name) {
            Some(b) if b.state == BindingState::Uninitialized => Err(EnvError::TemporalDeadZone),
            // `CreateImmutableBinding` always creates a binding whose
            // rejection of reassignment does not depend on the strictness
            // of the *assigning* code (ECMA-262 `SetMutableBinding` step
            // "if the binding is a strict binding, throw" — a `const`
            // binding's strictness is fixed at creation, not inherited
            // from the call site), so this ignores the caller's `strict`
            // argument entirely for an immutable binding.
            Some(b) if b.state == BindingState::Immutable => Err(EnvError::AssignToImmutable),
            Some(b) => {
                b.value = value;
                Ok(())
            }
            None if strict => Err(EnvError::Unresolved),
            None => Ok(()),
        },
        _ => unreachable!("set_mutable_binding on non-environment object"),
    }
}

pub fn get_binding_value(heap: &RawHeap, env: Cp, name: PropName, _strict: bool) -> EnvResult<Value> {
    match &with_env(heap, env).kind {
        ObjectKind::LexicalEnv { bindings, .. } => match bindings.get(&name) {
            Some(b) if b.state == BindingState::Uninitialized => Err(EnvError::TemporalDeadZone),
            Some(b) => Ok(b.value),
            None => Err(EnvError::Unresolved),
        },
        _ => unreachable!("get_binding_value on non-environment object"),
    }
}

pub fn delete_binding(heap: &mut RawHeap, env: Cp, name: PropName) -> bool {
    let obj = with_env_mut(heap, env);
    match &mut obj.kind {
        ObjectKind::LexicalEnv { bindings, .. } => bindings.remove(&name).is_some(),
        _ => unreachable!("delete_binding on non-environment object"),
    }
}

pub fn outer(heap: &RawHeap, env: Cp) -> Cp {
    match &with_env(heap, env).kind {
        ObjectKind::LexicalEnv { outer, .. } => *outer,
        _ => unreachable!("outer on non-environment object"),
    }
}

/// Walks the environment chain starting at `env` looking for `name`,
/// returning the environment record that owns the binding (not the value
/// itself — callers that need the value call `get_binding_value` on the
/// result). `None` means the reference is genuinely unresolved.
pub fn resolve_binding(heap: &RawHeap, mut env: Cp, name: PropName) -> Option<Cp> {
    loop {
        if env.is_null() {
            return None;
        }
        if has_binding(heap, env, name) {
            return Some(env);
        }
        env = outer(heap, env);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cp_heap::Heap;
    use crate::strings::MagicStr;

    fn name() -> PropName {
        PropName::Magic(MagicStr(4))
    }

    #[test]
    fn tdz_blocks_read_before_initialize() {
        let mut heap: RawHeap = Heap::new(16);
        let env = create_declarative_environment(&mut heap, Cp::NULL);
        create_binding(&mut heap, env, name(), false);
        assert!(get_binding_value(&heap, env, name(), false).is_err());
        initialize_binding(&mut heap, env, name(), Value::from_small_int(1));
        assert_eq!(get_binding_value(&heap, env, name(), false).unwrap().as_small_int(), Some(1));
    }

    #[test]
    fn immutable_binding_rejects_reassignment_regardless_of_caller_strictness() {
        let mut heap: RawHeap = Heap::new(16);
        let env = create_declarative_environment(&mut heap, Cp::NULL);
        create_binding(&mut heap, env, name(), true);
        initialize_binding(&mut heap, env, name(), Value::from_small_int(1));
        assert!(set_mutable_binding(&mut heap, env, name(), Value::from_small_int(2), true).is_err());
        // a const binding rejects reassignment even from non-strict code
        assert!(set_mutable_binding(&mut heap, env, name(), Value::from_small_int(2), false).is_err());
        assert_eq!(get_binding_value(&heap, env, name(), false).unwrap().as_small_int(), Some(1));
    }

    #[test]
    fn resolve_binding_walks_outer_chain() {
        let mut heap: RawHeap = Heap::new(16);
        let outer_env = create_declarative_environment(&mut heap, Cp::NULL);
        create_binding(&mut heap, outer_env, name(), false);
        initialize_binding(&mut heap, outer_env, name(), Value::from_small_int(9));
        let inner_env = create_declarative_environment(&mut heap, outer_env);
        let found = resolve_binding(&heap, inner_env, name()).unwrap();
        assert_eq!(found, outer_env);
    }

    #[test]
    fn unresolved_reference_is_none() {
        let mut heap: RawHeap = Heap::new(16);
        let env = create_declarative_environment(&mut heap, Cp::NULL);
        assert!(resolve_binding(&heap, env, name()).is_none());
    }
}
