/// Internal-method dispatch
///
/// Every object kind supports the same handful of internal methods
/// (`[[Get]]`, `[[Set]]`, `[[Delete]]`, `[[OwnPropertyKeys]]`, ...), but
/// several kinds override the ordinary algorithm: a fast array answers
/// `[[Get]]` for an index straight out of its dense element vector instead
/// of walking the property list, an arguments object's mapped indices
/// read/write through to the parent call environment, and a bound function
/// is not itself callable in the usual sense — `[[Call]]` resolves through
/// its target.
///
/// Rather than a table of function pointers selected at object-creation
/// time (the allocate-a-vtable idiom), dispatch here is a `match` over the
/// closed `ObjectKind` sum type. The compiler's exhaustiveness check is the
/// thing standing in for "every kind must supply every method" — adding a
/// new `ObjectKind` variant and forgetting to handle it in `get`/`set`/etc.
/// is a compile error, not a null-pointer vtable slot.
use crate::cp_heap::Cp;
use crate::errors::JsErrorKind;
use crate::heap::RawHeap;
use crate::object::{ObjectFlags, ObjectKind, PropAttrs, PropKind, PropName, PropValue};
use crate::strings::MagicStr;
use crate::value::{Singleton, Value};

/// The well-known `__proto__` accessor name; writes through it go to
/// `[[SetPrototypeOf]]` rather than becoming an ordinary own property.
const PROTO_NAME: PropName = PropName::Magic(MagicStr(3));

/// A property-resolution failure that hasn't yet been materialized into a
/// thrown heap value, mirroring `environment::EnvError` — the caller with
/// access to `EngineState` converts it via `EngineState::raise`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DispatchError {
    /// `[[Set]]` on a non-writable data property, or `[[DefineOwnProperty]]`
    /// on a non-configurable one, in strict mode.
    NotWritable,
    /// Calling or constructing a non-callable/non-constructable value.
    NotCallable,
    NotConstructable,
    /// A getter-only accessor was assigned through in strict mode (spec.md
    /// §8 scenario: "getter-only property silent-fail/TypeError").
    NoSetter,
    CallStackExceeded,
}

impl DispatchError {
    pub fn kind(self) -> JsErrorKind {
        JsErrorKind::TypeError
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

fn obj<'h>(heap: &'h RawHeap, cp: Cp) -> &'h crate::object::ObjectData {
    heap.get(cp).and_then(|r| r.as_object()).expect("Cp does not refer to a live object")
}

fn obj_mut<'h>(heap: &'h mut RawHeap, cp: Cp) -> &'h mut crate::object::ObjectData {
    heap.get_mut(cp).and_then(|r| r.as_object_mut()).expect("Cp does not refer to a live object")
}

/// `[[GetOwnProperty]]`, generalized over fast arrays and arguments objects
/// so a caller never needs to special-case those kinds itself.
pub fn get_own(heap: &RawHeap, cp: Cp, key: PropName) -> Option<PropValue> {
    let o = obj(heap, cp);
    if let ObjectKind::FastArray { elements } = &o.kind {
        if let PropName::Index(i) = key {
            return elements.get(i as usize).copied().map(PropValue::Data);
        }
    }
    if let ObjectKind::Arguments { mapped, parent_env } = &o.kind {
        if let PropName::Index(i) = key {
            if let Some(Some(name)) = mapped.get(i as usize) {
                // A mapped slot's live value tracks the parameter binding,
                // not whatever was last stored in `props` — so `arguments[0]`
                // observes a later `a = 2` reassignment of the parameter.
                if let Ok(v) = crate::environment::get_binding_value(heap, *parent_env, PropName::Magic(*name), false) {
                    return Some(PropValue::Data(v));
                }
            }
        }
    }
    o.props.get(key).map(|s| s.value)
}

/// `[[Get]]`: walks the prototype chain when the receiver has no own
/// property for `key`.
pub fn get(heap: &RawHeap, cp: Cp, key: PropName) -> Option<Value> {
    let mut current = cp;
    loop {
        if current.is_null() {
            return None;
        }
        if let Some(v) = get_own(heap, current, key) {
            return Some(match v {
                PropValue::Data(v) => v,
                // Accessor invocation requires calling back into the VM
                // (the getter is a function); callers needing that go
                // through `vm::get_with_receiver` instead. Plain `get` is
                // for data-only lookups (property storage, GC, etc.).
                PropValue::Accessor { .. } => Value::undefined(),
            });
        }
        current = obj(heap, current).prototype;
    }
}

/// `[[Set]]` for a plain data assignment (no accessor invocation — see the
/// note on `get`). Demotes a `FastArray` to `Array` the moment a write
/// would introduce a hole or a non-index key, per the fast-array invariant.
pub fn set(heap: &mut RawHeap, cp: Cp, key: PropName, value: Value, strict: bool) -> DispatchResult<()> {
    if key == PROTO_NAME {
        // Assigning a non-object, non-null value through `__proto__` is a
        // silent no-op in real ECMAScript rather than a `TypeError`.
        if value.is_null() {
            set_prototype_of(heap, cp, Cp::NULL);
        } else if let Some(proto_cp) = value.as_cp() {
            if heap.get(proto_cp).and_then(|r| r.as_object()).is_some() {
                set_prototype_of(heap, cp, proto_cp);
            }
        }
        return Ok(());
    }
    if let PropName::Index(i) = key {
        let mapped_write = match &obj(heap, cp).kind {
            ObjectKind::Arguments { mapped, parent_env } => mapped.get(i as usize).copied().flatten().map(|n| (n, *parent_env)),
            _ => None,
        };
        if let Some((name, parent_env)) = mapped_write {
            // Severing happens the moment the slot is redefined as
            // non-writable/non-configurable or deleted, which always goes
            // through `define`/`delete`, not this plain-assignment path —
            // so a live mapping here always still applies.
            let _ = crate::environment::set_mutable_binding(heap, parent_env, PropName::Magic(name), value, false);
        }
    }
    if let PropName::Index(i) = key {
        let is_fast = matches!(obj(heap, cp).kind, ObjectKind::FastArray { .. });
        if is_fast {
            let len = match &obj(heap, cp).kind {
                ObjectKind::FastArray { elements } => elements.len(),
                _ => unreachable!(),
            };
            if (i as usize) <= len {
                let o = obj_mut(heap, cp);
                if let ObjectKind::FastArray { elements } = &mut o.kind {
                    if (i as usize) == elements.len() {
                        elements.push(value);
                    } else {
                        elements[i as usize] = value;
                    }
                    return Ok(());
                }
            }
            demote_fast_array(heap, cp);
        }
    }

    let existing = obj(heap, cp).props.get(key).map(|s| (s.attrs, s.value));
    match existing {
        Some((attrs, PropValue::Accessor { set, .. })) => {
            if set.is_undefined() {
                if strict {
                    return Err(DispatchError::NoSetter);
                }
                return Ok(());
            }
            let _ = attrs;
            // Invoking the setter function is the VM's job (it has a call
            // stack to push a frame onto); this layer only reports that an
            // accessor owns the slot. Higher layers branch on this.
            Err(DispatchError::NoSetter)
        }
        Some((attrs, PropValue::Data(_))) => {
            if !attrs.writable {
                if strict {
                    return Err(DispatchError::NotWritable);
                }
                return Ok(());
            }
            obj_mut(heap, cp).props.define(key, PropValue::Data(value), attrs);
            Ok(())
        }
        None => {
            if !obj(heap, cp).flags.contains(crate::object::ObjectFlags::EXTENSIBLE) {
                if strict {
                    return Err(DispatchError::NotWritable);
                }
                return Ok(());
            }
            obj_mut(heap, cp).props.define(key, PropValue::Data(value), PropAttrs::DEFAULT);
            Ok(())
        }
    }
}

/// Irreversibly converts a `FastArray` into an ordinary `Array`, copying
/// its dense elements into the property list as indexed data properties.
/// Once demoted, an object never becomes a fast array again.
pub fn demote_fast_array(heap: &mut RawHeap, cp: Cp) {
    let elements = match &mut obj_mut(heap, cp).kind {
        ObjectKind::FastArray { elements } => std::mem::take(elements),
        _ => return,
    };
    let o = obj_mut(heap, cp);
    for (i, v) in elements.into_iter().enumerate() {
        o.props.define(PropName::Index(i as u32), PropValue::Data(v), PropAttrs::DEFAULT);
    }
    o.kind = ObjectKind::Array;
    o.flags.insert(crate::object::ObjectFlags::DEMOTED_FAST);
}

/// `[[SetPrototypeOf]]`. Demotes a fast array first — spec.md §4.4 lists
/// "set prototype" alongside "freeze" as triggers that retire the dense
/// element vector, since neither has anywhere to live once the object
/// needs a property-list entry for its own `[[Prototype]]` bookkeeping.
pub fn set_prototype_of(heap: &mut RawHeap, cp: Cp, proto: Cp) {
    if matches!(obj(heap, cp).kind, ObjectKind::FastArray { .. }) {
        demote_fast_array(heap, cp);
    }
    obj_mut(heap, cp).prototype = proto;
}

pub fn is_extensible(heap: &RawHeap, cp: Cp) -> bool {
    obj(heap, cp).flags.contains(ObjectFlags::EXTENSIBLE)
}

/// `[[PreventExtensions]]` ("freeze" in spec.md §4.4's demotion trigger
/// list). Irreversible, like `demote_fast_array` itself — there is no
/// `[[SetExtensible]]` to undo it.
pub fn prevent_extensions(heap: &mut RawHeap, cp: Cp) {
    if matches!(obj(heap, cp).kind, ObjectKind::FastArray { .. }) {
        demote_fast_array(heap, cp);
    }
    obj_mut(heap, cp).flags.remove(ObjectFlags::EXTENSIBLE);
}

pub fn has_property(heap: &RawHeap, cp: Cp, key: PropName) -> bool {
    let mut current = cp;
    loop {
        if current.is_null() {
            return false;
        }
        if get_own(heap, current, key).is_some() {
            return true;
        }
        current = obj(heap, current).prototype;
    }
}

pub fn delete(heap: &mut RawHeap, cp: Cp, key: PropName) -> bool {
    if let PropName::Index(i) = key {
        if matches!(obj(heap, cp).kind, ObjectKind::FastArray { .. }) {
            demote_fast_array(heap, cp);
        }
        let _ = i;
    }
    obj_mut(heap, cp).props.delete(key)
}

/// `[[OwnPropertyKeys]]`, including the synthesized indices of a fast
/// array (which has no corresponding property-list entries to enumerate).
pub fn own_keys(heap: &RawHeap, cp: Cp) -> Vec<PropName> {
    let o = obj(heap, cp);
    if let ObjectKind::FastArray { elements } = &o.kind {
        let mut keys: Vec<PropName> = (0..elements.len() as u32).map(PropName::Index).collect();
        keys.extend(o.props.own_keys_ordered());
        return keys;
    }
    o.props.own_keys_ordered()
}

pub fn is_callable(heap: &RawHeap, cp: Cp) -> bool {
    obj(heap, cp).kind.is_callable()
}

pub fn is_constructable(heap: &RawHeap, cp: Cp) -> bool {
    obj(heap, cp).kind.is_constructable()
}

/// Resolves a (possibly chained) bound function down to its ultimate
/// target plus the effective `this` and prepended-argument list, per the
/// "iterative resolution of bound-function chains" note in the object
/// model. Returns `None` if `cp` is not callable at all.
pub fn resolve_callable(heap: &RawHeap, mut cp: Cp) -> Option<(Cp, Value, Vec<Value>)> {
    let mut bound_this = Value::undefined();
    let mut prefix: Vec<Value> = Vec::new();
    loop {
        match &obj(heap, cp).kind {
            ObjectKind::BoundFunction { target, bound_this: this, bound_args } => {
                let mut combined = bound_args.clone();
                combined.extend(prefix);
                prefix = combined;
                bound_this = *this;
                cp = *target;
            }
            k if k.is_callable() => return Some((cp, bound_this, prefix)),
            _ => return None,
        }
    }
}

/// `typeof`-relevant singleton classification used by the `TypeOf` opcode;
/// kept here because it has to branch on `ObjectKind` the same way every
/// other dispatch operation does.
pub fn type_of_tag(heap: &RawHeap, v: Value) -> &'static str {
    if v.is_undefined() {
        return "undefined";
    }
    if v.is_null() {
        // `typeof null === "object"` is one of ECMAScript's load-bearing
        // historical accidents.
        return "object";
    }
    if v.as_small_int().is_some() {
        return "number";
    }
    if v.is_direct_str() {
        return "string";
    }
    if v.as_singleton() == Some(Singleton::True) || v.as_singleton() == Some(Singleton::False) {
        return "boolean";
    }
    if let Some(cp) = v.as_cp() {
        if let Some(o) = heap.get(cp).and_then(|r| r.as_object()) {
            if o.kind.is_callable() {
                return "function";
            }
            return "object";
        }
        if heap.get(cp).and_then(|r| r.as_symbol()).is_some() {
            return "symbol";
        }
        return "string"; // heap string
    }
    "undefined"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cp_heap::Heap;
    use crate::heap::{HeapRecord, HeapRecordData};
    use crate::object::ObjectData;

    fn new_heap() -> RawHeap {
        Heap::new(64)
    }

    fn alloc(heap: &mut RawHeap, kind: ObjectKind) -> Cp {
        heap.alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(kind, Cp::NULL)))).unwrap()
    }

    #[test]
    fn fast_array_get_set_within_bounds() {
        let mut heap = new_heap();
        let a = alloc(&mut heap, ObjectKind::FastArray { elements: vec![Value::from_small_int(1), Value::from_small_int(2)] });
        assert_eq!(get(&heap, a, PropName::Index(1)), Some(Value::from_small_int(2)));
        set(&mut heap, a, PropName::Index(1), Value::from_small_int(9), false).unwrap();
        assert_eq!(get(&heap, a, PropName::Index(1)), Some(Value::from_small_int(9)));
    }

    #[test]
    fn fast_array_append_at_length_stays_fast() {
        let mut heap = new_heap();
        let a = alloc(&mut heap, ObjectKind::FastArray { elements: vec![Value::from_small_int(1)] });
        set(&mut heap, a, PropName::Index(1), Value::from_small_int(2), false).unwrap();
        assert!(matches!(obj(&heap, a).kind, ObjectKind::FastArray { .. }));
    }

    #[test]
    fn fast_array_hole_demotes_irreversibly() {
        let mut heap = new_heap();
        let a = alloc(&mut heap, ObjectKind::FastArray { elements: vec![Value::from_small_int(1)] });
        // index 5 with only 1 element present introduces a hole at indices 1..5
        set(&mut heap, a, PropName::Index(5), Value::from_small_int(9), false).unwrap();
        assert!(matches!(obj(&heap, a).kind, ObjectKind::Array));
        assert_eq!(get(&heap, a, PropName::Index(0)), Some(Value::from_small_int(1)));
        assert_eq!(get(&heap, a, PropName::Index(5)), Some(Value::from_small_int(9)));
    }

    #[test]
    fn prototype_chain_lookup() {
        let mut heap = new_heap();
        let proto = alloc(&mut heap, ObjectKind::Ordinary);
        set(&mut heap, proto, PropName::Index(0), Value::from_small_int(7), false).unwrap();
        let child_cp = heap.alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(ObjectKind::Ordinary, proto)))).unwrap();
        assert_eq!(get(&heap, child_cp, PropName::Index(0)), Some(Value::from_small_int(7)));
    }

    #[test]
    fn bound_function_chain_resolves_to_ultimate_target() {
        let mut heap = new_heap();
        let target = alloc(&mut heap, ObjectKind::NativeFunction { id: 1 });
        let bound1 = alloc(
            &mut heap,
            ObjectKind::BoundFunction { target, bound_this: Value::from_small_int(1), bound_args: vec![Value::from_small_int(10)] },
        );
        let bound2 = alloc(
            &mut heap,
            ObjectKind::BoundFunction { target: bound1, bound_this: Value::from_small_int(2), bound_args: vec![Value::from_small_int(20)] },
        );
        let (resolved, this_val, args) = resolve_callable(&heap, bound2).unwrap();
        assert_eq!(resolved, target);
        assert_eq!(this_val.as_small_int(), Some(1));
        assert_eq!(args.len(), 2);
    }
}
