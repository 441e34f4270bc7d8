/// Object model and property storage
///
/// Every heap-resident "object" — ordinary objects, arrays, functions,
/// lexical environments, arguments objects — is one `ObjectData` record
/// tagged with an `ObjectKind`. Kind-specific state (a fast array's dense
/// element vector, a bound function's target/args, an environment's
/// binding table) lives in `ObjectKind`'s own variant payload rather than a
/// union of optional fields, so the match in `dispatch.rs` is exhaustive
/// and kind-specific data can't be read through the wrong kind.
///
/// Property storage is an insertion-ordered, tombstone-on-delete slot list
/// with an optional name->slot index that kicks in once the property count
/// crosses `HASH_INDEX_THRESHOLD` — the chain-then-hashmap escalation the
/// data model describes, represented here as a `Vec` (amortized O(1)
/// append, stable slot indices survive deletion) instead of a literal
/// pointer-linked chain, since the heap arena already gives every object
/// identity-stable storage.
use crate::bytecode::CompiledCode;
use crate::cp_heap::Cp;
use crate::strings::MagicStr;
use crate::value::Value;
use bitflags::bitflags;
use std::collections::HashMap;
use std::rc::Rc;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ObjectFlags: u16 {
        const EXTENSIBLE   = 1 << 0;
        const STRICT       = 1 << 1;
        /// Set on `ObjectKind::Array`/`FastArray` once a fast array has
        /// been demoted; kept as a flag (rather than solely the kind tag)
        /// so the demotion is observable without matching on kind.
        const DEMOTED_FAST = 1 << 2;
    }
}

impl Default for ObjectFlags {
    fn default() -> Self {
        ObjectFlags::EXTENSIBLE
    }
}

/// Property name. Heap and symbol names are pre-interned `Cp`s so equality
/// is a plain `Cp` comparison rather than a byte compare (see
/// `strings::StringPool` name interner).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PropName {
    Magic(MagicStr),
    Heap(Cp),
    Symbol(Cp),
    Index(u32),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PropKind {
    Data,
    Accessor,
}

#[derive(Clone, Copy, Debug)]
pub struct PropAttrs {
    pub writable: bool,
    pub enumerable: bool,
    pub configurable: bool,
}

impl PropAttrs {
    pub const DEFAULT: PropAttrs = PropAttrs { writable: true, enumerable: true, configurable: true };
}

#[derive(Clone, Copy)]
pub enum PropValue {
    Data(Value),
    /// getter/setter are function-object `Value`s, or `Value::undefined()`
    /// when absent.
    Accessor { get: Value, set: Value },
}

pub struct PropertySlot {
    pub name: PropName,
    pub attrs: PropAttrs,
    pub value: PropValue,
    /// Slots are never physically removed (stable indices for the name
    /// index); a deleted slot is tombstoned here instead.
    pub deleted: bool,
}

const HASH_INDEX_THRESHOLD: usize = 8;

/// Insertion-ordered property list with a lazily-built name index.
#[derive(Default)]
pub struct PropertyStore {
    slots: Vec<PropertySlot>,
    index: Option<HashMap<PropName, usize>>,
}

impl PropertyStore {
    pub fn new() -> Self {
        PropertyStore::default()
    }

    fn find(&self, name: PropName) -> Option<usize> {
        if let Some(idx) = &self.index {
            return idx.get(&name).copied().filter(|i| !self.slots[*i].deleted);
        }
        self.slots.iter().position(|s| !s.deleted && s.name == name)
    }

    pub fn get(&self, name: PropName) -> Option<&PropertySlot> {
        self.find(name).map(|i| &self.slots[i])
    }

    pub fn get_mut(&mut self, name: PropName) -> Option<&mut PropertySlot> {
        let i = self.find(name)?;
        Some(&mut self.slots[i])
    }

    /// Creates or overwrites a slot for `name`, preserving its slot index
    /// (and thus its position for `get_mut` callers) when it already
    /// exists, consistent with "define" semantics overwriting value/attrs
    /// without moving the property in enumeration order.
    pub fn define(&mut self, name: PropName, value: PropValue, attrs: PropAttrs) {
        if let Some(i) = self.find(name) {
            self.slots[i].value = value;
            self.slots[i].attrs = attrs;
            self.slots[i].deleted = false;
            return;
        }
        let new_idx = self.slots.len();
        self.slots.push(PropertySlot { name, attrs, value, deleted: false });
        if let Some(idx) = &mut self.index {
            idx.insert(name, new_idx);
        } else if self.live_count() > HASH_INDEX_THRESHOLD {
            self.rebuild_index();
        }
    }

    fn rebuild_index(&mut self) {
        let mut map = HashMap::with_capacity(self.slots.len());
        for (i, s) in self.slots.iter().enumerate() {
            if !s.deleted {
                map.insert(s.name, i);
            }
        }
        self.index = Some(map);
    }

    /// Tombstones the slot for `name`. Returns `false` if `configurable` is
    /// false or the property does not exist (a no-op in non-strict mode, a
    /// `TypeError` candidate in strict mode — the caller decides which).
    pub fn delete(&mut self, name: PropName) -> bool {
        match self.find(name) {
            Some(i) if self.slots[i].attrs.configurable => {
                self.slots[i].deleted = true;
                if let Some(idx) = &mut self.index {
                    idx.remove(&name);
                }
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.deleted).count()
    }

    /// All live property slots, for GC marking and snapshot-style dumps.
    /// Enumeration-order-sensitive callers should use `own_keys_ordered`
    /// instead.
    pub fn iter_slots(&self) -> impl Iterator<Item = &PropertySlot> {
        self.slots.iter().filter(|s| !s.deleted)
    }

    /// Own property keys in the order required by `[[OwnPropertyKeys]]`:
    /// integer indices ascending, then string keys in creation order, then
    /// symbol keys in creation order.
    pub fn own_keys_ordered(&self) -> Vec<PropName> {
        let live = self.slots.iter().filter(|s| !s.deleted);
        let mut indices: Vec<u32> = Vec::new();
        let mut strings: Vec<PropName> = Vec::new();
        let mut symbols: Vec<PropName> = Vec::new();
        for s in live {
            match s.name {
                PropName::Index(i) => indices.push(i),
                PropName::Symbol(_) => symbols.push(s.name),
                PropName::Magic(_) | PropName::Heap(_) => strings.push(s.name),
            }
        }
        indices.sort_unstable();
        indices
            .into_iter()
            .map(PropName::Index)
            .chain(strings)
            .chain(symbols)
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EnvKind {
    Declarative,
    Object,
    Global,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BindingState {
    /// Lexically declared but not yet reached its initializer (TDZ).
    Uninitialized,
    Mutable,
    Immutable,
}

pub struct Binding {
    pub value: Value,
    pub state: BindingState,
}

/// Per-index mapping from an arguments-object slot back to the parameter
/// binding in the enclosing (non-strict, simple-parameter-list) call
/// environment. `None` once the mapping has been severed (the slot was
/// redefined as non-writable, non-configurable, or deleted — ES5 §10.6).
pub type ArgMapping = Vec<Option<MagicStr>>;

pub enum ObjectKind {
    Ordinary,
    Array,
    /// Dense, hole-free array storage: the element vector mirrors indices
    /// `0..elements.len()` with no gaps and no accessor properties. Any
    /// operation that would introduce a hole, a non-index property, or an
    /// accessor demotes the object to `ObjectKind::Array` first; the
    /// demotion is irreversible (see `dispatch::demote_fast_array`).
    FastArray { elements: Vec<Value> },
    Arguments { mapped: ArgMapping, parent_env: Cp },
    BoundFunction { target: Cp, bound_this: Value, bound_args: Vec<Value> },
    /// `code` is a strong `Rc`, not a `Cp`: compiled code is refcounted
    /// independently of the GC heap (it may be shared with the
    /// out-of-scope snapshot subsystem), so it is never itself a heap
    /// record the mark/sweep pass visits directly — only `closure_env` is.
    ScriptedFunction { code: Rc<CompiledCode>, closure_env: Cp },
    NativeFunction { id: u32 },
    ConstructorFunction { code: Rc<CompiledCode>, closure_env: Cp },
    Proxy { target: Cp, handler: Cp },
    LexicalEnv { kind: EnvKind, bindings: HashMap<PropName, Binding>, outer: Cp, binding_object: Cp },
    Class { constructor: Cp, super_class: Cp },
    /// Holds `target` without keeping it alive: the GC mark phase never
    /// treats this edge as strong, and the sweep phase nulls `target` to
    /// `Cp::NULL` when it finds the referent unmarked (see `gc::collect`).
    WeakRef { target: Cp },
}

impl ObjectKind {
    /// A class constructor has `[[Call]]` (it's `typeof`-callable, and a
    /// valid right-hand side of `instanceof`) but `Vm::call` special-cases
    /// `ConstructorFunction` to always throw `TypeError` at invocation time
    /// instead of running the body — it can only be reached via
    /// `Construct` (spec.md §4.6).
    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            ObjectKind::BoundFunction { .. }
                | ObjectKind::ScriptedFunction { .. }
                | ObjectKind::NativeFunction { .. }
                | ObjectKind::ConstructorFunction { .. }
        )
    }

    pub fn is_constructable(&self) -> bool {
        matches!(self, ObjectKind::BoundFunction { .. } | ObjectKind::ConstructorFunction { .. } | ObjectKind::Class { .. })
    }

    pub fn is_env(&self) -> bool {
        matches!(self, ObjectKind::LexicalEnv { .. })
    }
}

/// A single heap object record: header fields common to every kind plus the
/// kind-specific payload and this object's property list.
pub struct ObjectData {
    pub kind: ObjectKind,
    pub flags: ObjectFlags,
    pub prototype: Cp,
    pub props: PropertyStore,
    /// Non-GC refcount (invariant: §3 object record "refcount-for-non-GC
    /// contexts") — bumped while a native caller holds a `Value` across a
    /// reentrant call the GC might run during, so a mark phase that
    /// happens mid-call never sweeps an object only reachable from a
    /// native local. Does not replace mark-and-sweep as the primary
    /// reclaim mechanism; see `gc::collect`.
    pub native_refcount: u32,
}

impl ObjectData {
    pub fn new(kind: ObjectKind, prototype: Cp) -> Self {
        ObjectData { kind, flags: ObjectFlags::default(), prototype, props: PropertyStore::new(), native_refcount: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_slot(v: Value) -> PropValue {
        PropValue::Data(v)
    }

    #[test]
    fn define_then_get_roundtrip() {
        let mut store = PropertyStore::new();
        let name = PropName::Magic(MagicStr(4));
        store.define(name, data_slot(Value::from_small_int(42)), PropAttrs::DEFAULT);
        let slot = store.get(name).unwrap();
        match slot.value {
            PropValue::Data(v) => assert_eq!(v.as_small_int(), Some(42)),
            _ => panic!("expected data property"),
        }
    }

    #[test]
    fn delete_respects_configurable() {
        let mut store = PropertyStore::new();
        let name = PropName::Index(0);
        store.define(
            name,
            data_slot(Value::undefined()),
            PropAttrs { writable: true, enumerable: true, configurable: false },
        );
        assert!(!store.delete(name));
        assert!(store.get(name).is_some());
    }

    #[test]
    fn enumeration_order_indices_then_strings_then_symbols() {
        let mut store = PropertyStore::new();
        store.define(PropName::Magic(MagicStr(0)), data_slot(Value::undefined()), PropAttrs::DEFAULT);
        store.define(PropName::Symbol(Cp(9)), data_slot(Value::undefined()), PropAttrs::DEFAULT);
        store.define(PropName::Index(5), data_slot(Value::undefined()), PropAttrs::DEFAULT);
        store.define(PropName::Index(1), data_slot(Value::undefined()), PropAttrs::DEFAULT);
        let keys = store.own_keys_ordered();
        assert_eq!(
            keys,
            vec![
                PropName::Index(1),
                PropName::Index(5),
                PropName::Magic(MagicStr(0)),
                PropName::Symbol(Cp(9)),
            ]
        );
    }

    #[test]
    fn index_builds_after_threshold() {
        let mut store = PropertyStore::new();
        for i in 0..(HASH_INDEX_THRESHOLD as u32 + 2) {
            store.define(PropName::Index(i), data_slot(Value::from_small_int(i as i32)), PropAttrs::DEFAULT);
        }
        assert!(store.index.is_some());
        assert!(store.get(PropName::Index(3)).is_some());
    }

    #[test]
    fn tombstone_then_redefine_reuses_slot_count() {
        let mut store = PropertyStore::new();
        let name = PropName::Index(0);
        store.define(name, data_slot(Value::from_small_int(1)), PropAttrs::DEFAULT);
        assert!(store.delete(name));
        assert!(store.get(name).is_none());
        store.define(name, data_slot(Value::from_small_int(2)), PropAttrs::DEFAULT);
        match store.get(name).unwrap().value {
            PropValue::Data(v) => assert_eq!(v.as_small_int(), Some(2)),
            _ => panic!(),
        }
    }
}
