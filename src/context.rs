/// `EngineState`: the single owner of engine-global mutable state
///
/// Everything the engine needs that would otherwise be a module-level
/// static — the heap, the GC, the string pool, the global environment, and
/// the "current exception" slot the VM consults after every opcode that
/// can throw — lives in one struct instead. `vm_init` builds one from an
/// `EngineConfig`; `vm_cleanup` (here, just `Drop`) tears it down. This is
/// the concrete realization of the "no global mutable statics" design
/// note: every subsystem function takes `&mut EngineState` (or narrower
/// `&mut RawHeap`/`&mut StringPool` borrows of one) rather than reaching
/// into thread-local or `static` storage.
use std::sync::Arc;

use parking_lot::Mutex;

use crate::conf::EngineConfig;
use crate::cp_heap::Cp;
use crate::environment;
use crate::errors::JsErrorKind;
use crate::gc::Gc;
use crate::heap::{HeapRecord, HeapRecordData, RawHeap};
use crate::object::{ObjectData, ObjectKind, PropAttrs, PropName, PropValue};
use crate::strings::{self, StringPool};
use crate::value::Value;

/// Shared, cross-thread termination request — the one piece of state an
/// embedder legitimately needs to poke from outside the engine's own
/// (single) execution thread, e.g. a signal handler or a watchdog timer
/// aborting a runaway script. `vm::run` polls this at backward branches
/// and function entry (spec.md §5).
#[derive(Clone)]
pub struct TerminationFlag(Arc<Mutex<bool>>);

impl TerminationFlag {
    pub fn new() -> Self {
        TerminationFlag(Arc::new(Mutex::new(false)))
    }

    pub fn request(&self) {
        *self.0.lock() = true;
    }

    pub fn is_set(&self) -> bool {
        *self.0.lock()
    }
}

impl Default for TerminationFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// A host-provided function backing `ObjectKind::NativeFunction`. Native
/// functions are registered once (typically at engine setup, by the
/// embedder or by the assembler-built demo programs under `src/main.rs`)
/// and referenced from object records by table index rather than by a raw
/// function pointer stored directly in the heap record, keeping every
/// heap-resident type plain data with no `fn` pointers to trace or compare.
pub type NativeFn = fn(&mut EngineState, Value, &[Value]) -> crate::errors::JsResult<Value>;

pub struct EngineState {
    pub heap: RawHeap,
    pub strings: StringPool,
    pub gc: Gc,
    pub global_env: Cp,
    pub global_object: Cp,
    /// The VM's completion slot: set when a `Throw` unwinds past every
    /// protected range in the active call, read by the embedder boundary
    /// to report an uncaught exception. Never mirrored into a plain
    /// `Value` on any operand stack (invariant I2).
    pub exception: Option<Value>,
    pub config: EngineConfig,
    pub terminate: TerminationFlag,
    pub native_fns: Vec<NativeFn>,
}

impl EngineState {
    pub fn new(config: EngineConfig) -> Self {
        let mut heap: RawHeap = crate::cp_heap::Heap::new(config.heap_slots);
        let global_object = heap
            .alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(ObjectKind::Ordinary, Cp::NULL))))
            .expect("initial heap allocation should always succeed");
        let global_env = environment::create_global_environment(&mut heap, global_object);
        EngineState {
            heap,
            strings: StringPool::new(),
            gc: Gc::new(config.gc_high_water_mark),
            global_env,
            global_object,
            exception: None,
            config,
            terminate: TerminationFlag::new(),
            native_fns: Vec::new(),
        }
    }

    /// Registers a native function and returns the id used by
    /// `ObjectKind::NativeFunction { id }` to refer to it.
    pub fn register_native(&mut self, f: NativeFn) -> u32 {
        self.native_fns.push(f);
        (self.native_fns.len() - 1) as u32
    }

    /// Allocates a fresh `Error`-kind object with `.name`/`.message` set,
    /// and stages it as the pending exception — the single place
    /// `EngineError`/`EnvError`/`DispatchError` become a thrown heap value
    /// (spec.md §7's `raise_internal`).
    pub fn raise(&mut self, kind: JsErrorKind, message: impl Into<String>) -> Value {
        let msg_cp = strings::alloc_str(&mut self.heap, message.into().into_bytes()).expect("string allocation during raise should not fail");
        let err_cp = self
            .heap
            .alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(ObjectKind::Ordinary, Cp::NULL))))
            .expect("error object allocation should not fail");
        let name_cp = strings::alloc_str(&mut self.heap, kind.name().as_bytes().to_vec()).expect("string allocation during raise should not fail");
        if let Some(o) = self.heap.get_mut(err_cp).and_then(|r| r.as_object_mut()) {
            o.props.define(PropName::Magic(crate::strings::MagicStr(4)), PropValue::Data(Value::from_cp(name_cp)), PropAttrs::DEFAULT);
            o.props.define(PropName::Magic(crate::strings::MagicStr(5)), PropValue::Data(Value::from_cp(msg_cp)), PropAttrs::DEFAULT);
        }
        let v = Value::from_cp(err_cp);
        self.exception = Some(v);
        v
    }

    /// Collects garbage if the heap's load factor has crossed the
    /// configured high-water mark. `roots` must enumerate every live VM
    /// frame's registers/operand stack in addition to the engine-owned
    /// roots this method adds automatically.
    pub fn maybe_collect(&mut self, extra_roots: impl IntoIterator<Item = Value>) {
        if !self.gc.should_collect(&self.heap) {
            return;
        }
        let mut roots: Vec<Value> = vec![Value::from_cp(self.global_env), Value::from_cp(self.global_object)];
        if let Some(exc) = self.exception {
            roots.push(exc);
        }
        roots.extend(extra_roots);
        self.gc.collect(&mut self.heap, roots);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_state_boots_with_global_environment() {
        let engine = EngineState::new(EngineConfig::default());
        assert!(!engine.global_env.is_null());
        assert!(!engine.global_object.is_null());
    }

    #[test]
    fn raise_sets_pending_exception() {
        let mut engine = EngineState::new(EngineConfig::default());
        assert!(engine.exception.is_none());
        engine.raise(JsErrorKind::TypeError, "boom");
        assert!(engine.exception.is_some());
    }

    #[test]
    fn termination_flag_is_observable_after_request() {
        let flag = TerminationFlag::new();
        assert!(!flag.is_set());
        flag.request();
        assert!(flag.is_set());
    }
}
