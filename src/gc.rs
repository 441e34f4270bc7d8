/// Mark-and-sweep garbage collector
///
/// A classic, whole-heap mark-sweep collector — no generations, no
/// incremental stepping, no write barriers. The root set is whatever the
/// caller hands `collect`: the global environment, every live VM frame's
/// registers/operand stack, the current exception slot, and any object
/// whose `native_refcount` is nonzero. Marking runs from an explicit `Vec`
/// worklist rather than recursing over the object graph, so a deeply
/// nested structure can't blow the native call stack during a collection
/// (this is the one place the spec's "leaves-first" dependency order
/// matters operationally: the heap and object model must already exist
/// before anything can be marked).
use crate::cp_heap::Cp;
use crate::heap::{HeapRecordData, RawHeap};
use crate::object::{ObjectKind, PropValue};
use crate::value::Value;

#[derive(Clone, Copy, Debug, Default)]
pub struct GcStats {
    pub collections: u64,
    pub objects_freed: u64,
    pub objects_live_after: u64,
}

pub struct Gc {
    /// Trigger a collection once `heap.load_factor()` crosses this ratio.
    pub high_water_mark: f64,
    pub stats: GcStats,
}

impl Gc {
    pub fn new(high_water_mark: f64) -> Self {
        Gc { high_water_mark, stats: GcStats::default() }
    }

    pub fn should_collect(&self, heap: &RawHeap) -> bool {
        heap.load_factor() >= self.high_water_mark
    }

    /// Runs one full mark-sweep cycle. `roots` is consumed once at the
    /// start of the mark phase.
    pub fn collect(&mut self, heap: &mut RawHeap, roots: impl IntoIterator<Item = Value>) -> GcStats {
        mark(heap, roots);
        clear_dead_weak_refs(heap);
        let freed = sweep(heap);
        self.stats.collections += 1;
        self.stats.objects_freed += freed as u64;
        self.stats.objects_live_after = heap.live_count() as u64;
        self.stats
    }
}

fn push_cp(heap: &mut RawHeap, worklist: &mut Vec<Cp>, cp: Cp) {
    if cp.is_null() {
        return;
    }
    if let Some(rec) = heap.get_mut(cp) {
        if !rec.marked {
            rec.marked = true;
            worklist.push(cp);
        }
    }
}

fn mark(heap: &mut RawHeap, roots: impl IntoIterator<Item = Value>) {
    let mut worklist = Vec::new();
    for v in roots {
        if let Some(cp) = v.as_cp() {
            push_cp(heap, &mut worklist, cp);
        }
    }
    // Objects with an outstanding native refcount are roots even if no
    // `Value` on the stack currently points at them (a native call may be
    // holding one in a local while triggering a reentrant GC).
    let native_rooted: Vec<Cp> = heap
        .iter()
        .filter_map(|(cp, rec)| rec.as_object().filter(|o| o.native_refcount > 0).map(|_| cp))
        .collect();
    for cp in native_rooted {
        push_cp(heap, &mut worklist, cp);
    }

    while let Some(cp) = worklist.pop() {
        let children = children_of(heap, cp);
        for child in children {
            push_cp(heap, &mut worklist, child);
        }
    }
}

fn children_of(heap: &RawHeap, cp: Cp) -> Vec<Cp> {
    let mut out = Vec::new();
    let Some(rec) = heap.get(cp) else { return out };
    match &rec.data {
        HeapRecordData::Object(obj) => {
            out.push(obj.prototype);
            for slot in obj.props.iter_slots() {
                match slot.value {
                    PropValue::Data(v) => push_value(&mut out, v),
                    PropValue::Accessor { get, set } => {
                        push_value(&mut out, get);
                        push_value(&mut out, set);
                    }
                }
            }
            match &obj.kind {
                ObjectKind::FastArray { elements } => {
                    for v in elements {
                        push_value(&mut out, *v);
                    }
                }
                ObjectKind::Arguments { parent_env, .. } => out.push(*parent_env),
                ObjectKind::BoundFunction { target, bound_this, bound_args } => {
                    out.push(*target);
                    push_value(&mut out, *bound_this);
                    for v in bound_args {
                        push_value(&mut out, *v);
                    }
                }
                ObjectKind::ScriptedFunction { code, closure_env }
                | ObjectKind::ConstructorFunction { code, closure_env } => {
                    out.push(*closure_env);
                    for v in &code.literals {
                        push_value(&mut out, *v);
                    }
                }
                ObjectKind::Proxy { target, handler } => {
                    out.push(*target);
                    out.push(*handler);
                }
                ObjectKind::LexicalEnv { bindings, outer, binding_object, .. } => {
                    out.push(*outer);
                    out.push(*binding_object);
                    for b in bindings.values() {
                        push_value(&mut out, b.value);
                    }
                }
                ObjectKind::Class { constructor, super_class } => {
                    out.push(*constructor);
                    out.push(*super_class);
                }
                // Weak edges: deliberately not followed (see `WeakRef` doc comment).
                ObjectKind::WeakRef { .. } => {}
                ObjectKind::Ordinary | ObjectKind::Array | ObjectKind::NativeFunction { .. } => {}
            }
        }
        HeapRecordData::Str(_) => {}
        HeapRecordData::Symbol(sym) => out.push(sym.description),
    }
    out
}

fn push_value(out: &mut Vec<Cp>, v: Value) {
    if let Some(cp) = v.as_cp() {
        out.push(cp);
    }
}

/// Between mark and sweep: any `WeakRef` whose target didn't get marked has
/// its target cleared, so the sweep phase (which runs next) frees the
/// referent without leaving a dangling `Cp` behind.
fn clear_dead_weak_refs(heap: &mut RawHeap) {
    let weak_cps: Vec<Cp> = heap
        .iter()
        .filter_map(|(cp, rec)| rec.as_object().filter(|o| matches!(o.kind, ObjectKind::WeakRef { .. })).map(|_| cp))
        .collect();
    for cp in weak_cps {
        let target = match heap.get(cp).and_then(|r| r.as_object()) {
            Some(o) => match o.kind {
                ObjectKind::WeakRef { target } => target,
                _ => continue,
            },
            None => continue,
        };
        let target_marked = target.is_null() || heap.get(target).map(|r| r.marked).unwrap_or(false);
        if !target_marked {
            if let Some(o) = heap.get_mut(cp).and_then(|r| r.as_object_mut()) {
                if let ObjectKind::WeakRef { target } = &mut o.kind {
                    *target = Cp::NULL;
                }
            }
        }
    }
}

fn sweep(heap: &mut RawHeap) -> usize {
    let dead: Vec<Cp> = heap.iter().filter(|(_, rec)| !rec.marked).map(|(cp, _)| cp).collect();
    for cp in &dead {
        heap.free(*cp);
    }
    let survivors: Vec<Cp> = heap.iter().map(|(cp, _)| cp).collect();
    for cp in survivors {
        if let Some(rec) = heap.get_mut(cp) {
            rec.marked = false;
        }
    }
    dead.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cp_heap::Heap;
    use crate::heap::HeapRecord;
    use crate::object::{ObjectData, ObjectKind, PropAttrs, PropName, PropValue};

    fn new_heap() -> RawHeap {
        Heap::new(64)
    }

    fn alloc_ordinary(heap: &mut RawHeap) -> Cp {
        heap.alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(ObjectKind::Ordinary, Cp::NULL)))).unwrap()
    }

    #[test]
    fn unreachable_object_is_collected() {
        let mut heap = new_heap();
        let a = alloc_ordinary(&mut heap);
        let mut gc = Gc::new(0.0);
        let stats = gc.collect(&mut heap, std::iter::empty());
        assert_eq!(stats.objects_freed, 1);
        assert!(heap.get(a).is_none());
    }

    #[test]
    fn rooted_object_survives() {
        let mut heap = new_heap();
        let a = alloc_ordinary(&mut heap);
        let mut gc = Gc::new(0.0);
        let stats = gc.collect(&mut heap, [Value::from_cp(a)]);
        assert_eq!(stats.objects_freed, 0);
        assert!(heap.get(a).is_some());
    }

    #[test]
    fn cycle_with_no_external_root_is_collected() {
        let mut heap = new_heap();
        let a = alloc_ordinary(&mut heap);
        let b = alloc_ordinary(&mut heap);
        // a.prop -> b, b.prop -> a: a reference cycle with nothing pointing
        // in from a root.
        heap.get_mut(a).unwrap().as_object_mut().unwrap().props.define(
            PropName::Index(0),
            PropValue::Data(Value::from_cp(b)),
            PropAttrs::DEFAULT,
        );
        heap.get_mut(b).unwrap().as_object_mut().unwrap().props.define(
            PropName::Index(0),
            PropValue::Data(Value::from_cp(a)),
            PropAttrs::DEFAULT,
        );
        let mut gc = Gc::new(0.0);
        let stats = gc.collect(&mut heap, std::iter::empty());
        assert_eq!(stats.objects_freed, 2);
    }

    #[test]
    fn reachable_through_prototype_chain_survives() {
        let mut heap = new_heap();
        let proto = alloc_ordinary(&mut heap);
        let child =
            heap.alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(ObjectKind::Ordinary, proto)))).unwrap();
        let mut gc = Gc::new(0.0);
        gc.collect(&mut heap, [Value::from_cp(child)]);
        assert!(heap.get(proto).is_some());
        assert!(heap.get(child).is_some());
    }

    #[test]
    fn weak_ref_target_nulled_when_unreachable() {
        let mut heap = new_heap();
        let target = alloc_ordinary(&mut heap);
        let weak = heap
            .alloc(HeapRecord::new(HeapRecordData::Object(ObjectData::new(ObjectKind::WeakRef { target }, Cp::NULL))))
            .unwrap();
        let mut gc = Gc::new(0.0);
        gc.collect(&mut heap, [Value::from_cp(weak)]);
        assert!(heap.get(target).is_none());
        match heap.get(weak).unwrap().as_object().unwrap().kind {
            ObjectKind::WeakRef { target } => assert!(target.is_null()),
            _ => panic!("expected weak ref"),
        }
    }
}
