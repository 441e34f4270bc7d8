/// String pool: magic strings, heap strings, and symbols
///
/// Three distinct string representations feed the tagged `Value`:
///   * magic strings — a compile-time table of well-known identifiers
///     ("length", "constructor", "Symbol.iterator", ...), referenced by a
///     direct-value id with no heap allocation at all.
///   * inline ASCII — up to 3 bytes packed straight into the `Value` word
///     (see `value::Value::from_inline_ascii`).
///   * heap strings — length-prefixed, ref-counted, CESU-8-encoded byte
///     sequences living in the heap arena, referenced through a `Cp`.
///
/// Heap strings and symbols share the same arena as objects (`heap::RawHeap`)
/// rather than each owning a private `Heap<T>` — a `Cp` is only meaningful
/// relative to one arena, so giving objects and strings separate arenas
/// would let numerically equal `Cp`s from different arenas collide inside a
/// single `Value`. `StringPool` here is reduced to the bookkeeping that
/// doesn't belong to any one slot: the well-known-symbol cache and the
/// property-name interner.
use crate::cp_heap::{Cp, OutOfMemory};
use crate::heap::{HeapRecord, HeapRecordData, RawHeap};
use std::collections::HashMap;

/// Id into the static magic-string table. Values `0..MAGIC_STRINGS.len()`
/// are valid; the table is fixed at compile time, never grown at runtime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MagicStr(pub u32);

/// A representative slice of the well-known-identifier table real engines
/// ship (property names the object model and dispatch layer reference by
/// name without going through user-visible string creation).
pub static MAGIC_STRINGS: &[&str] = &[
    "length",
    "constructor",
    "prototype",
    "__proto__",
    "name",
    "message",
    "arguments",
    "callee",
    "this",
    "value",
    "writable",
    "enumerable",
    "configurable",
    "get",
    "set",
    "done",
    "next",
    "Symbol.iterator",
    "Symbol.asyncIterator",
    "",
];

impl MagicStr {
    pub fn lookup(s: &str) -> Option<MagicStr> {
        MAGIC_STRINGS.iter().position(|m| *m == s).map(|i| MagicStr(i as u32))
    }

    pub fn as_str(self) -> &'static str {
        MAGIC_STRINGS[self.0 as usize]
    }
}

/// A heap-resident CESU-8 byte string. Immutable once constructed;
/// ref-counted (invariant I6) rather than GC-traced as a first-class root —
/// copying a `Value` that refers to one bumps `refcount`, dropping it
/// decrements, and a count reaching zero frees the slot immediately rather
/// than waiting for the next collection. The GC mark phase still visits
/// heap strings reachable from the object graph (see `gc::collect`), so an
/// orphaned string whose refcount bookkeeping the VM failed to maintain is
/// still reclaimed as a backstop, not silently leaked.
pub struct HeapStringData {
    pub bytes: Vec<u8>,
    pub refcount: u32,
}

impl HeapStringData {
    pub fn new(bytes: Vec<u8>) -> Self {
        HeapStringData { bytes, refcount: 1 }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Symbols carry an optional description and participate in object
/// properties the same way strings do, but are never equal to any string
/// value (ECMAScript symbols are a disjoint primitive type).
pub struct SymbolData {
    pub description: Cp, // heap string, or Cp::NULL for `Symbol()`
    pub well_known: Option<&'static str>,
}

#[derive(Default)]
pub struct StringPool {
    well_known_cache: HashMap<&'static str, Cp>,
    /// Dedups identifier-like property names so two occurrences of the same
    /// text intern to the same `Cp`, which is what lets `PropName::Heap`
    /// equality be a plain `Cp` comparison (see `object::PropertyStore`).
    name_interner: HashMap<Vec<u8>, Cp>,
}

impl StringPool {
    pub fn new() -> Self {
        StringPool::default()
    }

    /// Interns `bytes` as a property-name string: repeated calls with equal
    /// bytes return the same `Cp` with its refcount bumped accordingly.
    pub fn intern_name(&mut self, heap: &mut RawHeap, bytes: &[u8]) -> Result<Cp, OutOfMemory> {
        if let Some(cp) = self.name_interner.get(bytes) {
            retain(heap, *cp);
            return Ok(*cp);
        }
        let cp = alloc_str(heap, bytes.to_vec())?;
        self.name_interner.insert(bytes.to_vec(), cp);
        retain(heap, cp); // one ref for the interner table itself
        Ok(cp)
    }

    pub fn well_known_symbol(&mut self, heap: &mut RawHeap, name: &'static str) -> Cp {
        if let Some(cp) = self.well_known_cache.get(name) {
            return *cp;
        }
        let cp = heap
            .alloc(HeapRecord::new(HeapRecordData::Symbol(SymbolData { description: Cp::NULL, well_known: Some(name) })))
            .expect("well-known symbol table exceeded heap capacity");
        self.well_known_cache.insert(name, cp);
        cp
    }
}

/// Allocates a fresh, non-interned heap string (refcount 1). Most script
/// string values go through this path; only identifier-like property names
/// go through `StringPool::intern_name`.
pub fn alloc_str(heap: &mut RawHeap, bytes: Vec<u8>) -> Result<Cp, OutOfMemory> {
    heap.alloc(HeapRecord::new(HeapRecordData::Str(HeapStringData::new(bytes))))
}

pub fn retain(heap: &mut RawHeap, cp: Cp) {
    if let Some(s) = heap.get_mut(cp).and_then(HeapRecord::as_string_mut) {
        s.refcount += 1;
    }
}

/// Decrements the refcount; frees the slot immediately at zero. Returns
/// `true` if the string was freed by this call.
pub fn release(heap: &mut RawHeap, cp: Cp) -> bool {
    let should_free = match heap.get_mut(cp).and_then(HeapRecord::as_string_mut) {
        Some(s) => {
            debug_assert!(s.refcount > 0, "refcount underflow freeing {cp:?}");
            s.refcount -= 1;
            s.refcount == 0
        }
        None => false,
    };
    if should_free {
        heap.free(cp);
    }
    should_free
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cp_heap::Heap;

    #[test]
    fn magic_string_lookup_roundtrip() {
        let id = MagicStr::lookup("length").unwrap();
        assert_eq!(id.as_str(), "length");
        assert!(MagicStr::lookup("not-a-magic-string").is_none());
    }

    #[test]
    fn heap_string_refcount_frees_at_zero() {
        let mut heap: Heap<HeapRecord> = Heap::new(16);
        let cp = alloc_str(&mut heap, b"hello".to_vec()).unwrap();
        retain(&mut heap, cp);
        assert!(!release(&mut heap, cp)); // refcount 2 -> 1
        assert!(release(&mut heap, cp)); // refcount 1 -> 0, freed
        assert!(heap.get(cp).is_none());
    }

    #[test]
    fn well_known_symbols_are_cached_by_identity() {
        let mut heap: Heap<HeapRecord> = Heap::new(16);
        let mut pool = StringPool::new();
        let a = pool.well_known_symbol(&mut heap, "Symbol.iterator");
        let b = pool.well_known_symbol(&mut heap, "Symbol.iterator");
        assert_eq!(a, b);
    }

    #[test]
    fn name_interner_dedups_equal_bytes() {
        let mut heap: Heap<HeapRecord> = Heap::new(16);
        let mut pool = StringPool::new();
        let a = pool.intern_name(&mut heap, b"constructor").unwrap();
        let b = pool.intern_name(&mut heap, b"constructor").unwrap();
        assert_eq!(a, b);
    }
}
