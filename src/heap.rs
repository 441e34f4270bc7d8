/// Unified heap arena
///
/// Objects, heap strings, and symbols all live in one `Heap<HeapRecord>`
/// arena so a `Cp` is unambiguous no matter which kind of record it points
/// at — a `Value::from_cp` never needs to remember "which heap" it came
/// from. `HeapRecord` wraps the per-kind payload with the one piece of
/// state every record needs regardless of kind: the GC mark bit.
use crate::cp_heap::Heap;
use crate::object::ObjectData;
use crate::strings::{HeapStringData, SymbolData};

pub enum HeapRecordData {
    Object(ObjectData),
    Str(HeapStringData),
    Symbol(SymbolData),
}

pub struct HeapRecord {
    pub data: HeapRecordData,
    pub marked: bool,
}

impl HeapRecord {
    pub fn new(data: HeapRecordData) -> Self {
        HeapRecord { data, marked: false }
    }

    pub fn as_object(&self) -> Option<&ObjectData> {
        match &self.data {
            HeapRecordData::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut ObjectData> {
        match &mut self.data {
            HeapRecordData::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&HeapStringData> {
        match &self.data {
            HeapRecordData::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_string_mut(&mut self) -> Option<&mut HeapStringData> {
        match &mut self.data {
            HeapRecordData::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&SymbolData> {
        match &self.data {
            HeapRecordData::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_symbol_mut(&mut self) -> Option<&mut SymbolData> {
        match &mut self.data {
            HeapRecordData::Symbol(s) => Some(s),
            _ => None,
        }
    }
}

pub type RawHeap = Heap<HeapRecord>;
