/// Bytecode format and compiled-code object
///
/// Instructions are variable-length: one opcode byte, optionally preceded by
/// a `Wide` prefix byte that widens the following instruction's operand from
/// 8 to 16 bits (the same trick as the JVM's `wide` or CPython's
/// `EXTENDED_ARG`), plus zero or one operand bytes of its own. Every opcode
/// needs at most one immediate operand — a literal-table index, a small
/// integer, a branch offset, or an argument count — because everything else
/// an instruction needs comes off the operand stack (`vm::Frame`).
///
/// This is a genuine stack machine: there are no registers, and operands are
/// always the top N values of the current frame's value stack. That is a
/// deliberate divergence from a register-file bytecode, not an oversight.
use std::rc::Rc;

use bitflags::bitflags;

use crate::object::PropName;
use crate::value::Value;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Op {
    // --- prefix -------------------------------------------------------
    /// Widens the next instruction's operand to 16 bits. Not itself a
    /// "real" instruction — `decode_at` consumes it transparently.
    Wide = 0,

    // --- push family ----------------------------------------------------
    PushUndefined = 1,
    PushNull = 2,
    PushTrue = 3,
    PushFalse = 4,
    PushThis = 5,
    /// Pushes the array-hole / TDZ sentinel onto the stack.
    PushEmpty = 6,
    /// operand: signed 8/16-bit immediate, sign-extended.
    PushSmallInt = 7,
    /// operand: literal-table index.
    PushLiteral = 8,
    Pop = 9,
    Dup = 10,
    Swap = 11,

    // --- property family --------------------------------------------------
    /// stack: [obj, key] -> [value]
    GetProp = 20,
    /// stack: [obj, key, value] -> []
    SetProp = 21,
    /// stack: [obj] -> [value]; operand: literal-table index of the key.
    GetPropLiteral = 22,
    /// stack: [obj, value] -> []; operand: literal-table index of the key.
    SetPropLiteral = 23,
    /// stack: [obj, key] -> [bool]
    DeleteProp = 24,
    /// stack: [obj, key] -> [bool]
    HasProp = 25,
    /// stack: [obj, key, value] -> []. Defines a data property with default
    /// attrs rather than assigning through `[[Set]]`.
    DefineDataProp = 26,
    /// stack: [obj, key, getter, setter] -> []
    DefineAccessorProp = 27,
    /// stack: [] -> [array]; operand: initial dense element count already
    /// sitting below the new array on the stack (consumed in reverse).
    NewFastArray = 28,
    /// stack: [] -> [object]
    NewObject = 29,

    // --- identifier reference family ---------------------------------------
    /// operand: literal-table index of the name. Resolves through the
    /// current lexical environment chain.
    GetVar = 40,
    SetVar = 41,
    /// Declares a binding in the current environment (`var`/function scope).
    DeclareVar = 42,
    /// Declares a `let`/`const` binding, left uninitialized (TDZ) until
    /// `InitVar` runs.
    DeclareLexical = 43,
    InitVar = 44,
    /// stack: [] -> [bool] — whether the named binding exists anywhere on
    /// the chain (used for `typeof` on an unresolved reference).
    HasVar = 45,

    // --- arithmetic / comparison family --------------------------------------
    Add = 60,
    Sub = 61,
    Mul = 62,
    Div = 63,
    Mod = 64,
    Neg = 65,
    Not = 66,
    BitNot = 67,
    BitAnd = 68,
    BitOr = 69,
    BitXor = 70,
    Shl = 71,
    Shr = 72,
    UShr = 73,
    Eq = 74,
    StrictEq = 75,
    Lt = 76,
    Lte = 77,
    Gt = 78,
    Gte = 79,
    InstanceOf = 80,
    In = 81,
    TypeOf = 82,
    ToBoolean = 83,
    ToNumber = 84,

    // --- control flow family ----------------------------------------------
    /// operand: signed branch offset from the start of the *next*
    /// instruction.
    Jump = 100,
    JumpIfFalse = 101,
    JumpIfTrue = 102,
    /// Pops nothing; jumps if TOS is `null`/`undefined` (optional chaining
    /// short-circuit), leaving TOS in place.
    JumpIfNullish = 103,

    // --- call / construct family -------------------------------------------
    /// stack: [callee, this, arg0..argN-1] -> [result]; operand: N.
    Call = 120,
    /// stack: [callee, arg0..argN-1] -> [result]; operand: N.
    Construct = 121,
    Return = 122,

    // --- function / closure creation family -------------------------------
    /// operand: literal-table index of a nested `CompiledCode`. Captures
    /// the current lexical environment as the closure env.
    MakeClosure = 140,

    // --- exception family ---------------------------------------------------
    Throw = 160,
    /// Marks normal completion of a `try` block's protected range reached
    /// its end without an exception; needed so `finally` can tell a normal
    /// fall-through from a `return`/`break` completion that must resume
    /// after the handler runs.
    FinallyEnter = 161,
    FinallyExit = 162,

    // --- generator / async family (partial: cooperative suspend points) -----
    Yield = 180,
    Await = 181,

    // --- extended family -----------------------------------------------------
    /// No-op retained for alignment/patching convenience in the assembler.
    Nop = 255,
}

impl Op {
    pub fn from_u8(b: u8) -> Option<Op> {
        use Op::*;
        Some(match b {
            0 => Wide,
            1 => PushUndefined,
            2 => PushNull,
            3 => PushTrue,
            4 => PushFalse,
            5 => PushThis,
            6 => PushEmpty,
            7 => PushSmallInt,
            8 => PushLiteral,
            9 => Pop,
            10 => Dup,
            11 => Swap,
            20 => GetProp,
            21 => SetProp,
            22 => GetPropLiteral,
            23 => SetPropLiteral,
            24 => DeleteProp,
            25 => HasProp,
            26 => DefineDataProp,
            27 => DefineAccessorProp,
            28 => NewFastArray,
            29 => NewObject,
            40 => GetVar,
            41 => SetVar,
            42 => DeclareVar,
            43 => DeclareLexical,
            44 => InitVar,
            45 => HasVar,
            60 => Add,
            61 => Sub,
            62 => Mul,
            63 => Div,
            64 => Mod,
            65 => Neg,
            66 => Not,
            67 => BitNot,
            68 => BitAnd,
            69 => BitOr,
            70 => BitXor,
            71 => Shl,
            72 => Shr,
            73 => UShr,
            74 => Eq,
            75 => StrictEq,
            76 => Lt,
            77 => Lte,
            78 => Gt,
            79 => Gte,
            80 => InstanceOf,
            81 => In,
            82 => TypeOf,
            83 => ToBoolean,
            84 => ToNumber,
            100 => Jump,
            101 => JumpIfFalse,
            102 => JumpIfTrue,
            103 => JumpIfNullish,
            120 => Call,
            121 => Construct,
            122 => Return,
            140 => MakeClosure,
            160 => Throw,
            161 => FinallyEnter,
            162 => FinallyExit,
            180 => Yield,
            181 => Await,
            255 => Nop,
            _ => return None,
        })
    }

    pub fn operand_shape(self) -> OperandShape {
        use Op::*;
        match self {
            PushSmallInt => OperandShape::I8,
            PushLiteral
            | GetPropLiteral
            | SetPropLiteral
            | GetVar
            | SetVar
            | DeclareVar
            | DeclareLexical
            | InitVar
            | HasVar
            | MakeClosure
            | NewFastArray => OperandShape::WideableIndex,
            Jump | JumpIfFalse | JumpIfTrue | JumpIfNullish => OperandShape::WideableOffset,
            Call | Construct => OperandShape::U8Count,
            _ => OperandShape::None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OperandShape {
    None,
    I8,
    WideableIndex,
    WideableOffset,
    U8Count,
}

#[derive(Clone, Copy, Debug)]
pub struct Instr {
    pub op: Op,
    pub operand: i32,
}

/// Decodes the instruction starting at `ip`. Returns the instruction and the
/// `ip` of the following one. Panics on malformed bytecode (truncated
/// operand, unknown opcode byte) — by the time code reaches the VM it has
/// already passed `loader::validate`, which is where malformed bytecode is
/// expected to be rejected as a catchable `EngineError` instead.
pub fn decode_at(code: &[u8], ip: usize) -> (Instr, usize) {
    let mut pos = ip;
    let mut op = Op::from_u8(code[pos]).expect("decode_at: unknown opcode");
    pos += 1;
    let mut wide = false;
    if op == Op::Wide {
        wide = true;
        op = Op::from_u8(code[pos]).expect("decode_at: unknown opcode after Wide");
        pos += 1;
    }
    let operand = match op.operand_shape() {
        OperandShape::None => 0,
        OperandShape::I8 => {
            if wide {
                let v = i16::from_le_bytes([code[pos], code[pos + 1]]) as i32;
                pos += 2;
                v
            } else {
                let v = code[pos] as i8 as i32;
                pos += 1;
                v
            }
        }
        OperandShape::WideableIndex | OperandShape::U8Count => {
            if wide {
                let v = u16::from_le_bytes([code[pos], code[pos + 1]]) as i32;
                pos += 2;
                v
            } else {
                let v = code[pos] as i32;
                pos += 1;
                v
            }
        }
        OperandShape::WideableOffset => {
            if wide {
                let v = i16::from_le_bytes([code[pos], code[pos + 1]]) as i32;
                pos += 2;
                v
            } else {
                let v = code[pos] as i8 as i32;
                pos += 1;
                v
            }
        }
    };
    (Instr { op, operand }, pos)
}

/// Appends the encoding of `op`/`operand` to `buf`, choosing the 8- or
/// 16-bit operand form (and emitting a `Wide` prefix when needed)
/// automatically. Used by both the assembler and jump-patching.
pub fn emit_instr(buf: &mut Vec<u8>, op: Op, operand: i32) {
    match op.operand_shape() {
        OperandShape::None => buf.push(op as u8),
        OperandShape::I8 => {
            if (-128..=127).contains(&operand) {
                buf.push(op as u8);
                buf.push(operand as i8 as u8);
            } else {
                buf.push(Op::Wide as u8);
                buf.push(op as u8);
                buf.extend_from_slice(&(operand as i16).to_le_bytes());
            }
        }
        OperandShape::WideableIndex | OperandShape::U8Count => {
            if (0..=255).contains(&operand) {
                buf.push(op as u8);
                buf.push(operand as u8);
            } else {
                buf.push(Op::Wide as u8);
                buf.push(op as u8);
                buf.extend_from_slice(&(operand as u16).to_le_bytes());
            }
        }
        OperandShape::WideableOffset => {
            if (-128..=127).contains(&operand) {
                buf.push(op as u8);
                buf.push(operand as i8 as u8);
            } else {
                buf.push(Op::Wide as u8);
                buf.push(op as u8);
                buf.extend_from_slice(&(operand as i16).to_le_bytes());
            }
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct CodeFlags: u16 {
        const STRICT              = 1 << 0;
        const HAS_ARGUMENTS_OBJECT = 1 << 1;
        const LEXICAL_ENV_NEEDED   = 1 << 2;
        const GENERATOR            = 1 << 3;
        const ASYNC                = 1 << 4;
        const ARROW                = 1 << 5;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConstructorKind {
    None,
    Base,
    Derived,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProtectedKind {
    /// Jumps to `handler_ip` with the thrown value pushed for the `catch`
    /// binding. Does not fire on `return`/normal fall-through.
    Catch,
    /// Fires on throw, `return`, or normal fall-through out of the
    /// protected range; the VM pushes a completion record (not a plain
    /// value) that `Op::FinallyExit` re-applies once the handler finishes.
    Finally,
}

/// One entry of a compiled function's exception table: bytecode offsets
/// `[start_ip, end_ip)` are protected by a handler starting at `handler_ip`.
/// A `try`/`catch`/`finally` compiles to *two* overlapping entries rather
/// than one combined kind: a `Catch` range spanning only the `try` body,
/// nested inside a wider `Finally` range that additionally spans the
/// `catch` body. `handler_for` resolves overlap by picking the narrowest
/// (innermost) match, so a throw from the `try` body hits `Catch` first,
/// while a throw from within the `catch` body (outside the narrow range,
/// still inside the wide one) correctly falls through to `Finally` instead
/// of re-entering the same catch handler.
#[derive(Clone, Copy, Debug)]
pub struct ProtectedRange {
    pub start_ip: u32,
    pub end_ip: u32,
    pub handler_ip: u32,
    pub kind: ProtectedKind,
}

/// A compiled function/script body: immutable once built, independently
/// refcounted from the GC heap via `Rc` (see `object::ObjectKind::ScriptedFunction`).
pub struct CompiledCode {
    pub flags: CodeFlags,
    pub constructor_kind: ConstructorKind,
    /// Parameter binding names, in declaration order. `Duplicate` simple
    /// (non-destructuring) parameter names are legal in non-strict
    /// functions — ES5 "last wins" — so callers bind them left to right
    /// and let a later `InitVar`/env write simply overwrite an earlier one
    /// rather than rejecting the duplicate; `CodeFlags::STRICT` functions
    /// reject duplicates earlier, at assembly time.
    pub param_names: Vec<PropName>,
    pub literals: Vec<Value>,
    /// Nested function bodies, indexed by the operand `MakeClosure` refers
    /// to via the *literal table* (a literal entry of kind `Nested(u32)`
    /// would normally exist here; for simplicity nested code objects are
    /// addressed by this parallel table instead of unioning into `literals`).
    pub nested: Vec<Rc<CompiledCode>>,
    pub code: Vec<u8>,
    pub protected_ranges: Vec<ProtectedRange>,
    pub source_name: Option<String>,
    pub line_info: Vec<(u32, u32)>, // (ip, line) pairs, ascending by ip
}

impl CompiledCode {
    pub fn line_for_ip(&self, ip: u32) -> Option<u32> {
        let mut line = None;
        for (at_ip, at_line) in &self.line_info {
            if *at_ip > ip {
                break;
            }
            line = Some(*at_line);
        }
        line
    }

    /// The innermost (narrowest) protected range containing `ip`, if any.
    pub fn handler_for(&self, ip: u32) -> Option<&ProtectedRange> {
        self.protected_ranges
            .iter()
            .filter(|r| ip >= r.start_ip && ip < r.end_ip)
            .min_by_key(|r| r.end_ip - r.start_ip)
    }

    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let mut ip = 0usize;
        while ip < self.code.len() {
            let (instr, next) = decode_at(&self.code, ip);
            out.push_str(&format!("{ip:>6}: {:?} {}\n", instr.op, instr.operand));
            ip = next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_index_roundtrip() {
        let mut buf = Vec::new();
        emit_instr(&mut buf, Op::PushLiteral, 5);
        let (instr, next) = decode_at(&buf, 0);
        assert_eq!(instr.op, Op::PushLiteral);
        assert_eq!(instr.operand, 5);
        assert_eq!(next, buf.len());
        assert_eq!(buf.len(), 2, "narrow form should be opcode + 1 byte");
    }

    #[test]
    fn wide_index_roundtrip() {
        let mut buf = Vec::new();
        emit_instr(&mut buf, Op::PushLiteral, 4000);
        assert_eq!(buf[0], Op::Wide as u8);
        let (instr, _) = decode_at(&buf, 0);
        assert_eq!(instr.operand, 4000);
    }

    #[test]
    fn negative_branch_offset_roundtrip() {
        let mut buf = Vec::new();
        emit_instr(&mut buf, Op::Jump, -40);
        let (instr, _) = decode_at(&buf, 0);
        assert_eq!(instr.op, Op::Jump);
        assert_eq!(instr.operand, -40);
    }

    #[test]
    fn wide_branch_offset_roundtrip() {
        let mut buf = Vec::new();
        emit_instr(&mut buf, Op::Jump, 1000);
        let (instr, _) = decode_at(&buf, 0);
        assert_eq!(instr.operand, 1000);
    }

    #[test]
    fn protected_range_lookup() {
        let code = CompiledCode {
            flags: CodeFlags::empty(),
            constructor_kind: ConstructorKind::None,
            param_names: vec![],
            literals: vec![],
            nested: vec![],
            code: vec![],
            protected_ranges: vec![
                ProtectedRange { start_ip: 10, end_ip: 20, handler_ip: 30, kind: ProtectedKind::Catch },
                ProtectedRange { start_ip: 10, end_ip: 25, handler_ip: 35, kind: ProtectedKind::Finally },
            ],
            source_name: None,
            line_info: vec![],
        };
        assert_eq!(code.handler_for(15).unwrap().kind, ProtectedKind::Catch);
        assert_eq!(code.handler_for(22).unwrap().kind, ProtectedKind::Finally);
        assert!(code.handler_for(25).is_none());
    }
}
