/// Bytecode assembler
///
/// There is no lexer or grammar in this crate (spec.md's parser/lexer is
/// explicitly out of scope) so something still has to hand well-formed
/// `CompiledCode` to the VM: `CompiledCodeBuilder` is a programmatic
/// equivalent of the teacher's `Proto::emit`/`emit_jump`/`patch_jump`
/// builder methods, minus any notion of source text. Tests and the CLI
/// demo use it directly; a future front-end would target the same builder.
use std::rc::Rc;

use crate::bytecode::{CodeFlags, CompiledCode, ConstructorKind, Op, ProtectedKind, ProtectedRange, emit_instr};
use crate::object::PropName;
use crate::value::Value;

pub struct CompiledCodeBuilder {
    flags: CodeFlags,
    constructor_kind: ConstructorKind,
    param_names: Vec<PropName>,
    literals: Vec<Value>,
    nested: Vec<Rc<CompiledCode>>,
    code: Vec<u8>,
    protected_ranges: Vec<ProtectedRange>,
    source_name: Option<String>,
    line_info: Vec<(u32, u32)>,
}

impl Default for CompiledCodeBuilder {
    fn default() -> Self {
        CompiledCodeBuilder {
            flags: CodeFlags::empty(),
            constructor_kind: ConstructorKind::None,
            param_names: Vec::new(),
            literals: Vec::new(),
            nested: Vec::new(),
            code: Vec::new(),
            protected_ranges: Vec::new(),
            source_name: None,
            line_info: Vec::new(),
        }
    }
}

impl CompiledCodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict(mut self) -> Self {
        self.flags.insert(CodeFlags::STRICT);
        self
    }

    pub fn arrow(mut self) -> Self {
        self.flags.insert(CodeFlags::ARROW);
        self
    }

    pub fn generator(mut self) -> Self {
        self.flags.insert(CodeFlags::GENERATOR);
        self
    }

    pub fn async_fn(mut self) -> Self {
        self.flags.insert(CodeFlags::ASYNC);
        self
    }

    pub fn needs_arguments_object(mut self) -> Self {
        self.flags.insert(CodeFlags::HAS_ARGUMENTS_OBJECT);
        self
    }

    pub fn constructor_kind(mut self, kind: ConstructorKind) -> Self {
        self.constructor_kind = kind;
        self
    }

    pub fn source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = Some(name.into());
        self
    }

    /// Declares one more simple-parameter-list binding, in left-to-right
    /// order. Duplicate names are the caller's responsibility to reject
    /// when `strict()` was set — this builder does not re-derive that rule.
    pub fn param(mut self, name: PropName) -> Self {
        self.param_names.push(name);
        self
    }

    pub fn push_literal(&mut self, v: Value) -> u32 {
        let idx = self.literals.len() as u32;
        self.literals.push(v);
        idx
    }

    pub fn push_nested(&mut self, code: Rc<CompiledCode>) -> u32 {
        let idx = self.nested.len() as u32;
        self.nested.push(code);
        idx
    }

    /// Current write position, usable as a jump target for a backward
    /// branch (`emit(Op::Jump, (here - next_ip_of_jump) as i32)`).
    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    pub fn emit(&mut self, op: Op, operand: i32) -> u32 {
        let ip = self.code.len() as u32;
        emit_instr(&mut self.code, op, operand);
        ip
    }

    /// Emits a forward jump with a reserved 16-bit operand (always the wide
    /// form, so `patch_jump` can rewrite it once the target is known without
    /// shifting every later instruction's offset). Returns the site to pass
    /// to `patch_jump`.
    pub fn emit_jump(&mut self, op: Op) -> usize {
        let site = self.code.len();
        self.code.push(Op::Wide as u8);
        self.code.push(op as u8);
        self.code.extend_from_slice(&0i16.to_le_bytes());
        site
    }

    /// Patches a placeholder from `emit_jump` to target the builder's
    /// current write position.
    pub fn patch_jump(&mut self, site: usize) {
        let next_ip = (site + 4) as i64; // Wide + op + 2-byte operand
        let target = self.code.len() as i64;
        let offset = (target - next_ip) as i16;
        self.code[site + 2..site + 4].copy_from_slice(&offset.to_le_bytes());
    }

    pub fn protected_range(&mut self, start_ip: u32, end_ip: u32, handler_ip: u32, kind: ProtectedKind) {
        self.protected_ranges.push(ProtectedRange { start_ip, end_ip, handler_ip, kind });
    }

    pub fn line(&mut self, line: u32) {
        self.line_info.push((self.here(), line));
    }

    pub fn build(self) -> CompiledCode {
        CompiledCode {
            flags: self.flags,
            constructor_kind: self.constructor_kind,
            param_names: self.param_names,
            literals: self.literals,
            nested: self.nested,
            code: self.code,
            protected_ranges: self.protected_ranges,
            source_name: self.source_name,
            line_info: self.line_info,
        }
    }
}

/// Packs a `DeclareLexical` operand: bit 15 selects `const` (immutable)
/// over `let`, the low 15 bits index the literal table entry holding the
/// binding's name. `bytecode::emit_instr`'s existing narrow/wide operand
/// selection handles the resulting value transparently — setting bit 15
/// always forces the wide (16-bit) encoding.
pub fn declare_lexical_operand(immutable: bool, literal_idx: u32) -> i32 {
    debug_assert!(literal_idx < 0x8000, "literal index does not fit in DeclareLexical's 15-bit field");
    let flag = if immutable { 0x8000 } else { 0 };
    (literal_idx as i32) | flag
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::MagicStr;

    #[test]
    fn builds_simple_arithmetic_program() {
        let mut b = CompiledCodeBuilder::new();
        b.emit(Op::PushSmallInt, 1);
        b.emit(Op::PushSmallInt, 2);
        b.emit(Op::Add, 0);
        b.emit(Op::Return, 0);
        let code = b.build();
        assert_eq!(code.code.len(), 6); // two 2-byte PushSmallInt + 1-byte Add + 1-byte Return
        let (instr, _) = crate::bytecode::decode_at(&code.code, 0);
        assert_eq!(instr.op, Op::PushSmallInt);
    }

    #[test]
    fn forward_jump_patches_to_current_position() {
        let mut b = CompiledCodeBuilder::new();
        let site = b.emit_jump(Op::Jump);
        b.emit(Op::PushUndefined, 0);
        let landing = b.here();
        b.patch_jump(site);
        let code = b.build();
        let (instr, next) = crate::bytecode::decode_at(&code.code, 0);
        assert_eq!(instr.op, Op::Jump);
        assert_eq!((next as i64 + instr.operand as i64) as u32, landing);
    }

    #[test]
    fn declare_lexical_operand_encodes_const_flag() {
        let let_operand = declare_lexical_operand(false, 3);
        let const_operand = declare_lexical_operand(true, 3);
        assert_eq!(let_operand, 3);
        assert_eq!(const_operand, 3 | 0x8000);
    }

    #[test]
    fn builder_accumulates_literals_and_params() {
        let mut b = CompiledCodeBuilder::new().param(PropName::Magic(MagicStr(9)));
        let idx = b.push_literal(Value::from_small_int(42));
        let code = b.build();
        assert_eq!(idx, 0);
        assert_eq!(code.literals.len(), 1);
        assert_eq!(code.param_names.len(), 1);
    }
}
