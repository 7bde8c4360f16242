//! Builder for emitting bytecode during compilation.
//!
//! `CodeBuilder` encodes opcodes and operands, interns strings into the pool,
//! tracks the operand stack depth and resolves forward references: jumps and block
//! addresses through [`JumpLabel`]s, function addresses through fixups resolved
//! when the function body is placed.

use std::fmt;

use ahash::AHashMap;
use indexmap::IndexSet;

use super::op::{Event, NONE_U16, NONE_U32, Opcode, Prop};
use crate::{
    expressions::{FuncId, NodeKind},
    intrinsics::Intrinsic,
};

/// Invariant violations detected while emitting code. Any of these means the
/// compiler produced inconsistent output; nothing is ever emitted with one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    /// A forward address was never patched.
    UnpatchedJump { offset: usize },
    /// A call or closure refers to a function whose body was never placed.
    UndefinedFunction(FuncId),
    /// More values popped than pushed.
    StackUnderflow { offset: usize },
    /// Two control-flow paths meet with different stack depths.
    StackMismatch { offset: usize, expected: u16, found: u16 },
    /// More than 65535 distinct strings.
    PoolOverflow,
    /// Instruction stream larger than the 32-bit address space.
    CodeTooLarge,
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnpatchedJump { offset } => write!(f, "unpatched jump operand at offset {offset}"),
            Self::UndefinedFunction(id) => write!(f, "function {id} referenced but never emitted"),
            Self::StackUnderflow { offset } => write!(f, "operand stack underflow at offset {offset}"),
            Self::StackMismatch {
                offset,
                expected,
                found,
            } => write!(
                f,
                "stack depth mismatch at offset {offset}: expected {expected}, found {found}"
            ),
            Self::PoolOverflow => f.write_str("string pool exceeds 65535 entries"),
            Self::CodeTooLarge => f.write_str("instruction stream exceeds 4 GiB"),
        }
    }
}

impl std::error::Error for CodeError {}

/// Offset of an address operand waiting to be patched.
#[derive(Debug, PartialEq, Eq, Hash)]
#[must_use = "a jump label must be patched"]
pub struct JumpLabel(usize);

/// Output of the builder: the string pool and the instruction stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Code {
    pub pool: Vec<String>,
    pub code: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct CodeBuilder {
    code: Vec<u8>,
    pool: IndexSet<String, ahash::RandomState>,
    /// Address operands still holding a placeholder.
    unpatched: IndexSet<usize, ahash::RandomState>,
    /// Placed function bodies.
    functions: AHashMap<FuncId, u32>,
    /// Operand offsets waiting for a function address.
    fixups: Vec<(usize, FuncId)>,
    stack_depth: u16,
    max_stack_depth: u16,
    /// First invariant violation, reported by `build`.
    error: Option<CodeError>,
}

impl CodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current end of the instruction stream.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    /// Interns a string into the pool, returning its index.
    pub fn intern(&mut self, s: &str) -> u16 {
        let index = match self.pool.get_index_of(s) {
            Some(index) => index,
            None => self.pool.insert_full(s.to_owned()).0,
        };
        u16::try_from(index)
            .ok()
            .filter(|i| *i != NONE_U16)
            .unwrap_or_else(|| {
                self.fail(CodeError::PoolOverflow);
                NONE_U16
            })
    }

    /// Emits a no-operand instruction.
    pub fn emit(&mut self, op: Opcode) {
        self.code.push(op as u8);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an instruction with a u16 operand (identifier or pool index).
    pub fn emit_u16(&mut self, op: Opcode, operand: u16) {
        self.code.push(op as u8);
        self.code.extend_from_slice(&operand.to_le_bytes());
        let effect = match op {
            Opcode::BuildList => 1 - operand.cast_signed(),
            Opcode::BuildMap => 1 - 2 * operand.cast_signed(),
            _ => op.stack_effect().unwrap_or(0),
        };
        self.adjust_stack(effect);
    }

    /// Emits `PUSH_NUM`.
    pub fn emit_num(&mut self, value: f64) {
        self.code.push(Opcode::PushNum as u8);
        self.code.extend_from_slice(&value.to_le_bytes());
        self.adjust_stack(1);
    }

    /// Emits `PUSH_STR` for an interned string.
    pub fn emit_str(&mut self, value: &str) {
        let id = self.intern(value);
        self.emit_u16(Opcode::PushStr, id);
    }

    /// Emits an instruction naming an identifier, interning the name.
    pub fn emit_name(&mut self, op: Opcode, name: &str) {
        let id = self.intern(name);
        self.emit_u16(op, id);
    }

    pub fn emit_call_intrinsic(&mut self, intrinsic: Intrinsic, argc: u8) {
        self.code.push(Opcode::CallIntrinsic as u8);
        self.code.push(intrinsic as u8);
        self.code.push(argc);
        self.adjust_stack(1 - i16::from(argc));
    }

    /// Emits `CALL` to a function placed now or later.
    pub fn emit_call(&mut self, function: FuncId, argc: u8) {
        self.code.push(Opcode::Call as u8);
        self.emit_function_address(function);
        self.code.push(argc);
        self.adjust_stack(1 - i16::from(argc));
    }

    /// `CALL_VALUE`: pops the callee and `argc` arguments, pushes the result.
    pub fn emit_call_value(&mut self, argc: u8) {
        self.code.push(Opcode::CallValue as u8);
        self.code.push(argc);
        self.adjust_stack(-i16::from(argc));
    }

    /// Emits `MAKE_CLOSURE` over `captures` values already on the stack.
    pub fn emit_make_closure(&mut self, function: FuncId, captures: u8) {
        self.code.push(Opcode::MakeClosure as u8);
        self.emit_function_address(function);
        self.code.push(captures);
        self.adjust_stack(1 - i16::from(captures));
    }

    pub fn emit_remote_call(&mut self, name: &str, argc: u8, target: Option<&str>) {
        let name = self.intern(name);
        let target = target.map_or(NONE_U16, |t| self.intern(t));
        self.code.push(Opcode::RemoteCall as u8);
        self.code.extend_from_slice(&name.to_le_bytes());
        self.code.push(argc);
        self.code.extend_from_slice(&target.to_le_bytes());
        self.adjust_stack(1 - i16::from(argc));
    }

    pub fn emit_create_node(&mut self, kind: NodeKind, class: Option<&str>) {
        let class = class.map_or(NONE_U16, |c| self.intern(c));
        self.code.push(Opcode::CreateNode as u8);
        self.code.push(kind as u8);
        self.code.extend_from_slice(&class.to_le_bytes());
        self.adjust_stack(1);
    }

    pub fn emit_set_prop(&mut self, prop: Prop) {
        self.code.push(Opcode::SetProp as u8);
        self.code.push(prop as u8);
        self.adjust_stack(-1);
    }

    pub fn emit_on_event(&mut self, event: Event) {
        self.code.push(Opcode::OnEvent as u8);
        self.code.push(event as u8);
        self.adjust_stack(-1);
    }

    /// Emits `BIND_PROP` with its sub-range address left open.
    pub fn emit_bind_prop(&mut self, prop: Prop) -> JumpLabel {
        self.code.push(Opcode::BindProp as u8);
        self.code.push(prop as u8);
        self.placeholder_u32()
    }

    /// Emits a `JUMP` / `JUMP_IF_FALSE` whose target is patched later.
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        self.code.push(op as u8);
        let label = self.placeholder_u32();
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
        label
    }

    /// Emits a jump to an already known offset.
    pub fn emit_jump_to(&mut self, op: Opcode, target: usize) {
        self.code.push(op as u8);
        let target = self.address(target);
        self.code.extend_from_slice(&target.to_le_bytes());
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits `IF_BLOCK`, returning the labels of the then and else addresses.
    pub fn emit_if_block(&mut self, signal: &str) -> (JumpLabel, JumpLabel) {
        let signal = self.intern(signal);
        self.code.push(Opcode::IfBlock as u8);
        self.code.extend_from_slice(&signal.to_le_bytes());
        let then = self.placeholder_u32();
        let orelse = self.placeholder_u32();
        (then, orelse)
    }

    /// Emits `FOR_BLOCK`, returning the label of the template address.
    pub fn emit_for_block(&mut self, list: &str, item: &str) -> JumpLabel {
        let list = self.intern(list);
        let item = self.intern(item);
        self.code.push(Opcode::ForBlock as u8);
        self.code.extend_from_slice(&list.to_le_bytes());
        self.code.extend_from_slice(&item.to_le_bytes());
        self.placeholder_u32()
    }

    /// Points `label` at the current offset.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.address(self.code.len());
        self.write_u32(label, target);
    }

    /// Fills `label` with the "no address" marker.
    pub fn patch_none(&mut self, label: JumpLabel) {
        self.write_u32(label, NONE_U32);
    }

    /// Records that the body of `function` starts at the current offset.
    pub fn place_function(&mut self, function: FuncId) {
        let address = self.address(self.code.len());
        self.functions.insert(function, address);
    }

    #[must_use]
    pub fn stack_depth(&self) -> u16 {
        self.stack_depth
    }

    #[must_use]
    pub fn max_stack_depth(&self) -> u16 {
        self.max_stack_depth
    }

    /// Sets the tracked depth, used when starting a sub-range that runs on a fresh stack.
    pub fn set_stack_depth(&mut self, depth: u16) {
        self.stack_depth = depth;
        self.max_stack_depth = self.max_stack_depth.max(depth);
    }

    /// Records a mismatch unless the tracked depth equals `expected`.
    pub fn expect_stack_depth(&mut self, expected: u16) {
        if self.stack_depth != expected {
            self.fail(CodeError::StackMismatch {
                offset: self.code.len(),
                expected,
                found: self.stack_depth,
            });
        }
    }

    /// Finishes the stream, resolving function addresses and checking that every
    /// label was patched.
    pub fn build(mut self) -> Result<Code, CodeError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        if let Some(&offset) = self.unpatched.first() {
            return Err(CodeError::UnpatchedJump { offset });
        }
        for (offset, function) in std::mem::take(&mut self.fixups) {
            let address = *self
                .functions
                .get(&function)
                .ok_or(CodeError::UndefinedFunction(function))?;
            self.code[offset..offset + 4].copy_from_slice(&address.to_le_bytes());
        }
        Ok(Code {
            pool: self.pool.into_iter().collect(),
            code: self.code,
        })
    }

    fn emit_function_address(&mut self, function: FuncId) {
        let offset = self.code.len();
        self.code.extend_from_slice(&NONE_U32.to_le_bytes());
        self.fixups.push((offset, function));
    }

    fn placeholder_u32(&mut self) -> JumpLabel {
        let offset = self.code.len();
        self.code.extend_from_slice(&NONE_U32.to_le_bytes());
        self.unpatched.insert(offset);
        JumpLabel(offset)
    }

    fn write_u32(&mut self, label: JumpLabel, value: u32) {
        let JumpLabel(offset) = label;
        self.unpatched.shift_remove(&offset);
        self.code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn address(&mut self, offset: usize) -> u32 {
        u32::try_from(offset)
            .ok()
            .filter(|a| *a != NONE_U32)
            .unwrap_or_else(|| {
                self.fail(CodeError::CodeTooLarge);
                NONE_U32
            })
    }

    fn adjust_stack(&mut self, delta: i16) {
        let depth = i32::from(self.stack_depth) + i32::from(delta);
        if depth < 0 {
            self.fail(CodeError::StackUnderflow {
                offset: self.code.len(),
            });
        }
        self.stack_depth = u16::try_from(depth.max(0)).unwrap_or(u16::MAX);
        self.max_stack_depth = self.max_stack_depth.max(self.stack_depth);
    }

    fn fail(&mut self, error: CodeError) {
        self.error.get_or_insert(error);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn forward_jump_is_absolute() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::PushTrue);
        let jump = builder.emit_jump(Opcode::JumpIfFalse);
        builder.emit(Opcode::PushNone);
        builder.emit(Opcode::Pop);
        builder.patch_jump(jump);
        builder.emit(Opcode::Halt);
        let code = builder.build().unwrap();
        assert_eq!(
            code.code,
            vec![
                Opcode::PushTrue as u8,
                Opcode::JumpIfFalse as u8,
                8,
                0,
                0,
                0,
                Opcode::PushNone as u8,
                Opcode::Pop as u8,
                Opcode::Halt as u8,
            ]
        );
    }

    #[test]
    fn unpatched_label_is_an_error() {
        let mut builder = CodeBuilder::new();
        let (then, orelse) = builder.emit_if_block("flag");
        builder.patch_jump(then);
        drop(orelse);
        assert_eq!(builder.build(), Err(CodeError::UnpatchedJump { offset: 7 }));
    }

    #[test]
    fn pool_deduplicates() {
        let mut builder = CodeBuilder::new();
        assert_eq!(builder.intern("count"), 0);
        assert_eq!(builder.intern("label"), 1);
        assert_eq!(builder.intern("count"), 0);
        builder.emit_str("label");
        let code = builder.build().unwrap();
        assert_eq!(code.pool, vec!["count".to_owned(), "label".to_owned()]);
    }

    #[test]
    fn function_addresses_are_fixed_up() {
        let mut builder = CodeBuilder::new();
        builder.emit_call(FuncId(0), 0);
        builder.emit(Opcode::Pop);
        builder.emit(Opcode::Halt);
        builder.place_function(FuncId(0));
        builder.emit(Opcode::PushNone);
        builder.emit(Opcode::Return);
        let code = builder.build().unwrap();
        assert_eq!(&code.code[1..5], &8u32.to_le_bytes());
    }

    #[test]
    fn stack_errors_are_recorded() {
        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::Pop);
        assert_eq!(builder.build(), Err(CodeError::StackUnderflow { offset: 1 }));

        let mut builder = CodeBuilder::new();
        builder.emit(Opcode::PushNone);
        builder.expect_stack_depth(0);
        assert!(matches!(builder.build(), Err(CodeError::StackMismatch { expected: 0, found: 1, .. })));
    }
}
