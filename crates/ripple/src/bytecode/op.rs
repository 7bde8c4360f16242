//! Opcodes and decoded instructions.
//!
//! Every instruction is a one-byte opcode followed by fixed-width little-endian
//! operands. [`Instruction::decode`] is the single place that knows the operand
//! layout; the VM, the load-time verifier and the disassembler all go through it.

use std::fmt;

use crate::{expressions::NodeKind, intrinsics::Intrinsic};

/// Operand value meaning "no identifier" / "no class".
pub const NONE_U16: u16 = u16::MAX;
/// Operand value meaning "no address".
pub const NONE_U32: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Opcode {
    Halt = 0,
    PushNum,
    PushStr,
    PushTrue,
    PushFalse,
    PushNone,
    BuildList,
    BuildMap,
    GetItem,
    Pop,
    LoadVar,
    StoreVar,
    LoadSig,
    StoreSig,
    InitSig,
    InitComputed,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Jump,
    JumpIfFalse,
    Call,
    CallValue,
    CallIntrinsic,
    MakeClosure,
    Return,
    RemoteCall,
    CreateNode,
    SetProp,
    BindProp,
    BindValue,
    OnEvent,
    EnterNode,
    ExitNode,
    IfBlock,
    ForBlock,
    BlockEnd,
}

impl Opcode {
    /// Total size of the operands following the opcode byte.
    #[must_use]
    pub fn operand_size(self) -> usize {
        match self {
            Self::PushNum => 8,
            Self::PushStr
            | Self::BuildList
            | Self::BuildMap
            | Self::LoadVar
            | Self::StoreVar
            | Self::LoadSig
            | Self::StoreSig
            | Self::InitSig
            | Self::InitComputed
            | Self::BindValue => 2,
            Self::Jump | Self::JumpIfFalse => 4,
            Self::Call | Self::MakeClosure => 5,
            Self::CallValue | Self::SetProp | Self::OnEvent => 1,
            Self::CallIntrinsic => 2,
            Self::RemoteCall => 5,
            Self::CreateNode => 3,
            Self::BindProp => 5,
            Self::IfBlock => 10,
            Self::ForBlock => 8,
            _ => 0,
        }
    }

    /// Fixed stack effect, or `None` when it depends on an operand.
    #[must_use]
    pub fn stack_effect(self) -> Option<i16> {
        let effect = match self {
            Self::PushNum
            | Self::PushStr
            | Self::PushTrue
            | Self::PushFalse
            | Self::PushNone
            | Self::LoadVar
            | Self::LoadSig
            | Self::CreateNode => 1,
            Self::GetItem
            | Self::Pop
            | Self::StoreVar
            | Self::StoreSig
            | Self::InitSig
            | Self::InitComputed
            | Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Mod
            | Self::Eq
            | Self::Ne
            | Self::Lt
            | Self::Le
            | Self::Gt
            | Self::Ge
            | Self::And
            | Self::Or
            | Self::JumpIfFalse
            | Self::SetProp
            | Self::OnEvent
            | Self::EnterNode
            | Self::Return => -1,
            Self::BuildList
            | Self::BuildMap
            | Self::Call
            | Self::CallValue
            | Self::CallIntrinsic
            | Self::MakeClosure
            | Self::RemoteCall => return None,
            _ => 0,
        };
        Some(effect)
    }
}

/// Node property set by `SET_PROP` / `BIND_PROP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Prop {
    Text = 0,
    Placeholder = 1,
    Value = 2,
}

/// Node event handled by `ON_EVENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum Event {
    Click = 0,
    Input = 1,
}

impl Event {
    /// Number of arguments the handler receives.
    #[must_use]
    pub fn handler_arity(self) -> usize {
        match self {
            Self::Click => 0,
            Self::Input => 1,
        }
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    Halt,
    PushNum(f64),
    PushStr(u16),
    PushTrue,
    PushFalse,
    PushNone,
    BuildList(u16),
    BuildMap(u16),
    GetItem,
    Pop,
    LoadVar(u16),
    StoreVar(u16),
    LoadSig(u16),
    StoreSig(u16),
    InitSig(u16),
    InitComputed(u16),
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Jump(u32),
    JumpIfFalse(u32),
    Call { addr: u32, argc: u8 },
    CallValue { argc: u8 },
    CallIntrinsic { intrinsic: Intrinsic, argc: u8 },
    MakeClosure { addr: u32, captures: u8 },
    Return,
    RemoteCall { name: u16, argc: u8, target: Option<u16> },
    CreateNode { kind: NodeKind, class: Option<u16> },
    SetProp(Prop),
    BindProp { prop: Prop, addr: u32 },
    BindValue(u16),
    OnEvent(Event),
    EnterNode,
    ExitNode,
    IfBlock { signal: u16, then: u32, orelse: Option<u32> },
    ForBlock { list: u16, item: u16, template: u32 },
    BlockEnd,
}

/// Why an instruction could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    OutOfBounds(usize),
    UnknownOpcode(u8),
    Truncated(Opcode),
    BadOperand(Opcode, u32),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds(ip) => write!(f, "offset {ip} is past the end of the code"),
            Self::UnknownOpcode(byte) => write!(f, "unknown opcode 0x{byte:02x}"),
            Self::Truncated(op) => write!(f, "truncated operands for {op}"),
            Self::BadOperand(op, value) => write!(f, "operand {value} out of range for {op}"),
        }
    }
}

/// Little-endian operand cursor.
struct Operands<'a> {
    bytes: &'a [u8],
}

impl Operands<'_> {
    fn u8(&mut self) -> u8 {
        let (first, rest) = self.bytes.split_at(1);
        self.bytes = rest;
        first[0]
    }

    fn u16(&mut self) -> u16 {
        let (head, rest) = self.bytes.split_at(2);
        self.bytes = rest;
        u16::from_le_bytes([head[0], head[1]])
    }

    fn u32(&mut self) -> u32 {
        let (head, rest) = self.bytes.split_at(4);
        self.bytes = rest;
        u32::from_le_bytes([head[0], head[1], head[2], head[3]])
    }

    fn f64(&mut self) -> f64 {
        let (head, rest) = self.bytes.split_at(8);
        self.bytes = rest;
        let mut raw = [0; 8];
        raw.copy_from_slice(head);
        f64::from_le_bytes(raw)
    }

    fn opt_u16(&mut self) -> Option<u16> {
        Some(self.u16()).filter(|v| *v != NONE_U16)
    }

    fn opt_u32(&mut self) -> Option<u32> {
        Some(self.u32()).filter(|v| *v != NONE_U32)
    }
}

impl Instruction {
    /// Decodes the instruction at `ip`, returning it with the offset of the next one.
    pub fn decode(code: &[u8], ip: usize) -> Result<(Self, usize), DecodeError> {
        let Some(&byte) = code.get(ip) else {
            return Err(DecodeError::OutOfBounds(ip));
        };
        let op = Opcode::from_repr(byte).ok_or(DecodeError::UnknownOpcode(byte))?;
        let start = ip + 1;
        let end = start + op.operand_size();
        let bytes = code.get(start..end).ok_or(DecodeError::Truncated(op))?;
        let mut r = Operands { bytes };
        let instruction = match op {
            Opcode::Halt => Self::Halt,
            Opcode::PushNum => Self::PushNum(r.f64()),
            Opcode::PushStr => Self::PushStr(r.u16()),
            Opcode::PushTrue => Self::PushTrue,
            Opcode::PushFalse => Self::PushFalse,
            Opcode::PushNone => Self::PushNone,
            Opcode::BuildList => Self::BuildList(r.u16()),
            Opcode::BuildMap => Self::BuildMap(r.u16()),
            Opcode::GetItem => Self::GetItem,
            Opcode::Pop => Self::Pop,
            Opcode::LoadVar => Self::LoadVar(r.u16()),
            Opcode::StoreVar => Self::StoreVar(r.u16()),
            Opcode::LoadSig => Self::LoadSig(r.u16()),
            Opcode::StoreSig => Self::StoreSig(r.u16()),
            Opcode::InitSig => Self::InitSig(r.u16()),
            Opcode::InitComputed => Self::InitComputed(r.u16()),
            Opcode::Add => Self::Add,
            Opcode::Sub => Self::Sub,
            Opcode::Mul => Self::Mul,
            Opcode::Div => Self::Div,
            Opcode::Mod => Self::Mod,
            Opcode::Neg => Self::Neg,
            Opcode::Not => Self::Not,
            Opcode::Eq => Self::Eq,
            Opcode::Ne => Self::Ne,
            Opcode::Lt => Self::Lt,
            Opcode::Le => Self::Le,
            Opcode::Gt => Self::Gt,
            Opcode::Ge => Self::Ge,
            Opcode::And => Self::And,
            Opcode::Or => Self::Or,
            Opcode::Jump => Self::Jump(r.u32()),
            Opcode::JumpIfFalse => Self::JumpIfFalse(r.u32()),
            Opcode::Call => Self::Call {
                addr: r.u32(),
                argc: r.u8(),
            },
            Opcode::CallValue => Self::CallValue { argc: r.u8() },
            Opcode::CallIntrinsic => {
                let id = r.u8();
                let intrinsic = Intrinsic::from_repr(id).ok_or(DecodeError::BadOperand(op, u32::from(id)))?;
                Self::CallIntrinsic {
                    intrinsic,
                    argc: r.u8(),
                }
            }
            Opcode::MakeClosure => Self::MakeClosure {
                addr: r.u32(),
                captures: r.u8(),
            },
            Opcode::Return => Self::Return,
            Opcode::RemoteCall => Self::RemoteCall {
                name: r.u16(),
                argc: r.u8(),
                target: r.opt_u16(),
            },
            Opcode::CreateNode => {
                let id = r.u8();
                let kind = NodeKind::from_repr(id)
                    .filter(|kind| kind.is_constructible())
                    .ok_or(DecodeError::BadOperand(op, u32::from(id)))?;
                Self::CreateNode {
                    kind,
                    class: r.opt_u16(),
                }
            }
            Opcode::SetProp => {
                let id = r.u8();
                Self::SetProp(Prop::from_repr(id).ok_or(DecodeError::BadOperand(op, u32::from(id)))?)
            }
            Opcode::BindProp => {
                let id = r.u8();
                Self::BindProp {
                    prop: Prop::from_repr(id).ok_or(DecodeError::BadOperand(op, u32::from(id)))?,
                    addr: r.u32(),
                }
            }
            Opcode::BindValue => Self::BindValue(r.u16()),
            Opcode::OnEvent => {
                let id = r.u8();
                Self::OnEvent(Event::from_repr(id).ok_or(DecodeError::BadOperand(op, u32::from(id)))?)
            }
            Opcode::EnterNode => Self::EnterNode,
            Opcode::ExitNode => Self::ExitNode,
            Opcode::IfBlock => Self::IfBlock {
                signal: r.u16(),
                then: r.u32(),
                orelse: r.opt_u32(),
            },
            Opcode::ForBlock => Self::ForBlock {
                list: r.u16(),
                item: r.u16(),
                template: r.u32(),
            },
            Opcode::BlockEnd => Self::BlockEnd,
        };
        Ok((instruction, end))
    }

    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Halt => Opcode::Halt,
            Self::PushNum(_) => Opcode::PushNum,
            Self::PushStr(_) => Opcode::PushStr,
            Self::PushTrue => Opcode::PushTrue,
            Self::PushFalse => Opcode::PushFalse,
            Self::PushNone => Opcode::PushNone,
            Self::BuildList(_) => Opcode::BuildList,
            Self::BuildMap(_) => Opcode::BuildMap,
            Self::GetItem => Opcode::GetItem,
            Self::Pop => Opcode::Pop,
            Self::LoadVar(_) => Opcode::LoadVar,
            Self::StoreVar(_) => Opcode::StoreVar,
            Self::LoadSig(_) => Opcode::LoadSig,
            Self::StoreSig(_) => Opcode::StoreSig,
            Self::InitSig(_) => Opcode::InitSig,
            Self::InitComputed(_) => Opcode::InitComputed,
            Self::Add => Opcode::Add,
            Self::Sub => Opcode::Sub,
            Self::Mul => Opcode::Mul,
            Self::Div => Opcode::Div,
            Self::Mod => Opcode::Mod,
            Self::Neg => Opcode::Neg,
            Self::Not => Opcode::Not,
            Self::Eq => Opcode::Eq,
            Self::Ne => Opcode::Ne,
            Self::Lt => Opcode::Lt,
            Self::Le => Opcode::Le,
            Self::Gt => Opcode::Gt,
            Self::Ge => Opcode::Ge,
            Self::And => Opcode::And,
            Self::Or => Opcode::Or,
            Self::Jump(_) => Opcode::Jump,
            Self::JumpIfFalse(_) => Opcode::JumpIfFalse,
            Self::Call { .. } => Opcode::Call,
            Self::CallValue { .. } => Opcode::CallValue,
            Self::CallIntrinsic { .. } => Opcode::CallIntrinsic,
            Self::MakeClosure { .. } => Opcode::MakeClosure,
            Self::Return => Opcode::Return,
            Self::RemoteCall { .. } => Opcode::RemoteCall,
            Self::CreateNode { .. } => Opcode::CreateNode,
            Self::SetProp(_) => Opcode::SetProp,
            Self::BindProp { .. } => Opcode::BindProp,
            Self::BindValue(_) => Opcode::BindValue,
            Self::OnEvent(_) => Opcode::OnEvent,
            Self::EnterNode => Opcode::EnterNode,
            Self::ExitNode => Opcode::ExitNode,
            Self::IfBlock { .. } => Opcode::IfBlock,
            Self::ForBlock { .. } => Opcode::ForBlock,
            Self::BlockEnd => Opcode::BlockEnd,
        }
    }

    /// Code addresses this instruction refers to.
    #[must_use]
    pub fn targets(&self) -> Vec<u32> {
        match *self {
            Self::Jump(addr)
            | Self::JumpIfFalse(addr)
            | Self::Call { addr, .. }
            | Self::MakeClosure { addr, .. }
            | Self::BindProp { addr, .. } => vec![addr],
            Self::IfBlock { then, orelse, .. } => std::iter::once(then).chain(orelse).collect(),
            Self::ForBlock { template, .. } => vec![template],
            _ => Vec::new(),
        }
    }

    /// String pool indices this instruction refers to.
    #[must_use]
    pub fn pool_refs(&self) -> Vec<u16> {
        match *self {
            Self::PushStr(id)
            | Self::LoadVar(id)
            | Self::StoreVar(id)
            | Self::LoadSig(id)
            | Self::StoreSig(id)
            | Self::InitSig(id)
            | Self::InitComputed(id)
            | Self::BindValue(id)
            | Self::IfBlock { signal: id, .. } => vec![id],
            Self::RemoteCall { name, target, .. } => std::iter::once(name).chain(target).collect(),
            Self::CreateNode { class, .. } => class.into_iter().collect(),
            Self::ForBlock { list, item, .. } => vec![list, item],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_sizes_match_decoding() {
        let code = [
            Opcode::IfBlock as u8,
            3,
            0,
            0x10,
            0,
            0,
            0,
            0xff,
            0xff,
            0xff,
            0xff,
            Opcode::BlockEnd as u8,
        ];
        let (instruction, next) = Instruction::decode(&code, 0).unwrap();
        assert_eq!(
            instruction,
            Instruction::IfBlock {
                signal: 3,
                then: 0x10,
                orelse: None
            }
        );
        assert_eq!(next, 11);
        assert_eq!(Instruction::decode(&code, next).unwrap().0, Instruction::BlockEnd);
    }

    #[test]
    fn bad_bytes_are_rejected() {
        assert_eq!(Instruction::decode(&[0xee], 0), Err(DecodeError::UnknownOpcode(0xee)));
        assert_eq!(
            Instruction::decode(&[Opcode::Jump as u8, 1, 2], 0),
            Err(DecodeError::Truncated(Opcode::Jump))
        );
        assert_eq!(
            Instruction::decode(&[Opcode::CreateNode as u8, 0, 0xff, 0xff], 0),
            Err(DecodeError::BadOperand(Opcode::CreateNode, 0))
        );
    }

    #[test]
    fn opcode_names() {
        assert_eq!(Opcode::LoadSig.to_string(), "LOAD_SIG");
        assert_eq!(Opcode::BlockEnd.to_string(), "BLOCK_END");
    }
}
