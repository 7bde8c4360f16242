//! Binary artifact encoding, load-time verification and disassembly.
//!
//! Layout (little-endian):
//!
//! ```text
//! magic "RPLB" | u16 version | u16 pool count | pool count x (u32 len, utf-8 bytes)
//! | u32 code length | code
//! ```

use std::{borrow::Cow, fmt, fmt::Write as _};

use ahash::AHashSet;

use super::{
    builder::Code,
    op::{DecodeError, Instruction},
};

pub const MAGIC: &[u8; 4] = b"RPLB";
pub const VERSION: u16 = 1;

/// Why an artifact was rejected at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    BadMagic,
    UnsupportedVersion(u16),
    Truncated(&'static str),
    InvalidUtf8 { index: usize },
    TrailingBytes(usize),
    Decode { offset: usize, error: DecodeError },
    /// An address operand that is not the start of an instruction.
    BadAddress { offset: usize, target: u32 },
    BadPoolIndex { offset: usize, index: u16 },
    TooLarge(Cow<'static, str>),
}

impl fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => f.write_str("not a ripple artifact (bad magic)"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported artifact version {v}"),
            Self::Truncated(what) => write!(f, "artifact truncated while reading {what}"),
            Self::InvalidUtf8 { index } => write!(f, "pool entry {index} is not valid utf-8"),
            Self::TrailingBytes(n) => write!(f, "{n} unexpected bytes after the instruction stream"),
            Self::Decode { offset, error } => write!(f, "at offset {offset}: {error}"),
            Self::BadAddress { offset, target } => {
                write!(f, "at offset {offset}: address {target} is not an instruction boundary")
            }
            Self::BadPoolIndex { offset, index } => write!(f, "at offset {offset}: pool index {index} out of range"),
            Self::TooLarge(msg) => write!(f, "artifact too large: {msg}"),
        }
    }
}

impl std::error::Error for ArtifactError {}

/// Encodes compiled code as an artifact.
pub fn encode(code: &Code) -> Result<Vec<u8>, ArtifactError> {
    let mut out = Vec::with_capacity(16 + code.code.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    let count = u16::try_from(code.pool.len()).map_err(|_| ArtifactError::TooLarge("string pool".into()))?;
    out.extend_from_slice(&count.to_le_bytes());
    for entry in &code.pool {
        let len = u32::try_from(entry.len()).map_err(|_| ArtifactError::TooLarge("pool entry".into()))?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(entry.as_bytes());
    }
    let len = u32::try_from(code.code.len()).map_err(|_| ArtifactError::TooLarge("code".into()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&code.code);
    Ok(out)
}

/// A verified artifact, ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pool: Vec<String>,
    code: Vec<u8>,
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ArtifactError> {
        if self.bytes.len() < n {
            return Err(ArtifactError::Truncated(what));
        }
        let (head, rest) = self.bytes.split_at(n);
        self.bytes = rest;
        Ok(head)
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ArtifactError> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, ArtifactError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

impl Program {
    /// Parses and verifies an artifact.
    ///
    /// The whole instruction stream is decoded once; every address operand must land
    /// on an instruction boundary and every pool reference must be in range.
    pub fn load(bytes: &[u8]) -> Result<Self, ArtifactError> {
        let mut reader = Reader { bytes };
        if reader.take(4, "magic")? != MAGIC {
            return Err(ArtifactError::BadMagic);
        }
        let version = reader.u16("version")?;
        if version != VERSION {
            return Err(ArtifactError::UnsupportedVersion(version));
        }
        let count = reader.u16("pool count")?;
        let mut pool = Vec::with_capacity(usize::from(count));
        for index in 0..usize::from(count) {
            let len = reader.u32("pool entry length")?;
            let raw = reader.take(len as usize, "pool entry")?;
            let entry = std::str::from_utf8(raw).map_err(|_| ArtifactError::InvalidUtf8 { index })?;
            pool.push(entry.to_owned());
        }
        let len = reader.u32("code length")?;
        let code = reader.take(len as usize, "code")?.to_vec();
        if !reader.bytes.is_empty() {
            return Err(ArtifactError::TrailingBytes(reader.bytes.len()));
        }
        let program = Self { pool, code };
        program.verify()?;
        Ok(program)
    }

    fn verify(&self) -> Result<(), ArtifactError> {
        let instructions = self.instructions()?;
        let boundaries: AHashSet<u32> = instructions
            .iter()
            .filter_map(|(offset, _)| u32::try_from(*offset).ok())
            .collect();
        for (offset, instruction) in &instructions {
            for target in instruction.targets() {
                if !boundaries.contains(&target) {
                    return Err(ArtifactError::BadAddress {
                        offset: *offset,
                        target,
                    });
                }
            }
            for index in instruction.pool_refs() {
                if usize::from(index) >= self.pool.len() {
                    return Err(ArtifactError::BadPoolIndex { offset: *offset, index });
                }
            }
        }
        Ok(())
    }

    /// Decodes the whole stream as `(offset, instruction)` pairs.
    pub fn instructions(&self) -> Result<Vec<(usize, Instruction)>, ArtifactError> {
        let mut out = Vec::new();
        let mut ip = 0;
        while ip < self.code.len() {
            let (instruction, next) =
                Instruction::decode(&self.code, ip).map_err(|error| ArtifactError::Decode { offset: ip, error })?;
            out.push((ip, instruction));
            ip = next;
        }
        Ok(out)
    }

    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    #[must_use]
    pub fn pool(&self) -> &[String] {
        &self.pool
    }

    /// Pool entry `index`, or an empty string when out of range (verified programs
    /// never are).
    #[must_use]
    pub fn string(&self, index: u16) -> &str {
        self.pool.get(usize::from(index)).map_or("", String::as_str)
    }

    /// Renders the program as one instruction per line.
    pub fn disassemble(&self) -> Result<String, ArtifactError> {
        let mut out = String::new();
        for (offset, instruction) in self.instructions()? {
            let _ = write!(out, "{offset:6}  {}", instruction.opcode());
            let operands = self.render_operands(&instruction);
            if !operands.is_empty() {
                let _ = write!(out, " {operands}");
            }
            out.push('\n');
        }
        Ok(out)
    }

    fn render_operands(&self, instruction: &Instruction) -> String {
        let name = |i: u16| format!("{:?}", self.string(i));
        match *instruction {
            Instruction::PushNum(n) => crate::value::Value::Number(n).to_string(),
            Instruction::PushStr(i)
            | Instruction::LoadVar(i)
            | Instruction::StoreVar(i)
            | Instruction::LoadSig(i)
            | Instruction::StoreSig(i)
            | Instruction::InitSig(i)
            | Instruction::InitComputed(i)
            | Instruction::BindValue(i) => name(i),
            Instruction::BuildList(n) | Instruction::BuildMap(n) => n.to_string(),
            Instruction::Jump(a) | Instruction::JumpIfFalse(a) => format!("-> {a}"),
            Instruction::Call { addr, argc } => format!("-> {addr} argc={argc}"),
            Instruction::CallValue { argc } => format!("argc={argc}"),
            Instruction::CallIntrinsic { intrinsic, argc } => format!("{intrinsic} argc={argc}"),
            Instruction::MakeClosure { addr, captures } => format!("-> {addr} captures={captures}"),
            Instruction::RemoteCall { name: n, argc, target } => match target {
                Some(t) => format!("{} argc={argc} into {}", name(n), name(t)),
                None => format!("{} argc={argc}", name(n)),
            },
            Instruction::CreateNode { kind, class } => match class {
                Some(c) => format!("{kind} class={}", name(c)),
                None => kind.to_string(),
            },
            Instruction::SetProp(prop) => prop.to_string(),
            Instruction::BindProp { prop, addr } => format!("{prop} -> {addr}"),
            Instruction::OnEvent(event) => event.to_string(),
            Instruction::IfBlock { signal, then, orelse } => match orelse {
                Some(orelse) => format!("{} then={then} else={orelse}", name(signal)),
                None => format!("{} then={then}", name(signal)),
            },
            Instruction::ForBlock { list, item, template } => {
                format!("{} item={} template={template}", name(list), name(item))
            }
            _ => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::bytecode::{builder::CodeBuilder, op::Opcode};

    fn sample() -> Vec<u8> {
        let mut builder = CodeBuilder::new();
        builder.emit_num(0.0);
        builder.emit_name(Opcode::InitSig, "main.count");
        builder.emit(Opcode::Halt);
        encode(&builder.build().unwrap()).unwrap()
    }

    #[test]
    fn header_layout() {
        let bytes = sample();
        assert_eq!(&bytes[..4], b"RPLB");
        assert_eq!(&bytes[4..6], &[1, 0]);
        assert_eq!(&bytes[6..8], &[1, 0]);
        assert_eq!(&bytes[8..12], &10u32.to_le_bytes());
        assert_eq!(&bytes[12..22], b"main.count");
    }

    #[test]
    fn load_and_disassemble() {
        let program = Program::load(&sample()).unwrap();
        assert_eq!(
            program.disassemble().unwrap(),
            "     0  PUSH_NUM 0\n     9  INIT_SIG \"main.count\"\n    12  HALT\n"
        );
    }

    #[test]
    fn rejects_corruption() {
        let mut bytes = sample();
        bytes[0] = b'X';
        assert_eq!(Program::load(&bytes), Err(ArtifactError::BadMagic));

        let bytes = sample();
        assert_eq!(
            Program::load(&bytes[..bytes.len() - 1]),
            Err(ArtifactError::Truncated("code"))
        );

        let mut bytes = sample();
        // INIT_SIG operand points past the one-entry pool
        let at = bytes.len() - 3;
        bytes[at] = 7;
        assert_eq!(
            Program::load(&bytes),
            Err(ArtifactError::BadPoolIndex { offset: 9, index: 7 })
        );
    }

    #[test]
    fn rejects_jump_into_operand() {
        let mut builder = CodeBuilder::new();
        builder.emit_jump_to(Opcode::Jump, 2);
        builder.emit(Opcode::Halt);
        let bytes = encode(&builder.build().unwrap()).unwrap();
        assert_eq!(
            Program::load(&bytes),
            Err(ArtifactError::BadAddress { offset: 0, target: 2 })
        );
    }
}
