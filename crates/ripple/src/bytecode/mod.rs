//! Bytecode representation, compiler back end and virtual machine.
//!
//! # Module Structure
//!
//! - `op` - opcodes, operand types and instruction decoding
//! - `builder` - `CodeBuilder` for emitting bytecode with jump patching and stack tracking
//! - `artifact` - the binary artifact: encoding, load-time verification, disassembly
//! - `vm` - the virtual machine, node tree and remote-call plumbing

pub use artifact::{ArtifactError, MAGIC, Program, VERSION, encode};
pub use builder::{Code, CodeBuilder, CodeError, JumpLabel};
pub use op::{DecodeError, Event, Instruction, Opcode, Prop};
pub use vm::{
    BlockKind, Vm, VmError,
    nodes::{NodeId, NodeTree, NoopRenderer, RecordingRenderer, RenderOp, Renderer},
    remote::{CallId, Delivery, RemoteError, RemoteErrorKind, RemoteRequest, RemoteTransport},
};

mod artifact;
mod builder;
mod op;
pub mod vm;
