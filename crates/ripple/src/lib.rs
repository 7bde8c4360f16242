#![doc = include_str!("../../../README.md")]

mod arena;
pub mod build;
pub mod bytecode;
pub mod cache;
pub mod classify;
pub mod compiler;
pub mod config;
pub mod expressions;
pub mod graph;
pub mod intrinsics;
pub mod link;
pub mod parse;
pub mod prepare;
pub mod reactive;
pub mod resource;
pub mod sentinel;
pub mod style;
pub mod tracer;
pub mod value;

pub use crate::{
    build::{BuildError, BuildOutput, build, build_dir, build_project, compile_source, compile_sources},
    bytecode::{
        ArtifactError, NodeId, NodeTree, NoopRenderer, Program, RecordingRenderer, RemoteError, RemoteErrorKind,
        RemoteRequest, RemoteTransport, RenderOp, Renderer, Vm, VmError,
    },
    classify::{Classification, ModuleClass, Origin},
    compiler::CompileError,
    config::{BuildConfig, ConfigError},
    graph::{ModuleError, ModuleGraph},
    link::{LinkError, LinkErrorKind},
    parse::{CodeLoc, CodeRange, ParseError},
    reactive::{ReactiveError, SignalId},
    resource::{ReactiveLimits, ResourceError, ResourceLimits},
    sentinel::{LeakKind, ServerLeakError},
    style::{Style, StyleRegistry, merge},
    tracer::{NoopTracer, ProfilingReport, ProfilingTracer, RecordingTracer, StderrTracer, TraceEvent, VmTracer},
    value::Value,
};

/// The error returned when a name cannot be linked.
pub type UnresolvedSymbolError = LinkError;
