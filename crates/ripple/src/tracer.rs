//! VM execution tracing.
//!
//! The VM is generic over a [`VmTracer`]; every hook has a no-op default, so
//! `Vm<_, NoopTracer>` compiles the hooks away entirely.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | No-op (default) |
//! | [`StderrTracer`] | Human-readable execution log on stderr |
//! | [`ProfilingTracer`] | Opcode counts, call depth, render and teardown counters |
//! | [`RecordingTracer`] | Full event list for post-mortem inspection and tests |

use std::fmt;

use ahash::AHashMap;

use crate::bytecode::{
    CallId, Opcode,
    vm::{BlockKind, ScopeId, ScopeKind},
};

/// Trace event captured by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    Instruction {
        ip: usize,
        opcode: Opcode,
        /// Operand stack depth relative to the frame base.
        stack_depth: usize,
    },
    Call {
        addr: u32,
        depth: usize,
    },
    Return {
        depth: usize,
    },
    ScopeEnter {
        scope: ScopeId,
        kind: ScopeKind,
    },
    ScopeTeardown {
        scope: ScopeId,
        /// Resources released, nested scopes included.
        released: usize,
    },
    BlockRender {
        kind: BlockKind,
        /// Child scopes built by this render.
        children: usize,
    },
    RemoteCall {
        id: CallId,
        function: String,
    },
    RemoteDiscard {
        id: CallId,
    },
}

/// Hooks called by the VM at interesting points of execution.
pub trait VmTracer: fmt::Debug {
    /// Called before each instruction is dispatched. This is the hottest hook.
    #[inline(always)]
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {}

    /// A `CALL` / `CALL_VALUE` pushed a frame.
    #[inline(always)]
    fn on_call(&mut self, _addr: u32, _depth: usize) {}

    #[inline(always)]
    fn on_return(&mut self, _depth: usize) {}

    #[inline(always)]
    fn on_scope_enter(&mut self, _scope: ScopeId, _kind: ScopeKind) {}

    #[inline(always)]
    fn on_scope_teardown(&mut self, _scope: ScopeId, _released: usize) {}

    /// A reactive block (re)rendered.
    #[inline(always)]
    fn on_block_render(&mut self, _kind: BlockKind, _children: usize) {}

    #[inline(always)]
    fn on_remote_call(&mut self, _id: CallId, _function: &str) {}

    /// A response arrived for a call whose scope no longer exists.
    #[inline(always)]
    fn on_remote_discard(&mut self, _id: CallId) {}
}

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Prints a human-readable execution log to stderr.
///
/// ```text
/// [    0] PUSH_NUM  stack=0  frames=1
///   >>> CALL 42         depth=2
///   ~~~ RENDER if       children=1
///   --- TEARDOWN scope3 released=4
/// ```
#[derive(Debug, Default)]
pub struct StderrTracer {
    /// Stop logging after this many instructions.
    limit: Option<usize>,
    count: usize,
    stopped: bool,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        if self.stopped {
            return;
        }
        eprintln!("[{ip:>5}] {opcode}  stack={stack_depth}  frames={frame_depth}");
        self.count += 1;
        if let Some(limit) = self.limit
            && self.count >= limit
        {
            eprintln!("--- trace limit reached ({limit} instructions) ---");
            self.stopped = true;
        }
    }

    fn on_call(&mut self, addr: u32, depth: usize) {
        if !self.stopped {
            eprintln!("  >>> CALL {addr:<10} depth={depth}");
        }
    }

    fn on_return(&mut self, depth: usize) {
        if !self.stopped {
            eprintln!("  <<< RETURN          depth={depth}");
        }
    }

    fn on_scope_teardown(&mut self, scope: ScopeId, released: usize) {
        if !self.stopped {
            eprintln!("  --- TEARDOWN {scope} released={released}");
        }
    }

    fn on_block_render(&mut self, kind: BlockKind, children: usize) {
        if !self.stopped {
            eprintln!("  ~~~ RENDER {kind:<8} children={children}");
        }
    }

    fn on_remote_call(&mut self, id: CallId, function: &str) {
        if !self.stopped {
            eprintln!("  ==> REMOTE {id} {function}");
        }
    }

    fn on_remote_discard(&mut self, id: CallId) {
        if !self.stopped {
            eprintln!("  xxx DISCARD {id}");
        }
    }
}

/// Collects execution statistics.
#[derive(Debug, Default)]
pub struct ProfilingTracer {
    opcode_counts: AHashMap<Opcode, u64>,
    total_instructions: u64,
    max_depth: usize,
    total_calls: u64,
    block_renders: u64,
    teardowns: u64,
    remote_calls: u64,
}

/// Summary produced by [`ProfilingTracer::report`].
#[derive(Debug)]
pub struct ProfilingReport {
    /// Sorted by frequency, highest first; ties by opcode byte.
    pub opcode_counts: Vec<(Opcode, u64)>,
    pub total_instructions: u64,
    pub max_depth: usize,
    pub total_calls: u64,
    pub block_renders: u64,
    pub teardowns: u64,
    pub remote_calls: u64,
}

impl ProfilingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn report(&self) -> ProfilingReport {
        let mut opcode_counts: Vec<_> = self.opcode_counts.iter().map(|(&k, &v)| (k, v)).collect();
        opcode_counts.sort_by(|a, b| b.1.cmp(&a.1).then((a.0 as u8).cmp(&(b.0 as u8))));
        ProfilingReport {
            opcode_counts,
            total_instructions: self.total_instructions,
            max_depth: self.max_depth,
            total_calls: self.total_calls,
            block_renders: self.block_renders,
            teardowns: self.teardowns,
            remote_calls: self.remote_calls,
        }
    }
}

impl VmTracer for ProfilingTracer {
    #[inline]
    fn on_instruction(&mut self, _ip: usize, opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {
        *self.opcode_counts.entry(opcode).or_insert(0) += 1;
        self.total_instructions += 1;
    }

    fn on_call(&mut self, _addr: u32, depth: usize) {
        self.total_calls += 1;
        self.max_depth = self.max_depth.max(depth);
    }

    fn on_scope_teardown(&mut self, _scope: ScopeId, _released: usize) {
        self.teardowns += 1;
    }

    fn on_block_render(&mut self, _kind: BlockKind, _children: usize) {
        self.block_renders += 1;
    }

    fn on_remote_call(&mut self, _id: CallId, _function: &str) {
        self.remote_calls += 1;
    }
}

impl fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== VM Profiling Report ===")?;
        writeln!(f, "Total instructions: {}", self.total_instructions)?;
        writeln!(f, "Total calls:        {}", self.total_calls)?;
        writeln!(f, "Max call depth:     {}", self.max_depth)?;
        writeln!(f, "Block renders:      {}", self.block_renders)?;
        writeln!(f, "Scope teardowns:    {}", self.teardowns)?;
        writeln!(f, "Remote calls:       {}", self.remote_calls)?;
        writeln!(f)?;
        writeln!(f, "--- Opcode Frequency ---")?;
        for (opcode, count) in &self.opcode_counts {
            let pct = (*count as f64 / self.total_instructions as f64) * 100.0;
            writeln!(f, "  {:<20} {count:>10}  ({pct:>5.1}%)", opcode.to_string())?;
        }
        Ok(())
    }
}

/// Records every event.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
    limit: Option<usize>,
    /// Skip `Instruction` events, which dominate the log.
    structural_only: bool,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Vec::with_capacity(limit.min(1024)),
            limit: Some(limit),
            structural_only: false,
        }
    }

    /// Records everything except individual instructions.
    #[must_use]
    pub fn structural() -> Self {
        Self {
            structural_only: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    fn record(&mut self, event: TraceEvent) {
        if self.limit.is_none_or(|l| self.events.len() < l) {
            self.events.push(event);
        }
    }
}

impl VmTracer for RecordingTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, _frame_depth: usize) {
        if !self.structural_only {
            self.record(TraceEvent::Instruction {
                ip,
                opcode,
                stack_depth,
            });
        }
    }

    fn on_call(&mut self, addr: u32, depth: usize) {
        self.record(TraceEvent::Call { addr, depth });
    }

    fn on_return(&mut self, depth: usize) {
        self.record(TraceEvent::Return { depth });
    }

    fn on_scope_enter(&mut self, scope: ScopeId, kind: ScopeKind) {
        self.record(TraceEvent::ScopeEnter { scope, kind });
    }

    fn on_scope_teardown(&mut self, scope: ScopeId, released: usize) {
        self.record(TraceEvent::ScopeTeardown { scope, released });
    }

    fn on_block_render(&mut self, kind: BlockKind, children: usize) {
        self.record(TraceEvent::BlockRender { kind, children });
    }

    fn on_remote_call(&mut self, id: CallId, function: &str) {
        self.record(TraceEvent::RemoteCall {
            id,
            function: function.to_owned(),
        });
    }

    fn on_remote_discard(&mut self, id: CallId) {
        self.record(TraceEvent::RemoteDiscard { id });
    }
}
