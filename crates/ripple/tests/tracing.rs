use pretty_assertions::assert_eq;
use ripple::{
    NoopRenderer, ProfilingTracer, RecordingRenderer, RecordingTracer, RenderOp, ResourceLimits, TraceEvent, Value,
    Vm, bytecode::Opcode, compile_source,
};

const SOURCE: &str = "items = Signal([1, 2])\nfor item in items.value:\n    Text(item)\n";

#[test]
fn profiling_counts_renders_and_teardowns() {
    let output = compile_source(SOURCE).unwrap();
    let mut vm = Vm::with_parts(
        output.program().unwrap(),
        NoopRenderer,
        ProfilingTracer::new(),
        ResourceLimits::default(),
    );
    vm.run().unwrap();
    vm.set("main.items", Value::from(vec![Value::from(3.0)])).unwrap();

    let report = vm.tracer().report();
    assert_eq!(report.block_renders, 2);
    assert_eq!(report.teardowns, 2);
    assert_eq!(report.remote_calls, 0);
    assert!(report.opcode_counts.iter().any(|(op, _)| *op == Opcode::ForBlock));
    assert!(report.to_string().starts_with("=== VM Profiling Report ==="));
}

#[test]
fn recording_respects_its_limit() {
    let output = compile_source(SOURCE).unwrap();
    let mut vm = Vm::with_parts(
        output.program().unwrap(),
        NoopRenderer,
        RecordingTracer::with_limit(3),
        ResourceLimits::default(),
    );
    vm.run().unwrap();
    assert_eq!(vm.tracer().events().len(), 3);
    assert!(matches!(vm.tracer().events()[0], TraceEvent::Instruction { ip: 0, .. }));
}

#[test]
fn renderer_sees_every_change() {
    let output = compile_source("name = Signal('a')\nText(name.value)\n").unwrap();
    let mut vm = Vm::with_renderer(output.program().unwrap(), RecordingRenderer::default());
    vm.run().unwrap();
    let text = vm.tree().first(ripple::expressions::NodeKind::Text).unwrap();
    vm.renderer_mut().ops.clear();

    vm.set("main.name", Value::from("b")).unwrap();
    assert_eq!(vm.renderer().ops, vec![RenderOp::SetText(text, "b".to_owned())]);
}
