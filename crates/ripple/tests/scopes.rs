//! Block re-rendering, scope teardown and remote calls.

use pretty_assertions::assert_eq;
use ripple::{
    BuildConfig, NoopRenderer, RecordingTracer, RemoteError, RemoteErrorKind, RemoteRequest, ResourceLimits, TraceEvent,
    Value, Vm, compile_source, compile_sources,
    bytecode::Delivery,
    expressions::NodeKind,
};
use serde_json::json;

const API: &str = "__boundary__ = 'server'\n@rpc\ndef load(n):\n    return n\n";

fn run(source: &str) -> Vm {
    let output = compile_source(source).unwrap();
    let mut vm = Vm::new(output.program().unwrap());
    vm.run().unwrap();
    vm
}

fn run_with_api(main: &str) -> Vm {
    let config = BuildConfig::default().with_entries(["main"]);
    let output = compile_sources(&[("api", API), ("main", main)], &config).unwrap();
    let mut vm = Vm::new(output.program().unwrap());
    vm.run().unwrap();
    vm
}

#[test]
fn branch_swap_releases_every_node() {
    let source = "flag = Signal(True)\nif flag.value:\n    with Column():\n        Text('a')\n        Text('b')\nelse:\n    Text('c')\n";
    let output = compile_source(source).unwrap();
    let mut vm = Vm::with_parts(
        output.program().unwrap(),
        NoopRenderer,
        RecordingTracer::structural(),
        ResourceLimits::default(),
    );
    vm.run().unwrap();
    let nodes = vm.tree().len();
    let scopes = vm.scope_count();
    assert_eq!(vm.tree().count(NodeKind::Column), 1);
    assert_eq!(vm.tree().count(NodeKind::Text), 2);

    vm.set("main.flag", Value::Bool(false)).unwrap();
    assert_eq!(vm.tree().count(NodeKind::Column), 0);
    assert_eq!(vm.tree().count(NodeKind::Text), 1);
    assert_eq!(vm.tree().texts(), vec!["c"]);

    vm.set("main.flag", Value::Bool(true)).unwrap();
    assert_eq!(vm.tree().len(), nodes);
    assert_eq!(vm.scope_count(), scopes);
    assert_eq!(vm.tree().texts(), vec!["a", "b"]);

    let teardowns = vm
        .tracer()
        .events()
        .iter()
        .filter(|event| matches!(event, TraceEvent::ScopeTeardown { .. }))
        .count();
    assert!(teardowns >= 2, "expected a teardown per swap, saw {teardowns}");
}

#[test]
fn component_state_lives_with_its_block() {
    let mut vm = run(
        "@component\ndef Counter():\n    n = Signal(0)\n    Text(n.value)\nshow = Signal(True)\nif show.value:\n    Counter()\n",
    );
    let signals = vm.signal_count();
    let effects = vm.effect_count();
    assert_eq!(vm.tree().texts(), vec!["0"]);

    vm.set("main.show", Value::Bool(false)).unwrap();
    assert_eq!(vm.signal_count(), signals - 1);
    assert!(vm.effect_count() < effects);
    assert!(vm.tree().texts().is_empty());

    vm.set("main.show", Value::Bool(true)).unwrap();
    assert_eq!(vm.signal_count(), signals);
    assert_eq!(vm.effect_count(), effects);
}

#[test]
fn equal_write_keeps_the_block() {
    let output = compile_source("flag = Signal(True)\nif flag.value:\n    Text('a')\n").unwrap();
    let mut vm = Vm::with_parts(
        output.program().unwrap(),
        NoopRenderer,
        RecordingTracer::structural(),
        ResourceLimits::default(),
    );
    vm.run().unwrap();
    let before = vm.tracer().events().len();
    assert!(!vm.set("main.flag", Value::Bool(true)).unwrap());
    assert_eq!(vm.tracer().events().len(), before);
}

#[test]
fn remote_result_lands_in_the_target_signal() {
    let mut vm = run_with_api("from api import load\ndata = Signal(None)\ndata.value = load(7)\nText(str(data.value))\n");
    assert_eq!(vm.tree().texts(), vec!["None"]);
    assert_eq!(vm.pending_calls(), 1);

    let requests = vm.take_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].function, "api.load");
    assert_eq!(requests[0].args, vec![json!(7)]);

    let delivery = vm.resolve_remote(requests[0].id, Ok(json!("done"))).unwrap();
    assert_eq!(delivery, Delivery::Delivered);
    assert_eq!(vm.value("main.data"), Some(Value::from("done")));
    assert_eq!(vm.tree().texts(), vec!["done"]);
    assert_eq!(vm.pending_calls(), 0);
}

#[test]
fn remote_failure_is_an_error_value() {
    let mut vm = run_with_api(
        "from api import load\ndata = Signal(None)\ndata.value = load(1)\nText(str(is_error(data.value)))\n",
    );
    assert_eq!(vm.tree().texts(), vec!["False"]);
    let request = vm.take_requests().remove(0);
    let failure = RemoteError::new(RemoteErrorKind::Server, "boom");
    vm.resolve_remote(request.id, Err(failure)).unwrap();

    assert!(matches!(vm.value("main.data"), Some(Value::Error(_))));
    assert_eq!(vm.tree().texts(), vec!["True"]);
}

#[test]
fn response_after_teardown_is_discarded() {
    let mut vm = run_with_api(
        "from api import load\n@component\ndef Loader():\n    result = Signal(None)\n    result.value = load(1)\n    Text(str(result.value))\nshow = Signal(True)\nif show.value:\n    Loader()\n",
    );
    let request = vm.take_requests().remove(0);
    vm.set("main.show", Value::Bool(false)).unwrap();
    assert_eq!(vm.pending_calls(), 0);

    let delivery = vm.resolve_remote(request.id, Ok(json!(1))).unwrap();
    assert_eq!(delivery, Delivery::Discarded);
    assert!(vm.tree().texts().is_empty());
    assert!(!vm.is_poisoned());
}

#[test]
fn pump_drives_calls_to_completion() {
    let mut vm = run_with_api("from api import load\ndata = Signal(None)\ndata.value = load(2)\n");
    let mut seen = Vec::new();
    let calls = vm
        .pump(&mut |request: &RemoteRequest| -> Result<serde_json::Value, RemoteError> {
            seen.push(request.function.clone());
            Ok(json!({ "echo": request.args[0].clone() }))
        })
        .unwrap();
    assert_eq!(calls, 1);
    assert_eq!(seen, vec!["api.load"]);
    let Some(Value::Map(map)) = vm.value("main.data") else {
        panic!("expected a map");
    };
    assert_eq!(map.len(), 1);
}

#[test]
fn runtime_errors_poison_the_vm() {
    let mut vm = run("count = Signal(0)\ndef bad():\n    count.value = count.value + 'x'\nButton('go', on_click=bad)\n");
    let button = vm.tree().first(NodeKind::Button).unwrap();
    assert!(vm.click(button).is_err());
    assert!(vm.is_poisoned());
    assert!(vm.click(button).is_err());
}

#[test]
fn events_for_removed_nodes_are_ignored() {
    let mut vm = run(
        "count = Signal(0)\nname = Signal('')\nshow = Signal(True)\ndef bump():\n    count.value += 1\nif show.value:\n    Button('+', on_click=bump)\n    Input(value=name)\nText(count.value)\n",
    );
    let button = vm.tree().first(NodeKind::Button).unwrap();
    let input = vm.tree().first(NodeKind::Input).unwrap();
    assert!(vm.click(button).unwrap());
    assert_eq!(vm.value("main.count"), Some(Value::Number(1.0)));

    vm.set("main.show", Value::Bool(false)).unwrap();
    assert!(!vm.click(button).unwrap());
    vm.input(input, "late").unwrap();
    assert!(!vm.is_poisoned());
    assert_eq!(vm.value("main.name"), Some(Value::from("")));

    vm.set("main.count", Value::Number(5.0)).unwrap();
    assert_eq!(vm.tree().texts(), vec!["5"]);
    vm.set("main.show", Value::Bool(true)).unwrap();
    let button = vm.tree().first(NodeKind::Button).unwrap();
    assert!(vm.click(button).unwrap());
    assert_eq!(vm.tree().texts(), vec!["6"]);
}
