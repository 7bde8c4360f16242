//! Source in, artifact out, artifact run: the observable behavior of small programs.

use pretty_assertions::assert_eq;
use ripple::{
    BuildConfig, NoopRenderer, Program, RecordingTracer, ResourceLimits, TraceEvent, Value, Vm, compile_source,
    compile_sources,
    bytecode::{Instruction, Opcode},
    expressions::NodeKind,
};

fn run(source: &str) -> Vm {
    let output = compile_source(source).unwrap();
    let mut vm = Vm::new(output.program().unwrap());
    vm.run().unwrap();
    vm
}

fn opcodes(program: &Program) -> Vec<Opcode> {
    program
        .instructions()
        .unwrap()
        .into_iter()
        .map(|(_, instruction)| instruction.opcode())
        .collect()
}

#[test]
fn compound_assignment_on_a_signal() {
    let output = compile_source("count = Signal(0)\ncount.value += 1\n").unwrap();
    let program = output.program().unwrap();
    let ops = opcodes(&program);
    let store = ops.iter().position(|op| *op == Opcode::StoreSig).unwrap();
    assert_eq!(
        ops[store - 3..=store],
        [Opcode::LoadSig, Opcode::PushNum, Opcode::Add, Opcode::StoreSig]
    );

    let mut vm = Vm::new(program);
    vm.run().unwrap();
    assert_eq!(vm.value("main.count"), Some(Value::Number(1.0)));
}

#[test]
fn if_else_shows_exactly_one_branch() {
    let mut vm = run("flag = Signal(True)\nif flag.value:\n    Text('A')\nelse:\n    Text('B')\n");
    assert_eq!(vm.tree().texts(), vec!["A".to_owned()]);
    assert_eq!(vm.tree().count(NodeKind::Text), 1);

    vm.set("main.flag", Value::Bool(false)).unwrap();
    assert_eq!(vm.tree().texts(), vec!["B".to_owned()]);
    assert_eq!(vm.tree().count(NodeKind::Text), 1);

    vm.set("main.flag", Value::Bool(true)).unwrap();
    assert_eq!(vm.tree().texts(), vec!["A".to_owned()]);
}

#[test]
fn for_block_follows_the_list() {
    let mut vm = run("items = Signal([1, 2, 3])\nfor item in items.value:\n    Text(item)\n");
    assert_eq!(vm.tree().texts(), vec!["1", "2", "3"]);

    vm.set("main.items", Value::from(vec![Value::from(4.0)])).unwrap();
    assert_eq!(vm.tree().texts(), vec!["4"]);

    vm.set("main.items", Value::from(Vec::new())).unwrap();
    assert!(vm.tree().texts().is_empty());
}

#[test]
fn none_iterates_as_empty() {
    let vm = run("items = Signal(None)\nfor item in items.value:\n    Text(item)\n");
    assert!(vm.tree().texts().is_empty());
}

#[test]
fn bound_text_follows_its_signal() {
    let mut vm = run("name = Signal('x')\nText(f'hello {name.value}')\n");
    assert_eq!(vm.tree().texts(), vec!["hello x"]);
    vm.set("main.name", Value::from("ripple")).unwrap();
    assert_eq!(vm.tree().texts(), vec!["hello ripple"]);
}

#[test]
fn click_runs_the_handler() {
    let mut vm = run(
        "count = Signal(0)\ndef bump():\n    count.value += 1\nButton('+', on_click=bump)\nText(count.value)\n",
    );
    assert_eq!(vm.tree().texts(), vec!["0"]);
    let button = vm.tree().first(NodeKind::Button).unwrap();
    assert!(vm.click(button).unwrap());
    assert!(vm.click(button).unwrap());
    assert_eq!(vm.tree().texts(), vec!["2"]);
    assert_eq!(vm.value("main.count"), Some(Value::Number(2.0)));
}

#[test]
fn input_writes_the_bound_signal() {
    let mut vm = run("name = Signal('')\nInput(value=name, placeholder='name')\nText(f'hi {name.value}')\n");
    let input = vm.tree().first(NodeKind::Input).unwrap();
    vm.input(input, "ann").unwrap();
    assert_eq!(vm.value("main.name"), Some(Value::from("ann")));
    assert_eq!(vm.tree().texts(), vec!["hi ann"]);

    vm.set("main.name", Value::from("bo")).unwrap();
    assert_eq!(vm.tree().get(input).unwrap().value, "bo");
}

#[test]
fn components_render_in_place() {
    let vm = run(
        "@component\ndef Greeting(who):\n    Text(f'hi {who}')\nwith Column():\n    Greeting('a')\n    Greeting('b')\n",
    );
    assert_eq!(vm.tree().texts(), vec!["hi a", "hi b"]);
    let column = vm.tree().first(NodeKind::Column).unwrap();
    assert_eq!(vm.tree().get(column).unwrap().children.len(), 2);
}

#[test]
fn repeated_builds_are_byte_identical() {
    let sources = [
        ("api", "__boundary__ = 'server'\n@rpc\ndef load(n):\n    return n\n"),
        ("theme", "card = Style(padding=8, color='red')\n"),
        (
            "main",
            "from api import load\nfrom theme import card\ndata = Signal(None)\nitems = Signal([1, 2])\n\n@component\ndef App():\n    Text('x', style=card)\n    for item in items.value:\n        Text(item)\n\nApp()\ndata.value = load('HOME')\n",
        ),
    ];
    let config = BuildConfig::default().with_entries(["main"]);
    let first = compile_sources(&sources, &config).unwrap();
    let second = compile_sources(&sources, &config).unwrap();
    let sequential = compile_sources(&sources, &config.clone().sequential()).unwrap();
    assert_eq!(first.artifact, second.artifact);
    assert_eq!(first.artifact, sequential.artifact);
    assert_eq!(first.styles.css(), second.styles.css());
    assert_eq!(first.styles.len(), 1);
}

#[test]
fn nested_blocks_run() {
    let output = compile_source(
        "flag = Signal(False)\nitems = Signal([1])\nif flag.value:\n    for item in items.value:\n        with Row():\n            Text(item)\nelse:\n    Text(str(len(items.value) + 1))\n",
    )
    .unwrap();
    let program = output.program().unwrap();
    let blocks = program
        .instructions()
        .unwrap()
        .into_iter()
        .filter(|(_, i)| matches!(i, Instruction::IfBlock { .. } | Instruction::ForBlock { .. }))
        .count();
    assert_eq!(blocks, 2);
    assert!(program.disassemble().unwrap().contains("FOR_BLOCK"));

    let mut vm = Vm::new(program);
    vm.run().unwrap();
    assert_eq!(vm.tree().texts(), vec!["2"]);
    vm.set("main.flag", Value::Bool(true)).unwrap();
    assert_eq!(vm.tree().texts(), vec!["1"]);
    assert_eq!(vm.tree().count(NodeKind::Row), 1);
    vm.set("main.items", Value::from(vec![Value::from(1.0), Value::from(2.0)])).unwrap();
    assert_eq!(vm.tree().texts(), vec!["1", "2"]);
    assert_eq!(vm.tree().count(NodeKind::Row), 2);
}

/// Entry addresses of the lambdas handed to `Computed(...)`, in source order.
fn computed_lambdas(program: &Program) -> Vec<u32> {
    program
        .instructions()
        .unwrap()
        .windows(2)
        .filter_map(|pair| match (&pair[0].1, &pair[1].1) {
            (Instruction::MakeClosure { addr, .. }, Instruction::InitComputed(_)) => Some(*addr),
            _ => None,
        })
        .collect()
}

fn calls_to(vm: &Vm<NoopRenderer, RecordingTracer>, target: u32) -> usize {
    vm.tracer()
        .events()
        .iter()
        .filter(|event| matches!(event, TraceEvent::Call { addr, .. } if *addr == target))
        .count()
}

#[test]
fn computed_values_follow_their_sources_lazily() {
    let source = "a = Signal(1)\nb = Computed(lambda: a.value * 2)\nc = Computed(lambda: a.value + 100)\nText(b.value)\n";
    let output = compile_source(source).unwrap();
    let program = output.program().unwrap();
    let [shown, unread] = computed_lambdas(&program)[..] else {
        panic!("expected two computed lambdas");
    };
    let mut vm = Vm::with_parts(program, NoopRenderer, RecordingTracer::structural(), ResourceLimits::new());
    vm.run().unwrap();
    assert_eq!(vm.tree().texts(), vec!["2"]);
    assert_eq!(calls_to(&vm, shown), 1);
    assert_eq!(calls_to(&vm, unread), 0);

    vm.set("main.a", Value::Number(5.0)).unwrap();
    assert_eq!(vm.tree().texts(), vec!["10"]);
    assert_eq!(calls_to(&vm, shown), 2);
    assert_eq!(calls_to(&vm, unread), 0);

    let c = vm.signal("main.c").unwrap();
    assert_eq!(vm.value("main.c"), None);
    assert_eq!(vm.read(c).unwrap(), Value::Number(105.0));
    assert_eq!(vm.read(c).unwrap(), Value::Number(105.0));
    assert_eq!(calls_to(&vm, unread), 1);

    vm.set("main.a", Value::Number(6.0)).unwrap();
    assert_eq!(vm.value("main.c"), Some(Value::Number(105.0)));
    assert_eq!(vm.read(c).unwrap(), Value::Number(106.0));
    assert_eq!(calls_to(&vm, unread), 2);
    assert_eq!(calls_to(&vm, shown), 3);
}
