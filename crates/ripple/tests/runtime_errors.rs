//! Programs that fail at run time must fail with an error, never take the host down.

use pretty_assertions::assert_eq;
use ripple::{
    NoopRenderer, NoopTracer, Program, ResourceError, ResourceLimits, Vm, VmError,
    bytecode::{MAGIC, Opcode, VERSION},
    compile_source,
    resource::DEFAULT_MAX_COLLECTION_LEN,
};

fn run_err(source: &str) -> VmError {
    let output = compile_source(source).unwrap();
    let mut vm = Vm::new(output.program().unwrap());
    let err = vm.run().unwrap_err();
    assert!(vm.is_poisoned());
    err
}

#[test]
fn huge_range_is_refused() {
    let err = run_err("big = Signal(range(4000000000000000))\n");
    assert_eq!(
        err,
        VmError::Resource(ResourceError::Collection {
            limit: DEFAULT_MAX_COLLECTION_LEN,
            len: 4_000_000_000_000_000,
        })
    );
}

#[test]
fn huge_str_repeat_is_refused() {
    let err = run_err("big = Signal('x' * 9000000000000000)\n");
    assert!(
        matches!(err, VmError::Resource(ResourceError::Collection { len: 9_000_000_000_000_000, .. })),
        "{err}"
    );
}

#[test]
fn huge_list_repeat_is_refused() {
    let err = run_err("big = Signal([1, 2] * 9000000000000000)\n");
    assert!(
        matches!(err, VmError::Resource(ResourceError::Collection { len: 18_000_000_000_000_000, .. })),
        "{err}"
    );
}

#[test]
fn collection_bound_is_configurable() {
    let output = compile_source("small = Signal(range(3))\nlarge = Signal(range(5))\n").unwrap();
    let limits = ResourceLimits::default().max_collection_len(Some(4));
    let mut vm = Vm::with_parts(output.program().unwrap(), NoopRenderer, NoopTracer, limits);
    let err = vm.run().unwrap_err();
    assert_eq!(err, VmError::Resource(ResourceError::Collection { limit: 4, len: 5 }));
}

#[test]
fn popping_an_empty_stack_is_an_underflow() {
    let mut bytes = MAGIC.to_vec();
    bytes.extend_from_slice(&VERSION.to_le_bytes());
    bytes.extend_from_slice(&0u16.to_le_bytes());
    let code = [Opcode::Pop as u8, Opcode::Halt as u8];
    bytes.extend_from_slice(&u32::try_from(code.len()).unwrap().to_le_bytes());
    bytes.extend_from_slice(&code);

    let mut vm = Vm::new(Program::load(&bytes).unwrap());
    let err = vm.run().unwrap_err();
    assert!(matches!(err, VmError::StackUnderflow { ip: 0, opcode: Opcode::Pop }), "{err}");
    assert!(vm.is_poisoned());
}
