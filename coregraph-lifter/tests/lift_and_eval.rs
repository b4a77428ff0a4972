//! End-to-end lifting tests over hand-assembled x86-64 accessor bodies.

use coregraph_descriptors::{FunctionDescriptor, ParameterDescriptor, TypeDescriptor};
use coregraph_image::{MemoryImage, MemoryRegion, Permissions};
use coregraph_lifter::{
    AccessorCache, AccessorKey, AccessorLifter, EvalError, Evaluator, LiftError,
    DEFAULT_STEP_BUDGET,
};
use coregraph_descriptors::BuildId;

fn func(name: &str, addr: u64, bytes: &[u8]) -> FunctionDescriptor {
    FunctionDescriptor {
        linkage_name: name.to_string(),
        display_name: String::new(),
        low_address: addr,
        high_address: addr + bytes.len() as u64,
        bytes: bytes.to_vec(),
        parameters: vec![ParameterDescriptor {
            name: Some("this".to_string()),
            ty: TypeDescriptor::pointer_to(TypeDescriptor::Named {
                name: "receiver".to_string(),
            }),
            artificial: true,
        }],
        return_type: None,
        template_args: Vec::new(),
    }
}

fn image(addr: u64, bytes: Vec<u8>) -> MemoryImage {
    MemoryImage::from_regions(vec![MemoryRegion::new(addr, Permissions::RW, bytes)]).unwrap()
}

#[test]
fn begin_accessor_loads_member_pointer() {
    // mov rax, [rdi]; ret
    let lifter = AccessorLifter::new().unwrap();
    let program = lifter.lift(&func("begin", 0x1000, &[0x48, 0x8b, 0x07, 0xc3])).unwrap();

    let img = image(0x2000, 0x700040u64.to_le_bytes().to_vec());
    let out = Evaluator::new(&img, DEFAULT_STEP_BUDGET)
        .evaluate(&program, &[0x2000])
        .unwrap();
    assert_eq!(out, 0x700040);
}

#[test]
fn end_accessor_uses_displacement() {
    // mov rax, [rdi+8]; ret
    let lifter = AccessorLifter::new().unwrap();
    let program = lifter
        .lift(&func("end", 0x1000, &[0x48, 0x8b, 0x47, 0x08, 0xc3]))
        .unwrap();

    let mut bytes = vec![0u8; 16];
    bytes[8..16].copy_from_slice(&0x700058u64.to_le_bytes());
    let img = image(0x2000, bytes);
    let out = Evaluator::new(&img, DEFAULT_STEP_BUDGET)
        .evaluate(&program, &[0x2000])
        .unwrap();
    assert_eq!(out, 0x700058);
}

#[test]
fn lifting_is_deterministic() {
    let lifter = AccessorLifter::new().unwrap();
    let f = func("begin", 0x1000, &[0x48, 0x8b, 0x07, 0xc3]);
    let first = lifter.lift(&f).unwrap();
    let second = lifter.lift(&f).unwrap();
    assert_eq!(first, second);
}

#[test]
fn unsupported_instruction_stops_the_lift() {
    // syscall; ret
    let lifter = AccessorLifter::new().unwrap();
    let err = lifter.lift(&func("bad", 0x1000, &[0x0f, 0x05, 0xc3])).unwrap_err();
    match err {
        LiftError::UnsupportedInstruction { mnemonic, address } => {
            assert_eq!(mnemonic, "syscall");
            assert_eq!(address, 0x1000);
        }
        other => panic!("expected UnsupportedInstruction, got {other}"),
    }
}

#[test]
fn backward_jump_terminates_via_step_budget() {
    // self: jmp self
    let lifter = AccessorLifter::new().unwrap();
    let program = lifter.lift(&func("spin", 0x1000, &[0xeb, 0xfe])).unwrap();

    let img = image(0x2000, vec![0; 8]);
    let err = Evaluator::new(&img, 500)
        .evaluate(&program, &[0x2000])
        .unwrap_err();
    assert_eq!(err, EvalError::Divergence { budget: 500 });
}

#[test]
fn get_if_shape_selects_the_active_alternative() {
    // cmp dword [rdi], 1; jne null; lea rax, [rdi+8]; ret; null: xor eax, eax; ret
    let bytes = [
        0x83, 0x3f, 0x01, // cmp dword ptr [rdi], 1
        0x75, 0x05, // jne +5
        0x48, 0x8d, 0x47, 0x08, // lea rax, [rdi+8]
        0xc3, // ret
        0x31, 0xc0, // xor eax, eax
        0xc3, // ret
    ];
    let lifter = AccessorLifter::new().unwrap();
    let program = lifter.lift(&func("get_if", 0x1000, &bytes)).unwrap();

    let mut active = 1u64.to_le_bytes().to_vec();
    active.extend_from_slice(&42u64.to_le_bytes());
    let img = image(0x2000, active);
    let ev = Evaluator::new(&img, DEFAULT_STEP_BUDGET);
    assert_eq!(ev.evaluate(&program, &[0x2000]).unwrap(), 0x2008);

    let mut inactive = 2u64.to_le_bytes().to_vec();
    inactive.extend_from_slice(&42u64.to_le_bytes());
    let img = image(0x2000, inactive);
    let ev = Evaluator::new(&img, DEFAULT_STEP_BUDGET);
    assert_eq!(ev.evaluate(&program, &[0x2000]).unwrap(), 0);
}

#[test]
fn equality_operator_compares_two_arguments() {
    // cmp rdi, rsi; sete al; movzx eax, al; ret
    let bytes = [0x48, 0x39, 0xf7, 0x0f, 0x94, 0xc0, 0x0f, 0xb6, 0xc0, 0xc3];
    let lifter = AccessorLifter::new().unwrap();
    let program = lifter.lift(&func("operator==", 0x1000, &bytes)).unwrap();

    let img = image(0x2000, vec![0; 8]);
    let ev = Evaluator::new(&img, DEFAULT_STEP_BUDGET);
    assert_eq!(ev.evaluate(&program, &[0x10, 0x10]).unwrap(), 1);
    assert_eq!(ev.evaluate(&program, &[0x10, 0x18]).unwrap(), 0);
}

#[test]
fn frame_spills_evaluate_against_the_scratch_stack() {
    // push rbp; mov rbp, rsp; mov [rbp-8], rdi; mov rax, [rbp-8]; pop rbp; ret
    let bytes = [
        0x55, // push rbp
        0x48, 0x89, 0xe5, // mov rbp, rsp
        0x48, 0x89, 0x7d, 0xf8, // mov [rbp-8], rdi
        0x48, 0x8b, 0x45, 0xf8, // mov rax, [rbp-8]
        0x5d, // pop rbp
        0xc3, // ret
    ];
    let lifter = AccessorLifter::new().unwrap();
    let program = lifter.lift(&func("spill", 0x1000, &bytes)).unwrap();

    let img = image(0x2000, vec![0; 8]);
    let out = Evaluator::new(&img, DEFAULT_STEP_BUDGET)
        .evaluate(&program, &[0xfeed])
        .unwrap();
    assert_eq!(out, 0xfeed);
}

#[test]
fn cache_returns_the_same_program_and_remembers_failures() {
    let lifter = AccessorLifter::new().unwrap();
    let cache = AccessorCache::new();
    let build = BuildId::new("app");

    let good = func("begin", 0x1000, &[0x48, 0x8b, 0x07, 0xc3]);
    let first = cache
        .get_or_lift(AccessorKey::new(&build, 0x1000), &good, &lifter)
        .unwrap();
    let second = cache
        .get_or_lift(AccessorKey::new(&build, 0x1000), &good, &lifter)
        .unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));

    let bad = func("bad", 0x2000, &[0x0f, 0x05]);
    assert!(matches!(
        cache.get_or_lift(AccessorKey::new(&build, 0x2000), &bad, &lifter),
        Err(LiftError::UnsupportedInstruction { .. })
    ));
    assert!(matches!(
        cache.get_or_lift(AccessorKey::new(&build, 0x2000), &bad, &lifter),
        Err(LiftError::PreviouslyFailed { .. })
    ));
}
