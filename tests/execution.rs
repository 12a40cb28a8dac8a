//! Compile assembly at runtime and execute it in the host process.

#![cfg(all(target_arch = "x86_64", not(windows)))]

use asmbridge::x64::Abi;
use asmbridge::{CompilationUnit, Manager, ManagerConfig, Outcome, UnitError};
use std::cell::RefCell;
use std::ffi::{c_char, CStr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

fn manager() -> Manager {
    let _ = env_logger::builder().is_test(true).try_init();
    Manager::with_config(ManagerConfig::new(0x1000).anywhere()).unwrap()
}

fn compile<'m>(manager: &'m Manager, source: &str) -> CompilationUnit<'m> {
    let mut unit = CompilationUnit::with_source(source);
    unit.set_manager(manager);
    let outcome = unit.assemble().unwrap();
    assert!(outcome.is_compiled(), "compile failed:\n{}", unit.errors());
    unit
}

#[test]
fn test_predefinition_resolves_to_host_address() {
    static SLOT: AtomicU64 = AtomicU64::new(0);

    let manager = manager();
    let mut unit = CompilationUnit::with_source("mov rax, slot\nmov qword [rax], 0x1234\nret");
    unit.set_manager(&manager);
    unit.add_predefinition_ptr("slot", &SLOT as *const AtomicU64);
    assert!(unit.assemble().unwrap().is_compiled(), "{}", unit.errors());

    unsafe { unit.run(false) }.unwrap();
    assert_eq!(SLOT.load(Ordering::SeqCst), 0x1234);

    SLOT.store(0, Ordering::SeqCst);
    unsafe { unit.run(true) }.unwrap();
    assert_eq!(SLOT.load(Ordering::SeqCst), 0x1234);
}

static PRINTED: Mutex<String> = Mutex::new(String::new());

extern "C" fn host_print(text: *const c_char) {
    let text = unsafe { CStr::from_ptr(text) }.to_string_lossy();
    PRINTED.lock().unwrap().push_str(&text);
}

#[test]
fn test_generated_code_calls_host_print() {
    let manager = manager();
    let mut unit = CompilationUnit::with_source(
        "\
        sub rsp, 8
        lea rdi, [message]
        mov rax, printf
        call rax
        add rsp, 8
        ret
message db 'Hello from generated code', 10, 0",
    );
    unit.set_manager(&manager);
    unit.add_predefinition("printf", host_print as extern "C" fn(*const c_char) as usize);
    assert!(unit.assemble().unwrap().is_compiled(), "{}", unit.errors());

    unsafe { unit.run(true) }.unwrap();
    assert_eq!(*PRINTED.lock().unwrap(), "Hello from generated code\n");

    // Calling the absolute address directly, across the gap between region and host.
    unit.set_source(
        "\
        sub rsp, 8
        lea rdi, [message]
        call printf
        add rsp, 8
        ret
message db 'Called directly', 10, 0",
    );
    assert!(unit.assemble().unwrap().is_compiled(), "{}", unit.errors());

    unsafe { unit.run(false) }.unwrap();
    assert_eq!(
        *PRINTED.lock().unwrap(),
        "Hello from generated code\nCalled directly\n"
    );
}

#[test]
fn test_local_labels_and_loops() {
    static RESULT: AtomicU32 = AtomicU32::new(0);

    let manager = manager();
    let mut unit = CompilationUnit::with_source(
        "\
sum:    mov ecx, 10
        xor eax, eax
.next:  add eax, ecx
        dec ecx
        jnz .next
        mov rdx, result
        mov [rdx], eax
        ret",
    );
    unit.set_manager(&manager);
    unit.add_predefinition_ptr("result", &RESULT as *const AtomicU32);
    assert!(unit.assemble().unwrap().is_compiled(), "{}", unit.errors());

    unsafe { unit.run(false) }.unwrap();
    assert_eq!(RESULT.load(Ordering::SeqCst), 55);
}

thread_local! {
    static CLOBBERING: RefCell<Option<CompilationUnit<'static>>> = RefCell::new(None);
}

static CLOBBER_RUNS: AtomicU64 = AtomicU64::new(0);
static OBSERVED: [AtomicU64; 8] = [const { AtomicU64::new(0) }; 8];

extern "C" fn run_clobbering_unit() {
    CLOBBERING.with_borrow(|unit| {
        let unit = unit.as_ref().expect("clobbering unit not compiled");
        unsafe { unit.run(true) }.expect("guarded run failed");
    });
}

#[test]
fn test_guarded_run_preserves_non_volatile_registers() {
    let registers = Abi::HOST.non_volatile_gprs();
    let seeds: Vec<u64> = (1..=registers.len() as u64).map(|i| i * 0x1111).collect();

    // Overwrites every callee-saved register and counts its own runs.
    let inner_manager: &'static Manager = Box::leak(Box::new(manager()));
    let mut clobber: String = registers.iter().map(|reg| format!("mov {reg}, -1\n")).collect();
    clobber.push_str("mov rax, runs\ninc qword [rax]\nret\n");
    let mut inner = CompilationUnit::with_source(clobber);
    inner.set_manager(inner_manager);
    inner.add_predefinition_ptr("runs", &CLOBBER_RUNS as *const AtomicU64);
    assert!(inner.assemble().unwrap().is_compiled(), "{}", inner.errors());
    CLOBBERING.set(Some(inner));

    // Seeds the registers, runs the clobbering unit guarded, then records what survived.
    let padding = if registers.len() % 2 == 0 { 8 } else { 16 };
    let mut outer = String::new();
    for reg in registers {
        outer.push_str(&format!("push {reg}\n"));
    }
    for (reg, seed) in registers.iter().zip(&seeds) {
        outer.push_str(&format!("mov {reg}, {seed:#x}\n"));
    }
    outer.push_str(&format!("sub rsp, {padding}\nmov rax, callback\ncall rax\nadd rsp, {padding}\n"));
    outer.push_str("mov rax, observed\n");
    for (slot, reg) in registers.iter().enumerate() {
        outer.push_str(&format!("mov [rax + {}], {reg}\n", slot * 8));
    }
    for reg in registers.iter().rev() {
        outer.push_str(&format!("pop {reg}\n"));
    }
    outer.push_str("ret\n");

    let manager = manager();
    let mut unit = CompilationUnit::with_source(outer);
    unit.set_manager(&manager);
    unit.add_predefinition("callback", run_clobbering_unit as extern "C" fn() as usize);
    unit.add_predefinition_ptr("observed", OBSERVED.as_ptr());
    assert!(unit.assemble().unwrap().is_compiled(), "{}", unit.errors());

    for round in 1..=4 {
        unsafe { unit.run(false) }.unwrap();
        assert_eq!(CLOBBER_RUNS.load(Ordering::SeqCst), round);
        let observed: Vec<u64> = OBSERVED[..registers.len()]
            .iter()
            .map(|slot| slot.swap(0, Ordering::SeqCst))
            .collect();
        assert_eq!(observed, seeds);
    }
}

#[test]
fn test_failed_recompile_leaves_nothing_to_run() {
    let manager = manager();
    let mut unit = compile(&manager, "ret");
    unsafe { unit.run(true) }.unwrap();

    unit.set_source("mov eax, [undefined_label]\nret");
    assert_eq!(unit.assemble(), Ok(Outcome::Failed));
    assert!(!unit.errors().is_empty());
    assert_eq!(unsafe { unit.run(true) }, Err(UnitError::NotCompiled));
}

#[test]
fn test_run_preconditions() {
    let unit = CompilationUnit::with_source("ret");
    assert_eq!(unsafe { unit.run(true) }, Err(UnitError::NotCompiled));

    let mut unit = CompilationUnit::with_source("ret");
    assert_eq!(unit.assemble(), Err(UnitError::NoManager));
}

#[test]
fn test_shared_manager_overwrite_is_detected() {
    static WHO: AtomicU64 = AtomicU64::new(0);

    let manager = manager();
    let mut first = CompilationUnit::with_source("mov rax, who\nmov qword [rax], 1\nret");
    let mut second = CompilationUnit::with_source("mov rax, who\nmov qword [rax], 2\nret");
    for unit in [&mut first, &mut second] {
        unit.set_manager(&manager);
        unit.add_predefinition_ptr("who", &WHO as *const AtomicU64);
    }

    assert!(first.assemble().unwrap().is_compiled());
    unsafe { first.run(true) }.unwrap();
    assert_eq!(WHO.load(Ordering::SeqCst), 1);

    assert!(second.assemble().unwrap().is_compiled());
    assert_eq!(unsafe { first.run(true) }, Err(UnitError::Overwritten));
    unsafe { second.run(true) }.unwrap();
    assert_eq!(WHO.load(Ordering::SeqCst), 2);

    assert!(first.assemble().unwrap().is_compiled());
    unsafe { first.run(false) }.unwrap();
    assert_eq!(WHO.load(Ordering::SeqCst), 1);
}
