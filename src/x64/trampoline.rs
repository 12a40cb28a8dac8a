// This module transfers control from the host into compiled code. Two strategies exist.
// Bare invocation casts the entry address to an `extern "C" fn()` and calls it, trusting the
// generated code to honour the host ABI. Guarded invocation wraps the call in inline
// assembly that makes the call safe even for code that tramples every register: RBX and RBP
// (ESI and EBP on 32-bit x86) are LLVM-reserved and therefore pushed and popped by hand,
// all remaining callee-saved registers are declared as clobbered so the compiler saves what
// it needs, MXCSR and the x87 control word are stored around the call, the direction flag is
// cleared afterwards and the frame keeps the stack aligned (with Win64 shadow space) at the
// call instruction. Frame sizes are derived from the calling convention tables.

//! Execution trampoline.

use crate::x64::calling_convention::{aligned_frame, Abi};
use cfg_if::cfg_if;

/// How control is transferred to generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// Plain call through a function pointer.
    Bare,
    /// Call wrapped with save/restore of all non-volatile state.
    Guarded,
}

impl Invocation {
    pub fn from_preserve(preserve_non_volatile: bool) -> Self {
        if preserve_non_volatile {
            Invocation::Guarded
        } else {
            Invocation::Bare
        }
    }
}

/// MXCSR (4 bytes) followed by the x87 control word (2 bytes), padded.
const SAVE_AREA: usize = 8;
/// Registers pushed by hand before the frame is reserved.
const PUSHED: usize = 2 * Abi::HOST.slot_size();
/// The save area sits above the callee's shadow space.
const SAVE_OFFSET: usize = Abi::HOST.shadow_space();
const FRAME: usize = aligned_frame(Abi::HOST, SAVE_OFFSET + SAVE_AREA, PUSHED);

/// Call `entry` using `mode`.
///
/// # Safety
///
/// `entry` must point to executable code that returns to its caller with the stack
/// pointer restored. With [`Invocation::Bare`] the code must additionally preserve every
/// non-volatile register of the host ABI.
pub unsafe fn invoke(entry: usize, mode: Invocation) {
    log::debug!("Invoking {entry:#x} ({mode:?}, {:?})", Abi::HOST);
    // SAFETY: ensured by caller
    unsafe {
        match mode {
            Invocation::Bare => invoke_bare(entry),
            Invocation::Guarded => invoke_guarded(entry),
        }
    }
}

/// Call `entry` as a plain `extern "C" fn()`.
///
/// # Safety
///
/// See [`invoke`].
pub unsafe fn invoke_bare(entry: usize) {
    // SAFETY: ensured by caller
    unsafe {
        let func = std::mem::transmute::<usize, unsafe extern "C" fn()>(entry);
        func();
    }
}

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Call `entry` with every non-volatile register preserved around the call.
        ///
        /// # Safety
        ///
        /// `entry` must point to executable code that returns with the stack pointer
        /// restored.
        #[inline(never)]
        pub unsafe fn invoke_guarded(entry: usize) {
            // Safety: inline assembly
            unsafe {
                core::arch::asm! {
                    // RBX and RBP are LLVM reserved registers and cannot be named as
                    // clobbers, so they are saved on the stack.
                    "push rbx",
                    "push rbp",
                    "sub rsp, {frame}",
                    "stmxcsr dword ptr [rsp + {save}]",
                    "fnstcw word ptr [rsp + {save} + 4]",
                    "call {entry}",
                    "ldmxcsr dword ptr [rsp + {save}]",
                    "fldcw word ptr [rsp + {save} + 4]",
                    "cld",
                    "add rsp, {frame}",
                    "pop rbp",
                    "pop rbx",
                    entry = in(reg) entry,
                    frame = const FRAME,
                    save = const SAVE_OFFSET,
                    // The union of both x86-64 ABIs covers RDI, RSI and XMM6-15 as well as
                    // every volatile register; R12-R15 are the remaining callee-saved ones.
                    lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
                    clobber_abi("sysv64", "win64"),
                }
            }
        }
    } else if #[cfg(target_arch = "x86")] {
        /// Call `entry` with every non-volatile register preserved around the call.
        ///
        /// # Safety
        ///
        /// `entry` must point to executable code that returns with the stack pointer
        /// restored.
        #[inline(never)]
        pub unsafe fn invoke_guarded(entry: usize) {
            // Safety: inline assembly
            unsafe {
                core::arch::asm! {
                    // EBP and ESI are LLVM reserved registers on 32-bit x86.
                    "push ebp",
                    "push esi",
                    "sub esp, {frame}",
                    "stmxcsr dword ptr [esp + {save}]",
                    "fnstcw word ptr [esp + {save} + 4]",
                    "call {entry}",
                    "ldmxcsr dword ptr [esp + {save}]",
                    "fldcw word ptr [esp + {save} + 4]",
                    "cld",
                    "add esp, {frame}",
                    "pop esi",
                    "pop ebp",
                    entry = in(reg) entry,
                    frame = const FRAME,
                    save = const SAVE_OFFSET,
                    lateout("ebx") _, lateout("edi") _,
                    clobber_abi("C"),
                }
            }
        }
    } else {
        compile_error!("Unsupported target architecture");
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::core::config::ManagerConfig;
    use crate::core::manager::Manager;
    use iced_x86::code_asm::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn load(manager: &Manager, build: impl FnOnce(&mut CodeAssembler)) -> usize {
        let mut a = CodeAssembler::new(64).unwrap();
        build(&mut a);
        let code = a.assemble(manager.base() as u64).unwrap();
        manager.load(&code).unwrap();
        manager.base()
    }

    fn read_fpu_control_word() -> u16 {
        let mut value = 0u16;
        // Safety: inline assembly
        unsafe {
            core::arch::asm!("fnstcw word ptr [{0}]", in(reg) &mut value, options(nostack));
        }
        value
    }

    fn direction_flag_set() -> bool {
        let flags: u64;
        // Safety: inline assembly
        unsafe {
            core::arch::asm!("pushfq", "pop {0}", out(reg) flags);
        }
        flags & (1 << 10) != 0
    }

    fn read_mxcsr() -> u32 {
        let mut value = 0u32;
        // Safety: inline assembly
        unsafe {
            core::arch::asm!("stmxcsr dword ptr [{0}]", in(reg) &mut value, options(nostack));
        }
        value
    }

    #[test]
    fn test_frame_keeps_stack_aligned() {
        assert_eq!((FRAME + PUSHED) % Abi::HOST.stack_alignment(), 0);
        assert!(FRAME >= SAVE_OFFSET + SAVE_AREA);
    }

    #[test]
    fn test_bare_invocation() {
        let manager = Manager::with_config(ManagerConfig::new(256).anywhere()).unwrap();
        let entry = load(&manager, |a| a.ret().unwrap());
        unsafe { invoke(entry, Invocation::Bare) };
    }

    /// Registers callee-saved under both x86-64 ABIs and the values parked in them.
    const SEEDS: [(AsmRegister64, u64); 6] = [
        (rbx, 0x1111),
        (rbp, 0x2222),
        (r12, 0x3333),
        (r13, 0x4444),
        (r14, 0x5555),
        (r15, 0x6666),
    ];

    static INNER_ENTRY: AtomicUsize = AtomicUsize::new(0);
    static OBSERVED: [AtomicU64; SEEDS.len()] = [const { AtomicU64::new(0) }; SEEDS.len()];

    extern "C" fn call_inner_guarded() {
        unsafe { invoke(INNER_ENTRY.load(Ordering::SeqCst), Invocation::Guarded) };
    }

    #[test]
    fn test_guarded_invocation_restores_clobbered_registers() {
        let inner_manager = Manager::with_config(ManagerConfig::new(256).anywhere()).unwrap();
        let inner = load(&inner_manager, |a| {
            for (reg, _) in SEEDS {
                a.mov(reg, -1i64).unwrap();
            }
            a.xor(rsi, rsi).unwrap();
            a.xor(rdi, rdi).unwrap();
            a.pxor(xmm6, xmm6).unwrap();
            a.pxor(xmm15, xmm15).unwrap();
            a.ret().unwrap();
        });
        INNER_ENTRY.store(inner, Ordering::SeqCst);

        // The outer function seeds every callee-saved register, enters the clobbering code
        // through the guarded trampoline and records what it finds afterwards.
        let out = OBSERVED.as_ptr() as u64;
        let reserve = (Abi::HOST.shadow_space() + 8) as i32;
        let outer_manager = Manager::with_config(ManagerConfig::new(512).anywhere()).unwrap();
        let outer = load(&outer_manager, |a| {
            for (reg, _) in SEEDS {
                a.push(reg).unwrap();
            }
            for (reg, seed) in SEEDS {
                a.mov(reg, seed as i64).unwrap();
            }
            a.sub(rsp, reserve).unwrap();
            a.mov(rax, call_inner_guarded as extern "C" fn() as usize as u64).unwrap();
            a.call(rax).unwrap();
            a.add(rsp, reserve).unwrap();
            a.mov(rax, out).unwrap();
            for (slot, (reg, _)) in SEEDS.iter().enumerate() {
                a.mov(qword_ptr(rax + (slot * 8) as i32), *reg).unwrap();
            }
            for (reg, _) in SEEDS.iter().rev() {
                a.pop(*reg).unwrap();
            }
            a.ret().unwrap();
        });

        for _ in 0..4 {
            for slot in &OBSERVED {
                slot.store(0, Ordering::SeqCst);
            }
            unsafe { invoke(outer, Invocation::Bare) };
            let observed = OBSERVED.each_ref().map(|slot| slot.load(Ordering::SeqCst));
            assert_eq!(observed, SEEDS.map(|(_, seed)| seed));
        }
    }

    #[test]
    fn test_guarded_invocation_restores_control_state() {
        let manager = Manager::with_config(ManagerConfig::new(256).anywhere()).unwrap();
        // Round toward zero with exceptions masked for both SSE and x87, then set DF.
        let entry = load(&manager, |a| {
            a.sub(rsp, 8).unwrap();
            a.mov(dword_ptr(rsp), 0x7F80).unwrap();
            a.ldmxcsr(dword_ptr(rsp)).unwrap();
            a.mov(word_ptr(rsp + 4), 0x0C7F).unwrap();
            a.fldcw(word_ptr(rsp + 4)).unwrap();
            a.add(rsp, 8).unwrap();
            a.std().unwrap();
            a.ret().unwrap();
        });

        let mxcsr = read_mxcsr();
        let fpu_cw = read_fpu_control_word();
        assert_ne!(mxcsr, 0x7F80);
        assert_ne!(fpu_cw, 0x0C7F);

        unsafe { invoke(entry, Invocation::Guarded) };
        assert_eq!(read_mxcsr(), mxcsr);
        assert_eq!(read_fpu_control_word(), fpu_cw);
        assert!(!direction_flag_set());
    }

    #[test]
    fn test_invocation_from_preserve_flag() {
        assert_eq!(Invocation::from_preserve(true), Invocation::Guarded);
        assert_eq!(Invocation::from_preserve(false), Invocation::Bare);
    }
}
