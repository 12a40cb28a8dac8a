// This module describes the calling conventions the execution trampoline has to honour on
// x86 hosts: System V AMD64 (Linux, macOS and the BSDs), Microsoft x64 (Windows) and the
// 32-bit cdecl convention. For each it records the argument registers, the return register,
// the non-volatile (callee-saved) general purpose and vector registers, the stack alignment
// required at a call instruction and the shadow space the caller must reserve. Abi::HOST
// selects the convention of the running process at compile time; its const accessors feed
// the trampoline's inline assembly so frame sizes stay consistent with the ABI tables, and
// the register lists let callers build code that deliberately clobbers every register a
// guarded invocation promises to restore.

//! x86 / x86-64 calling convention descriptions.

/// A calling convention the trampoline knows how to enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    /// System V AMD64 ABI.
    SysV64,
    /// Microsoft x64 calling convention.
    Win64,
    /// 32-bit cdecl (System V i386 / MSVC).
    Cdecl32,
}

impl Abi {
    /// Convention of the running process.
    pub const HOST: Abi = if cfg!(target_arch = "x86") {
        Abi::Cdecl32
    } else if cfg!(windows) {
        Abi::Win64
    } else {
        Abi::SysV64
    };

    /// General purpose registers the callee must preserve.
    pub const fn non_volatile_gprs(self) -> &'static [&'static str] {
        match self {
            Abi::SysV64 => &["rbx", "rbp", "r12", "r13", "r14", "r15"],
            Abi::Win64 => &["rbx", "rbp", "rdi", "rsi", "r12", "r13", "r14", "r15"],
            Abi::Cdecl32 => &["ebx", "ebp", "esi", "edi"],
        }
    }

    /// Vector registers the callee must preserve.
    pub const fn non_volatile_vector_regs(self) -> &'static [&'static str] {
        match self {
            Abi::Win64 => &[
                "xmm6", "xmm7", "xmm8", "xmm9", "xmm10", "xmm11", "xmm12", "xmm13", "xmm14",
                "xmm15",
            ],
            Abi::SysV64 | Abi::Cdecl32 => &[],
        }
    }

    /// Integer argument registers, in order. Empty for stack-only conventions.
    pub const fn argument_gprs(self) -> &'static [&'static str] {
        match self {
            Abi::SysV64 => &["rdi", "rsi", "rdx", "rcx", "r8", "r9"],
            Abi::Win64 => &["rcx", "rdx", "r8", "r9"],
            Abi::Cdecl32 => &[],
        }
    }

    pub const fn return_gpr(self) -> &'static str {
        match self {
            Abi::SysV64 | Abi::Win64 => "rax",
            Abi::Cdecl32 => "eax",
        }
    }

    /// Stack alignment required at a call instruction.
    pub const fn stack_alignment(self) -> usize {
        16
    }

    /// Bytes the caller reserves above the return address for the callee.
    pub const fn shadow_space(self) -> usize {
        match self {
            Abi::Win64 => 32,
            Abi::SysV64 | Abi::Cdecl32 => 0,
        }
    }

    /// Size of a pushed register.
    pub const fn slot_size(self) -> usize {
        match self {
            Abi::SysV64 | Abi::Win64 => 8,
            Abi::Cdecl32 => 4,
        }
    }

    pub const fn bitness(self) -> u32 {
        match self {
            Abi::SysV64 | Abi::Win64 => 64,
            Abi::Cdecl32 => 32,
        }
    }

    /// Whether `reg` (lower case name) must survive a call under this convention.
    pub fn is_non_volatile(self, reg: &str) -> bool {
        self.non_volatile_gprs()
            .iter()
            .chain(self.non_volatile_vector_regs())
            .any(|&saved| saved == reg)
    }
}

/// Round `size` up so that `size + pushed` keeps the stack aligned for `abi`.
pub const fn aligned_frame(abi: Abi, size: usize, pushed: usize) -> usize {
    let align = abi.stack_alignment();
    let total = size + pushed;
    (total + align - 1) / align * align - pushed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_matches_target() {
        assert_eq!(Abi::HOST.bitness() as usize, usize::BITS as usize);
        assert_eq!(Abi::HOST.slot_size(), std::mem::size_of::<usize>());
    }

    #[test]
    fn test_sysv_non_volatile_set() {
        let abi = Abi::SysV64;
        for reg in ["rbx", "rbp", "r12", "r13", "r14", "r15"] {
            assert!(abi.is_non_volatile(reg), "{reg} should be callee-saved");
        }
        for reg in ["rax", "rcx", "rdx", "rsi", "rdi", "r8", "r11", "xmm6"] {
            assert!(!abi.is_non_volatile(reg), "{reg} should be caller-saved");
        }
    }

    #[test]
    fn test_win64_non_volatile_set() {
        let abi = Abi::Win64;
        assert!(abi.is_non_volatile("rsi"));
        assert!(abi.is_non_volatile("rdi"));
        assert!(abi.is_non_volatile("xmm15"));
        assert!(!abi.is_non_volatile("xmm5"));
        assert_eq!(abi.shadow_space(), 32);
    }

    #[test]
    fn test_aligned_frame() {
        // Two pushed 8-byte registers plus an 8-byte save area.
        assert_eq!(aligned_frame(Abi::SysV64, 8, 16), 16);
        // Shadow space plus save area.
        assert_eq!(aligned_frame(Abi::Win64, 32 + 8, 16), 48);
        // Two pushed 4-byte registers plus an 8-byte save area.
        assert_eq!(aligned_frame(Abi::Cdecl32, 8, 8), 8);
        assert_eq!((aligned_frame(Abi::SysV64, 1, 16) + 16) % 16, 0);
    }
}
