// This module provides IcedEngine, the default assembler engine. It feeds statements from
// the source parser into an iced-x86 CodeAssembler and lets iced's block encoder produce the
// final bytes for the real load address, so label references, rip-relative data and absolute
// branch targets all resolve against the region the code will run from. Encoding happens in
// two passes. The first gathers label definitions, groups labels that name the same location
// onto one CodeLabel (iced allows only one label per instruction) and reports duplicates; the
// second lowers parsed operands onto typed iced operands (AsmRegister64/32/16/8, memory
// operands, immediates, labels) and dispatches each mnemonic onto the matching
// CodeAssembler method. Operand combinations iced has no encoding for, immediates out of
// range, registers unavailable in 32-bit mode and undefined symbols become diagnostics
// carrying the line number and source text. Nothing is emitted unless every line encodes.

//! Default assembler engine built on iced-x86.

use crate::core::engine::{Diagnostic, Engine, Target};
use crate::x64::parser::{parse_source, DataItem, Gpr, Memory, Operand, Statement, StatementKind};
use hashbrown::HashMap;
use iced_x86::code_asm::{registers::cl, *};
use iced_x86::IcedError;

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    #[error("unknown instruction '{0}'")]
    UnknownInstruction(String),
    #[error("invalid operands for '{0}'")]
    InvalidOperands(String),
    #[error("operand sizes do not match")]
    SizeMismatch,
    #[error("operand size not specified")]
    MissingSize,
    #[error("undefined symbol '{0}'")]
    UndefinedSymbol(String),
    #[error("immediate {value} does not fit in {bits} bits")]
    ImmediateRange { value: i64, bits: u32 },
    #[error("'{0}' is not available in 32-bit mode")]
    LongModeOnly(String),
    #[error("absolute memory operand {0:#x} is not supported, load the address into a register")]
    AbsoluteAddress(i64),
    #[error("reservation of {0} bytes exceeds the region capacity")]
    ReservationTooLarge(u64),
    /// Assembly error from iced-x86.
    #[error("{0}")]
    Assembler(String),
}

impl From<IcedError> for EncodingError {
    fn from(e: IcedError) -> Self {
        EncodingError::Assembler(e.to_string())
    }
}

const GP64: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];
const GP32: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];
const GP16: [AsmRegister16; 16] = [
    ax, cx, dx, bx, sp, bp, si, di, r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
];
const GP8: [AsmRegister8; 16] = [
    al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
];
const GP8_HIGH: [AsmRegister8; 4] = [ah, ch, dh, bh];

/// A parsed operand lowered onto iced types.
#[derive(Debug, Clone, Copy)]
enum Arg {
    R64(AsmRegister64),
    R32(AsmRegister32),
    R16(AsmRegister16),
    R8(AsmRegister8),
    Imm(i64),
    /// Memory operand and its explicit size in bits.
    Mem(AsmMemoryOperand, Option<u32>),
    Label(CodeLabel),
}

impl Arg {
    fn width(self) -> Option<u32> {
        match self {
            Arg::R64(_) => Some(64),
            Arg::R32(_) => Some(32),
            Arg::R16(_) => Some(16),
            Arg::R8(_) => Some(8),
            Arg::Mem(_, size) => size,
            Arg::Imm(_) | Arg::Label(_) => None,
        }
    }
}

fn same_size(dst: Arg, src: Arg) -> Result<(), EncodingError> {
    match (dst.width(), src.width()) {
        (Some(d), Some(s)) if d != s => Err(EncodingError::SizeMismatch),
        _ => Ok(()),
    }
}

/// Immediate for an operand of `bits` width, wrapped into the signed range.
fn imm(value: i64, bits: u32) -> Result<i32, EncodingError> {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << bits) - 1;
    if value < min || value > max {
        return Err(EncodingError::ImmediateRange { value, bits });
    }
    let shift = 64 - bits;
    Ok(((value << shift) >> shift) as i32)
}

/// Sign-extended 32-bit immediate for a 64-bit operand.
fn simm32(value: i64) -> Result<i32, EncodingError> {
    i32::try_from(value).map_err(|_| EncodingError::ImmediateRange { value, bits: 32 })
}

fn mem_imm(value: i64, size: Option<u32>) -> Result<i32, EncodingError> {
    match size {
        Some(64) => simm32(value),
        Some(bits) => imm(value, bits),
        None => Err(EncodingError::MissingSize),
    }
}

fn sized(mem: AsmMemoryOperand, size: Option<u32>) -> AsmMemoryOperand {
    match size {
        Some(8) => byte_ptr(mem),
        Some(16) => word_ptr(mem),
        Some(32) => dword_ptr(mem),
        Some(64) => qword_ptr(mem),
        _ => mem,
    }
}

/// Build `[base + index*scale + disp]` from one register table.
macro_rules! address {
    ($table:ident, $base:expr, $index:expr, $disp:expr, $abs:expr) => {
        match ($base, $index) {
            (Some(base), None) => $table[base.number as usize] + $disp,
            (Some(base), Some((index, scale))) => {
                $table[base.number as usize] + $table[index.number as usize] * scale + $disp
            }
            (None, Some((index, scale))) => $table[index.number as usize] * scale + $disp,
            (None, None) => return Err(EncodingError::AbsoluteAddress($abs)),
        }
    };
}

/// Two-operand integer instructions with the usual r/m, r/m, imm forms.
///
/// The `@with` form takes the arms for a 64-bit register and an immediate (plus any
/// other special cases) from the caller, since `mov` has no sign-extended imm32 form.
macro_rules! binary {
    (@with $a:expr, $method:ident, $dst:expr, $src:expr, $mnemonic:expr,
        $($extra:pat $(if $guard:expr)? => $body:expr),+ $(,)?) => {
        match ($dst, $src) {
            $($extra $(if $guard)? => $body,)+
            (Arg::R64(d), Arg::R64(s)) => $a.$method(d, s)?,
            (Arg::R32(d), Arg::R32(s)) => $a.$method(d, s)?,
            (Arg::R16(d), Arg::R16(s)) => $a.$method(d, s)?,
            (Arg::R8(d), Arg::R8(s)) => $a.$method(d, s)?,
            (Arg::R64(d), Arg::Mem(m, _)) => $a.$method(d, m)?,
            (Arg::R32(d), Arg::Mem(m, _)) => $a.$method(d, m)?,
            (Arg::R16(d), Arg::Mem(m, _)) => $a.$method(d, m)?,
            (Arg::R8(d), Arg::Mem(m, _)) => $a.$method(d, m)?,
            (Arg::Mem(m, _), Arg::R64(s)) => $a.$method(m, s)?,
            (Arg::Mem(m, _), Arg::R32(s)) => $a.$method(m, s)?,
            (Arg::Mem(m, _), Arg::R16(s)) => $a.$method(m, s)?,
            (Arg::Mem(m, _), Arg::R8(s)) => $a.$method(m, s)?,
            (Arg::R32(d), Arg::Imm(v)) => $a.$method(d, imm(v, 32)?)?,
            (Arg::R16(d), Arg::Imm(v)) => $a.$method(d, imm(v, 16)?)?,
            (Arg::R8(d), Arg::Imm(v)) => $a.$method(d, imm(v, 8)?)?,
            (Arg::Mem(m, size), Arg::Imm(v)) => $a.$method(m, mem_imm(v, size)?)?,
            _ => return Err(EncodingError::InvalidOperands($mnemonic.to_string())),
        }
    };
    ($a:expr, $method:ident, $dst:expr, $src:expr, $mnemonic:expr) => {
        binary!(@with $a, $method, $dst, $src, $mnemonic,
            (Arg::R64(d), Arg::Imm(v)) => $a.$method(d, simm32(v)?)?)
    };
}

/// Single r/m operand instructions.
macro_rules! unary {
    ($a:expr, $method:ident, $arg:expr, $mnemonic:expr) => {
        match $arg {
            Arg::R64(r) => $a.$method(r)?,
            Arg::R32(r) => $a.$method(r)?,
            Arg::R16(r) => $a.$method(r)?,
            Arg::R8(r) => $a.$method(r)?,
            Arg::Mem(_, None) => return Err(EncodingError::MissingSize),
            Arg::Mem(m, Some(_)) => $a.$method(m)?,
            _ => return Err(EncodingError::InvalidOperands($mnemonic.to_string())),
        }
    };
}

/// Shifts and rotates by `cl` or an 8-bit count.
macro_rules! shift {
    ($a:expr, $method:ident, $dst:expr, $count:expr, $mnemonic:expr) => {{
        if let Arg::Mem(_, None) = $dst {
            return Err(EncodingError::MissingSize);
        }
        match ($dst, $count) {
            (Arg::R64(d), Arg::R8(c)) if c == cl => $a.$method(d, cl)?,
            (Arg::R32(d), Arg::R8(c)) if c == cl => $a.$method(d, cl)?,
            (Arg::R16(d), Arg::R8(c)) if c == cl => $a.$method(d, cl)?,
            (Arg::R8(d), Arg::R8(c)) if c == cl => $a.$method(d, cl)?,
            (Arg::Mem(m, _), Arg::R8(c)) if c == cl => $a.$method(m, cl)?,
            (dst, Arg::Imm(v)) if (0..=255).contains(&v) => {
                let count = v as i32;
                match dst {
                    Arg::R64(d) => $a.$method(d, count)?,
                    Arg::R32(d) => $a.$method(d, count)?,
                    Arg::R16(d) => $a.$method(d, count)?,
                    Arg::R8(d) => $a.$method(d, count)?,
                    Arg::Mem(m, _) => $a.$method(m, count)?,
                    _ => return Err(EncodingError::InvalidOperands($mnemonic.to_string())),
                }
            }
            (_, Arg::Imm(value)) => return Err(EncodingError::ImmediateRange { value, bits: 8 }),
            _ => return Err(EncodingError::InvalidOperands($mnemonic.to_string())),
        }
    }};
}

/// Condition codes shared by the `jcc`, `setcc` and `cmovcc` families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Condition {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Condition {
    fn from_suffix(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "o" => Condition::O,
            "no" => Condition::No,
            "b" | "c" | "nae" => Condition::B,
            "ae" | "nb" | "nc" => Condition::Ae,
            "e" | "z" => Condition::E,
            "ne" | "nz" => Condition::Ne,
            "be" | "na" => Condition::Be,
            "a" | "nbe" => Condition::A,
            "s" => Condition::S,
            "ns" => Condition::Ns,
            "p" | "pe" => Condition::P,
            "np" | "po" => Condition::Np,
            "l" | "nge" => Condition::L,
            "ge" | "nl" => Condition::Ge,
            "le" | "ng" => Condition::Le,
            "g" | "nle" => Condition::G,
            _ => return None,
        })
    }
}

macro_rules! by_condition {
    ($cond:expr, $emit:ident, $($variant:ident => $method:ident),+ $(,)?) => {
        match $cond {
            $(Condition::$variant => $emit!($method),)+
        }
    };
}

macro_rules! jcc_methods {
    ($cond:expr, $emit:ident) => {
        by_condition!($cond, $emit,
            O => jo, No => jno, B => jb, Ae => jae, E => je, Ne => jne, Be => jbe, A => ja,
            S => js, Ns => jns, P => jp, Np => jnp, L => jl, Ge => jge, Le => jle, G => jg)
    };
}

macro_rules! setcc_methods {
    ($cond:expr, $emit:ident) => {
        by_condition!($cond, $emit,
            O => seto, No => setno, B => setb, Ae => setae, E => sete, Ne => setne,
            Be => setbe, A => seta, S => sets, Ns => setns, P => setp, Np => setnp, L => setl,
            Ge => setge, Le => setle, G => setg)
    };
}

macro_rules! cmovcc_methods {
    ($cond:expr, $emit:ident) => {
        by_condition!($cond, $emit,
            O => cmovo, No => cmovno, B => cmovb, Ae => cmovae, E => cmove, Ne => cmovne,
            Be => cmovbe, A => cmova, S => cmovs, Ns => cmovns, P => cmovp, Np => cmovnp,
            L => cmovl, Ge => cmovge, Le => cmovle, G => cmovg)
    };
}

/// Assembler engine for a FASM-flavoured Intel-syntax subset, encoded with iced-x86.
#[derive(Debug, Default, Clone, Copy)]
pub struct IcedEngine;

impl IcedEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Engine for IcedEngine {
    fn assemble(&mut self, source: &str, target: Target) -> Result<Vec<u8>, Vec<Diagnostic>> {
        let statements = parse_source(source)?;
        let lines: Vec<&str> = source.lines().collect();
        let at = |line: usize, message: String| {
            let diag = Diagnostic::at_line(line, message);
            match lines.get(line - 1) {
                Some(text) => diag.with_source(*text),
                None => diag,
            }
        };

        let mut diagnostics = Vec::new();
        let bitness = select_bitness(&statements, target.bitness, &mut |line, message| {
            diagnostics.push(at(line, message))
        });

        let asm = CodeAssembler::new(bitness).map_err(|e| vec![Diagnostic::new(e.to_string())])?;
        let mut emitter = Emitter {
            asm,
            bitness,
            capacity: target.capacity,
            labels: HashMap::new(),
        };

        // Pass 1: bind every label to the statement that follows it.
        let mut defined: HashMap<&str, usize> = HashMap::new();
        let mut anchors: Vec<Option<CodeLabel>> = vec![None; statements.len()];
        let mut pending: Vec<&str> = Vec::new();
        for (idx, statement) in statements.iter().enumerate() {
            for name in &statement.labels {
                if let Some(first) = defined.insert(name, statement.line) {
                    defined.insert(name, first);
                    diagnostics.push(at(
                        statement.line,
                        format!("label '{name}' is already defined on line {first}"),
                    ));
                } else {
                    pending.push(name);
                }
            }
            if emits(statement) && !pending.is_empty() {
                anchors[idx] = Some(emitter.bind(pending.drain(..)));
            }
        }
        let trailing = (!pending.is_empty()).then(|| emitter.bind(pending.drain(..)));

        // Pass 2: encode.
        let mut emitted = false;
        for (statement, anchor) in statements.iter().zip(anchors) {
            if let Some(mut label) = anchor {
                if let Err(e) = emitter.asm.set_label(&mut label) {
                    diagnostics.push(at(statement.line, e.to_string()));
                }
            }
            match emitter.statement(statement) {
                Ok(()) => {
                    emitted |= emits(statement);
                    log::trace!("Line {}: {:?}", statement.line, statement.kind);
                }
                Err(e) => {
                    diagnostics.push(at(statement.line, e.to_string()));
                    // Keeps a label bound above this line attached to something.
                    let _ = emitter.asm.int3();
                }
            }
        }

        if !diagnostics.is_empty() {
            return Err(diagnostics);
        }
        if !emitted {
            return Ok(Vec::new());
        }

        if let Some(mut label) = trailing {
            emitter
                .asm
                .set_label(&mut label)
                .and_then(|_| emitter.asm.zero_bytes())
                .map_err(|e| vec![Diagnostic::new(e.to_string())])?;
        }

        emitter
            .asm
            .assemble(target.base)
            .map_err(|e| vec![Diagnostic::new(e.to_string())])
    }
}

/// Code size for the source: its `use32`/`use64` directive, or the target default.
fn select_bitness(
    statements: &[Statement],
    default: u32,
    report: &mut dyn FnMut(usize, String),
) -> u32 {
    let mut selected: Option<u32> = None;
    for statement in statements {
        if let StatementKind::Mode(bits) = statement.kind {
            match selected {
                Some(previous) if previous != bits => report(
                    statement.line,
                    format!("conflicting code size: use{bits} after use{previous}"),
                ),
                Some(_) => {}
                None => {
                    if bits != default {
                        report(
                            statement.line,
                            format!("use{bits} code cannot run on a {default}-bit host"),
                        );
                    }
                    selected = Some(bits);
                }
            }
        }
    }
    selected.unwrap_or(default)
}

fn emits(statement: &Statement) -> bool {
    match &statement.kind {
        StatementKind::Instruction { .. } => true,
        StatementKind::Data { items, .. } => items
            .iter()
            .any(|item| !matches!(item, DataItem::Bytes(bytes) if bytes.is_empty())),
        StatementKind::Reserve { count, .. } => *count > 0,
        StatementKind::Empty | StatementKind::Mode(_) => false,
    }
}

fn data_bytes(unit: usize, items: &[DataItem]) -> Result<Vec<u8>, EncodingError> {
    let mut bytes = Vec::with_capacity(unit * items.len());
    for item in items {
        match item {
            DataItem::Value(value) => {
                let bits = (unit * 8) as u32;
                if bits < 64 {
                    imm(*value, bits)?;
                }
                bytes.extend_from_slice(&value.to_le_bytes()[..unit]);
            }
            DataItem::Bytes(data) => bytes.extend_from_slice(data),
            DataItem::Uninitialized => bytes.resize(bytes.len() + unit, 0),
        }
    }
    Ok(bytes)
}

struct Emitter {
    asm: CodeAssembler,
    bitness: u32,
    capacity: usize,
    labels: HashMap<String, CodeLabel>,
}

impl Emitter {
    /// Create one label shared by all `names`.
    fn bind<'n>(&mut self, names: impl Iterator<Item = &'n str>) -> CodeLabel {
        let label = self.asm.create_label();
        for name in names {
            self.labels.insert(name.to_string(), label);
        }
        label
    }

    fn label(&self, name: &str) -> Result<CodeLabel, EncodingError> {
        self.labels
            .get(name)
            .copied()
            .ok_or_else(|| EncodingError::UndefinedSymbol(name.to_string()))
    }

    fn check_mode(&self, reg: Gpr) -> Result<(), EncodingError> {
        if self.bitness == 32 && reg.requires_long_mode() {
            return Err(EncodingError::LongModeOnly(reg.name().to_string()));
        }
        Ok(())
    }

    fn lower(&self, operand: &Operand) -> Result<Arg, EncodingError> {
        Ok(match operand {
            Operand::Register(reg) => {
                self.check_mode(*reg)?;
                let idx = reg.number as usize;
                match reg.width {
                    64 => Arg::R64(GP64[idx]),
                    32 => Arg::R32(GP32[idx]),
                    16 => Arg::R16(GP16[idx]),
                    _ if reg.high => Arg::R8(GP8_HIGH[idx - 4]),
                    _ => Arg::R8(GP8[idx]),
                }
            }
            Operand::Immediate(value) => Arg::Imm(*value),
            Operand::Symbol(name) => Arg::Label(self.label(name)?),
            Operand::Memory(mem) => Arg::Mem(sized(self.address(mem)?, mem.size), mem.size),
        })
    }

    fn address(&self, mem: &Memory) -> Result<AsmMemoryOperand, EncodingError> {
        if let Some(name) = &mem.label {
            return Ok(ptr(self.label(name)?));
        }
        if mem.base.is_none() && mem.index.is_none() {
            return Err(EncodingError::AbsoluteAddress(mem.displacement));
        }
        for reg in mem.base.iter().chain(mem.index.iter().map(|(reg, _)| reg)) {
            self.check_mode(*reg)?;
        }

        let disp = simm32(mem.displacement)?;
        let wide = mem.base.or(mem.index.map(|(reg, _)| reg)).is_some_and(|reg| reg.width == 64);
        Ok(if wide {
            address!(GP64, mem.base, mem.index, disp, mem.displacement)
        } else {
            address!(GP32, mem.base, mem.index, disp, mem.displacement)
        })
    }

    fn statement(&mut self, statement: &Statement) -> Result<(), EncodingError> {
        match &statement.kind {
            StatementKind::Instruction { mnemonic, operands } => {
                let args = operands
                    .iter()
                    .map(|op| self.lower(op))
                    .collect::<Result<Vec<_>, _>>()?;
                self.instruction(mnemonic, &args)
            }
            StatementKind::Data { unit, items } => {
                let bytes = data_bytes(*unit, items)?;
                if !bytes.is_empty() {
                    self.asm.db(&bytes)?;
                }
                Ok(())
            }
            StatementKind::Reserve { unit, count } => {
                let total = count.saturating_mul(*unit as u64);
                if total > self.capacity as u64 {
                    return Err(EncodingError::ReservationTooLarge(total));
                }
                if total > 0 {
                    self.asm.db(&vec![0u8; total as usize])?;
                }
                Ok(())
            }
            StatementKind::Empty | StatementKind::Mode(_) => Ok(()),
        }
    }

    fn instruction(&mut self, mnemonic: &str, args: &[Arg]) -> Result<(), EncodingError> {
        let invalid = || EncodingError::InvalidOperands(mnemonic.to_string());
        let long_mode = self.bitness == 64;
        let a = &mut self.asm;

        if !long_mode && matches!(mnemonic, "cqo" | "cdqe" | "movsxd") {
            return Err(EncodingError::LongModeOnly(mnemonic.to_string()));
        }

        match (mnemonic, args) {
            ("nop", []) => a.nop()?,
            ("int3", []) => a.int3()?,
            ("leave", []) => a.leave()?,
            ("cdq", []) => a.cdq()?,
            ("cqo", []) => a.cqo()?,
            ("cdqe", []) => a.cdqe()?,
            ("cld", []) => a.cld()?,
            ("std", []) => a.std()?,
            ("ud2", []) => a.ud2()?,
            ("pause", []) => a.pause()?,
            ("ret", []) => a.ret()?,
            ("ret", [Arg::Imm(v)]) => {
                if !(0..=0xFFFF).contains(v) {
                    return Err(EncodingError::ImmediateRange { value: *v, bits: 16 });
                }
                a.ret_1(*v as i32)?
            }

            ("mov", [dst, src]) => {
                same_size(*dst, *src)?;
                binary!(@with a, mov, *dst, *src, mnemonic,
                    (Arg::R64(d), Arg::Imm(v)) => a.mov(d, v)?,
                    (Arg::R64(d), Arg::Label(l)) => a.lea(d, ptr(l))?,
                    (Arg::R32(d), Arg::Label(l)) if !long_mode => a.lea(d, ptr(l))?,
                )
            }
            ("add" | "sub" | "and" | "or" | "xor" | "cmp" | "adc" | "sbb", [dst, src]) => {
                same_size(*dst, *src)?;
                let (dst, src) = (*dst, *src);
                match mnemonic {
                    "add" => binary!(a, add, dst, src, mnemonic),
                    "sub" => binary!(a, sub, dst, src, mnemonic),
                    "and" => binary!(a, and, dst, src, mnemonic),
                    "or" => binary!(a, or, dst, src, mnemonic),
                    "xor" => binary!(a, xor, dst, src, mnemonic),
                    "cmp" => binary!(a, cmp, dst, src, mnemonic),
                    "adc" => binary!(a, adc, dst, src, mnemonic),
                    _ => binary!(a, sbb, dst, src, mnemonic),
                }
            }
            ("test" | "xchg", [dst, src]) => {
                same_size(*dst, *src)?;
                // Both are commutative; iced only encodes the r/m, reg order.
                let (dst, src) = match (*dst, *src) {
                    (reg, Arg::Mem(m, size)) if !matches!(reg, Arg::Mem(..)) => {
                        (Arg::Mem(m, size), reg)
                    }
                    pair => pair,
                };
                match (mnemonic, dst, src) {
                    ("test", Arg::R64(d), Arg::R64(s)) => a.test(d, s)?,
                    ("test", Arg::R32(d), Arg::R32(s)) => a.test(d, s)?,
                    ("test", Arg::R16(d), Arg::R16(s)) => a.test(d, s)?,
                    ("test", Arg::R8(d), Arg::R8(s)) => a.test(d, s)?,
                    ("test", Arg::Mem(m, _), Arg::R64(s)) => a.test(m, s)?,
                    ("test", Arg::Mem(m, _), Arg::R32(s)) => a.test(m, s)?,
                    ("test", Arg::Mem(m, _), Arg::R16(s)) => a.test(m, s)?,
                    ("test", Arg::Mem(m, _), Arg::R8(s)) => a.test(m, s)?,
                    ("test", Arg::R64(d), Arg::Imm(v)) => a.test(d, simm32(v)?)?,
                    ("test", Arg::R32(d), Arg::Imm(v)) => a.test(d, imm(v, 32)?)?,
                    ("test", Arg::R16(d), Arg::Imm(v)) => a.test(d, imm(v, 16)?)?,
                    ("test", Arg::R8(d), Arg::Imm(v)) => a.test(d, imm(v, 8)?)?,
                    ("test", Arg::Mem(m, size), Arg::Imm(v)) => a.test(m, mem_imm(v, size)?)?,
                    ("xchg", Arg::R64(d), Arg::R64(s)) => a.xchg(d, s)?,
                    ("xchg", Arg::R32(d), Arg::R32(s)) => a.xchg(d, s)?,
                    ("xchg", Arg::R16(d), Arg::R16(s)) => a.xchg(d, s)?,
                    ("xchg", Arg::R8(d), Arg::R8(s)) => a.xchg(d, s)?,
                    ("xchg", Arg::Mem(m, _), Arg::R64(s)) => a.xchg(m, s)?,
                    ("xchg", Arg::Mem(m, _), Arg::R32(s)) => a.xchg(m, s)?,
                    ("xchg", Arg::Mem(m, _), Arg::R16(s)) => a.xchg(m, s)?,
                    ("xchg", Arg::Mem(m, _), Arg::R8(s)) => a.xchg(m, s)?,
                    _ => return Err(invalid()),
                }
            }
            ("lea", [dst, src]) => match (*dst, *src) {
                (Arg::R64(d), Arg::Mem(m, _)) => a.lea(d, m)?,
                (Arg::R32(d), Arg::Mem(m, _)) => a.lea(d, m)?,
                (Arg::R16(d), Arg::Mem(m, _)) => a.lea(d, m)?,
                (Arg::R64(d), Arg::Label(l)) => a.lea(d, ptr(l))?,
                (Arg::R32(d), Arg::Label(l)) => a.lea(d, ptr(l))?,
                _ => return Err(invalid()),
            },
            ("movzx" | "movsx", [dst, src]) => {
                let zero = mnemonic == "movzx";
                match (*dst, *src) {
                    (_, Arg::Mem(_, None)) => return Err(EncodingError::MissingSize),
                    (Arg::R64(d), Arg::R8(s)) if zero => a.movzx(d, s)?,
                    (Arg::R64(d), Arg::R16(s)) if zero => a.movzx(d, s)?,
                    (Arg::R32(d), Arg::R8(s)) if zero => a.movzx(d, s)?,
                    (Arg::R32(d), Arg::R16(s)) if zero => a.movzx(d, s)?,
                    (Arg::R16(d), Arg::R8(s)) if zero => a.movzx(d, s)?,
                    (Arg::R64(d), Arg::Mem(m, Some(8 | 16))) if zero => a.movzx(d, m)?,
                    (Arg::R32(d), Arg::Mem(m, Some(8 | 16))) if zero => a.movzx(d, m)?,
                    (Arg::R16(d), Arg::Mem(m, Some(8))) if zero => a.movzx(d, m)?,
                    (Arg::R64(d), Arg::R8(s)) => a.movsx(d, s)?,
                    (Arg::R64(d), Arg::R16(s)) => a.movsx(d, s)?,
                    (Arg::R32(d), Arg::R8(s)) => a.movsx(d, s)?,
                    (Arg::R32(d), Arg::R16(s)) => a.movsx(d, s)?,
                    (Arg::R16(d), Arg::R8(s)) => a.movsx(d, s)?,
                    (Arg::R64(d), Arg::Mem(m, Some(8 | 16))) => a.movsx(d, m)?,
                    (Arg::R32(d), Arg::Mem(m, Some(8 | 16))) => a.movsx(d, m)?,
                    (Arg::R16(d), Arg::Mem(m, Some(8))) => a.movsx(d, m)?,
                    _ => return Err(invalid()),
                }
            }
            ("movsxd", [dst, src]) => match (*dst, *src) {
                (Arg::R64(d), Arg::R32(s)) => a.movsxd(d, s)?,
                (Arg::R64(d), Arg::Mem(m, None | Some(32))) => a.movsxd(d, dword_ptr(m))?,
                _ => return Err(invalid()),
            },
            ("shl" | "sal" | "shr" | "sar" | "rol" | "ror", [dst, count]) => {
                let (dst, count) = (*dst, *count);
                match mnemonic {
                    "shl" | "sal" => shift!(a, shl, dst, count, mnemonic),
                    "shr" => shift!(a, shr, dst, count, mnemonic),
                    "sar" => shift!(a, sar, dst, count, mnemonic),
                    "rol" => shift!(a, rol, dst, count, mnemonic),
                    _ => shift!(a, ror, dst, count, mnemonic),
                }
            }
            ("inc" | "dec" | "neg" | "not" | "mul" | "div" | "idiv" | "imul", [arg]) => {
                let arg = *arg;
                match mnemonic {
                    "inc" => unary!(a, inc, arg, mnemonic),
                    "dec" => unary!(a, dec, arg, mnemonic),
                    "neg" => unary!(a, neg, arg, mnemonic),
                    "not" => unary!(a, not, arg, mnemonic),
                    "mul" => unary!(a, mul, arg, mnemonic),
                    "div" => unary!(a, div, arg, mnemonic),
                    "idiv" => unary!(a, idiv, arg, mnemonic),
                    _ => unary!(a, imul, arg, mnemonic),
                }
            }
            ("imul", [dst, src]) => {
                same_size(*dst, *src)?;
                match (*dst, *src) {
                    (Arg::R64(d), Arg::R64(s)) => a.imul_2(d, s)?,
                    (Arg::R32(d), Arg::R32(s)) => a.imul_2(d, s)?,
                    (Arg::R16(d), Arg::R16(s)) => a.imul_2(d, s)?,
                    (Arg::R64(d), Arg::Mem(m, _)) => a.imul_2(d, m)?,
                    (Arg::R32(d), Arg::Mem(m, _)) => a.imul_2(d, m)?,
                    (Arg::R16(d), Arg::Mem(m, _)) => a.imul_2(d, m)?,
                    (Arg::R64(d), Arg::Imm(v)) => a.imul_3(d, d, simm32(v)?)?,
                    (Arg::R32(d), Arg::Imm(v)) => a.imul_3(d, d, imm(v, 32)?)?,
                    (Arg::R16(d), Arg::Imm(v)) => a.imul_3(d, d, imm(v, 16)?)?,
                    _ => return Err(invalid()),
                }
            }
            ("imul", [dst, src, Arg::Imm(v)]) => {
                same_size(*dst, *src)?;
                match (*dst, *src) {
                    (Arg::R64(d), Arg::R64(s)) => a.imul_3(d, s, simm32(*v)?)?,
                    (Arg::R32(d), Arg::R32(s)) => a.imul_3(d, s, imm(*v, 32)?)?,
                    (Arg::R16(d), Arg::R16(s)) => a.imul_3(d, s, imm(*v, 16)?)?,
                    (Arg::R64(d), Arg::Mem(m, _)) => a.imul_3(d, m, simm32(*v)?)?,
                    (Arg::R32(d), Arg::Mem(m, _)) => a.imul_3(d, m, imm(*v, 32)?)?,
                    (Arg::R16(d), Arg::Mem(m, _)) => a.imul_3(d, m, imm(*v, 16)?)?,
                    _ => return Err(invalid()),
                }
            }
            ("push" | "pop", [arg]) => {
                let push = mnemonic == "push";
                let native = if long_mode { 64 } else { 32 };
                match *arg {
                    Arg::R64(r) if push => a.push(r)?,
                    Arg::R64(r) => a.pop(r)?,
                    Arg::R32(r) if !long_mode && push => a.push(r)?,
                    Arg::R32(r) if !long_mode => a.pop(r)?,
                    Arg::R16(r) if push => a.push(r)?,
                    Arg::R16(r) => a.pop(r)?,
                    Arg::Mem(m, size) if size.is_none() || size == Some(native) => {
                        let m = sized(m, Some(native));
                        if push {
                            a.push(m)?
                        } else {
                            a.pop(m)?
                        }
                    }
                    Arg::Imm(v) if push && long_mode => a.push(simm32(v)?)?,
                    Arg::Imm(v) if push => a.push(imm(v, 32)?)?,
                    _ => return Err(invalid()),
                }
            }
            ("call" | "jmp", [target]) => {
                let call = mnemonic == "call";
                match *target {
                    Arg::Label(l) if call => a.call(l)?,
                    Arg::Label(l) => a.jmp(l)?,
                    Arg::Imm(v) if call => a.call(v as u64)?,
                    Arg::Imm(v) => a.jmp(v as u64)?,
                    Arg::R64(r) if call => a.call(r)?,
                    Arg::R64(r) => a.jmp(r)?,
                    Arg::R32(r) if !long_mode && call => a.call(r)?,
                    Arg::R32(r) if !long_mode => a.jmp(r)?,
                    Arg::Mem(m, _) => {
                        let m = if long_mode { qword_ptr(m) } else { dword_ptr(m) };
                        if call {
                            a.call(m)?
                        } else {
                            a.jmp(m)?
                        }
                    }
                    _ => return Err(invalid()),
                }
            }
            (_, [target]) if mnemonic.starts_with('j') => {
                let cond = Condition::from_suffix(&mnemonic[1..])
                    .ok_or_else(|| EncodingError::UnknownInstruction(mnemonic.to_string()))?;
                match *target {
                    Arg::Label(label) => {
                        macro_rules! emit {
                            ($m:ident) => {
                                a.$m(label)?
                            };
                        }
                        jcc_methods!(cond, emit)
                    }
                    Arg::Imm(v) => {
                        let address = v as u64;
                        macro_rules! emit {
                            ($m:ident) => {
                                a.$m(address)?
                            };
                        }
                        jcc_methods!(cond, emit)
                    }
                    _ => return Err(invalid()),
                }
            }
            (_, [arg]) if mnemonic.starts_with("set") => {
                let cond = Condition::from_suffix(&mnemonic[3..])
                    .ok_or_else(|| EncodingError::UnknownInstruction(mnemonic.to_string()))?;
                match *arg {
                    Arg::R8(r) => {
                        macro_rules! emit {
                            ($m:ident) => {
                                a.$m(r)?
                            };
                        }
                        setcc_methods!(cond, emit)
                    }
                    Arg::Mem(m, None | Some(8)) => {
                        let m = byte_ptr(m);
                        macro_rules! emit {
                            ($m:ident) => {
                                a.$m(m)?
                            };
                        }
                        setcc_methods!(cond, emit)
                    }
                    _ => return Err(invalid()),
                }
            }
            (_, [dst, src]) if mnemonic.starts_with("cmov") => {
                let cond = Condition::from_suffix(&mnemonic[4..])
                    .ok_or_else(|| EncodingError::UnknownInstruction(mnemonic.to_string()))?;
                same_size(*dst, *src)?;
                let (dst, src) = (*dst, *src);
                macro_rules! emit {
                    ($m:ident) => {
                        match (dst, src) {
                            (Arg::R64(d), Arg::R64(s)) => a.$m(d, s)?,
                            (Arg::R32(d), Arg::R32(s)) => a.$m(d, s)?,
                            (Arg::R16(d), Arg::R16(s)) => a.$m(d, s)?,
                            (Arg::R64(d), Arg::Mem(m, _)) => a.$m(d, m)?,
                            (Arg::R32(d), Arg::Mem(m, _)) => a.$m(d, m)?,
                            (Arg::R16(d), Arg::Mem(m, _)) => a.$m(d, m)?,
                            _ => return Err(invalid()),
                        }
                    };
                }
                cmovcc_methods!(cond, emit)
            }
            _ if is_known(mnemonic) => return Err(invalid()),
            _ => return Err(EncodingError::UnknownInstruction(mnemonic.to_string())),
        }

        Ok(())
    }
}

/// Whether `mnemonic` is handled at all, used to tell bad operands from unknown names.
fn is_known(mnemonic: &str) -> bool {
    const PLAIN: &[&str] = &[
        "nop", "int3", "leave", "cdq", "cqo", "cdqe", "cld", "std", "ud2", "pause", "ret", "mov",
        "add", "sub", "and", "or", "xor", "cmp", "adc", "sbb", "test", "xchg", "lea", "movzx",
        "movsx", "movsxd", "shl", "sal", "shr", "sar", "rol", "ror", "inc", "dec", "neg", "not",
        "mul", "div", "idiv", "imul", "push", "pop", "call", "jmp",
    ];
    PLAIN.contains(&mnemonic)
        || ["j", "set", "cmov"].iter().any(|prefix| {
            mnemonic
                .strip_prefix(prefix)
                .is_some_and(|suffix| Condition::from_suffix(suffix).is_some())
        })
}
