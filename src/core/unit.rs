// This module implements CompilationUnit, the object a host program drives to turn assembly
// text into running code. A unit owns its source text, a predefinition table and an
// engine, and borrows the Manager whose region receives the compiled bytes. Assembling
// expands predefinitions into the source, hands the result to the engine together with the
// region's target descriptor, and on success copies the code to the start of the region and
// records a blob (entry address, private copy of the bytes, load generation). Failures are
// reported as data: the outcome is Outcome::Failed and the diagnostics are kept for errors().
// Running a unit checks that its blob still exists and has not been overwritten by another
// unit sharing the region, then calls into the code through the execution trampoline.

//! Compilation units.

use crate::core::engine::{render_diagnostics, Diagnostic, Engine};
use crate::core::error::{UnitError, UnitResult};
use crate::core::manager::Manager;
use crate::core::symbols::SymbolTable;
use crate::x64::encoder::IcedEngine;
use crate::x64::trampoline::{invoke, Invocation};
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};
use std::fmt::Write as _;

/// Result of [`CompilationUnit::assemble`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Code was loaded at `entry` and occupies `size` bytes.
    Compiled { entry: usize, size: usize },
    /// The engine rejected the source; see [`CompilationUnit::errors`].
    Failed,
}

impl Outcome {
    pub fn is_compiled(&self) -> bool {
        matches!(self, Outcome::Compiled { .. })
    }
}

/// Code produced by the last successful compile.
#[derive(Debug, Clone)]
struct Blob {
    entry: usize,
    bytes: Vec<u8>,
    /// Manager generation the bytes were loaded under.
    generation: u64,
}

/// Assembly source, its predefinitions and the region it compiles into.
///
/// ```no_run
/// use asmbridge::{CompilationUnit, Manager};
///
/// let manager = Manager::new(4096)?;
/// let mut unit = CompilationUnit::with_source("mov eax, 42\nret");
/// unit.set_manager(&manager);
/// if unit.assemble()?.is_compiled() {
///     // SAFETY: the source above is a well-formed leaf function.
///     unsafe { unit.run(true)? };
/// } else {
///     eprintln!("{}", unit.errors());
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct CompilationUnit<'m, E: Engine = IcedEngine> {
    source: String,
    symbols: SymbolTable,
    manager: Option<&'m Manager>,
    engine: E,
    blob: Option<Blob>,
    diagnostics: Vec<Diagnostic>,
    errors: String,
}

impl<'m> CompilationUnit<'m> {
    /// An empty unit using the default engine.
    pub fn new() -> Self {
        Self::with_engine(IcedEngine::new())
    }

    pub fn with_source(source: impl Into<String>) -> Self {
        let mut unit = Self::new();
        unit.set_source(source);
        unit
    }
}

impl Default for CompilationUnit<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'m, E: Engine> CompilationUnit<'m, E> {
    /// An empty unit using `engine`.
    pub fn with_engine(engine: E) -> Self {
        Self {
            source: String::new(),
            symbols: SymbolTable::new(),
            manager: None,
            engine,
            blob: None,
            diagnostics: Vec::new(),
            errors: String::new(),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Replace the source text. Already compiled code stays runnable until the next
    /// [`assemble`](Self::assemble).
    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = source.into();
    }

    pub fn manager(&self) -> Option<&'m Manager> {
        self.manager
    }

    /// Attach the region code is compiled into.
    ///
    /// Switching to a different manager discards compiled code, which lives in the
    /// previous region.
    pub fn set_manager(&mut self, manager: &'m Manager) {
        if self.manager.is_some_and(|current| !std::ptr::eq(current, manager)) {
            self.blob = None;
        }
        self.manager = Some(manager);
    }

    /// Detach the current manager, discarding compiled code.
    pub fn detach_manager(&mut self) -> Option<&'m Manager> {
        self.blob = None;
        self.manager.take()
    }

    /// Register `name` to be replaced by `address` in the source. Returns the value it
    /// replaces, if any.
    pub fn add_predefinition(&mut self, name: impl Into<String>, address: usize) -> Option<usize> {
        self.symbols.insert(name, address)
    }

    /// Register `name` for the address of `ptr`.
    pub fn add_predefinition_ptr<T: ?Sized>(
        &mut self,
        name: impl Into<String>,
        ptr: *const T,
    ) -> Option<usize> {
        self.add_predefinition(name, ptr.cast::<()>() as usize)
    }

    pub fn remove_predefinition(&mut self, name: &str) -> Option<usize> {
        self.symbols.remove(name)
    }

    pub fn clear_predefinitions(&mut self) {
        self.symbols.clear();
    }

    pub fn predefinition(&self, name: &str) -> Option<usize> {
        self.symbols.get(name)
    }

    pub fn predefinitions(&self) -> impl Iterator<Item = (&str, usize)> {
        self.symbols.iter()
    }

    /// The source as the engine sees it, with predefinitions substituted.
    pub fn expanded_source(&self) -> String {
        self.symbols.expand(&self.source)
    }

    /// Compile the source into the attached manager's region.
    ///
    /// Any previous compiled code and diagnostics are discarded first. Problems with the
    /// source itself are reported through [`Outcome::Failed`] and [`errors`](Self::errors),
    /// never as `Err`.
    ///
    /// # Errors
    ///
    /// [`UnitError::NoManager`] if no manager is attached.
    pub fn assemble(&mut self) -> UnitResult<Outcome> {
        let manager = self.manager.ok_or(UnitError::NoManager)?;

        self.blob = None;
        self.diagnostics.clear();
        self.errors.clear();

        let expanded = self.symbols.expand(&self.source);
        log::trace!("Expanded source:\n{expanded}");

        let code = match self.engine.assemble(&expanded, manager.target()) {
            Ok(code) => code,
            Err(diagnostics) => return Ok(self.fail(diagnostics)),
        };

        let Some(generation) = manager.load(&code) else {
            let message = format!(
                "out of memory: {} bytes of code exceed the region capacity of {} bytes",
                code.len(),
                manager.capacity()
            );
            return Ok(self.fail(vec![Diagnostic::new(message)]));
        };

        let entry = manager.base();
        let size = code.len();
        log::debug!("Compiled {size} bytes at {entry:#x}");
        self.blob = Some(Blob {
            entry,
            bytes: code,
            generation,
        });
        Ok(Outcome::Compiled { entry, size })
    }

    fn fail(&mut self, mut diagnostics: Vec<Diagnostic>) -> Outcome {
        if diagnostics.is_empty() {
            diagnostics.push(Diagnostic::new("assembly failed"));
        }
        self.errors = render_diagnostics(&diagnostics);
        log::debug!("Compilation failed with {} diagnostics", diagnostics.len());
        self.diagnostics = diagnostics;
        Outcome::Failed
    }

    /// Diagnostic text of the last failed compile, empty otherwise.
    pub fn errors(&self) -> &str {
        &self.errors
    }

    /// Alias of [`errors`](Self::errors).
    pub fn get_errors(&self) -> &str {
        self.errors()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn is_compiled(&self) -> bool {
        self.blob.is_some()
    }

    pub fn entry_point(&self) -> Option<usize> {
        self.blob.as_ref().map(|blob| blob.entry)
    }

    /// The compiled bytes, as loaded into the region.
    pub fn code(&self) -> Option<&[u8]> {
        self.blob.as_ref().map(|blob| blob.bytes.as_slice())
    }

    /// Intel-syntax disassembly of the compiled code, one instruction per line.
    pub fn listing(&self) -> Option<String> {
        let blob = self.blob.as_ref()?;
        let bitness = self.manager.map_or(usize::BITS, |m| m.target().bitness);

        let mut decoder =
            Decoder::with_ip(bitness, &blob.bytes, blob.entry as u64, DecoderOptions::NONE);
        let mut formatter = IntelFormatter::new();
        let mut instruction = Instruction::default();
        let mut text = String::new();
        let mut listing = String::new();

        while decoder.can_decode() {
            decoder.decode_out(&mut instruction);
            text.clear();
            formatter.format(&instruction, &mut text);

            let start = (instruction.ip() - blob.entry as u64) as usize;
            let bytes = &blob.bytes[start..start + instruction.len()];
            let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
            let _ = writeln!(listing, "{:016X} {hex:<20} {text}", instruction.ip());
        }

        Some(listing)
    }

    /// Execute the compiled code.
    ///
    /// With `preserve_non_volatile` the call goes through the guarded trampoline, which
    /// restores every callee-saved register, MXCSR, the x87 control word and the direction
    /// flag regardless of what the code does. Otherwise the code is called directly and
    /// must follow the host calling convention itself.
    ///
    /// # Errors
    ///
    /// [`UnitError::NotCompiled`] without a successful compile,
    /// [`UnitError::EmptyProgram`] if the compiled code is empty and
    /// [`UnitError::Overwritten`] if another unit has since loaded code into the region.
    ///
    /// # Safety
    ///
    /// The compiled code runs with the full privileges of the process. It must return to
    /// its caller with the stack pointer restored and must not corrupt memory the host
    /// relies on.
    pub unsafe fn run(&self, preserve_non_volatile: bool) -> UnitResult<()> {
        let blob = self.blob.as_ref().ok_or(UnitError::NotCompiled)?;
        let manager = self.manager.ok_or(UnitError::NoManager)?;

        if blob.bytes.is_empty() {
            return Err(UnitError::EmptyProgram);
        }
        if manager.generation() != blob.generation {
            return Err(UnitError::Overwritten);
        }

        let mode = Invocation::from_preserve(preserve_non_volatile);
        // SAFETY: ensured by caller
        unsafe { invoke(blob.entry, mode) };
        Ok(())
    }
}
