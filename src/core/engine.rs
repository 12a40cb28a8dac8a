// This module defines the boundary between a compilation unit and the assembler engine
// that turns source text into machine code. The unit hands the engine the fully expanded
// source (predefinitions already substituted) and a Target describing the region the code
// will run from: its base address, its capacity and the default code size. The engine
// answers with either the encoded bytes, assembled as if loaded at the target base, or a
// list of Diagnostic records. Diagnostics are plain data (line, message, offending source
// line) rendered in the conventional "line N: message" layout. Assembly-content problems
// always travel through this channel and are never turned into hard errors.

//! Assembler engine interface.

use std::fmt;

/// Output target descriptor handed to an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// Address the first byte of output will be loaded at.
    pub base: u64,
    /// Maximum number of bytes the output may occupy.
    pub capacity: usize,
    /// Default code size (32 or 64) for sources that do not select one.
    pub bitness: u32,
}

impl Target {
    /// Code size of the host process.
    pub const HOST_BITNESS: u32 = if cfg!(target_pointer_width = "64") { 64 } else { 32 };
}

/// A single problem reported by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// 1-based source line, when the problem can be attributed to one.
    pub line: Option<usize>,
    pub message: String,
    /// Text of the offending line.
    pub source: Option<String>,
}

impl Diagnostic {
    /// A diagnostic not tied to any line.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            line: None,
            message: message.into(),
            source: None,
        }
    }

    /// A diagnostic attributed to `line` (1-based).
    pub fn at_line(line: usize, message: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {line}: error: {}", self.message)?,
            None => write!(f, "error: {}", self.message)?,
        }
        if let Some(source) = &self.source {
            write!(f, "\n    {}", source.trim())?;
        }
        Ok(())
    }
}

/// Render diagnostics as the text returned by `CompilationUnit::errors`.
pub fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// An assembler that turns source text into machine code for a target region.
pub trait Engine {
    /// Assemble `source` for `target`.
    ///
    /// On success the returned bytes must be valid when copied to `target.base`.
    fn assemble(&mut self, source: &str, target: Target) -> Result<Vec<u8>, Vec<Diagnostic>>;
}

impl<E: Engine + ?Sized> Engine for &mut E {
    fn assemble(&mut self, source: &str, target: Target) -> Result<Vec<u8>, Vec<Diagnostic>> {
        (**self).assemble(source, target)
    }
}

impl<E: Engine + ?Sized> Engine for Box<E> {
    fn assemble(&mut self, source: &str, target: Target) -> Result<Vec<u8>, Vec<Diagnostic>> {
        (**self).assemble(source, target)
    }
}
