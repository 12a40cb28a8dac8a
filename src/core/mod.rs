// This module gathers the target-independent parts of asmbridge: the executable region and
// its manager, the predefinition table, the engine interface and the compilation unit that
// combines them. The manager owns a page-aligned read/write/execute mapping and enforces the
// one-fixed-address-region-per-process rule with a static atomic flag. Compilation units
// borrow a manager, expand predefinitions into their source, hand the text to an engine and
// load the resulting bytes into the region. Errors for environment and precondition
// failures live in `error`; assembly problems travel as engine diagnostics.

//! Core asmbridge infrastructure.
//!
//! # Key Components
//!
//! ## Executable memory (`region`, `manager`)
//! - Page-rounded RWX mapping at a fixed address or wherever the OS chooses
//! - At most one fixed-address manager per process
//! - Load generation counter for detecting overwritten code
//!
//! ## Compilation (`symbols`, `engine`, `unit`)
//! - Textual predefinition substitution on whole identifier tokens
//! - Pluggable assembler engines returning bytes or diagnostics
//! - Compile, inspect and run through the execution trampoline
//!
//! ## Ambient (`config`, `error`)
//! - Builder and environment based region configuration
//! - thiserror based error enums

pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod region;
pub mod symbols;
pub mod unit;

pub use config::{ManagerConfig, Placement, DEFAULT_CAPACITY, DEFAULT_FIXED_BASE};
pub use engine::{render_diagnostics, Diagnostic, Engine, Target};
pub use error::{AllocationError, AllocationResult, ConfigError, UnitError, UnitResult};
pub use manager::Manager;
pub use region::Region;
pub use symbols::SymbolTable;
pub use unit::{CompilationUnit, Outcome};
