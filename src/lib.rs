//! asmbridge - compile x86/x64 assembly at runtime and run it in place.
//!
//! A [`Manager`] maps a region of executable memory. A [`CompilationUnit`] holds assembly
//! source and a table of predefinitions (host addresses referred to by name), assembles the
//! source into the manager's region and calls into it.
//!
//! # Primary Usage
//!
//! ```no_run
//! use asmbridge::{CompilationUnit, Manager};
//!
//! static mut COUNTER: u64 = 0;
//!
//! let manager = Manager::new(4096)?;
//! let mut unit = CompilationUnit::with_source(
//!     "mov rax, counter\n\
//!      mov qword [rax], 42\n\
//!      ret",
//! );
//! unit.set_manager(&manager);
//! unit.add_predefinition_ptr("counter", &raw const COUNTER);
//!
//! if !unit.assemble()?.is_compiled() {
//!     panic!("{}", unit.errors());
//! }
//! // SAFETY: the code only writes COUNTER and returns.
//! unsafe { unit.run(true)? };
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Region, manager, predefinitions, engine interface and compilation units
//! - [`x64`] - Default iced-x86 engine, calling conventions and the execution trampoline

pub mod core;
pub mod x64;

pub use self::core::{
    AllocationError, CompilationUnit, ConfigError, Diagnostic, Engine, Manager, ManagerConfig,
    Outcome, Placement, Target, UnitError,
};
pub use self::x64::{IcedEngine, Invocation};
