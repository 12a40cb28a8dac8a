//! x86 / x86-64 architecture-specific components.
//!
//! This module contains all x86 specific code:
//! - Source parsing and instruction encoding for the default engine (iced-x86)
//! - Host calling convention descriptions
//! - The execution trampoline that enters compiled code

pub mod calling_convention;
pub mod encoder;
pub mod parser;
pub mod trampoline;

pub use calling_convention::Abi;
pub use encoder::{EncodingError, IcedEngine};
pub use trampoline::{invoke, Invocation};
