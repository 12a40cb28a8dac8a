// This module defines the error types for asmbridge using the thiserror crate for idiomatic
// Rust error handling. The crate separates two classes of failure. Environment and
// precondition failures are hard errors: AllocationError covers everything that can go
// wrong while mapping the executable region (zero or overflowing capacity, misaligned or
// colliding fixed addresses, a second fixed-address manager, OS mapping failures);
// UnitError covers calling assemble without a manager and running a unit that holds no
// runnable blob; ConfigError covers malformed environment configuration. Assembly-content
// failures are never represented here: they travel as Diagnostic records returned by the
// engine and surface through CompilationUnit::errors.

//! Error types for asmbridge.
//!
//! Using thiserror for more idiomatic error handling.

use std::io;
use thiserror::Error;

/// Failure to construct a [`Manager`](crate::core::manager::Manager).
#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("Region capacity must be non-zero")]
    ZeroCapacity,

    #[error("Region capacity of {capacity} bytes overflows when rounded to pages")]
    CapacityOverflow { capacity: usize },

    #[error("Fixed base address {address:#x} is not aligned to the {page_size}-byte page size")]
    MisalignedBase { address: usize, page_size: usize },

    #[error("A fixed-address region at {address:#x} is already live in this process")]
    FixedRegionInUse { address: usize },

    #[error("Address range at {address:#x} ({len} bytes) is unavailable")]
    AddressUnavailable { address: usize, len: usize },

    #[error("Failed to map {len} bytes of executable memory: {source}")]
    Os {
        len: usize,
        #[source]
        source: io::Error,
    },
}

/// Precondition violations on a [`CompilationUnit`](crate::core::unit::CompilationUnit).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitError {
    #[error("No manager attached to the compilation unit")]
    NoManager,

    #[error("Compilation unit has not been successfully assembled")]
    NotCompiled,

    #[error("Compiled code was overwritten by a later load into the same region")]
    Overwritten,

    #[error("Compiled program is empty")]
    EmptyProgram,
}

/// Malformed configuration read from the environment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

/// Result type alias for manager construction.
pub type AllocationResult<T> = Result<T, AllocationError>;

/// Result type alias for unit operations.
pub type UnitResult<T> = Result<T, UnitError>;
