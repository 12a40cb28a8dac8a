// This module implements Manager, the exclusive owner of one executable Region. A manager
// maps its region at construction and unmaps it when released or dropped; compilation units
// borrow it (&'m Manager) so the borrow checker rejects any program that releases the
// region while a unit attached to it is still in use. Fixed-address placements are limited
// to one live manager per process: a static atomic flag is claimed with compare-exchange
// before mapping and handed back by an RAII slot that drops after the region has been
// unmapped. The manager also keeps a load generation counter. Every load of compiled code
// bumps it, letting a unit detect that another unit sharing the region overwrote its code.

//! Executable memory manager.

use crate::core::config::{ManagerConfig, Placement};
use crate::core::engine::Target;
use crate::core::error::{AllocationError, AllocationResult};
use crate::core::region::Region;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide record of whether a fixed-address region is currently mapped.
static FIXED_REGION_LIVE: AtomicBool = AtomicBool::new(false);

/// Padding written over stale code so a dangling jump traps instead of running it.
const SCRUB_BYTE: u8 = 0xCC;

/// Claim on the process-wide fixed-address slot, released on drop.
#[derive(Debug)]
struct FixedSlot {
    address: usize,
}

impl FixedSlot {
    fn claim(address: usize) -> AllocationResult<Self> {
        FIXED_REGION_LIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| AllocationError::FixedRegionInUse { address })?;
        Ok(Self { address })
    }
}

impl Drop for FixedSlot {
    fn drop(&mut self) {
        FIXED_REGION_LIVE.store(false, Ordering::Release);
        log::debug!("Fixed region slot at {:#x} released", self.address);
    }
}

/// Owner of an executable region that compilation units load code into.
#[derive(Debug)]
pub struct Manager {
    config: ManagerConfig,
    /// Must be declared before `slot` so the mapping is gone before the slot frees up.
    region: Region,
    slot: Option<FixedSlot>,
    generation: Cell<u64>,
    /// Bytes occupied by the most recent load.
    used: Cell<usize>,
}

impl Manager {
    /// Allocate a region of `capacity` bytes with the host default placement.
    pub fn new(capacity: usize) -> AllocationResult<Self> {
        Self::with_config(ManagerConfig::new(capacity))
    }

    /// Allocate a region as described by `config`.
    ///
    /// # Errors
    ///
    /// Fails if a fixed-address manager is already live in this process, or if the
    /// operating system cannot provide the requested range.
    pub fn with_config(config: ManagerConfig) -> AllocationResult<Self> {
        let slot = match config.placement {
            Placement::Fixed(address) => Some(FixedSlot::claim(address)?),
            Placement::Anywhere => None,
        };

        // On failure `slot` drops here and the fixed-address claim is handed back.
        let region = Region::allocate(config.capacity, config.placement)?;

        Ok(Self {
            config,
            region,
            slot,
            generation: Cell::new(0),
            used: Cell::new(0),
        })
    }

    /// Whether a fixed-address manager is live anywhere in this process.
    pub fn fixed_region_live() -> bool {
        FIXED_REGION_LIVE.load(Ordering::Acquire)
    }

    /// Base address of the region.
    pub fn base(&self) -> usize {
        self.region.base()
    }

    /// Capacity requested at construction.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Length actually mapped (capacity rounded up to whole pages).
    pub fn mapped_len(&self) -> usize {
        self.region.len()
    }

    pub fn placement(&self) -> Placement {
        self.config.placement
    }

    pub fn is_fixed(&self) -> bool {
        self.slot.is_some()
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Number of loads performed into this region so far.
    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    /// Output target descriptor handed to engines.
    pub fn target(&self) -> Target {
        Target {
            base: self.base() as u64,
            capacity: self.capacity(),
            bitness: Target::HOST_BITNESS,
        }
    }

    /// Copy compiled code to the start of the region and return the new generation.
    ///
    /// Whatever the previous load left beyond the new code is overwritten with `int3`.
    /// Returns `None` if `code` does not fit in the capacity.
    pub(crate) fn load(&self, code: &[u8]) -> Option<u64> {
        if code.len() > self.capacity() {
            return None;
        }

        self.region.write(0, code)?;
        let stale = self.used.get().saturating_sub(code.len());
        if stale > 0 {
            self.region.fill(code.len(), stale, SCRUB_BYTE)?;
        }
        self.used.set(code.len());

        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        log::debug!(
            "Loaded {} bytes at {:#x} (generation {})",
            code.len(),
            self.base(),
            generation
        );
        Some(generation)
    }

    /// Release the region back to the operating system.
    ///
    /// Equivalent to dropping the manager. Code loaded into the region must no longer be
    /// executing.
    pub fn release(self) {
        log::debug!("Releasing manager at {:#x}", self.base());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anywhere_manager() {
        let manager = Manager::with_config(ManagerConfig::new(4096).anywhere()).unwrap();
        assert!(!manager.is_fixed());
        assert_eq!(manager.capacity(), 4096);
        assert!(manager.mapped_len() >= 4096);
        assert_eq!(manager.target().base, manager.base() as u64);
        assert_eq!(manager.target().capacity, 4096);
        manager.release();
    }

    #[test]
    fn test_load_scrubs_stale_code_and_bumps_generation() {
        let manager = Manager::with_config(ManagerConfig::new(64).anywhere()).unwrap();
        assert_eq!(manager.generation(), 0);

        assert_eq!(manager.load(&[0x90, 0x90, 0x90, 0xC3]), Some(1));
        assert_eq!(manager.load(&[0xC3]), Some(2));
        assert_eq!(
            manager.region().read(0, 4).unwrap(),
            vec![0xC3, SCRUB_BYTE, SCRUB_BYTE, SCRUB_BYTE]
        );
    }

    #[test]
    fn test_load_rejects_oversized_code() {
        let manager = Manager::with_config(ManagerConfig::new(4).anywhere()).unwrap();
        assert_eq!(manager.load(&[0x90; 5]), None);
        assert_eq!(manager.generation(), 0);
    }
}
