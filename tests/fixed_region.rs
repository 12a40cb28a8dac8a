//! The one-fixed-address-region-per-process rule.
//!
//! Kept in its own test binary so no other test holds the fixed slot.

use asmbridge::core::DEFAULT_FIXED_BASE;
use asmbridge::{AllocationError, CompilationUnit, Manager, ManagerConfig};

#[test]
fn test_single_fixed_region_per_process() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = ManagerConfig::new(0x1000).fixed_at(DEFAULT_FIXED_BASE);

    // A failed construction hands the slot back.
    let misaligned = Manager::with_config(config.fixed_at(DEFAULT_FIXED_BASE + 1));
    assert!(matches!(misaligned, Err(AllocationError::MisalignedBase { .. })));
    assert!(!Manager::fixed_region_live());

    let first = match Manager::with_config(config) {
        Ok(manager) => manager,
        Err(e @ (AllocationError::AddressUnavailable { .. } | AllocationError::Os { .. })) => {
            eprintln!("skipping: {e}");
            return;
        }
        Err(e) => panic!("unexpected error: {e}"),
    };
    assert!(first.is_fixed());
    assert_eq!(first.base(), DEFAULT_FIXED_BASE);
    assert!(Manager::fixed_region_live());

    let second = Manager::with_config(config);
    assert!(matches!(
        second,
        Err(AllocationError::FixedRegionInUse { address }) if address == DEFAULT_FIXED_BASE
    ));

    // Placement-agnostic managers are not affected.
    let anywhere = Manager::with_config(config.anywhere()).unwrap();
    assert!(!anywhere.is_fixed());
    drop(anywhere);

    #[cfg(all(target_arch = "x86_64", not(windows)))]
    {
        let mut unit = CompilationUnit::with_source("ret");
        unit.set_manager(&first);
        assert!(unit.assemble().unwrap().is_compiled());
        assert_eq!(unit.entry_point(), Some(DEFAULT_FIXED_BASE));
        unsafe { unit.run(true) }.unwrap();
    }

    first.release();
    assert!(!Manager::fixed_region_live());

    let again = Manager::with_config(config).unwrap();
    assert_eq!(again.base(), DEFAULT_FIXED_BASE);
}
