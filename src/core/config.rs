// This module holds the configuration of an executable region. ManagerConfig pairs the
// requested capacity with a Placement, which is either Anywhere (the OS picks the base) or
// Fixed(address) (the region must land exactly at that address and the process-wide
// single-instance rule applies). The host default follows the target: 32-bit x86 hosts
// anchor the region at DEFAULT_FIXED_BASE, x86-64 hosts let the OS choose. Configuration
// can be built in code through builder methods or read from the ASMBRIDGE_CAPACITY and
// ASMBRIDGE_BASE environment variables, which accept decimal or 0x-prefixed hexadecimal.

//! Region configuration.

use crate::core::error::ConfigError;
use std::env;

/// Capacity used when none is requested.
pub const DEFAULT_CAPACITY: usize = 0x10_0000;

/// Base address used for fixed-address regions when none is requested.
pub const DEFAULT_FIXED_BASE: usize = 0x1000_0000;

/// Environment variable overriding the region capacity.
pub const CAPACITY_VAR: &str = "ASMBRIDGE_CAPACITY";

/// Environment variable overriding the region placement.
pub const BASE_VAR: &str = "ASMBRIDGE_BASE";

/// Where the executable region is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Let the operating system choose the base address.
    Anywhere,
    /// Map exactly at this address. At most one such region may be live per process.
    Fixed(usize),
}

impl Placement {
    /// Placement the host target expects by default.
    pub const fn host_default() -> Self {
        if cfg!(target_arch = "x86") {
            Placement::Fixed(DEFAULT_FIXED_BASE)
        } else {
            Placement::Anywhere
        }
    }

    /// The requested base address, if fixed.
    pub fn fixed_address(self) -> Option<usize> {
        match self {
            Placement::Fixed(address) => Some(address),
            Placement::Anywhere => None,
        }
    }
}

impl Default for Placement {
    fn default() -> Self {
        Self::host_default()
    }
}

/// Configuration for a [`Manager`](crate::core::manager::Manager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Requested capacity in bytes. Rounded up to whole pages when mapped.
    pub capacity: usize,
    /// Base address policy.
    pub placement: Placement,
}

impl ManagerConfig {
    /// Create a configuration with the given capacity and the host default placement.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            placement: Placement::host_default(),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Anchor the region at `address`.
    pub fn fixed_at(mut self, address: usize) -> Self {
        self.placement = Placement::Fixed(address);
        self
    }

    /// Let the operating system choose the base address.
    pub fn anywhere(mut self) -> Self {
        self.placement = Placement::Anywhere;
        self
    }

    /// Read the configuration from the environment, falling back to defaults for
    /// variables that are not set.
    ///
    /// `ASMBRIDGE_CAPACITY` takes a byte count. `ASMBRIDGE_BASE` takes an address or
    /// the word `any`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(CAPACITY_VAR) {
            config.capacity = parse_number(&value).ok_or(ConfigError::InvalidNumber {
                var: CAPACITY_VAR,
                value: value.clone(),
            })?;
        }

        if let Some(value) = lookup(BASE_VAR) {
            config.placement = if value.trim().eq_ignore_ascii_case("any") {
                Placement::Anywhere
            } else {
                let address = parse_number(&value).ok_or(ConfigError::InvalidNumber {
                    var: BASE_VAR,
                    value: value.clone(),
                })?;
                Placement::Fixed(address)
            };
        }

        Ok(config)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn parse_number(text: &str) -> Option<usize> {
    let text = text.trim().replace('_', "");
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ManagerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, ManagerConfig::default());
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
    }

    #[test]
    fn test_env_overrides() {
        let config = ManagerConfig::from_lookup(lookup_from(&[
            (CAPACITY_VAR, "0x2000"),
            (BASE_VAR, "0x2000_0000"),
        ]))
        .unwrap();
        assert_eq!(config.capacity, 0x2000);
        assert_eq!(config.placement, Placement::Fixed(0x2000_0000));

        let config =
            ManagerConfig::from_lookup(lookup_from(&[(CAPACITY_VAR, "4096"), (BASE_VAR, "any")]))
                .unwrap();
        assert_eq!(config.capacity, 4096);
        assert_eq!(config.placement, Placement::Anywhere);
    }

    #[test]
    fn test_invalid_env_value() {
        let err = ManagerConfig::from_lookup(lookup_from(&[(CAPACITY_VAR, "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                var: CAPACITY_VAR,
                value: "lots".to_string()
            }
        );
    }

    #[test]
    fn test_builder() {
        let config = ManagerConfig::new(64).fixed_at(0x3000_0000).with_capacity(128);
        assert_eq!(config.capacity, 128);
        assert_eq!(config.placement.fixed_address(), Some(0x3000_0000));
        assert_eq!(config.anywhere().placement, Placement::Anywhere);
    }
}
