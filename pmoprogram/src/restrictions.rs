//! Contract restrictions: which seeks the current entitlement allows.

use crate::config::RestrictionsConfig;

/// Seek policy attached to the current contract.
///
/// Positions are zero-based offsets in milliseconds.
pub trait ContractRestrictions: Send + Sync {
    /// Whether a seek from `from` to `to` may happen at all
    fn can_seek(&self, from: i64, to: i64) -> bool;

    /// Target actually allowed for a seek from `from` to `to`.
    ///
    /// May differ from `to`; callers report the adjustment as a warning.
    fn will_seek(&self, from: i64, to: i64) -> i64;
}

/// Per-direction restrictions driven by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicContractRestrictions {
    pub rewind_enabled: bool,
    pub fast_forward_enabled: bool,
}

impl BasicContractRestrictions {
    pub fn unrestricted() -> Self {
        Self {
            rewind_enabled: true,
            fast_forward_enabled: true,
        }
    }
}

impl Default for BasicContractRestrictions {
    fn default() -> Self {
        Self::unrestricted()
    }
}

impl From<&RestrictionsConfig> for BasicContractRestrictions {
    fn from(config: &RestrictionsConfig) -> Self {
        Self {
            rewind_enabled: config.rewind_enabled,
            fast_forward_enabled: config.fast_forward_enabled,
        }
    }
}

impl ContractRestrictions for BasicContractRestrictions {
    fn can_seek(&self, from: i64, to: i64) -> bool {
        if to >= from {
            self.fast_forward_enabled
        } else {
            self.rewind_enabled
        }
    }

    fn will_seek(&self, _from: i64, to: i64) -> i64 {
        to.max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_flags() {
        let no_rewind = BasicContractRestrictions {
            rewind_enabled: false,
            fast_forward_enabled: true,
        };
        assert!(no_rewind.can_seek(1_000, 5_000));
        assert!(!no_rewind.can_seek(5_000, 1_000));

        let no_ff = BasicContractRestrictions {
            rewind_enabled: true,
            fast_forward_enabled: false,
        };
        assert!(!no_ff.can_seek(1_000, 5_000));
        assert!(no_ff.can_seek(5_000, 1_000));
    }

    #[test]
    fn test_will_seek_clamps_negative_targets() {
        let restrictions = BasicContractRestrictions::default();
        assert_eq!(restrictions.will_seek(1_000, -500), 0);
        assert_eq!(restrictions.will_seek(1_000, 2_000), 2_000);
    }

    #[test]
    fn test_from_config() {
        let config = RestrictionsConfig {
            rewind_enabled: false,
            fast_forward_enabled: true,
        };
        let restrictions = BasicContractRestrictions::from(&config);
        assert!(!restrictions.rewind_enabled);
        assert!(restrictions.fast_forward_enabled);
    }
}
