use std::time::Duration;

use errors::ErrorMetadataAnyhowExt;
use rand::Rng;

use crate::config::MaintenanceConfig;

/// Fixed retry tiers for transient faults.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryTier {
    /// Lock conflicts and tables that are not open yet.
    Short,
    /// Overloaded store or a replica that is not master.
    Long,
    /// Disk-space pressure.
    VeryLong,
}

impl RetryTier {
    /// `None` means the error is not retriable.
    pub fn classify(e: &anyhow::Error) -> Option<Self> {
        if e.is_occ() || e.is_table_unavailable() {
            Some(Self::Short)
        } else if e.is_overloaded() || e.is_not_master() {
            Some(Self::Long)
        } else if e.is_disk_limit() {
            Some(Self::VeryLong)
        } else {
            None
        }
    }

    pub fn base_delay(&self, config: &MaintenanceConfig) -> Duration {
        match self {
            Self::Short => config.short_retry,
            Self::Long => config.long_retry,
            Self::VeryLong => config.very_long_retry,
        }
    }

    /// Base delay scaled by a random factor in [0.5, 1.5).
    pub fn delay(&self, config: &MaintenanceConfig, rng: &mut impl Rng) -> Duration {
        let jitter = 0.5 + rng.random::<f32>();
        self.base_delay(config).mul_f32(jitter)
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Long => "long",
            Self::VeryLong => "very_long",
        }
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadata;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    use super::RetryTier;
    use crate::config::MaintenanceConfig;

    #[test]
    fn test_classify() {
        let cases = [
            (ErrorMetadata::system_occ(), Some(RetryTier::Short)),
            (
                ErrorMetadata::table_unavailable("not open"),
                Some(RetryTier::Short),
            ),
            (ErrorMetadata::not_master(), Some(RetryTier::Long)),
            (
                ErrorMetadata::overloaded("Busy", "busy"),
                Some(RetryTier::Long),
            ),
            (
                ErrorMetadata::insufficient_disk_space("full"),
                Some(RetryTier::VeryLong),
            ),
            (ErrorMetadata::bad_request("Bad", "bad"), None),
        ];
        for (em, expected) in cases {
            let e = anyhow::anyhow!("inner").context(em);
            assert_eq!(RetryTier::classify(&e), expected);
        }
        assert_eq!(RetryTier::classify(&anyhow::anyhow!("untagged")), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn test_jitter_stays_within_tier(tier in any::<RetryTier>(), seed in any::<u64>()) {
            let config = MaintenanceConfig::default();
            let mut rng = ChaCha12Rng::seed_from_u64(seed);
            let base = tier.base_delay(&config);
            let delay = tier.delay(&config, &mut rng);
            // Allow for f32 rounding in `Duration::mul_f32`.
            prop_assert!(delay >= base * 49 / 100);
            prop_assert!(delay <= base * 151 / 100);
        }
    }
}
