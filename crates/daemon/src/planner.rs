//! Chunk planning: which selected profiles are encoded whole and which go out
//! as a chunking request.
//!
//! The planner does not cut the timeline itself. Chunked profiles are handed
//! to a chunking worker, which segments the source and reports the manifest
//! back by dispatching one chunk job per boundary.

use crate::profiles::SelectedProfile;

/// Strictly longer than the threshold is chunked.
pub fn should_chunk(duration_secs: u64, threshold_secs: u64) -> bool {
    duration_secs > threshold_secs
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodePlan {
    /// One whole-file job each.
    pub whole: Vec<SelectedProfile>,
    /// Sent together as one chunking request.
    pub chunked: Vec<SelectedProfile>,
}

impl EncodePlan {
    pub fn is_empty(&self) -> bool {
        self.whole.is_empty() && self.chunked.is_empty()
    }
}

/// Splits the selected profiles into whole-file jobs and a chunking request.
///
/// Gif profiles are always encoded whole.
pub fn plan_encodes(
    duration_secs: u64,
    selected: Vec<SelectedProfile>,
    threshold_secs: u64,
    chunkize: bool,
) -> EncodePlan {
    if !chunkize || !should_chunk(duration_secs, threshold_secs) {
        return EncodePlan {
            whole: selected,
            chunked: Vec::new(),
        };
    }

    let (whole, chunked) = selected.into_iter().partition(|s| s.profile.is_gif());
    EncodePlan { whole, chunked }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{select_profiles, test_profile, Codec, EncodeProfile, Extension, Resolution};
    use proptest::prelude::*;

    fn scenario_profiles() -> Vec<EncodeProfile> {
        vec![
            test_profile(1, Extension::Mp4, Some(Resolution::R1080), Some(Codec::H264)),
            test_profile(2, Extension::Mp4, Some(Resolution::R720), Some(Codec::H264)),
            test_profile(3, Extension::Gif, None, None),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_short_sources_are_never_chunked(threshold in 0u64..10_000, below in 0u64..10_000) {
            let duration = threshold.saturating_sub(below);
            let selected = select_profiles(&scenario_profiles(), Some(1080), &[]);
            let plan = plan_encodes(duration, selected, threshold, true);
            prop_assert!(plan.chunked.is_empty());
            prop_assert_eq!(plan.whole.len(), 3);
        }

        #[test]
        fn prop_gif_is_never_chunked(threshold in 0u64..10_000, above in 1u64..10_000) {
            let selected = select_profiles(&scenario_profiles(), Some(1080), &[]);
            let plan = plan_encodes(threshold + above, selected, threshold, true);
            prop_assert!(plan.chunked.iter().all(|s| !s.profile.is_gif()));
            prop_assert!(plan.whole.iter().all(|s| s.profile.is_gif()));
            prop_assert_eq!(plan.chunked.len(), 2);
        }
    }

    #[test]
    fn test_long_source_scenario() {
        let selected = select_profiles(&scenario_profiles(), Some(1080), &[240, 360]);
        let plan = plan_encodes(7200, selected, 3600, true);

        let whole: Vec<u32> = plan.whole.iter().map(|s| s.profile.id).collect();
        let chunked: Vec<u32> = plan.chunked.iter().map(|s| s.profile.id).collect();
        assert_eq!(whole, vec![3]);
        assert_eq!(chunked, vec![1, 2]);
    }

    #[test]
    fn test_threshold_is_strict() {
        assert!(!should_chunk(3600, 3600));
        assert!(should_chunk(3601, 3600));

        let selected = select_profiles(&scenario_profiles(), Some(1080), &[]);
        let plan = plan_encodes(3600, selected, 3600, true);
        assert!(plan.chunked.is_empty());
    }

    #[test]
    fn test_chunking_switched_off() {
        let selected = select_profiles(&scenario_profiles(), Some(1080), &[]);
        let plan = plan_encodes(7200, selected, 3600, false);
        assert!(plan.chunked.is_empty());
        assert_eq!(plan.whole.len(), 3);
    }
}
