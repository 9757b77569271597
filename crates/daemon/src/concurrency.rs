//! Concurrency planning for the local worker pool
//!
//! Derives how many encodes run at once and how many ffmpeg threads each one
//! gets from the CPU core count and the `[workers]` configuration.

use crate::config::Config;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// ffmpeg `-threads` value per encode
    pub threads_per_job: u32,
    /// Maximum number of concurrent work units
    pub max_concurrent_jobs: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - threads_per_job: 8 for 32+ cores, 4 for 8+ cores, 2 otherwise
    /// - max_concurrent_jobs: cores / threads_per_job, at least 1
    ///
    /// Explicit non-zero values are used unchanged.
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .workers
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1);

        let threads_per_job = if cfg.workers.threads_per_job > 0 {
            cfg.workers.threads_per_job
        } else {
            derive_threads(total_cores)
        };

        let max_concurrent_jobs = if cfg.workers.max_concurrent_jobs > 0 {
            cfg.workers.max_concurrent_jobs
        } else {
            (total_cores / threads_per_job).max(1)
        };

        Self {
            total_cores,
            threads_per_job,
            max_concurrent_jobs,
        }
    }
}

fn derive_threads(cores: u32) -> u32 {
    if cores >= 32 {
        8
    } else if cores >= 8 {
        4
    } else {
        2
    }
}

pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config_with(cores: u32, threads: u32, jobs: u32) -> Config {
        let mut cfg = Config::default();
        cfg.workers.logical_cores = Some(cores);
        cfg.workers.threads_per_job = threads;
        cfg.workers.max_concurrent_jobs = jobs;
        cfg
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_derived_plan_fits_the_machine(cores in 1u32..256) {
            let plan = derive_plan(&config_with(cores, 0, 0));

            prop_assert_eq!(plan.total_cores, cores);
            let expected_threads = if cores >= 32 { 8 } else if cores >= 8 { 4 } else { 2 };
            prop_assert_eq!(plan.threads_per_job, expected_threads);
            prop_assert!(plan.max_concurrent_jobs >= 1);
            if cores >= expected_threads {
                prop_assert!(plan.max_concurrent_jobs * plan.threads_per_job <= cores);
            }
        }

        #[test]
        fn prop_explicit_values_are_kept(
            cores in 1u32..256,
            threads in 1u32..64,
            jobs in 1u32..16,
        ) {
            let plan = derive_plan(&config_with(cores, threads, jobs));
            prop_assert_eq!(plan.threads_per_job, threads);
            prop_assert_eq!(plan.max_concurrent_jobs, jobs);
        }
    }

    #[test]
    fn test_zero_cores_treated_as_one() {
        let plan = derive_plan(&config_with(0, 0, 0));
        assert_eq!(plan.total_cores, 1);
        assert_eq!(plan.max_concurrent_jobs, 1);
    }
}
