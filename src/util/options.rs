//! Configuration for a dirty card queue set.

use std::str::FromStr;

/// Tunables for the queue set and its refinement machinery.
///
/// Every field can be overridden from the environment
/// (`CARDQ_BUFFER_CAPACITY`, `CARDQ_MUTATOR_REFINEMENT_THRESHOLD`,
/// `CARDQ_REFINEMENT_THREADS`, `CARDQ_MUTATOR_HELPERS`,
/// `CARDQ_MATERIALIZE_COUNTERS`). Unparsable values are ignored with a
/// warning, keeping the default.
#[derive(Clone, Debug)]
pub struct RefinementOptions {
    /// Entries per buffer node.
    pub buffer_capacity: usize,
    /// When more cards than this are queued, a mutator handing off a full
    /// buffer performs one refinement step itself.
    pub mutator_refinement_threshold: usize,
    /// Dedicated refinement worker count. Together with
    /// `mutator_helpers` this bounds the number of concurrently claimed
    /// worker ids.
    pub refinement_threads: usize,
    /// Headroom in the worker-id space for mutators doing inline
    /// refinement, so they rarely wait on a free id.
    pub mutator_helpers: usize,
    /// Whether per-thread refinement timings are collected. Card and
    /// buffer counts are always maintained; only the clock reads are
    /// conditional.
    pub materialize_counters: bool,
}

impl Default for RefinementOptions {
    fn default() -> Self {
        let threads = (num_cpus::get() / 4).max(1);
        RefinementOptions {
            buffer_capacity: 256,
            mutator_refinement_threshold: 1024,
            refinement_threads: threads,
            mutator_helpers: threads,
            materialize_counters: true,
        }
    }
}

impl RefinementOptions {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        let mut options = RefinementOptions::default();
        read_env("CARDQ_BUFFER_CAPACITY", &mut options.buffer_capacity);
        read_env(
            "CARDQ_MUTATOR_REFINEMENT_THRESHOLD",
            &mut options.mutator_refinement_threshold,
        );
        read_env("CARDQ_REFINEMENT_THREADS", &mut options.refinement_threads);
        read_env("CARDQ_MUTATOR_HELPERS", &mut options.mutator_helpers);
        read_env(
            "CARDQ_MATERIALIZE_COUNTERS",
            &mut options.materialize_counters,
        );
        options.validate();
        options
    }

    /// Upper bound on concurrently claimed worker ids.
    pub fn num_par_ids(&self) -> u32 {
        (self.refinement_threads + self.mutator_helpers).max(1) as u32
    }

    pub(crate) fn validate(&self) {
        assert!(self.buffer_capacity > 0, "buffer_capacity must be nonzero");
    }
}

fn read_env<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(value) = std::env::var(key) {
        match value.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!("ignoring unparsable {}={:?}", key, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let options = RefinementOptions::default();
        assert!(options.buffer_capacity > 0);
        assert!(options.num_par_ids() >= 1);
    }

    #[test]
    fn env_override_and_bad_value() {
        std::env::set_var("CARDQ_BUFFER_CAPACITY", "512");
        std::env::set_var("CARDQ_REFINEMENT_THREADS", "notanumber");
        let options = RefinementOptions::from_env();
        assert_eq!(options.buffer_capacity, 512);
        assert_eq!(
            options.refinement_threads,
            RefinementOptions::default().refinement_threads
        );
        std::env::remove_var("CARDQ_BUFFER_CAPACITY");
        std::env::remove_var("CARDQ_REFINEMENT_THREADS");
    }
}
