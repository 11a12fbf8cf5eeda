//! Lock-free max / running-mean accumulators for checkpoint latencies.

use std::sync::atomic::{AtomicU64, Ordering};

/// `f64` stored as its bit pattern in an `AtomicU64`.
#[derive(Debug, Default)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub(crate) fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn update(&self, f: impl Fn(f64) -> f64) {
        // The closure always returns Some, so this cannot fail.
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some(f(f64::from_bits(bits)).to_bits())
            });
    }
}

/// Max and running mean, in seconds, of a series of elapsed times.
#[derive(Debug, Default)]
pub(crate) struct TimingStat {
    max_secs: AtomicU64,
    mean_secs: AtomicF64,
    samples: AtomicU64,
}

impl TimingStat {
    pub(crate) fn record(&self, elapsed_millis: i64) {
        let secs = elapsed_millis.max(0) as f64 / 1000.0;
        self.max_secs.fetch_max(secs as u64, Ordering::AcqRel);
        let previous = self.samples.fetch_add(1, Ordering::AcqRel) as f64;
        self.mean_secs
            .update(|mean| (mean * previous + secs) / (previous + 1.0));
    }

    pub(crate) fn max_secs(&self) -> u64 {
        self.max_secs.load(Ordering::Acquire)
    }

    pub(crate) fn mean_secs(&self) -> f64 {
        self.mean_secs.load()
    }

    pub(crate) fn samples(&self) -> u64 {
        self.samples.load(Ordering::Acquire)
    }
}

/// `Σ(mean_i × count_i) / Σcount_i`, truncated to whole seconds.
///
/// Returns 0 when no samples were taken at all.
pub(crate) fn weighted_mean(samples: impl IntoIterator<Item = (f64, u64)>) -> u64 {
    let (weighted, count) = samples
        .into_iter()
        .fold((0.0_f64, 0_u64), |(sum, total), (mean, count)| {
            (sum + mean * count as f64, total + count)
        });
    if count == 0 {
        return 0;
    }
    (weighted / count as f64) as u64
}
