//! Reservoir sampling for latency percentiles: a fixed-capacity buffer
//! that stays representative of the whole stream without growing
//! unbounded.

use parking_lot::Mutex;

pub struct ReservoirSampler {
    capacity: usize,
    samples: Mutex<Vec<u64>>,
    seen: std::sync::atomic::AtomicU64,
}

impl ReservoirSampler {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Mutex::new(Vec::with_capacity(capacity)),
            seen: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Insert unconditionally until the reservoir fills, thereafter at a
    /// uniformly random index with probability `capacity / k`.
    pub fn add(&self, value_ms: u64) {
        let k = self.seen.fetch_add(1, std::sync::atomic::Ordering::AcqRel) + 1;
        let mut samples = self.samples.lock();
        if samples.len() < self.capacity {
            samples.push(value_ms);
            return;
        }
        let k = k as usize;
        let index = fastrand::usize(0..k);
        if index < self.capacity {
            samples[index] = value_ms;
        }
    }

    /// P50/P95/P99, each `floor(n * q)`-indexed into the sorted sample set.
    pub fn percentiles(&self) -> (u64, u64, u64) {
        let mut sorted = self.samples.lock().clone();
        if sorted.is_empty() {
            return (0, 0, 0);
        }
        sorted.sort_unstable();
        let pick = |q: f64| {
            let index = ((sorted.len() as f64) * q).floor() as usize;
            sorted[index.min(sorted.len() - 1)]
        };
        (pick(0.50), pick(0.95), pick(0.99))
    }

    pub fn reset(&self) {
        self.samples.lock().clear();
        self.seen.store(0, std::sync::atomic::Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_unconditionally_until_capacity() {
        let sampler = ReservoirSampler::new(5);
        for v in 0..5 {
            sampler.add(v);
        }
        assert_eq!(sampler.len(), 5);
    }

    #[test]
    fn stays_at_capacity_past_fill() {
        let sampler = ReservoirSampler::new(5);
        for v in 0..500 {
            sampler.add(v);
        }
        assert_eq!(sampler.len(), 5);
    }

    #[test]
    fn percentiles_on_uniform_data() {
        let sampler = ReservoirSampler::new(100);
        for v in 1..=100 {
            sampler.add(v);
        }
        let (p50, p95, p99) = sampler.percentiles();
        assert!(p50 >= 40 && p50 <= 60);
        assert!(p95 >= p50);
        assert!(p99 >= p95);
    }

    #[test]
    fn empty_reservoir_returns_zero() {
        let sampler = ReservoirSampler::new(10);
        assert_eq!(sampler.percentiles(), (0, 0, 0));
    }
}
