//! Execution profiles
//!
//! Rolling statistics per (action signature, worker): mean wall time, mean
//! transferred bytes and success rate. The implementation score of a
//! placement is the negated expected wall time; unknown pairs fall back to
//! the signature's mean across workers, then to zero.

use std::collections::HashMap;
use weft_core::WorkerId;

/// Sample reported with a completion.
#[derive(Debug, Clone, Copy)]
pub struct CompletionStats {
    pub wall_ms: u64,
    pub transferred_bytes: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Default)]
struct Profile {
    samples: u64,
    mean_wall_ms: f64,
    mean_bytes: f64,
    successes: u64,
}

impl Profile {
    fn observe(&mut self, stats: CompletionStats) {
        self.samples += 1;
        let n = self.samples as f64;
        self.mean_wall_ms += (stats.wall_ms as f64 - self.mean_wall_ms) / n;
        self.mean_bytes += (stats.transferred_bytes as f64 - self.mean_bytes) / n;
        if stats.success {
            self.successes += 1;
        }
    }
}

#[derive(Debug, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<(String, WorkerId), Profile>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, signature: &str, worker: &WorkerId, stats: CompletionStats) {
        self.profiles
            .entry((signature.to_string(), worker.clone()))
            .or_default()
            .observe(stats);
    }

    /// Expected wall time for the pair; falls back to the signature's mean
    /// across all workers; `None` when the signature was never observed.
    pub fn expected_wall_ms(&self, signature: &str, worker: &WorkerId) -> Option<f64> {
        if let Some(profile) = self.profiles.get(&(signature.to_string(), worker.clone())) {
            if profile.samples > 0 {
                return Some(profile.mean_wall_ms);
            }
        }
        let (sum, count) = self
            .profiles
            .iter()
            .filter(|((sig, _), p)| sig == signature && p.samples > 0)
            .fold((0.0, 0u64), |(sum, count), (_, p)| {
                (sum + p.mean_wall_ms, count + 1)
            });
        if count > 0 {
            Some(sum / count as f64)
        } else {
            None
        }
    }

    pub fn success_rate(&self, signature: &str, worker: &WorkerId) -> Option<f64> {
        self.profiles
            .get(&(signature.to_string(), worker.clone()))
            .filter(|p| p.samples > 0)
            .map(|p| p.successes as f64 / p.samples as f64)
    }
}
