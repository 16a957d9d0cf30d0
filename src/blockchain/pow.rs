use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Instant;

use log::debug;

use super::block::{meets_difficulty, HeaderTemplate};
use super::config::ChainConfig;

/// Hashes a worker performs between counter flushes and deadline checks
const FLUSH_INTERVAL: u64 = 1024;

/// Cooperative cancellation signal passed to every search worker
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Attempt counter accumulated across workers, readable while a search runs
#[derive(Debug, Default)]
pub struct SearchCounters {
    attempts: AtomicU64,
}

impl SearchCounters {
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    fn add(&self, n: u64) {
        if n > 0 {
            self.attempts.fetch_add(n, Ordering::Relaxed);
        }
    }
}

/// Result of one search invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Found { nonce: u64, hash: [u8; 32] },
    /// Every nonce in `[0, max_nonce)` was tried
    Exhausted,
    /// The caller's token fired
    Cancelled,
    /// The re-template deadline passed
    Expired,
}

/// Splits the nonce space across worker threads that race for a solution
#[derive(Debug, Clone)]
pub struct NoncePool {
    workers: usize,
    max_nonce: u64,
}

impl NoncePool {
    pub fn new(workers: usize, max_nonce: u64) -> Self {
        NoncePool {
            workers: workers.max(1),
            max_nonce,
        }
    }

    pub fn from_config(config: &ChainConfig) -> Self {
        Self::new(config.worker_count, config.max_nonce)
    }

    /// Single worker scanning upwards, so the lowest satisfying nonce wins
    pub fn sequential(max_nonce: u64) -> Self {
        Self::new(1, max_nonce)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Disjoint contiguous subranges covering `[0, max_nonce)`, one per worker
    pub fn partition(&self) -> Vec<Range<u64>> {
        let workers = self.workers as u64;
        let chunk = self.max_nonce / workers;
        let remainder = self.max_nonce % workers;

        let mut start = 0u64;
        (0..workers)
            .map(|i| {
                let len = chunk + u64::from(i < remainder);
                let range = start..start + len;
                start += len;
                range
            })
            .collect()
    }

    /// Searches for a nonce whose header hash has `difficulty` leading zero nibbles.
    ///
    /// Blocks until a worker wins, the space is exhausted, `cancel` fires or
    /// `deadline` passes. At most one nonce is reported.
    pub fn search(
        &self,
        template: &HeaderTemplate,
        difficulty: u32,
        cancel: &CancellationToken,
        counters: &SearchCounters,
        deadline: Option<Instant>,
    ) -> SearchOutcome {
        let winner: OnceLock<(u64, [u8; 32])> = OnceLock::new();
        let stop = AtomicBool::new(false);
        let expired = AtomicBool::new(false);

        thread::scope(|scope| {
            for (worker_id, range) in self.partition().into_iter().enumerate() {
                if range.is_empty() {
                    continue;
                }

                let winner = &winner;
                let stop = &stop;
                let expired = &expired;

                scope.spawn(move || {
                    debug!("Worker {} searching nonces {}..{}", worker_id, range.start, range.end);

                    let mut pending = 0u64;
                    for nonce in range {
                        if stop.load(Ordering::Relaxed) || cancel.is_cancelled() {
                            break;
                        }

                        let hash = template.hash_with_nonce(nonce);
                        pending += 1;

                        if meets_difficulty(&hash, difficulty) {
                            if winner.set((nonce, hash)).is_ok() {
                                debug!("Worker {} found nonce {}", worker_id, nonce);
                            }
                            stop.store(true, Ordering::Relaxed);
                            break;
                        }

                        if pending == FLUSH_INTERVAL {
                            counters.add(pending);
                            pending = 0;

                            if deadline.is_some_and(|d| Instant::now() >= d) {
                                expired.store(true, Ordering::Relaxed);
                                stop.store(true, Ordering::Relaxed);
                                break;
                            }
                        }
                    }
                    counters.add(pending);
                });
            }
        });

        if let Some((nonce, hash)) = winner.get().copied() {
            SearchOutcome::Found { nonce, hash }
        } else if cancel.is_cancelled() {
            SearchOutcome::Cancelled
        } else if expired.load(Ordering::Relaxed) {
            SearchOutcome::Expired
        } else {
            SearchOutcome::Exhausted
        }
    }
}
