use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::block::Block;
use super::chain::{Blockchain, BlockchainError};
use super::crypto::Address;
use super::pow::{CancellationToken, NoncePool, SearchCounters, SearchOutcome};

/// Window the hashrate is averaged over
const HASHRATE_WINDOW: Duration = Duration::from_secs(60);

/// Pause before retrying after the nonce space ran out, so the next template
/// gets a new timestamp
const EXHAUSTED_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("Miner is already running")]
    AlreadyRunning,

    #[error("Failed to spawn miner thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Mining stopped before a block was found")]
    Stopped,

    #[error(transparent)]
    Chain(#[from] BlockchainError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MinerState {
    Idle,
    Searching,
    Stopping,
}

/// Snapshot reported by the miner
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MinerMetrics {
    pub state: MinerState,
    /// Height of the current head
    pub height: Option<u64>,
    /// Difficulty of the next block
    pub difficulty: u32,
    /// Hashes per second over the last minute
    pub hashrate: f64,
    pub total_attempts: u64,
    pub blocks_mined: u64,
    pub blocks_rejected: u64,
    pub last_error: Option<String>,
}

/// Rolling samples of the cumulative attempt counter
struct HashrateMeter {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl HashrateMeter {
    fn new(window: Duration) -> Self {
        HashrateMeter {
            samples: VecDeque::with_capacity(64),
            window,
        }
    }

    fn record(&mut self, total_attempts: u64) {
        let now = Instant::now();
        self.samples.push_back((now, total_attempts));

        while let Some(&(ts, _)) = self.samples.front() {
            if now.duration_since(ts) > self.window && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn hashrate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };

        let elapsed = last.0.duration_since(first.0).as_secs_f64();
        if elapsed < 0.001 {
            return 0.0;
        }
        last.1.saturating_sub(first.1) as f64 / elapsed
    }
}

struct Control {
    state: MinerState,
    /// Token of the search in flight, if any
    current: Option<CancellationToken>,
}

enum Round {
    Mined(Block),
    Retry,
    Stopped,
}

struct MinerInner {
    chain: Arc<Blockchain>,
    address: Address,
    pool: NoncePool,
    retemplate_interval: Option<Duration>,
    control: Mutex<Control>,
    /// Signalled whenever the state returns to `Idle`
    idle: Condvar,
    counters: SearchCounters,
    meter: Mutex<HashrateMeter>,
    blocks_mined: AtomicU64,
    blocks_rejected: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl MinerInner {
    /// Registers a fresh token for the next search, cancelling any earlier one.
    ///
    /// Returns `None` once a stop has been requested.
    fn begin_search(&self) -> Option<CancellationToken> {
        let mut control = self.control.lock();
        if control.state == MinerState::Stopping {
            return None;
        }

        let token = CancellationToken::new();
        if let Some(previous) = control.current.replace(token.clone()) {
            previous.cancel();
        }
        Some(token)
    }

    fn end_search(&self) {
        self.control.lock().current = None;
        self.meter.lock().record(self.counters.attempts());
    }

    fn finish(&self) {
        let mut control = self.control.lock();
        control.state = MinerState::Idle;
        control.current = None;
        self.idle.notify_all();
    }

    fn record_error(&self, err: &BlockchainError) {
        *self.last_error.lock() = Some(err.to_string());
    }

    /// Builds a template, searches it and submits the result
    fn mine_round(&self) -> Result<Round, BlockchainError> {
        if self.chain.is_halted() {
            return Err(BlockchainError::Halted);
        }

        let Some(token) = self.begin_search() else {
            return Ok(Round::Stopped);
        };

        let template = self.chain.build_template(&self.address, Utc::now().timestamp());
        let deadline = self.retemplate_interval.map(|interval| Instant::now() + interval);
        debug!(
            "Searching height {} at difficulty {} with {} workers",
            template.height,
            template.difficulty,
            self.pool.workers()
        );

        let outcome = self.pool.search(
            &template.template(),
            template.difficulty,
            &token,
            &self.counters,
            deadline,
        );
        self.end_search();

        match outcome {
            SearchOutcome::Found { nonce, .. } => {
                let block = template.seal(nonce);
                match self.chain.submit_block(block.clone()) {
                    Ok(_) => {
                        self.blocks_mined.fetch_add(1, Ordering::Relaxed);
                        info!("Mined block {} with nonce {}", block.height, block.nonce);
                        Ok(Round::Mined(block))
                    }
                    Err(err) if err.is_fatal() => {
                        self.record_error(&err);
                        Err(err)
                    }
                    Err(err) => {
                        // The head moved or the block went stale; mine on the new head
                        self.blocks_rejected.fetch_add(1, Ordering::Relaxed);
                        self.record_error(&err);
                        Ok(Round::Retry)
                    }
                }
            }
            SearchOutcome::Exhausted => {
                warn!("Nonce space exhausted at height {}, rebuilding template", template.height);
                thread::sleep(EXHAUSTED_BACKOFF);
                Ok(Round::Retry)
            }
            SearchOutcome::Expired => {
                debug!("Template for height {} expired, rebuilding", template.height);
                Ok(Round::Retry)
            }
            SearchOutcome::Cancelled => Ok(Round::Stopped),
        }
    }

    fn run(self: Arc<Self>) {
        info!("Miner started for {}", self.address);
        loop {
            match self.mine_round() {
                Ok(Round::Mined(_)) | Ok(Round::Retry) => continue,
                Ok(Round::Stopped) => break,
                Err(err) => {
                    error!("Miner stopping after fatal error: {}", err);
                    break;
                }
            }
        }

        self.finish();
        info!("Miner stopped");
    }
}

/// Drives block production: template, search, submit, repeat
pub struct Miner {
    inner: Arc<MinerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Miner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Miner")
            .field("address", &self.inner.address)
            .field("state", &self.state())
            .finish()
    }
}

impl Miner {
    pub fn new(chain: Arc<Blockchain>, address: Address) -> Self {
        let config = chain.config();
        let pool = NoncePool::from_config(config);
        let retemplate_interval = match config.retemplate_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Miner {
            inner: Arc::new(MinerInner {
                chain,
                address,
                pool,
                retemplate_interval,
                control: Mutex::new(Control {
                    state: MinerState::Idle,
                    current: None,
                }),
                idle: Condvar::new(),
                counters: SearchCounters::default(),
                meter: Mutex::new(HashrateMeter::new(HASHRATE_WINDOW)),
                blocks_mined: AtomicU64::new(0),
                blocks_rejected: AtomicU64::new(0),
                last_error: Mutex::new(None),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn state(&self) -> MinerState {
        self.inner.control.lock().state
    }

    /// Starts mining continuously on a background thread
    pub fn start(&self) -> Result<(), MinerError> {
        {
            let mut control = self.inner.control.lock();
            if control.state != MinerState::Idle {
                return Err(MinerError::AlreadyRunning);
            }
            control.state = MinerState::Searching;
        }

        let mut handle = self.handle.lock();
        if let Some(finished) = handle.take() {
            let _ = finished.join();
        }

        let inner = Arc::clone(&self.inner);
        match thread::Builder::new()
            .name("miner".to_string())
            .spawn(move || inner.run())
        {
            Ok(join) => {
                *handle = Some(join);
                Ok(())
            }
            Err(err) => {
                self.inner.finish();
                Err(err.into())
            }
        }
    }

    /// Cancels the search in flight and waits for the miner to go idle.
    ///
    /// Works for both the background loop and a `mine_block` call on another
    /// thread; the state only returns to `Idle` once that round has ended.
    pub fn stop(&self) {
        {
            let mut control = self.inner.control.lock();
            if control.state == MinerState::Idle {
                return;
            }
            control.state = MinerState::Stopping;
            if let Some(token) = control.current.take() {
                token.cancel();
            }
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("Miner thread panicked");
                self.inner.finish();
            }
        }

        let mut control = self.inner.control.lock();
        while control.state != MinerState::Idle {
            self.inner.idle.wait(&mut control);
        }
    }

    /// Mines until one block is accepted, on the calling thread
    pub fn mine_block(&self) -> Result<Block, MinerError> {
        {
            let mut control = self.inner.control.lock();
            if control.state != MinerState::Idle {
                return Err(MinerError::AlreadyRunning);
            }
            control.state = MinerState::Searching;
        }

        let result = loop {
            match self.inner.mine_round() {
                Ok(Round::Mined(block)) => break Ok(block),
                Ok(Round::Retry) => continue,
                Ok(Round::Stopped) => break Err(MinerError::Stopped),
                Err(err) => break Err(err.into()),
            }
        };

        self.inner.finish();
        result
    }

    pub fn metrics(&self) -> MinerMetrics {
        let inner = &self.inner;
        let total_attempts = inner.counters.attempts();
        let hashrate = {
            let mut meter = inner.meter.lock();
            meter.record(total_attempts);
            meter.hashrate()
        };

        MinerMetrics {
            state: self.state(),
            height: inner.chain.height(),
            difficulty: inner.chain.next_difficulty(),
            hashrate,
            total_attempts,
            blocks_mined: inner.blocks_mined.load(Ordering::Relaxed),
            blocks_rejected: inner.blocks_rejected.load(Ordering::Relaxed),
            last_error: inner.last_error.lock().clone(),
        }
    }
}

impl Drop for Miner {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::config::ChainConfig;
    use crate::blockchain::storage::BlockchainStorage;

    fn config() -> ChainConfig {
        ChainConfig {
            initial_difficulty: 1,
            min_difficulty: 1,
            max_difficulty: 2,
            adjustment_interval: 1000,
            initial_reward: 100,
            halving_interval: 1000,
            worker_count: 2,
            ..ChainConfig::default()
        }
    }

    fn chain() -> Arc<Blockchain> {
        Arc::new(Blockchain::new(config()).unwrap())
    }

    #[test]
    fn test_mine_block_extends_chain() {
        let chain = chain();
        let miner = Miner::new(Arc::clone(&chain), Address("miner".into()));

        let block = miner.mine_block().unwrap();

        assert_eq!(block.height, 1);
        assert_eq!(chain.height(), Some(1));
        assert_eq!(chain.ledger().balance(&Address("miner".into())), 100);
        assert_eq!(miner.state(), MinerState::Idle);

        let metrics = miner.metrics();
        assert_eq!(metrics.blocks_mined, 1);
        assert_eq!(metrics.height, Some(1));
        assert_eq!(metrics.blocks_rejected, 0);
        assert_eq!(metrics.state, MinerState::Idle);
    }

    #[test]
    fn test_start_and_stop() {
        let chain = chain();
        let miner = Miner::new(Arc::clone(&chain), Address("miner".into()));

        miner.start().unwrap();
        assert!(matches!(miner.start(), Err(MinerError::AlreadyRunning)));
        assert!(matches!(miner.mine_block(), Err(MinerError::AlreadyRunning)));

        let deadline = Instant::now() + Duration::from_secs(30);
        while chain.height() < Some(3) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        miner.stop();

        assert_eq!(miner.state(), MinerState::Idle);
        assert!(chain.height() >= Some(3));
        assert!(chain.is_valid());

        // stopping an idle miner is a no-op, and it can be restarted
        miner.stop();
        miner.start().unwrap();
        miner.stop();
    }

    #[test]
    fn test_stop_right_after_start() {
        let miner = Miner::new(chain(), Address("miner".into()));

        miner.start().unwrap();
        miner.stop();
        assert_eq!(miner.state(), MinerState::Idle);
        assert!(miner.metrics().last_error.is_none());
    }

    /// Block 1 is cheap; the retarget at height 2 jumps to a difficulty no
    /// test will ever solve
    fn unreachable_chain() -> Arc<Blockchain> {
        let config = ChainConfig {
            initial_difficulty: 4,
            min_difficulty: 1,
            max_difficulty: 16,
            target_block_time: 1_000_000_000_000,
            adjustment_interval: 2,
            initial_reward: 100,
            halving_interval: 1000,
            worker_count: 2,
            ..ChainConfig::default()
        };
        Arc::new(Blockchain::new(config).unwrap())
    }

    fn wait_for(miner: &Miner, state: MinerState) {
        let deadline = Instant::now() + Duration::from_secs(30);
        while miner.state() != state {
            assert!(Instant::now() < deadline, "miner never reached {:?}", state);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_stop_waits_for_synchronous_round() {
        let chain = unreachable_chain();
        let miner = Arc::new(Miner::new(Arc::clone(&chain), Address("miner".into())));
        miner.mine_block().unwrap();
        assert_eq!(chain.next_difficulty(), 16);

        let worker = {
            let miner = Arc::clone(&miner);
            thread::spawn(move || miner.mine_block())
        };
        wait_for(&miner, MinerState::Searching);

        miner.stop();
        assert_eq!(miner.state(), MinerState::Idle);
        // the round has already returned, so joining cannot block
        assert!(matches!(worker.join().unwrap(), Err(MinerError::Stopped)));
        assert_eq!(chain.height(), Some(1));

        miner.start().unwrap();
        miner.stop();
        assert_eq!(miner.state(), MinerState::Idle);
    }

    #[test]
    fn test_commit_failure_stops_running_miner() {
        let storage = BlockchainStorage::temporary().unwrap();
        let chain = Arc::new(Blockchain::from_storage(storage, config()).unwrap());
        chain.storage().unwrap().fail_commits(true);

        let miner = Miner::new(Arc::clone(&chain), Address("miner".into()));
        miner.start().unwrap();
        wait_for(&miner, MinerState::Idle);

        assert!(chain.is_halted());
        assert_eq!(chain.height(), Some(0));
        assert_eq!(chain.ledger().balance(&Address("miner".into())), 0);
        assert!(miner.metrics().last_error.is_some());
        assert!(matches!(
            miner.mine_block(),
            Err(MinerError::Chain(BlockchainError::Halted))
        ));
        assert_eq!(miner.state(), MinerState::Idle);
    }

    #[test]
    fn test_hashrate_meter() {
        let mut meter = HashrateMeter::new(Duration::from_secs(60));
        assert_eq!(meter.hashrate(), 0.0);

        meter.record(0);
        thread::sleep(Duration::from_millis(20));
        meter.record(10_000);

        assert!(meter.hashrate() > 0.0);
    }
}
