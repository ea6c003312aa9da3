//! Runtime configuration
//!
//! Configuration is loaded from environment variables and validated before
//! the runtime starts. Every knob has a default suitable for local
//! development.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Scheduling policy selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPolicyKind {
    /// Priority only, FIFO within equals
    Fifo,
    /// Full score tuple: priority, locality, resource slack, profile
    Locality,
    /// Locality-first, FIFO within equals
    Data,
    /// Locality including successors' inputs (lookahead)
    FullGraph,
}

impl SchedulerPolicyKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "fifo" => Ok(SchedulerPolicyKind::Fifo),
            "locality" => Ok(SchedulerPolicyKind::Locality),
            "data" => Ok(SchedulerPolicyKind::Data),
            "full_graph" => Ok(SchedulerPolicyKind::FullGraph),
            other => Err(anyhow!(
                "unknown scheduler policy '{other}' (expected fifo|locality|data|full_graph)"
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerPolicyKind::Fifo => "fifo",
            SchedulerPolicyKind::Locality => "locality",
            SchedulerPolicyKind::Data => "data",
            SchedulerPolicyKind::FullGraph => "full_graph",
        }
    }
}

/// Runtime configuration surface.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub scheduler_policy: SchedulerPolicyKind,

    /// Retry budget for retriable failures
    pub max_retries: u32,

    /// How long to wait for a worker to acknowledge a cancellation before
    /// declaring it degraded
    pub cancel_timeout: Duration,

    /// Ready time after which an action starts receiving priority bumps
    pub starvation_wait: Duration,

    /// One effective-priority bump per elapsed interval beyond the wait
    pub starvation_bump: Duration,

    /// Bound on concurrent transfers
    pub transfer_parallelism: usize,

    /// Storage collaborator configuration; `None` disables PSCO support
    pub storage_conf: Option<PathBuf>,

    /// Fall back to a plain move when the filesystem rejects an atomic one
    pub allow_non_atomic_move: bool,

    /// High-water mark of the submission queue; senders block when full
    pub submission_queue_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler_policy: SchedulerPolicyKind::Locality,
            max_retries: 3,
            cancel_timeout: Duration::from_secs(30),
            starvation_wait: Duration::from_secs(60),
            starvation_bump: Duration::from_secs(30),
            transfer_parallelism: default_transfer_parallelism(),
            storage_conf: None,
            allow_non_atomic_move: true,
            submission_queue_depth: 1024,
        }
    }
}

fn default_transfer_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(8))
        .unwrap_or(4)
}

impl RuntimeConfig {
    /// Load configuration from `WEFT_*` environment variables.
    ///
    /// - `WEFT_SCHEDULER_POLICY`: fifo | locality | data | full_graph
    /// - `WEFT_MAX_RETRIES`
    /// - `WEFT_CANCEL_TIMEOUT_MS`
    /// - `WEFT_STARVATION_WAIT_MS`, `WEFT_STARVATION_BUMP_MS`
    /// - `WEFT_TRANSFER_PARALLELISM`
    /// - `WEFT_STORAGE_CONF` (path; empty disables persistent objects)
    /// - `WEFT_ALLOW_NON_ATOMIC_MOVE`
    /// - `WEFT_SUBMISSION_QUEUE_DEPTH`
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let scheduler_policy = match env::var("WEFT_SCHEDULER_POLICY") {
            Ok(v) => SchedulerPolicyKind::parse(&v)?,
            Err(_) => defaults.scheduler_policy,
        };

        let max_retries = parse_env("WEFT_MAX_RETRIES", defaults.max_retries)?;
        let cancel_timeout = Duration::from_millis(parse_env(
            "WEFT_CANCEL_TIMEOUT_MS",
            defaults.cancel_timeout.as_millis() as u64,
        )?);
        let starvation_wait = Duration::from_millis(parse_env(
            "WEFT_STARVATION_WAIT_MS",
            defaults.starvation_wait.as_millis() as u64,
        )?);
        let starvation_bump = Duration::from_millis(parse_env(
            "WEFT_STARVATION_BUMP_MS",
            defaults.starvation_bump.as_millis() as u64,
        )?);
        let transfer_parallelism =
            parse_env("WEFT_TRANSFER_PARALLELISM", defaults.transfer_parallelism)?;
        let allow_non_atomic_move =
            parse_env("WEFT_ALLOW_NON_ATOMIC_MOVE", defaults.allow_non_atomic_move)?;
        let submission_queue_depth = parse_env(
            "WEFT_SUBMISSION_QUEUE_DEPTH",
            defaults.submission_queue_depth,
        )?;

        let storage_conf = match env::var("WEFT_STORAGE_CONF") {
            Ok(v) if !v.is_empty() => Some(PathBuf::from(v)),
            _ => None,
        };
        if storage_conf.is_none() {
            warn!("No storage configuration set; persistent object support disabled");
        }

        let config = Self {
            scheduler_policy,
            max_retries,
            cancel_timeout,
            starvation_wait,
            starvation_bump,
            transfer_parallelism,
            storage_conf,
            allow_non_atomic_move,
            submission_queue_depth,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.transfer_parallelism == 0 {
            return Err(anyhow!("transfer_parallelism must be at least 1"));
        }
        if self.submission_queue_depth == 0 {
            return Err(anyhow!("submission_queue_depth must be at least 1"));
        }
        if self.starvation_bump.is_zero() {
            return Err(anyhow!("starvation_bump must be non-zero"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(v) => v.parse::<T>().with_context(|| format!("invalid {key}")),
        Err(_) => Ok(default),
    }
}
