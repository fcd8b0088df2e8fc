//! Durable job queue for relayq
//!
//! Jobs are leased to one worker at a time, kept alive by heartbeats,
//! deduplicated by idempotency key and retried with backoff. Admission
//! control caps queue depth and submission rate. The same contract is served
//! by an in-process provider, a Redis provider (feature `redis`) and a test
//! double with injected latency and failures.

pub mod backend;
pub mod clock;
pub mod error;
pub mod job;
pub mod maintenance;
pub mod processor;
pub mod queue;
pub mod settings;
pub mod worker;

pub use backend::fake::{FakeDurableProvider, Simulation};
pub use backend::memory::InMemoryProvider;
#[cfg(feature = "redis")]
pub use backend::redis::RedisProvider;
pub use backend::{Backend, ProviderConfig, QueueProvider, Submitted};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{config_error, Result};
pub use job::{
    BackoffStrategy, EnqueueRequest, FailureRecord, Job, JobError, JobPriority, JobStatus,
    Payload, QueueStats, RetryPolicy, LEASE_EXPIRED,
};
pub use maintenance::{Reaper, SweepReport};
pub use processor::{Processor, Progress, SimulatedProcessor};
pub use queue::QueueHandle;
pub use settings::QueueSettings;
pub use worker::{Outcome, Worker, WorkerConfig};
