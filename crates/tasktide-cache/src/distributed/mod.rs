//! Distributed warming: persisted jobs routed through a shared queue.

mod job;
mod queue;
mod redis_queue;
mod router;

pub use job::{DEFAULT_JOB_TTL, DeadLetterEntry, DistributedJob, JobType};
pub use queue::{DEAD_LETTER_QUEUE, JobQueue, MemoryJobQueue, QueueSizes};
pub use redis_queue::RedisJobQueue;
pub use router::{DistributedJobRouter, RouterMetrics, RouterSettings};
