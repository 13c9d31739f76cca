//! Background job queue.
//!
//! `JobEnqueue` only records work; an external worker drains the queue with
//! [`JobQueue::pop_ready`].  Ready jobs come out highest priority first, then
//! earliest `run_at`, then enqueue order.

use std::sync::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::error::Fault;

/// One queued job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub topic: String,
    pub payload: Value,
    /// 1 (lowest) to 10 (highest).
    pub priority: u8,
    pub max_retries: u32,
    pub run_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip)]
    seq: u64,
}

/// Arguments of a new job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub topic: String,
    pub payload: Value,
    pub delay_secs: u64,
    pub priority: u8,
    pub max_retries: u32,
}

impl NewJob {
    /// Build from a validated `JobEnqueue` payload.
    pub fn from_payload(payload: &hookbridge_protocol::Payload) -> Result<Self, Fault> {
        let topic = payload
            .get("topic")
            .and_then(Value::as_str)
            .ok_or_else(|| Fault::invalid("topic", "is required"))?;
        let int = |name: &str, default: u64| {
            payload
                .get(name)
                .and_then(Value::as_u64)
                .unwrap_or(default)
        };
        Ok(Self {
            topic: topic.to_owned(),
            payload: payload.get("payload").cloned().unwrap_or(Value::Null),
            delay_secs: int("delay", 0),
            priority: u8::try_from(int("priority", 5))
                .map_err(|_| Fault::invalid("priority", "out of range"))?,
            max_retries: u32::try_from(int("maxRetries", 3))
                .map_err(|_| Fault::invalid("maxRetries", "out of range"))?,
        })
    }
}

/// Thread-safe priority queue of jobs.
#[derive(Default)]
pub struct JobQueue {
    jobs: Mutex<Vec<Job>>,
    seq: AtomicU64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign an id to `job` without queueing it.
    ///
    /// Transactions prepare jobs at call time and [`push`](Self::push) them
    /// on commit, so the id returned to the sandbox is stable.
    pub fn prepare(&self, job: NewJob) -> Job {
        let now = Utc::now();
        let delay = i64::try_from(job.delay_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        Job {
            id: uuid::Uuid::now_v7().to_string(),
            topic: job.topic,
            payload: job.payload,
            priority: job.priority,
            max_retries: job.max_retries,
            run_at: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
            enqueued_at: now,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn push(&self, job: Job) -> Result<(), Fault> {
        self.batch()?.push(job);
        Ok(())
    }

    /// Hold the queue lock so a series of pushes cannot fail part way.
    pub fn batch(&self) -> Result<JobBatch<'_>, Fault> {
        Ok(JobBatch { jobs: self.lock()? })
    }

    /// Prepare and queue in one step.
    pub fn enqueue(&self, job: NewJob) -> Result<Job, Fault> {
        let job = self.prepare(job);
        self.push(job.clone())?;
        Ok(job)
    }

    /// Jobs whose `run_at` has passed, in dispatch order.
    pub fn ready(&self, now: DateTime<Utc>) -> Result<Vec<Job>, Fault> {
        let mut ready: Vec<Job> = self
            .lock()?
            .iter()
            .filter(|j| j.run_at <= now)
            .cloned()
            .collect();
        ready.sort_by(dispatch_order);
        Ok(ready)
    }

    /// Remove and return the next ready job.
    pub fn pop_ready(&self, now: DateTime<Utc>) -> Result<Option<Job>, Fault> {
        let mut jobs = self.lock()?;
        let next = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.run_at <= now)
            .min_by(|(_, a), (_, b)| dispatch_order(a, b))
            .map(|(i, _)| i);
        Ok(next.map(|i| jobs.remove(i)))
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<Job>>, Fault> {
        self.jobs
            .lock()
            .map_err(|e| Fault::host(format!("job queue mutex poisoned: {e}")))
    }

    /// Poison the queue mutex the way a panicking worker would.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        std::thread::scope(|s| {
            let _ = s
                .spawn(|| {
                    let _guard = self.jobs.lock();
                    panic!("worker panicked while holding the job queue");
                })
                .join();
        });
    }
}

/// Exclusive access to the queue, from [`JobQueue::batch`].
pub struct JobBatch<'q> {
    jobs: MutexGuard<'q, Vec<Job>>,
}

impl JobBatch<'_> {
    pub fn push(&mut self, job: Job) {
        info!(job_id = %job.id, topic = %job.topic, priority = job.priority, "job enqueued");
        self.jobs.push(job);
    }
}

fn dispatch_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.run_at.cmp(&b.run_at))
        .then(a.seq.cmp(&b.seq))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn job(topic: &str, priority: u8, delay_secs: u64) -> NewJob {
        NewJob {
            topic: topic.into(),
            payload: json!({"topic": topic}),
            delay_secs,
            priority,
            max_retries: 3,
        }
    }

    #[test]
    fn higher_priority_first_then_fifo() {
        let q = JobQueue::new();
        q.enqueue(job("low", 1, 0)).unwrap();
        q.enqueue(job("high-a", 9, 0)).unwrap();
        q.enqueue(job("high-b", 9, 0)).unwrap();
        let now = Utc::now();
        let order: Vec<String> = q.ready(now).unwrap().into_iter().map(|j| j.topic).collect();
        assert_eq!(order, vec!["high-a", "high-b", "low"]);

        assert_eq!(q.pop_ready(now).unwrap().unwrap().topic, "high-a");
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn delayed_jobs_are_not_ready() {
        let q = JobQueue::new();
        q.enqueue(job("later", 5, 3600)).unwrap();
        assert!(q.pop_ready(Utc::now()).unwrap().is_none());
        let future = Utc::now() + Duration::hours(2);
        assert_eq!(q.pop_ready(future).unwrap().unwrap().topic, "later");
        assert!(q.is_empty());
    }

    #[test]
    fn prepared_jobs_are_not_queued() {
        let q = JobQueue::new();
        let prepared = q.prepare(job("t", 5, 0));
        assert!(q.is_empty());
        q.push(prepared.clone()).unwrap();
        assert_eq!(q.pop_ready(Utc::now()).unwrap(), Some(prepared));
    }

    #[test]
    fn batch_pushes_under_one_lock() {
        let q = JobQueue::new();
        {
            let mut batch = q.batch().unwrap();
            batch.push(q.prepare(job("a", 5, 0)));
            batch.push(q.prepare(job("b", 5, 0)));
        }
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn poisoned_queue_refuses_batches() {
        let q = JobQueue::new();
        q.poison();
        let err = q.batch().err().unwrap();
        assert_eq!(err.kind, hookbridge_protocol::ErrorKind::HostError);
        assert!(q.push(q.prepare(job("t", 5, 0))).is_err());
    }

    #[test]
    fn from_payload_reads_defaults() {
        let payload = hookbridge_protocol::validate(
            hookbridge_protocol::OpCode::JobEnqueue,
            json!({"topic": "email"}).as_object().cloned().unwrap(),
        )
        .unwrap();
        let job = NewJob::from_payload(&payload).unwrap();
        assert_eq!(job.priority, 5);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.delay_secs, 0);
        assert_eq!(job.payload, Value::Null);
    }
}
