//! Invocation metrics.
//!
//! [`InvocationMetrics`] counts hook invocations by outcome, keeps a latency
//! histogram, and tracks the same figures per module.  Counters are atomics;
//! the per-module table is a [`DashMap`] so concurrent invocations of
//! different modules never contend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::error::HostError;

/// Upper bounds, in milliseconds, of the latency histogram buckets.  A final
/// overflow bucket counts everything slower.
pub const LATENCY_BUCKETS_MS: [u64; 12] =
    [1, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The hook returned an `ok` envelope.
    Ok,
    /// The hook returned an `err` envelope.
    GuestError,
    /// The guest trapped or broke the calling convention.
    Trap,
    /// The fuel budget ran out.
    OutOfFuel,
    /// Anything else: instantiation, missing exports, host faults.
    Failed,
}

impl Outcome {
    pub fn of<T>(result: &Result<T, HostError>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(HostError::Guest(_)) => Self::GuestError,
            Err(HostError::Trap(_) | HostError::Execution(_)) => Self::Trap,
            Err(HostError::OutOfFuel { .. }) => Self::OutOfFuel,
            Err(_) => Self::Failed,
        }
    }
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    ok: AtomicU64,
    guest_error: AtomicU64,
    trap: AtomicU64,
    out_of_fuel: AtomicU64,
    failed: AtomicU64,
    latency_us_sum: AtomicU64,
    fuel_sum: AtomicU64,
    host_calls_sum: AtomicU64,
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
}

impl Counters {
    fn record(&self, outcome: Outcome, elapsed: Duration, fuel: u64, host_calls: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let slot = match outcome {
            Outcome::Ok => &self.ok,
            Outcome::GuestError => &self.guest_error,
            Outcome::Trap => &self.trap,
            Outcome::OutOfFuel => &self.out_of_fuel,
            Outcome::Failed => &self.failed,
        };
        slot.fetch_add(1, Ordering::Relaxed);

        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.latency_us_sum.fetch_add(micros, Ordering::Relaxed);
        self.fuel_sum.fetch_add(fuel, Ordering::Relaxed);
        self.host_calls_sum.fetch_add(host_calls, Ordering::Relaxed);
        self.buckets[bucket_index(elapsed)].fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let total = load(&self.total);
        let latency_us_sum = load(&self.latency_us_sum);
        MetricsSnapshot {
            total,
            ok: load(&self.ok),
            guest_error: load(&self.guest_error),
            trap: load(&self.trap),
            out_of_fuel: load(&self.out_of_fuel),
            failed: load(&self.failed),
            avg_latency_ms: if total == 0 {
                0.0
            } else {
                latency_us_sum as f64 / total as f64 / 1000.0
            },
            fuel_consumed: load(&self.fuel_sum),
            host_calls: load(&self.host_calls_sum),
            latency_histogram: LATENCY_BUCKETS_MS
                .iter()
                .map(|&le| Some(le))
                .chain(std::iter::once(None))
                .zip(self.buckets.iter())
                .map(|(le_ms, count)| LatencyBucket {
                    le_ms,
                    count: load(count),
                })
                .collect(),
        }
    }
}

fn bucket_index(elapsed: Duration) -> usize {
    let ms = elapsed.as_millis();
    LATENCY_BUCKETS_MS
        .iter()
        .position(|&le| ms <= u128::from(le))
        .unwrap_or(LATENCY_BUCKETS_MS.len())
}

/// One histogram bucket; `le_ms == None` is the overflow bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyBucket {
    pub le_ms: Option<u64>,
    pub count: u64,
}

/// Point-in-time view of a set of counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub ok: u64,
    pub guest_error: u64,
    pub trap: u64,
    pub out_of_fuel: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
    pub fuel_consumed: u64,
    pub host_calls: u64,
    pub latency_histogram: Vec<LatencyBucket>,
}

impl MetricsSnapshot {
    /// Fraction of invocations that returned `ok`, or `0.0` before the first.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.ok as f64 / self.total as f64
        }
    }
}

/// Overall and per-module figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeMetrics {
    pub overall: MetricsSnapshot,
    /// Sorted by module name.
    pub modules: Vec<(String, MetricsSnapshot)>,
}

/// Collector shared by every invocation of a [`HookRuntime`](crate::HookRuntime).
#[derive(Default)]
pub struct InvocationMetrics {
    overall: Counters,
    by_module: DashMap<String, Counters>,
}

impl InvocationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        module: &str,
        outcome: Outcome,
        elapsed: Duration,
        fuel_consumed: u64,
        host_calls: u64,
    ) {
        self.overall.record(outcome, elapsed, fuel_consumed, host_calls);
        if let Some(counters) = self.by_module.get(module) {
            counters.record(outcome, elapsed, fuel_consumed, host_calls);
            return;
        }
        self.by_module
            .entry(module.to_owned())
            .or_default()
            .record(outcome, elapsed, fuel_consumed, host_calls);
    }

    pub fn overall(&self) -> MetricsSnapshot {
        self.overall.snapshot()
    }

    pub fn module(&self, name: &str) -> Option<MetricsSnapshot> {
        self.by_module.get(name).map(|c| c.snapshot())
    }

    pub fn snapshot(&self) -> RuntimeMetrics {
        let mut modules: Vec<(String, MetricsSnapshot)> = self
            .by_module
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect();
        modules.sort_by(|a, b| a.0.cmp(&b.0));
        RuntimeMetrics {
            overall: self.overall.snapshot(),
            modules,
        }
    }

    /// Drop the per-module figures of an unloaded module.
    pub fn forget(&self, module: &str) {
        self.by_module.remove(module);
    }
}

#[cfg(test)]
mod tests {
    use hookbridge_protocol::{ErrorBody, ErrorKind};

    use super::*;

    #[test]
    fn outcomes_are_classified() {
        let ok: Result<(), HostError> = Ok(());
        assert_eq!(Outcome::of(&ok), Outcome::Ok);
        let guest = Err::<(), _>(HostError::Guest(ErrorBody {
            kind: ErrorKind::InvalidArgument,
            message: "no".into(),
            field: None,
        }));
        assert_eq!(Outcome::of(&guest), Outcome::GuestError);
        let trap = Err::<(), _>(HostError::Trap("unreachable".into()));
        assert_eq!(Outcome::of(&trap), Outcome::Trap);
        let fuel = Err::<(), _>(HostError::OutOfFuel { limit: 10 });
        assert_eq!(Outcome::of(&fuel), Outcome::OutOfFuel);
        let other = Err::<(), _>(HostError::Instantiation("missing import".into()));
        assert_eq!(Outcome::of(&other), Outcome::Failed);
    }

    #[test]
    fn counts_split_by_module_and_outcome() {
        let m = InvocationMetrics::new();
        m.record("a", Outcome::Ok, Duration::from_millis(3), 100, 2);
        m.record("a", Outcome::GuestError, Duration::from_millis(7), 50, 1);
        m.record("b", Outcome::OutOfFuel, Duration::from_secs(20), 1000, 0);

        let overall = m.overall();
        assert_eq!(overall.total, 3);
        assert_eq!(overall.ok, 1);
        assert_eq!(overall.guest_error, 1);
        assert_eq!(overall.out_of_fuel, 1);
        assert_eq!(overall.fuel_consumed, 1150);
        assert_eq!(overall.host_calls, 3);

        let a = m.module("a").unwrap();
        assert_eq!(a.total, 2);
        assert!((a.success_rate() - 0.5).abs() < f64::EPSILON);
        assert!((a.avg_latency_ms - 5.0).abs() < 1e-9);
        assert_eq!(m.module("b").unwrap().out_of_fuel, 1);
        assert!(m.module("c").is_none());

        let names: Vec<String> = m.snapshot().modules.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
        m.forget("a");
        assert!(m.module("a").is_none());
        assert_eq!(m.overall().total, 3);
    }

    #[test]
    fn latency_lands_in_the_right_bucket() {
        let m = InvocationMetrics::new();
        m.record("a", Outcome::Ok, Duration::from_micros(500), 0, 0);
        m.record("a", Outcome::Ok, Duration::from_millis(30), 0, 0);
        m.record("a", Outcome::Trap, Duration::from_secs(60), 0, 0);

        let hist = m.overall().latency_histogram;
        assert_eq!(hist.len(), LATENCY_BUCKETS_MS.len() + 1);
        assert_eq!(hist[0], LatencyBucket { le_ms: Some(1), count: 1 });
        assert_eq!(hist[4], LatencyBucket { le_ms: Some(50), count: 1 });
        assert_eq!(hist.last().unwrap(), &LatencyBucket { le_ms: None, count: 1 });
        assert_eq!(hist.iter().map(|b| b.count).sum::<u64>(), 3);
    }

    #[test]
    fn empty_collector_reports_zeroes() {
        let m = InvocationMetrics::new();
        let s = m.overall();
        assert_eq!(s.total, 0);
        assert_eq!(s.avg_latency_ms, 0.0);
        assert_eq!(s.success_rate(), 0.0);
    }
}
