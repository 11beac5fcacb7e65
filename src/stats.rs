use std::collections::VecDeque;
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Shared counters for one run. Every update and every snapshot goes through
/// the same lock, so readers never see a count without its sample.
pub struct StatAggregator {
    tally: Mutex<Tally>,
    start_time: Instant,
    capacity: usize,
}

struct Tally {
    requests: u64,
    errors: u64,
    bytes: u64,
    window: VecDeque<Duration>,
    // Whole-run latency in microseconds; the window only covers recent samples.
    histogram: Histogram<u64>,
}

impl StatAggregator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        StatAggregator {
            tally: Mutex::new(Tally {
                requests: 0,
                errors: 0,
                bytes: 0,
                window: VecDeque::with_capacity(capacity),
                histogram: Histogram::<u64>::new(3)
                    .expect("three significant figures is a valid histogram precision"),
            }),
            start_time: Instant::now(),
            capacity,
        }
    }

    pub fn record_success(&self, elapsed: Duration, bytes: u64) {
        {
            let mut tally = self.tally.lock();
            tally.requests += 1;
            tally.bytes += bytes;
            if tally.window.len() == self.capacity {
                tally.window.pop_front();
            }
            tally.window.push_back(elapsed);
            tally.histogram.saturating_record(elapsed.as_micros() as u64);
        }

        metrics::counter!("netstress_requests_total").increment(1);
        metrics::counter!("netstress_bytes_total").increment(bytes);
        metrics::histogram!("netstress_response_time_seconds").record(elapsed.as_secs_f64());
    }

    pub fn record_error(&self) {
        self.tally.lock().errors += 1;
        metrics::counter!("netstress_errors_total").increment(1);
    }

    pub fn snapshot(&self) -> Snapshot {
        let tally = self.tally.lock();
        let p99 = (!tally.histogram.is_empty())
            .then(|| Duration::from_micros(tally.histogram.value_at_quantile(0.99)));
        Snapshot {
            requests: tally.requests,
            errors: tally.errors,
            bytes: tally.bytes,
            samples: tally.window.iter().copied().collect(),
            p99,
            elapsed: self.start_time.elapsed(),
        }
    }
}

/// Consistent copy of the aggregator state at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Completed requests. Failures are counted separately in `errors`.
    pub requests: u64,
    pub errors: u64,
    pub bytes: u64,
    /// Recent response times, oldest first.
    pub samples: Vec<Duration>,
    /// Over the whole run, not just the window.
    pub p99: Option<Duration>,
    pub elapsed: Duration,
}

impl Snapshot {
    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: u128 = self.samples.iter().map(Duration::as_nanos).sum();
        let mean = total / self.samples.len() as u128;
        Some(Duration::from_nanos(u64::try_from(mean).unwrap_or(u64::MAX)))
    }

    pub fn min(&self) -> Option<Duration> {
        self.samples.iter().min().copied()
    }

    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().max().copied()
    }

    pub fn median(&self) -> Option<Duration> {
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let len = sorted.len();
        match len {
            0 => None,
            _ if len % 2 == 1 => Some(sorted[len / 2]),
            _ => Some((sorted[len / 2 - 1] + sorted[len / 2]) / 2),
        }
    }

    /// Requests per second since the run started.
    pub fn overall_rate(&self) -> f64 {
        per_second(self.requests, self.elapsed)
    }

    /// Requests per second since `earlier` was taken.
    pub fn rate_since(&self, earlier: &Snapshot) -> f64 {
        per_second(
            self.requests.saturating_sub(earlier.requests),
            self.elapsed.saturating_sub(earlier.elapsed),
        )
    }

    /// `(requests - errors) / requests`, clamped to `[0, 1]`; zero before the
    /// first completed request.
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.requests.saturating_sub(self.errors) as f64 / self.requests as f64
    }

    pub fn transfer_rate_mib(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs / 1024.0 / 1024.0
        } else {
            0.0
        }
    }
}

fn per_second(count: u64, over: Duration) -> f64 {
    let secs = over.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

fn millis(value: Option<Duration>) -> f64 {
    value.map_or(0.0, |d| d.as_nanos() as f64 / 1_000_000.0)
}

/// Periodic view of a running session.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveStats {
    pub requests: u64,
    pub errors: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub overall_rate: f64,
    pub recent_rate: f64,
    pub elapsed: Duration,
}

impl LiveStats {
    pub fn new(current: &Snapshot, previous: &Snapshot) -> Self {
        LiveStats {
            requests: current.requests,
            errors: current.errors,
            avg_ms: millis(current.average()),
            min_ms: millis(current.min()),
            max_ms: millis(current.max()),
            overall_rate: current.overall_rate(),
            recent_rate: current.rate_since(previous),
            elapsed: current.elapsed,
        }
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Manual,
    DurationElapsed,
}

/// Emitted once when a run returns to idle.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalReport {
    pub requests: u64,
    pub errors: u64,
    pub bytes: u64,
    pub success_rate: f64,
    pub avg_ms: f64,
    pub median_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p99_ms: f64,
    pub overall_rate: f64,
    pub transfer_rate_mib: f64,
    pub elapsed: Duration,
    pub reason: StopReason,
    /// Workers still unwinding when the grace period ran out.
    pub abandoned_workers: usize,
}

impl FinalReport {
    pub fn new(snapshot: &Snapshot, reason: StopReason, abandoned_workers: usize) -> Self {
        FinalReport {
            requests: snapshot.requests,
            errors: snapshot.errors,
            bytes: snapshot.bytes,
            success_rate: snapshot.success_rate(),
            avg_ms: millis(snapshot.average()),
            median_ms: millis(snapshot.median()),
            min_ms: millis(snapshot.min()),
            max_ms: millis(snapshot.max()),
            p99_ms: millis(snapshot.p99),
            overall_rate: snapshot.overall_rate(),
            transfer_rate_mib: snapshot.transfer_rate_mib(),
            elapsed: snapshot.elapsed,
            reason,
            abandoned_workers,
        }
    }
}
