//! Transport doubles for exercising the engine without a network.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::StatusCode;
use tokio::time;
use url::Url;

use crate::targets::TargetSet;
use crate::transport::{Fetched, Transport, TransportError};

/// Counts calls, answers after a fixed latency, and fails every `fail_every`th call.
pub struct ScriptedTransport {
    calls: AtomicU64,
    latency: Duration,
    fail_every: Option<u64>,
    bytes: u64,
}

impl ScriptedTransport {
    pub fn new(latency: Duration) -> Self {
        ScriptedTransport {
            calls: AtomicU64::new(0),
            latency,
            fail_every: None,
            bytes: 0,
        }
    }

    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n);
        self
    }

    pub fn with_body(mut self, bytes: u64) -> Self {
        self.bytes = bytes;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    async fn fetch(&self, _target: &Url) -> Result<Fetched, TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        time::sleep(self.latency).await;
        match self.fail_every {
            Some(n) if call % n == 0 => Err(TransportError::Timeout(self.latency)),
            _ => Ok(Fetched {
                status: StatusCode::OK,
                bytes: self.bytes,
            }),
        }
    }
}

/// Blocks its runtime thread for `stall` inside `fetch`. Cancellation can't
/// interrupt it, so a stopping pool has to give up on the worker.
pub struct StallingTransport {
    calls: AtomicU64,
    stall: Duration,
}

impl StallingTransport {
    pub fn new(stall: Duration) -> Arc<Self> {
        Arc::new(StallingTransport {
            calls: AtomicU64::new(0),
            stall,
        })
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transport for StallingTransport {
    async fn fetch(&self, _target: &Url) -> Result<Fetched, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Let tasks woken by this worker run elsewhere before the thread blocks.
        tokio::task::yield_now().await;
        std::thread::sleep(self.stall);
        Ok(Fetched {
            status: StatusCode::OK,
            bytes: 0,
        })
    }
}

pub fn mock_targets() -> TargetSet {
    TargetSet::parse(&["http://mock.test/"]).expect("static mock URL parses")
}
