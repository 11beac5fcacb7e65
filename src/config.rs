use std::time::Duration;

use clap::ValueEnum;
use thiserror::Error;

/// How workers load the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LoadMode {
    /// Pick a random endpoint per attempt and measure its response time.
    #[default]
    Probe,
    /// Keep downloading a large file and discard the body.
    Saturate,
}

/// Upper bound on workers in one run. Past this the host runs out of sockets
/// long before the link saturates.
pub const MAX_WORKERS: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("intensity must be a positive number, got {0}")]
    NonPositiveIntensity(f64),
    #[error("thread count must be at least 1")]
    NoThreads,
    #[error("{requested} workers requested; at most {MAX_WORKERS} are supported")]
    TooManyWorkers { requested: f64 },
    #[error("duration bound must be longer than zero; leave it unset for an unbounded run")]
    ZeroDuration,
    #[error("intensity {intensity} stretches the {base:?} delay beyond what can be slept")]
    DelayOutOfRange { intensity: f64, base: Duration },
}

/// User-facing parameters of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Nominally a percentage. Scales concurrency up and the delay down.
    pub intensity: f64,
    pub thread_count: usize,
    pub base_delay: Duration,
    /// `None` runs until stopped.
    pub duration: Option<Duration>,
    pub mode: LoadMode,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            intensity: 50.0,
            thread_count: 10,
            base_delay: Duration::from_millis(100),
            duration: None,
            mode: LoadMode::Probe,
        }
    }
}

/// Concrete pool configuration derived from a [`RunConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunPlan {
    pub workers: usize,
    pub delay: Duration,
    pub duration: Option<Duration>,
    pub mode: LoadMode,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // NaN fails this comparison too.
        if !(self.intensity > 0.0) || self.intensity.is_infinite() {
            return Err(ConfigError::NonPositiveIntensity(self.intensity));
        }
        if self.thread_count == 0 {
            return Err(ConfigError::NoThreads);
        }
        let requested = self.scaled_threads();
        if !requested.is_finite() || requested > MAX_WORKERS as f64 {
            return Err(ConfigError::TooManyWorkers { requested });
        }
        if self.duration == Some(Duration::ZERO) {
            return Err(ConfigError::ZeroDuration);
        }
        Ok(())
    }

    fn scaled_threads(&self) -> f64 {
        (self.thread_count as f64 * self.intensity / 100.0).round()
    }

    /// `max(1, round(threads * intensity / 100))`, capped at [`MAX_WORKERS`].
    pub fn effective_threads(&self) -> usize {
        (self.scaled_threads() as usize).clamp(1, MAX_WORKERS)
    }

    /// `base_delay * 100 / intensity`
    pub fn effective_delay(&self) -> Result<Duration, ConfigError> {
        if self.base_delay.is_zero() {
            return Ok(Duration::ZERO);
        }
        let nanos = self.base_delay.as_nanos() as f64 * 100.0 / self.intensity;
        if !nanos.is_finite() || nanos > u64::MAX as f64 {
            return Err(ConfigError::DelayOutOfRange {
                intensity: self.intensity,
                base: self.base_delay,
            });
        }
        Ok(Duration::from_nanos(nanos.round() as u64))
    }

    pub fn plan(&self) -> Result<RunPlan, ConfigError> {
        self.validate()?;
        Ok(RunPlan {
            workers: self.effective_threads(),
            delay: self.effective_delay()?,
            duration: self.duration,
            mode: self.mode,
        })
    }

    /// Settings the original tool asked the operator to confirm before running.
    pub fn is_extreme(&self) -> bool {
        self.intensity > 500.0 || self.thread_count > 100 || self.base_delay < Duration::from_millis(10)
    }
}

/// Engine knobs that stay fixed across runs.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub request_timeout: Duration,
    /// Capacity of the rolling response-time window.
    pub sample_window: usize,
    pub report_interval: Duration,
    /// How long a stop waits for in-flight workers before abandoning them.
    pub stop_grace: Duration,
    pub failure_backoff: Duration,
    pub saturation_pause: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            request_timeout: Duration::from_secs(5),
            sample_window: 100,
            report_interval: Duration::from_secs(2),
            stop_grace: Duration::from_millis(500),
            failure_backoff: Duration::from_secs(1),
            saturation_pause: Duration::from_millis(50),
        }
    }
}

impl EngineSettings {
    pub fn for_mode(mode: LoadMode) -> Self {
        match mode {
            LoadMode::Probe => EngineSettings::default(),
            LoadMode::Saturate => EngineSettings {
                request_timeout: Duration::from_secs(10),
                ..EngineSettings::default()
            },
        }
    }
}
