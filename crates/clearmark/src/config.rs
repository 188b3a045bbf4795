/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Operational configuration.
//!
//! Each component takes a config struct with sensible defaults and chainable
//! setters; `from_env()` overlays the enumerated environment variables on
//! those defaults. Unset variables keep the default; a set-but-unparsable
//! variable is a hard [`ConfigError`], never silently ignored.

use std::time::Duration;

use crate::dispatcher::retry::DEFAULT_RETRY_SCHEDULE_MS;
use crate::error::ConfigError;
use crate::models::DeadLetterSource;

fn env_var(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env_var(name) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| ConfigError::InvalidValue {
            var: name,
            value: raw,
            reason: format!("expected {}", std::any::type_name::<T>()),
        }),
    }
}

fn parse_bool_env(name: &'static str) -> Result<Option<bool>, ConfigError> {
    match env_var(name) {
        None => Ok(None),
        Some(raw) => match raw.as_str() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                var: name,
                value: raw,
                reason: "expected true/false/1/0".to_string(),
            }),
        },
    }
}

fn parse_schedule(name: &'static str, raw: &str) -> Result<Vec<u64>, ConfigError> {
    let schedule: Result<Vec<u64>, _> = raw.split(',').map(|s| s.trim().parse()).collect();
    match schedule {
        Ok(s) if !s.is_empty() => Ok(s),
        _ => Err(ConfigError::InvalidValue {
            var: name,
            value: raw.to_string(),
            reason: "expected a comma-separated list of milliseconds".to_string(),
        }),
    }
}

/// Outbox dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Sleep between poll cycles
    pub poll_interval: Duration,
    /// Maximum pending events scanned per cycle
    pub batch_size: usize,
    /// Backoff schedule in milliseconds, indexed by attempt number
    pub retry_schedule_ms: Vec<u64>,
    /// Timeout applied to endpoints registered without one
    pub default_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
            retry_schedule_ms: DEFAULT_RETRY_SCHEDULE_MS.to_vec(),
            default_timeout_ms: 5_000,
        }
    }
}

impl DispatcherConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retry_schedule_ms(mut self, schedule: Vec<u64>) -> Self {
        self.retry_schedule_ms = schedule;
        self
    }

    /// Overlays `DISPATCH_POLL_INTERVAL_MS`, `DISPATCH_BATCH_SIZE`,
    /// `DISPATCH_RETRY_SCHEDULE_MS`, and `DISPATCH_DEFAULT_TIMEOUT_MS` on the
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ms) = parse_env::<u64>("DISPATCH_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(batch) = parse_env::<usize>("DISPATCH_BATCH_SIZE")? {
            config.batch_size = batch;
        }
        if let Some(raw) = env_var("DISPATCH_RETRY_SCHEDULE_MS") {
            config.retry_schedule_ms = parse_schedule("DISPATCH_RETRY_SCHEDULE_MS", &raw)?;
        }
        if let Some(ms) = parse_env::<u64>("DISPATCH_DEFAULT_TIMEOUT_MS")? {
            config.default_timeout_ms = ms;
        }
        Ok(config)
    }
}

/// Dead-letter replay tool settings.
///
/// The concurrency here is the *requested* value; the replay tool clamps it
/// to its hard caps regardless of what is configured.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Bounded scan window over the quarantine table
    pub max_scan: usize,
    /// Maximum items replayed per invocation
    pub max_replay: usize,
    /// Requested replay concurrency, clamped by the tool
    pub concurrency: usize,
    /// Restrict replay to one source subsystem
    pub source: Option<DeadLetterSource>,
    /// Scan, match, and log without mutating anything
    pub dry_run: bool,
    /// Raises the concurrency cap from 10 to 20
    pub allow_high_concurrency: bool,
    /// Second confirmation required for bulk replay at elevated concurrency
    pub allow_bulk_replay: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_scan: 500,
            max_replay: 100,
            concurrency: 5,
            source: None,
            dry_run: false,
            allow_high_concurrency: false,
            allow_bulk_replay: false,
        }
    }
}

impl ReplayConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_source(mut self, source: DeadLetterSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_high_concurrency(mut self, allow: bool) -> Self {
        self.allow_high_concurrency = allow;
        self
    }

    pub fn with_bulk_replay(mut self, allow: bool) -> Self {
        self.allow_bulk_replay = allow;
        self
    }

    /// Overlays the `DLQ_*` variables on the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(scan) = parse_env::<usize>("DLQ_MAX_SCAN")? {
            config.max_scan = scan;
        }
        if let Some(replay) = parse_env::<usize>("DLQ_MAX_REPLAY")? {
            config.max_replay = replay;
        }
        if let Some(concurrency) = parse_env::<usize>("DLQ_REPLAY_CONCURRENCY")? {
            config.concurrency = concurrency;
        }
        if let Some(raw) = env_var("DLQ_REPLAY_SOURCE") {
            config.source =
                Some(
                    DeadLetterSource::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                        var: "DLQ_REPLAY_SOURCE",
                        value: raw,
                        reason: "expected task.progress or outbox.dispatch".to_string(),
                    })?,
                );
        }
        if let Some(dry_run) = parse_bool_env("DLQ_DRY_RUN")? {
            config.dry_run = dry_run;
        }
        if let Some(allow) = parse_bool_env("DLQ_ALLOW_HIGH_CONCURRENCY")? {
            config.allow_high_concurrency = allow;
        }
        if let Some(allow) = parse_bool_env("DLQ_ALLOW_HIGH_CONCURRENCY_BULK_REPLAY")? {
            config.allow_bulk_replay = allow;
        }
        Ok(config)
    }
}

/// Delivery-health alerting thresholds.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Alarm when the windowed success rate drops below this
    pub min_success_rate: f64,
    /// Alarm when the windowed retry rate exceeds this
    pub max_retry_rate: f64,
    /// No alarms until the window holds at least this many samples
    pub min_samples: usize,
    /// Rolling window width
    pub window: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            min_success_rate: 0.95,
            max_retry_rate: 0.20,
            min_samples: 20,
            window: Duration::from_secs(300),
        }
    }
}

impl AlertConfig {
    /// Overlays `ALERT_MIN_SUCCESS_RATE`, `ALERT_MAX_RETRY_RATE`,
    /// `ALERT_MIN_SAMPLES`, and `ALERT_WINDOW_SECS` on the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(rate) = parse_env::<f64>("ALERT_MIN_SUCCESS_RATE")? {
            config.min_success_rate = rate;
        }
        if let Some(rate) = parse_env::<f64>("ALERT_MAX_RETRY_RATE")? {
            config.max_retry_rate = rate;
        }
        if let Some(samples) = parse_env::<usize>("ALERT_MIN_SAMPLES")? {
            config.min_samples = samples;
        }
        if let Some(secs) = parse_env::<u64>("ALERT_WINDOW_SECS")? {
            config.window = Duration::from_secs(secs);
        }
        Ok(config)
    }
}
