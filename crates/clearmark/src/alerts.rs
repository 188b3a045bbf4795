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

//! Delivery-health monitoring.
//!
//! A rolling window of delivery-attempt samples. The host loop records each
//! attempt and periodically calls [`DeliveryMonitor::evaluate`]; alarms fire
//! only once the window holds enough samples, so a single failed delivery on
//! a quiet night does not page anyone. State is owned by the monitor
//! instance; the caller supplies the clock.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use metrics::gauge;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::AlertConfig;

/// A threshold breach over the current window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Alert {
    SuccessRateBelowThreshold {
        rate: f64,
        threshold: f64,
        samples: usize,
    },
    RetryRateAboveThreshold {
        rate: f64,
        threshold: f64,
        samples: usize,
    },
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: DateTime<Utc>,
    success: bool,
    /// Attempt number greater than 1
    retry: bool,
}

/// Rolling-window delivery monitor.
pub struct DeliveryMonitor {
    config: AlertConfig,
    samples: Mutex<VecDeque<Sample>>,
}

impl DeliveryMonitor {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    fn window(&self) -> Duration {
        Duration::milliseconds(self.config.window.as_millis() as i64)
    }

    /// Records one delivery attempt.
    pub fn record_attempt(&self, success: bool, retry: bool, at: DateTime<Utc>) {
        let mut samples = self.samples.lock();
        let cutoff = at - self.window();
        while samples.front().is_some_and(|s| s.at < cutoff) {
            samples.pop_front();
        }
        samples.push_back(Sample { at, success, retry });
    }

    /// Evaluates the window and returns every threshold currently breached.
    /// Rates are also mirrored to metrics gauges on every call.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let mut samples = self.samples.lock();
        let cutoff = now - self.window();
        while samples.front().is_some_and(|s| s.at < cutoff) {
            samples.pop_front();
        }

        let total = samples.len();
        if total == 0 {
            return Vec::new();
        }

        let successes = samples.iter().filter(|s| s.success).count();
        let retries = samples.iter().filter(|s| s.retry).count();
        let success_rate = successes as f64 / total as f64;
        let retry_rate = retries as f64 / total as f64;

        gauge!("webhook_delivery_success_rate").set(success_rate);
        gauge!("webhook_delivery_retry_rate").set(retry_rate);

        if total < self.config.min_samples {
            return Vec::new();
        }

        let mut alerts = Vec::new();
        if success_rate < self.config.min_success_rate {
            warn!(
                success_rate,
                threshold = self.config.min_success_rate,
                samples = total,
                "webhook delivery success rate below threshold"
            );
            alerts.push(Alert::SuccessRateBelowThreshold {
                rate: success_rate,
                threshold: self.config.min_success_rate,
                samples: total,
            });
        }
        if retry_rate > self.config.max_retry_rate {
            warn!(
                retry_rate,
                threshold = self.config.max_retry_rate,
                samples = total,
                "webhook delivery retry rate above threshold"
            );
            alerts.push(Alert::RetryRateAboveThreshold {
                rate: retry_rate,
                threshold: self.config.max_retry_rate,
                samples: total,
            });
        }
        alerts
    }
}
