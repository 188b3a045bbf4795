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

//! Webhook HTTP transport.
//!
//! The dispatcher delivers through this trait; tests substitute a scripted
//! transport and never open a socket. The production implementation wraps a
//! shared `reqwest` client with a per-request timeout.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::models::FailureCode;

/// Classified result of one HTTP delivery attempt.
///
/// Transport problems are outcomes, not `Err`s; the dispatcher records them
/// as failed delivery rows and the retry schedule takes over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Receiver answered 2xx
    Delivered { response_status: u16 },
    Failed {
        code: FailureCode,
        /// Receiver's status, when a response arrived at all
        response_status: Option<u16>,
        detail: String,
    },
}

/// Delivery side of the dispatcher, one POST per call.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &str,
        timeout: Duration,
    ) -> DeliveryOutcome;
}

/// Production transport over a shared HTTP client.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn deliver(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &str,
        timeout: Duration,
    ) -> DeliveryOutcome {
        let mut request = self
            .client
            .post(url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .body(body.to_string());
        for (name, value) in headers {
            request = request.header(name, value);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    debug!(url, status = status.as_u16(), "webhook delivered");
                    DeliveryOutcome::Delivered {
                        response_status: status.as_u16(),
                    }
                } else {
                    DeliveryOutcome::Failed {
                        code: FailureCode::HttpNon2xx,
                        response_status: Some(status.as_u16()),
                        detail: format!("receiver answered {status}"),
                    }
                }
            }
            Err(e) if e.is_timeout() => DeliveryOutcome::Failed {
                code: FailureCode::Timeout,
                response_status: None,
                detail: format!("request timed out after {timeout:?}"),
            },
            Err(e) => DeliveryOutcome::Failed {
                code: FailureCode::NetworkError,
                response_status: None,
                detail: e.to_string(),
            },
        }
    }
}
