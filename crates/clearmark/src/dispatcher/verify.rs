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

//! Receiver-side signature verification.
//!
//! Mirrors the signer: reject stale timestamps, look up the secret by key
//! id, recompute the HMAC over `"{timestamp}.{rawBody}"` and compare in
//! constant time, then register the `X-Webhook-Id` in a TTL replay cache so
//! an exact repeat of the same attempt is rejected. The cache is state owned
//! by the verifier instance, never process-global.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;

use crate::error::SignatureError;

use super::signing::{
    HEADER_EVENT, HEADER_ID, HEADER_KEY_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP,
    SIGNATURE_VERSION,
};

type HmacSha256 = Hmac<Sha256>;

/// Default tolerated clock skew between signer and receiver.
pub const DEFAULT_REPLAY_WINDOW_SECS: u64 = 300;

/// Default retention of seen delivery ids.
pub const DEFAULT_REPLAY_CACHE_TTL_SECS: u64 = 24 * 60 * 60;

/// Headers and body accepted after a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedDelivery {
    /// The attempt's `X-Webhook-Id`
    pub delivery_id: String,
    /// Wire event type, e.g. `task.succeeded`
    pub event_type: String,
    pub timestamp: i64,
}

/// Stateful webhook receiver verifier.
pub struct SignatureVerifier {
    /// Valid signing secrets by key id; rotation keeps several alive
    secrets: HashMap<String, String>,
    replay_window: Duration,
    replay_ttl: Duration,
    /// Delivery ids accepted within the TTL, with acceptance time
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl SignatureVerifier {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self {
            secrets,
            replay_window: Duration::seconds(DEFAULT_REPLAY_WINDOW_SECS as i64),
            replay_ttl: Duration::seconds(DEFAULT_REPLAY_CACHE_TTL_SECS as i64),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_replay_window(mut self, window: Duration) -> Self {
        self.replay_window = window;
        self
    }

    fn header<'a>(
        headers: &'a HashMap<String, String>,
        name: &'static str,
    ) -> Result<&'a str, SignatureError> {
        headers
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or(SignatureError::MalformedHeader { header: name })
    }

    /// Verifies one incoming delivery against the raw request body.
    pub fn verify(
        &self,
        headers: &HashMap<String, String>,
        raw_body: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifiedDelivery, SignatureError> {
        let delivery_id = Self::header(headers, HEADER_ID)?;
        let event_type = Self::header(headers, HEADER_EVENT)?;
        let key_id = Self::header(headers, HEADER_KEY_ID)?;
        let signature = Self::header(headers, HEADER_SIGNATURE)?;
        let timestamp: i64 = Self::header(headers, HEADER_TIMESTAMP)?
            .parse()
            .map_err(|_| SignatureError::MalformedHeader {
                header: HEADER_TIMESTAMP,
            })?;

        let skew = (now.timestamp() - timestamp).abs();
        if skew > self.replay_window.num_seconds() {
            return Err(SignatureError::TimestampOutsideWindow {
                timestamp,
                window_secs: self.replay_window.num_seconds() as u64,
            });
        }

        let secret = self
            .secrets
            .get(key_id)
            .ok_or_else(|| SignatureError::UnknownKeyId {
                key_id: key_id.to_string(),
            })?;

        let encoded = signature
            .strip_prefix(&format!("{SIGNATURE_VERSION}="))
            .ok_or(SignatureError::MalformedHeader {
                header: HEADER_SIGNATURE,
            })?;
        let claimed = hex::decode(encoded).map_err(|_| SignatureError::MalformedHeader {
            header: HEADER_SIGNATURE,
        })?;

        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(format!("{timestamp}.{raw_body}").as_bytes());
        // Constant-time comparison
        mac.verify_slice(&claimed)
            .map_err(|_| SignatureError::InvalidSignature)?;

        {
            let mut seen = self.seen.lock();
            let cutoff = now - self.replay_ttl;
            seen.retain(|_, accepted_at| *accepted_at > cutoff);
            if seen.contains_key(delivery_id) {
                return Err(SignatureError::ReplayedDelivery {
                    delivery_id: delivery_id.to_string(),
                });
            }
            seen.insert(delivery_id.to_string(), now);
        }

        Ok(VerifiedDelivery {
            delivery_id: delivery_id.to_string(),
            event_type: event_type.to_string(),
            timestamp,
        })
    }
}
