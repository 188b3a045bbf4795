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

//! Webhook request signing.
//!
//! Builds the JSON envelope and the signed header set for one delivery
//! attempt. The signature covers `"{timestamp}.{rawBody}"` with HMAC-SHA256
//! under the endpoint's active secret, rendered as `v1=<hex>`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::OutboxEvent;

type HmacSha256 = Hmac<Sha256>;

/// Signature scheme prefix in `X-Webhook-Signature`.
pub const SIGNATURE_VERSION: &str = "v1";

/// Envelope schema version, sent in the body and `X-Webhook-Version`.
pub const ENVELOPE_VERSION: &str = "1.0";

pub const HEADER_ID: &str = "X-Webhook-Id";
pub const HEADER_EVENT: &str = "X-Webhook-Event";
pub const HEADER_VERSION: &str = "X-Webhook-Version";
pub const HEADER_TIMESTAMP: &str = "X-Webhook-Timestamp";
pub const HEADER_KEY_ID: &str = "X-Webhook-Key-Id";
pub const HEADER_TRACE_ID: &str = "X-Webhook-Trace-Id";
pub const HEADER_SIGNATURE: &str = "X-Webhook-Signature";

/// Wire body of a delivery.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookEnvelope<'a> {
    event_id: Uuid,
    event_type: &'a str,
    version: &'a str,
    occurred_at: DateTime<Utc>,
    trace_id: &'a str,
    data: &'a serde_json::Value,
}

/// A fully prepared delivery request: body, headers, and audit fields.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub body: String,
    pub headers: HashMap<String, String>,
    /// SHA-256 hex of `body`, persisted on the delivery row
    pub payload_sha256: String,
}

/// HMAC-SHA256 signature over `"{timestamp}.{raw_body}"`, as `v1=<hex>`.
pub fn sign(secret: &str, timestamp: i64, raw_body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(format!("{timestamp}.{raw_body}").as_bytes());
    format!(
        "{SIGNATURE_VERSION}={}",
        hex::encode(mac.finalize().into_bytes())
    )
}

/// Builds the signed request for one delivery attempt of an event.
///
/// `delivery_id` is the attempt's own id; it goes out as `X-Webhook-Id` so
/// receivers can dedupe individual HTTP calls.
pub fn build_request(
    event: &OutboxEvent,
    delivery_id: Uuid,
    key_id: &str,
    secret: &str,
    now: DateTime<Utc>,
) -> Result<SignedRequest, serde_json::Error> {
    let envelope = WebhookEnvelope {
        event_id: event.event_id,
        event_type: event.event_type.as_str(),
        version: ENVELOPE_VERSION,
        occurred_at: event.created_at,
        trace_id: &event.trace_id,
        data: &event.payload,
    };
    let body = serde_json::to_string(&envelope)?;

    let timestamp = now.timestamp();
    let signature = sign(secret, timestamp, &body);

    let mut headers = HashMap::new();
    headers.insert(HEADER_ID.to_string(), delivery_id.to_string());
    headers.insert(HEADER_EVENT.to_string(), event.event_type.as_str().to_string());
    headers.insert(HEADER_VERSION.to_string(), ENVELOPE_VERSION.to_string());
    headers.insert(HEADER_TIMESTAMP.to_string(), timestamp.to_string());
    headers.insert(HEADER_KEY_ID.to_string(), key_id.to_string());
    headers.insert(HEADER_TRACE_ID.to_string(), event.trace_id.clone());
    headers.insert(HEADER_SIGNATURE.to_string(), signature);

    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    let payload_sha256 = hex::encode(hasher.finalize());

    Ok(SignedRequest {
        body,
        headers,
        payload_sha256,
    })
}
