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

//! Webhook endpoint registry.
//!
//! Tenant-facing management of webhook subscriptions: registration, updates,
//! pause/resume, soft-delete, signing-key rotation, and sandbox test
//! deliveries. Rotation keeps old keys valid for receiver-side verification;
//! only the active key signs new deliveries.
//!
//! All lookups are scoped to the acting tenant. An endpoint owned by someone
//! else reads as `NotFound`, never as a distinguishable "forbidden".

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::dispatcher::signing;
use crate::dispatcher::transport::{DeliveryOutcome, WebhookTransport};
use crate::error::RegistryError;
use crate::models::{
    AggregateType, DeliveryStatus, EndpointStatus, EventType, FailureCode, OutboxEvent,
    OutboxStatus, WebhookDelivery, WebhookEndpoint,
};
use crate::storage::{EndpointPatch, Storage, WriteOp};

/// Default retry budget for newly registered endpoints.
pub const DEFAULT_MAX_RETRIES: u32 = 6;

/// Registration request.
#[derive(Debug, Clone)]
pub struct RegisterEndpointInput {
    pub url: String,
    pub events: Vec<EventType>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

/// Mutable subscription fields.
#[derive(Debug, Clone, Default)]
pub struct EndpointUpdate {
    pub url: Option<String>,
    pub events: Option<Vec<EventType>>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

/// A freshly issued signing key. The secret is returned exactly once, at
/// issue time.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub key_id: String,
    pub secret: String,
}

/// Webhook subscription management.
pub struct EndpointRegistry {
    storage: Arc<dyn Storage>,
    transport: Arc<dyn WebhookTransport>,
    default_timeout_ms: u64,
}

fn generate_secret() -> String {
    format!(
        "whsec_{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

impl EndpointRegistry {
    pub fn new(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn WebhookTransport>,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            storage,
            transport,
            default_timeout_ms,
        }
    }

    /// Registers a new endpoint with a first signing key (`k1`) and returns
    /// it along with the issued secret.
    pub async fn register(
        &self,
        actor_id: &str,
        input: RegisterEndpointInput,
    ) -> Result<(WebhookEndpoint, IssuedKey), RegistryError> {
        let now = Utc::now();
        let key = IssuedKey {
            key_id: "k1".to_string(),
            secret: generate_secret(),
        };
        let endpoint = WebhookEndpoint {
            endpoint_id: Uuid::new_v4(),
            user_id: actor_id.to_string(),
            url: input.url,
            events: input.events,
            status: EndpointStatus::Active,
            timeout_ms: input.timeout_ms.unwrap_or(self.default_timeout_ms),
            max_retries: input.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            active_key_id: key.key_id.clone(),
            secrets: [(key.key_id.clone(), key.secret.clone())].into(),
            created_at: now,
            updated_at: now,
        };
        self.storage
            .apply(vec![WriteOp::InsertEndpoint(endpoint.clone())])
            .await?;
        info!(endpoint_id = %endpoint.endpoint_id, actor_id, "webhook endpoint registered");
        Ok((endpoint, key))
    }

    /// Fetches an endpoint the actor owns, rejecting deleted ones.
    async fn owned(
        &self,
        actor_id: &str,
        endpoint_id: Uuid,
    ) -> Result<WebhookEndpoint, RegistryError> {
        let endpoint = self
            .storage
            .get_endpoint(endpoint_id)
            .await?
            .filter(|ep| ep.user_id == actor_id)
            .ok_or(RegistryError::NotFound { endpoint_id })?;
        if endpoint.status == EndpointStatus::Deleted {
            return Err(RegistryError::Deleted { endpoint_id });
        }
        Ok(endpoint)
    }

    pub async fn update(
        &self,
        actor_id: &str,
        endpoint_id: Uuid,
        update: EndpointUpdate,
    ) -> Result<WebhookEndpoint, RegistryError> {
        self.owned(actor_id, endpoint_id).await?;
        self.storage
            .apply(vec![WriteOp::UpdateEndpoint {
                endpoint_id,
                patch: EndpointPatch {
                    url: update.url,
                    events: update.events,
                    timeout_ms: update.timeout_ms,
                    max_retries: update.max_retries,
                    ..Default::default()
                },
            }])
            .await?;
        self.owned(actor_id, endpoint_id).await
    }

    pub async fn pause(
        &self,
        actor_id: &str,
        endpoint_id: Uuid,
    ) -> Result<WebhookEndpoint, RegistryError> {
        self.set_status(actor_id, endpoint_id, EndpointStatus::Paused)
            .await
    }

    pub async fn resume(
        &self,
        actor_id: &str,
        endpoint_id: Uuid,
    ) -> Result<WebhookEndpoint, RegistryError> {
        self.set_status(actor_id, endpoint_id, EndpointStatus::Active)
            .await
    }

    /// Soft-deletes an endpoint. The row stays for the delivery audit trail;
    /// it is never dispatched to again and no further operations accept it.
    pub async fn remove(&self, actor_id: &str, endpoint_id: Uuid) -> Result<(), RegistryError> {
        self.owned(actor_id, endpoint_id).await?;
        self.storage
            .apply(vec![WriteOp::UpdateEndpoint {
                endpoint_id,
                patch: EndpointPatch {
                    status: Some(EndpointStatus::Deleted),
                    ..Default::default()
                },
            }])
            .await?;
        info!(endpoint_id = %endpoint_id, "webhook endpoint soft-deleted");
        Ok(())
    }

    async fn set_status(
        &self,
        actor_id: &str,
        endpoint_id: Uuid,
        status: EndpointStatus,
    ) -> Result<WebhookEndpoint, RegistryError> {
        self.owned(actor_id, endpoint_id).await?;
        self.storage
            .apply(vec![WriteOp::UpdateEndpoint {
                endpoint_id,
                patch: EndpointPatch {
                    status: Some(status),
                    ..Default::default()
                },
            }])
            .await?;
        self.owned(actor_id, endpoint_id).await
    }

    /// Issues a new signing key and marks it active. Previous keys remain in
    /// the secret set so in-flight and receiver-side verification keep
    /// working through the rotation window.
    pub async fn rotate_key(
        &self,
        actor_id: &str,
        endpoint_id: Uuid,
    ) -> Result<IssuedKey, RegistryError> {
        let endpoint = self.owned(actor_id, endpoint_id).await?;
        let key = IssuedKey {
            key_id: format!("k{}", endpoint.secrets.len() + 1),
            secret: generate_secret(),
        };
        self.storage
            .apply(vec![WriteOp::UpdateEndpoint {
                endpoint_id,
                patch: EndpointPatch {
                    add_secret: Some((key.key_id.clone(), key.secret.clone())),
                    active_key_id: Some(key.key_id.clone()),
                    ..Default::default()
                },
            }])
            .await?;
        info!(endpoint_id = %endpoint_id, key_id = %key.key_id, "signing key rotated");
        Ok(key)
    }

    /// Sends a sandbox verification delivery to the endpoint and records the
    /// attempt. A URL containing `"fail"` short-circuits to a failed row
    /// with `SIMULATED_DISPATCH_FAILURE` without touching the network, so
    /// tenants can exercise their failure handling safely. Each call gets a
    /// fresh delivery id.
    pub async fn test_delivery(
        &self,
        actor_id: &str,
        endpoint_id: Uuid,
    ) -> Result<WebhookDelivery, RegistryError> {
        let endpoint = self.owned(actor_id, endpoint_id).await?;
        let now = Utc::now();
        let delivery_id = Uuid::new_v4();

        // Synthetic event, delivered inline; the dispatch loop never picks
        // up endpoint.test.
        let mut event = OutboxEvent::for_task(
            EventType::EndpointTest,
            endpoint_id,
            actor_id,
            serde_json::json!({
                "endpointId": endpoint_id,
                "message": "test delivery",
            }),
            now,
        );
        event.aggregate_type = AggregateType::Endpoint;
        event.status = OutboxStatus::Published;

        let secret =
            endpoint
                .active_secret()
                .ok_or_else(|| crate::error::StorageError::RowMissing {
                    entity: "signing secret",
                    id: endpoint.active_key_id.clone(),
                })?;
        let request =
            signing::build_request(&event, delivery_id, &endpoint.active_key_id, secret, now)?;

        let outcome = if endpoint.url.contains("fail") {
            DeliveryOutcome::Failed {
                code: FailureCode::SimulatedDispatchFailure,
                response_status: None,
                detail: "sandbox failure simulation".to_string(),
            }
        } else {
            self.transport
                .deliver(
                    &endpoint.url,
                    &request.headers,
                    &request.body,
                    endpoint.timeout(),
                )
                .await
        };

        let delivery = match outcome {
            DeliveryOutcome::Delivered { response_status } => WebhookDelivery {
                delivery_id,
                event_id: event.event_id,
                endpoint_id,
                attempt: 1,
                status: DeliveryStatus::Success,
                failure_code: None,
                request_headers: request.headers,
                payload_sha256: request.payload_sha256,
                request_signed: true,
                response_status: Some(response_status),
                created_at: now,
            },
            DeliveryOutcome::Failed {
                code,
                response_status,
                ..
            } => WebhookDelivery {
                delivery_id,
                event_id: event.event_id,
                endpoint_id,
                attempt: 1,
                status: DeliveryStatus::Failed,
                failure_code: Some(code),
                request_headers: request.headers,
                payload_sha256: request.payload_sha256,
                request_signed: true,
                response_status,
                created_at: now,
            },
        };

        self.storage
            .apply(vec![
                WriteOp::InsertOutboxEvent(event),
                WriteOp::InsertDelivery(delivery.clone()),
            ])
            .await?;
        Ok(delivery)
    }
}
