//! Revocation event consumer
//!
//! When a credential is revoked, the issuing service publishes an event to
//! a durable fan-out exchange. Every sidecar instance binds its own
//! anonymous exclusive queue to that exchange, so each replica receives
//! every event and keeps its in-process cache independently current.
//!
//! Deliveries are auto-acknowledged: every event carries its own expiry,
//! and the startup bootstrap rebuilds anything a replica missed, so
//! at-most-once handling is sufficient.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::RevocationCache;
use crate::error::{AuthzError, Result};
use crate::mask;
use crate::metrics;

/// Fan-out exchange carrying revocation events
pub const EXCHANGE_NAME: &str = "revocation.events";

/// Delay before reconnecting after a transport failure
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A revocation event as published on the bus. Unknown fields are ignored
/// for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevocationEvent {
    /// Event type: `add` or `remove`
    #[serde(rename = "type")]
    pub kind: String,

    /// Credential identifier
    #[serde(default)]
    pub jti: String,

    /// Natural expiry of the credential; required for `add`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Long-lived subscriber applying revocation events to the local cache
#[derive(Clone)]
pub struct EventConsumer {
    amqp_url: String,
    cache: Arc<RevocationCache>,
    shutdown: CancellationToken,
}

impl EventConsumer {
    /// Create a consumer for the given bus URL and cache
    pub fn new(amqp_url: impl Into<String>, cache: Arc<RevocationCache>) -> Self {
        Self {
            amqp_url: amqp_url.into(),
            cache,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the consume loop. It reconnects on any transport error until
    /// [`EventConsumer::stop`] is called.
    pub fn start(&self) -> JoinHandle<()> {
        let consumer = self.clone();
        tokio::spawn(async move { consumer.consume_loop().await })
    }

    /// Signal the consume loop to stop. Unblocks within one pending
    /// delivery or the reconnect delay, whichever comes first.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn consume_loop(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            // Shutdown must also unblock a dial that is still in flight
            let session = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.connect_and_consume() => result,
            };
            match session {
                Ok(()) => break, // clean shutdown from inside the delivery loop
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in = ?RECONNECT_DELAY,
                        "event bus connection failed"
                    );
                    metrics::set_bus_connected(false);
                    metrics::record_bus_reconnect();
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
        metrics::set_bus_connected(false);
        info!("revocation event consumer stopped");
    }

    /// Dial the bus, declare the topology, and consume until the
    /// connection drops or shutdown is signalled.
    async fn connect_and_consume(&self) -> Result<()> {
        let conn = Connection::connect(&self.amqp_url, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;

        channel
            .exchange_declare(
                EXCHANGE_NAME,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        // Server-named exclusive auto-delete queue: every instance gets its
        // own copy of every event, which is the only correct shape for
        // replicated in-process caches.
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_bind(
                queue.name().as_str(),
                EXCHANGE_NAME,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let mut consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        metrics::set_bus_connected(true);
        info!(
            exchange = EXCHANGE_NAME,
            queue = %queue.name().as_str(),
            "event bus consumer connected"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => self.handle_delivery(&delivery.data),
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(AuthzError::consumer("delivery stream closed")),
                },
            }
        }
    }

    /// Apply a single raw delivery to the cache
    fn handle_delivery(&self, payload: &[u8]) {
        let event: RevocationEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "failed to decode revocation event"
                );
                metrics::record_event_failed();
                return;
            }
        };

        metrics::record_event_received(&event.kind);

        match event.kind.as_str() {
            "add" => {
                if event.jti.is_empty() {
                    warn!("revocation add event with empty jti");
                    metrics::record_event_failed();
                    return;
                }
                let Some(expires_at) = event.expires_at else {
                    warn!(
                        jti = %mask::mask_field("jti", &event.jti),
                        "revocation add event without expires_at"
                    );
                    metrics::record_event_failed();
                    return;
                };
                self.cache.insert(event.jti.clone(), expires_at.into());
                debug!(
                    jti = %mask::mask_field("jti", &event.jti),
                    expires_at = %expires_at,
                    "revocation added to cache"
                );
                metrics::record_event_processed("add");
            }
            "remove" => {
                // Entries expire by TTL; an early un-revoke is not applied.
                debug!(
                    jti = %mask::mask_field("jti", &event.jti),
                    "revocation remove event ignored"
                );
                metrics::record_event_processed("remove");
            }
            other => {
                warn!(kind = %other, "unknown revocation event type");
                metrics::record_event_failed();
            }
        }
    }
}
