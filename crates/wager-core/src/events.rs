use crate::error::WagerError;
use crate::types::{BetStatus, DisputeStatus, Money};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Fact published after a unit of work has committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlatformEvent {
    BetPlaced {
        slip_id: Uuid,
        user_id: String,
        stake: Money,
        potential_win: Money,
    },
    BetSettled {
        slip_id: Uuid,
        user_id: String,
        status: BetStatus,
        payout: Money,
    },
    BetCashedOut {
        slip_id: Uuid,
        user_id: String,
        amount: Money,
    },
    DisputeOpened {
        dispute_id: Uuid,
        slip_id: Uuid,
        user_id: String,
        ticket_reference: String,
        reason: String,
        frozen_amount: Money,
        collections_review: bool,
    },
    DisputeResolved {
        dispute_id: Uuid,
        user_id: String,
        status: DisputeStatus,
        credited: Money,
    },
    EscrowTransferred {
        transfer_id: Uuid,
        flag_id: Uuid,
        amount: Money,
    },
    IntegrityHalted {
        user_id: String,
        detail: String,
    },
}

impl PlatformEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BetPlaced { .. } => "bet_placed",
            Self::BetSettled { .. } => "bet_settled",
            Self::BetCashedOut { .. } => "bet_cashed_out",
            Self::DisputeOpened { .. } => "dispute_opened",
            Self::DisputeResolved { .. } => "dispute_resolved",
            Self::EscrowTransferred { .. } => "escrow_transferred",
            Self::IntegrityHalted { .. } => "integrity_halted",
        }
    }

    /// Player the event concerns, if any.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::BetPlaced { user_id, .. }
            | Self::BetSettled { user_id, .. }
            | Self::BetCashedOut { user_id, .. }
            | Self::DisputeOpened { user_id, .. }
            | Self::DisputeResolved { user_id, .. }
            | Self::IntegrityHalted { user_id, .. } => Some(user_id),
            Self::EscrowTransferred { .. } => None,
        }
    }
}

/// Pluggable post-commit side effect (notifications, ticketing, ...).
///
/// Sinks run outside any transaction; a failing sink never affects the money path.
#[async_trait]
pub trait EventSink: Send + Sync {
    fn sink_name(&self) -> &str;

    async fn deliver(&self, event: &PlatformEvent) -> Result<(), WagerError>;
}

/// Registry of sinks with fire-and-forget dispatch.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Arc<RwLock<HashMap<String, Arc<dyn EventSink>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sink: Arc<dyn EventSink>) {
        match self.sinks.write() {
            Ok(mut sinks) => {
                sinks.insert(sink.sink_name().to_string(), sink);
            }
            Err(_) => warn!("event sink registry lock poisoned; sink not registered"),
        }
    }

    pub fn sink_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sinks
            .read()
            .map(|sinks| sinks.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Deliver `events` to every sink on a spawned task.
    pub fn publish(&self, events: Vec<PlatformEvent>) -> Option<JoinHandle<()>> {
        if events.is_empty() {
            return None;
        }
        let sinks: Vec<Arc<dyn EventSink>> = self
            .sinks
            .read()
            .map(|sinks| sinks.values().cloned().collect())
            .unwrap_or_default();
        if sinks.is_empty() {
            return None;
        }
        Some(tokio::spawn(async move {
            for event in &events {
                let deliveries = sinks
                    .iter()
                    .map(|sink| async move { (sink, sink.deliver(event).await) });
                for (sink, result) in join_all(deliveries).await {
                    match result {
                        Ok(()) => debug!(
                            sink = sink.sink_name(),
                            event = event.name(),
                            "platform event delivered"
                        ),
                        Err(err) => warn!(
                            sink = sink.sink_name(),
                            event = event.name(),
                            error = %err,
                            "platform event delivery failed"
                        ),
                    }
                }
            }
        }))
    }
}
