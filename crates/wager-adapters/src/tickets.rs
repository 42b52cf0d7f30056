//! Support ticket desk.

use crate::error::AdapterError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupportTicket {
    /// Reference generated when the dispute was opened.
    pub reference: String,
    pub user_id: String,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait TicketDesk: Send + Sync {
    /// Create the ticket; creating an existing reference again is a no-op.
    async fn open_ticket(&self, ticket: SupportTicket) -> Result<(), AdapterError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTicketDesk {
    tickets: Arc<RwLock<BTreeMap<String, SupportTicket>>>,
}

impl MemoryTicketDesk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket(&self, reference: &str) -> Option<SupportTicket> {
        self.tickets
            .read()
            .ok()
            .and_then(|tickets| tickets.get(reference).cloned())
    }

    pub fn len(&self) -> usize {
        self.tickets.read().map(|tickets| tickets.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TicketDesk for MemoryTicketDesk {
    async fn open_ticket(&self, ticket: SupportTicket) -> Result<(), AdapterError> {
        let mut tickets = self
            .tickets
            .write()
            .map_err(|_| AdapterError::Ticket("ticket store lock poisoned".to_string()))?;
        tickets.entry(ticket.reference.clone()).or_insert(ticket);
        Ok(())
    }
}

/// Ticket desk reached over HTTP; the reference doubles as the idempotency key.
#[derive(Debug, Clone)]
pub struct HttpTicketDesk {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTicketDesk {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AdapterError::Ticket(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl TicketDesk for HttpTicketDesk {
    async fn open_ticket(&self, ticket: SupportTicket) -> Result<(), AdapterError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("idempotency-key", ticket.reference.as_str())
            .json(&ticket)
            .send()
            .await
            .map_err(|err| AdapterError::Ticket(err.to_string()))?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            Ok(())
        } else {
            Err(AdapterError::Ticket(format!("ticket desk returned {status}")))
        }
    }
}
