//! Notification dispatch: SMS with exactly one retry, then in-app fallback.

use crate::error::AdapterError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait SmsGateway: Send + Sync {
    fn gateway_name(&self) -> &str;

    async fn send(&self, user_id: &str, message: &str) -> Result<(), AdapterError>;
}

#[async_trait]
pub trait InAppChannel: Send + Sync {
    async fn push(&self, user_id: &str, message: &str) -> Result<(), AdapterError>;
}

/// How a notification finally reached the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryResult {
    /// First SMS attempt succeeded.
    Sent,
    /// SMS succeeded on the single retry.
    Retry,
    /// Both SMS attempts failed; delivered in-app.
    Fallback,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    sms: Arc<dyn SmsGateway>,
    in_app: Arc<dyn InAppChannel>,
    retry_delay: Duration,
}

impl NotificationDispatcher {
    pub fn new(sms: Arc<dyn SmsGateway>, in_app: Arc<dyn InAppChannel>) -> Self {
        Self {
            sms,
            in_app,
            retry_delay: Duration::from_millis(250),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub async fn dispatch(&self, user_id: &str, message: &str) -> Result<DeliveryResult, AdapterError> {
        match self.sms.send(user_id, message).await {
            Ok(()) => return Ok(DeliveryResult::Sent),
            Err(err) => {
                debug!(user_id, gateway = self.sms.gateway_name(), error = %err, "sms failed; retrying once");
            }
        }

        tokio::time::sleep(self.retry_delay).await;
        match self.sms.send(user_id, message).await {
            Ok(()) => return Ok(DeliveryResult::Retry),
            Err(err) => {
                warn!(user_id, gateway = self.sms.gateway_name(), error = %err, "sms retry failed; falling back to in-app");
            }
        }

        self.in_app.push(user_id, message).await?;
        Ok(DeliveryResult::Fallback)
    }
}

/// SMS gateway reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSmsGateway {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct SmsPayload<'a> {
    user_id: &'a str,
    message: &'a str,
}

impl HttpSmsGateway {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AdapterError::Sms(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl SmsGateway for HttpSmsGateway {
    fn gateway_name(&self) -> &str {
        "http-sms"
    }

    async fn send(&self, user_id: &str, message: &str) -> Result<(), AdapterError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SmsPayload { user_id, message })
            .send()
            .await
            .map_err(|err| AdapterError::Sms(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(AdapterError::Sms(format!("gateway returned {status}: {body}")))
        }
    }
}

/// Gateway used when no SMS provider is configured; every send fails.
#[derive(Debug, Clone, Default)]
pub struct DisabledSmsGateway;

#[async_trait]
impl SmsGateway for DisabledSmsGateway {
    fn gateway_name(&self) -> &str {
        "disabled"
    }

    async fn send(&self, _user_id: &str, _message: &str) -> Result<(), AdapterError> {
        Err(AdapterError::Sms("no SMS gateway configured".to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboxMessage {
    pub message: String,
    pub delivered_at: DateTime<Utc>,
}

/// In-process in-app inbox.
#[derive(Debug, Clone, Default)]
pub struct MemoryInbox {
    messages: Arc<RwLock<HashMap<String, Vec<InboxMessage>>>>,
}

impl MemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages_for(&self, user_id: &str) -> Vec<InboxMessage> {
        self.messages
            .read()
            .map(|inbox| inbox.get(user_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl InAppChannel for MemoryInbox {
    async fn push(&self, user_id: &str, message: &str) -> Result<(), AdapterError> {
        let mut inbox = self
            .messages
            .write()
            .map_err(|_| AdapterError::InApp("inbox lock poisoned".to_string()))?;
        inbox.entry(user_id.to_string()).or_default().push(InboxMessage {
            message: message.to_string(),
            delivered_at: Utc::now(),
        });
        Ok(())
    }
}
