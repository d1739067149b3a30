//! Bundled transport implementations.
//!
//! `WebhookTransport` hands delivery requests to an HTTP endpoint (a
//! relay that owns the actual OS push tokens). `MemoryTransport` records
//! requests in memory — the test double, also handy for dry runs.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use verdant_core::error::{Result, VerdantError};
use verdant_core::traits::NotificationTransport;
use verdant_core::types::{DeliveryHandle, NotificationContent};

/// HTTP relay transport: POSTs delivery requests and cancellations as
/// JSON. The relay is trusted to hold the request until `deliver_at`.
pub struct WebhookTransport {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl WebhookTransport {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            headers: Vec::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    async fn post(&self, payload: serde_json::Value) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&payload)
            .timeout(Duration::from_secs(10));
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| VerdantError::transport_retryable(format!("network_error: {e}")))?;

        if resp.status().is_success() {
            Ok(())
        } else if resp.status() == reqwest::StatusCode::FORBIDDEN {
            Err(VerdantError::transport_fatal("permission_denied"))
        } else if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(VerdantError::transport_fatal("quota_exceeded"))
        } else {
            Err(VerdantError::transport_retryable(format!(
                "network_error: relay returned {}",
                resp.status()
            )))
        }
    }
}

#[async_trait]
impl NotificationTransport for WebhookTransport {
    async fn request_delivery(
        &self,
        content: &NotificationContent,
        when: DateTime<Utc>,
    ) -> Result<DeliveryHandle> {
        let handle = DeliveryHandle(uuid::Uuid::new_v4().to_string());
        self.post(serde_json::json!({
            "action": "deliver",
            "handle": handle.0,
            "deliver_at": when.to_rfc3339(),
            "title": content.title,
            "body": content.body,
            "category_id": content.category_id,
            "priority": content.priority.as_str(),
            "task_ids": content.task_ids,
        }))
        .await?;
        tracing::debug!("📣 Delivery requested via relay: {} at {}", handle, when);
        Ok(handle)
    }

    async fn cancel_delivery(&self, handle: &DeliveryHandle) -> Result<()> {
        self.post(serde_json::json!({
            "action": "cancel",
            "handle": handle.0,
        }))
        .await
    }
}

/// In-memory transport double. Issues handles and records every call.
#[derive(Default)]
pub struct MemoryTransport {
    requests: Mutex<Vec<(NotificationContent, DateTime<Utc>, DeliveryHandle)>>,
    cancelled: Mutex<Vec<DeliveryHandle>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// All delivery requests seen so far, in order.
    pub fn requests(&self) -> Vec<(NotificationContent, DateTime<Utc>, DeliveryHandle)> {
        self.requests.lock().expect("transport mutex").clone()
    }

    pub fn cancelled(&self) -> Vec<DeliveryHandle> {
        self.cancelled.lock().expect("transport mutex").clone()
    }

    /// Requests that have not been cancelled.
    pub fn live_requests(&self) -> Vec<(NotificationContent, DateTime<Utc>, DeliveryHandle)> {
        let cancelled = self.cancelled();
        self.requests()
            .into_iter()
            .filter(|(_, _, h)| !cancelled.contains(h))
            .collect()
    }
}

#[async_trait]
impl NotificationTransport for MemoryTransport {
    async fn request_delivery(
        &self,
        content: &NotificationContent,
        when: DateTime<Utc>,
    ) -> Result<DeliveryHandle> {
        let handle = DeliveryHandle(uuid::Uuid::new_v4().to_string());
        self.requests
            .lock()
            .expect("transport mutex")
            .push((content.clone(), when, handle.clone()));
        Ok(handle)
    }

    async fn cancel_delivery(&self, handle: &DeliveryHandle) -> Result<()> {
        self.cancelled.lock().expect("transport mutex").push(handle.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdant_core::types::TaskPriority;

    fn content() -> NotificationContent {
        NotificationContent {
            title: "Water Blue Dream #1".into(),
            body: "Blue Dream #1 — watering".into(),
            category_id: None,
            priority: TaskPriority::Medium,
            task_ids: vec!["task-1".into()],
        }
    }

    #[tokio::test]
    async fn test_memory_transport_records_and_cancels() {
        let t = MemoryTransport::new();
        let h = t.request_delivery(&content(), Utc::now()).await.unwrap();
        assert_eq!(t.requests().len(), 1);
        assert_eq!(t.live_requests().len(), 1);

        t.cancel_delivery(&h).await.unwrap();
        assert_eq!(t.cancelled(), vec![h]);
        assert!(t.live_requests().is_empty());
    }

    #[tokio::test]
    async fn test_memory_transport_issues_unique_handles() {
        let t = MemoryTransport::new();
        let a = t.request_delivery(&content(), Utc::now()).await.unwrap();
        let b = t.request_delivery(&content(), Utc::now()).await.unwrap();
        assert_ne!(a, b);
    }
}
