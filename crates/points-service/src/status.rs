// Copyright 2026 Primev, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct StatusInner {
    running: bool,
    subscription_active: bool,
    last_error: Option<String>,
    inconsistency: Option<String>,
}

/// Health of the ingestion routine, shared between the ingestion task and the API.
#[derive(Debug, Clone, Default)]
pub struct IngestionStatus {
    inner: Arc<RwLock<StatusInner>>,
}

impl IngestionStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_running(&self, running: bool) {
        let mut inner = self.inner.write().await;
        inner.running = running;
        if !running {
            inner.subscription_active = false;
        }
    }

    pub async fn subscription_up(&self) {
        let mut inner = self.inner.write().await;
        inner.subscription_active = true;
        inner.last_error = None;
    }

    pub async fn subscription_down(&self, err: impl ToString) {
        let mut inner = self.inner.write().await;
        inner.subscription_active = false;
        inner.last_error = Some(err.to_string());
    }

    /// Record an event that contradicted the ledger. Sticky until restart.
    pub async fn record_inconsistency(&self, msg: impl ToString) {
        let mut inner = self.inner.write().await;
        inner.inconsistency = Some(msg.to_string());
    }

    pub async fn is_running(&self) -> bool {
        self.inner.read().await.running
    }

    pub async fn is_subscription_active(&self) -> bool {
        self.inner.read().await.subscription_active
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.read().await.last_error.clone()
    }

    /// `Ok` when the ingestion routine is running, subscribed, and has seen no ledger
    /// inconsistency; otherwise the reason it is unhealthy.
    pub async fn health(&self) -> Result<(), String> {
        let inner = self.inner.read().await;
        if !inner.running {
            return Err("Points routine not running".to_string());
        }
        if let Some(msg) = &inner.inconsistency {
            return Err(format!("Ledger inconsistency: {msg}"));
        }
        if !inner.subscription_active {
            return match &inner.last_error {
                Some(err) => Err(format!("Event subscription not active: {err}")),
                None => Err("Event subscription not active".to_string()),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_transitions() {
        let status = IngestionStatus::new();
        assert_eq!(status.health().await.unwrap_err(), "Points routine not running");

        status.set_running(true).await;
        assert_eq!(status.health().await.unwrap_err(), "Event subscription not active");

        status.subscription_up().await;
        assert!(status.health().await.is_ok());

        status.subscription_down("rpc timeout").await;
        assert_eq!(
            status.health().await.unwrap_err(),
            "Event subscription not active: rpc timeout"
        );
        assert_eq!(status.last_error().await.as_deref(), Some("rpc timeout"));

        status.subscription_up().await;
        assert!(status.last_error().await.is_none());

        status.set_running(false).await;
        assert!(!status.is_subscription_active().await);
    }

    #[tokio::test]
    async fn inconsistency_is_sticky() {
        let status = IngestionStatus::new();
        status.set_running(true).await;
        status.subscription_up().await;

        status.record_inconsistency("duplicate open interval").await;
        assert!(status.health().await.unwrap_err().contains("duplicate open interval"));

        status.subscription_up().await;
        assert!(status.health().await.is_err());
    }
}
