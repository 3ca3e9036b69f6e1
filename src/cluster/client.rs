//! Run delegation
//!
//! In a cluster exactly one instance owns the publish run. The
//! [`RunDelegate`] trait hides whether a call lands on the local
//! [`RunController`] or travels to the owning instance over HTTP.
//! Transport failures are retried with a fixed delay; application-level
//! rejections are not.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::run::{RunController, RunStatusView};

// ============================================================================
// Wire Types
// ============================================================================

/// Envelope for every cluster API response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    fn into_result(self) -> Result<T, ClusterError> {
        if self.success {
            self.data
                .ok_or_else(|| ClusterError::Remote("response carried no data".into()))
        } else {
            Err(ClusterError::Remote(
                self.error.unwrap_or_else(|| "unknown remote error".into()),
            ))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub block: bool,
}

// ============================================================================
// Delegate Trait
// ============================================================================

/// Run operations, local or remote.
#[async_trait]
pub trait RunDelegate: Send + Sync {
    async fn is_running(&self) -> Result<bool, ClusterError>;
    async fn start(&self, force: bool) -> Result<Uuid, ClusterError>;
    async fn stop(&self, block: bool) -> Result<(), ClusterError>;
    async fn status(&self) -> Result<RunStatusView, ClusterError>;
}

// ============================================================================
// Local Delegate
// ============================================================================

/// Delegate over the controller in this process.
pub struct LocalDelegate {
    controller: Arc<RunController>,
}

impl LocalDelegate {
    pub fn new(controller: Arc<RunController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl RunDelegate for LocalDelegate {
    async fn is_running(&self) -> Result<bool, ClusterError> {
        Ok(self.controller.is_running())
    }

    async fn start(&self, force: bool) -> Result<Uuid, ClusterError> {
        self.controller
            .start(force)
            .map_err(|e| ClusterError::Local(e.to_string()))
    }

    async fn stop(&self, block: bool) -> Result<(), ClusterError> {
        self.controller
            .stop(block)
            .await
            .map_err(|e| ClusterError::Local(e.to_string()))
    }

    async fn status(&self) -> Result<RunStatusView, ClusterError> {
        Ok(self.controller.status())
    }
}

// ============================================================================
// HTTP Delegate
// ============================================================================

/// Delegate that forwards every call to the owning instance.
pub struct HttpDelegate {
    client: reqwest::Client,
    base_url: String,
    retry_count: u32,
    retry_delay: Duration,
}

impl HttpDelegate {
    pub fn new(owner_url: impl Into<String>, config: &ClusterConfig) -> Result<Self, ClusterError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ClusterError::Init(e.to_string()))?;
        Ok(Self {
            client,
            base_url: owner_url.into().trim_end_matches('/').to_string(),
            retry_count: config.retry_count,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClusterError> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = None;

        for attempt in 0..=self.retry_count {
            if attempt > 0 {
                tracing::debug!(%url, attempt, "retrying cluster call");
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.client.post(&url).json(body).send().await {
                Ok(response) => {
                    let envelope: ApiResponse<T> = response.json().await?;
                    return envelope.into_result();
                }
                Err(e) => {
                    tracing::warn!(%url, attempt, error = %e, "cluster call failed");
                    last_error = Some(ClusterError::from(e));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ClusterError::Transport("no attempts made".into())))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClusterError> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = None;

        for attempt in 0..=self.retry_count {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.client.get(&url).send().await {
                Ok(response) => {
                    let envelope: ApiResponse<T> = response.json().await?;
                    return envelope.into_result();
                }
                Err(e) => {
                    tracing::warn!(%url, attempt, error = %e, "cluster call failed");
                    last_error = Some(ClusterError::from(e));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ClusterError::Transport("no attempts made".into())))
    }
}

#[async_trait]
impl RunDelegate for HttpDelegate {
    async fn is_running(&self) -> Result<bool, ClusterError> {
        Ok(self.status().await?.state.is_active())
    }

    async fn start(&self, force: bool) -> Result<Uuid, ClusterError> {
        self.post("/api/run/start", &StartRequest { force }).await
    }

    async fn stop(&self, block: bool) -> Result<(), ClusterError> {
        // the reply carries no payload beyond the envelope
        let _: serde_json::Value = self.post("/api/run/stop", &StopRequest { block }).await?;
        Ok(())
    }

    async fn status(&self) -> Result<RunStatusView, ClusterError> {
        self.get("/api/run/status").await
    }
}

/// Build the delegate this instance should use: HTTP when an owner URL
/// is configured, otherwise the local controller.
pub fn delegate_for(
    config: &ClusterConfig,
    controller: Arc<RunController>,
) -> Result<Arc<dyn RunDelegate>, ClusterError> {
    match &config.owner_url {
        Some(owner_url) => {
            tracing::info!(%owner_url, "delegating publish runs to owning instance");
            Ok(Arc::new(HttpDelegate::new(owner_url.clone(), config)?))
        }
        None => Ok(Arc::new(LocalDelegate::new(controller))),
    }
}

// ============================================================================
// Tests
// ============================================================================
