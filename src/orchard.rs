//! Outbound client for the Orchard orchestration service.
//!
//! The core only needs five capabilities from Orchard: create, activate,
//! cancel, delete, and details. `OrchardGateway` speaks Orchard's REST
//! surface; `MemoryOrchard` implements the same trait in memory for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::{header, Method, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchardError {
    #[error("orchard request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("orchard returned status {0}")]
    Status(u16),
}

/// Workflow metadata returned by the details endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchardDetails {
    pub id: String,
    pub name: String,
    pub status: String,
    pub created_at: String,
}

/// The capability set the scheduling pipeline needs from an orchestration
/// backend.
#[async_trait]
pub trait OrchardClient: Send + Sync {
    /// Submit one workflow payload; returns the Orchard-assigned id.
    async fn create(&self, payload: &str) -> Result<String, OrchardError>;

    async fn activate(&self, orchard_id: &str) -> Result<(), OrchardError>;

    async fn cancel(&self, orchard_id: &str) -> Result<(), OrchardError>;

    async fn delete(&self, orchard_id: &str) -> Result<(), OrchardError>;

    async fn details(&self, orchard_id: &str) -> Result<OrchardDetails, OrchardError>;

    /// Whether a workflow has left the `pending` state. Errors when the
    /// workflow is unknown to Orchard.
    async fn is_activated(&self, orchard_id: &str) -> Result<bool, OrchardError> {
        let details = self.details(orchard_id).await?;
        Ok(details.status != "pending")
    }
}

/// REST client for a real Orchard deployment.
///
/// Every request carries `Content-Type: application/json` and, when
/// configured, the API key header. Non-200 responses are failures; retries
/// are the caller's decision.
pub struct OrchardGateway {
    host: String,
    api_key_name: Option<String>,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OrchardGateway {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            api_key_name: None,
            api_key: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_key(mut self, name: impl Into<String>, key: impl Into<String>) -> Self {
        let name = name.into();
        let key = key.into();
        if !name.is_empty() && !key.is_empty() {
            self.api_key_name = Some(name);
            self.api_key = Some(key);
        }
        self
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<reqwest::Response, OrchardError> {
        let url = format!("{}{}", self.host, path);
        let mut request = self
            .client
            .request(method, url)
            .header(header::CONTENT_TYPE, "application/json");
        if let (Some(name), Some(key)) = (&self.api_key_name, &self.api_key) {
            request = request.header(name.as_str(), key.as_str());
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            return Err(OrchardError::Status(response.status().as_u16()));
        }
        Ok(response)
    }
}

#[async_trait]
impl OrchardClient for OrchardGateway {
    async fn create(&self, payload: &str) -> Result<String, OrchardError> {
        let response = self
            .request(Method::POST, "/v1/workflow", Some(payload.to_string()))
            .await?;
        // Orchard answers with a bare JSON string holding the id.
        let orchard_id: String = response.json().await?;
        Ok(orchard_id)
    }

    async fn activate(&self, orchard_id: &str) -> Result<(), OrchardError> {
        self.request(
            Method::PUT,
            &format!("/v1/workflow/{orchard_id}/activate"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn cancel(&self, orchard_id: &str) -> Result<(), OrchardError> {
        self.request(
            Method::PUT,
            &format!("/v1/workflow/{orchard_id}/cancel"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, orchard_id: &str) -> Result<(), OrchardError> {
        self.request(Method::DELETE, &format!("/v1/workflow/{orchard_id}"), None)
            .await?;
        Ok(())
    }

    async fn details(&self, orchard_id: &str) -> Result<OrchardDetails, OrchardError> {
        let response = self
            .request(
                Method::GET,
                &format!("/v1/workflow/{orchard_id}/details"),
                None,
            )
            .await?;
        Ok(response.json().await?)
    }
}

#[derive(Default)]
struct MemoryOrchardState {
    /// orchard_id -> status ("pending" until activated).
    workflows: HashMap<String, String>,
    /// Payloads in the order they were created.
    created_payloads: Vec<String>,
    deleted: Vec<String>,
    canceled: Vec<String>,
    create_calls: usize,
    fail_create_at: Option<usize>,
    fail_activate: bool,
    fail_delete: bool,
}

/// In-memory Orchard for unit tests. Failures are scripted per call.
#[derive(Default)]
pub struct MemoryOrchard {
    state: Mutex<MemoryOrchardState>,
}

impl MemoryOrchard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the zero-based `index`th create call.
    pub fn fail_create_at(&self, index: usize) {
        let mut state = self.state.lock().expect("orchard state poisoned");
        state.fail_create_at = Some(index);
    }

    pub fn fail_activations(&self) {
        let mut state = self.state.lock().expect("orchard state poisoned");
        state.fail_activate = true;
    }

    pub fn fail_deletes(&self) {
        let mut state = self.state.lock().expect("orchard state poisoned");
        state.fail_delete = true;
    }

    /// Payloads accepted so far, in creation order.
    pub fn created_payloads(&self) -> Vec<String> {
        let state = self.state.lock().expect("orchard state poisoned");
        state.created_payloads.clone()
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        let state = self.state.lock().expect("orchard state poisoned");
        state.deleted.clone()
    }

    pub fn status_of(&self, orchard_id: &str) -> Option<String> {
        let state = self.state.lock().expect("orchard state poisoned");
        state.workflows.get(orchard_id).cloned()
    }
}

#[async_trait]
impl OrchardClient for MemoryOrchard {
    async fn create(&self, payload: &str) -> Result<String, OrchardError> {
        let mut state = self.state.lock().expect("orchard state poisoned");
        let call = state.create_calls;
        state.create_calls += 1;
        if state.fail_create_at == Some(call) {
            return Err(OrchardError::Status(500));
        }
        let orchard_id = format!("wf-{}", Uuid::new_v4());
        state.workflows.insert(orchard_id.clone(), "pending".to_string());
        state.created_payloads.push(payload.to_string());
        Ok(orchard_id)
    }

    async fn activate(&self, orchard_id: &str) -> Result<(), OrchardError> {
        let mut state = self.state.lock().expect("orchard state poisoned");
        if state.fail_activate {
            return Err(OrchardError::Status(500));
        }
        match state.workflows.get_mut(orchard_id) {
            Some(status) => {
                *status = "activated".to_string();
                Ok(())
            }
            None => Err(OrchardError::Status(404)),
        }
    }

    async fn cancel(&self, orchard_id: &str) -> Result<(), OrchardError> {
        let mut state = self.state.lock().expect("orchard state poisoned");
        match state.workflows.get_mut(orchard_id) {
            Some(status) => {
                *status = "canceled".to_string();
                state.canceled.push(orchard_id.to_string());
                Ok(())
            }
            None => Err(OrchardError::Status(404)),
        }
    }

    async fn delete(&self, orchard_id: &str) -> Result<(), OrchardError> {
        let mut state = self.state.lock().expect("orchard state poisoned");
        if state.fail_delete {
            return Err(OrchardError::Status(500));
        }
        if state.workflows.remove(orchard_id).is_none() {
            return Err(OrchardError::Status(404));
        }
        state.deleted.push(orchard_id.to_string());
        Ok(())
    }

    async fn details(&self, orchard_id: &str) -> Result<OrchardDetails, OrchardError> {
        let state = self.state.lock().expect("orchard state poisoned");
        match state.workflows.get(orchard_id) {
            Some(status) => Ok(OrchardDetails {
                id: orchard_id.to_string(),
                name: String::new(),
                status: status.clone(),
                created_at: String::new(),
            }),
            None => Err(OrchardError::Status(404)),
        }
    }
}
