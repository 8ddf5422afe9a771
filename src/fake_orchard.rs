//! In-memory fake Orchard HTTP service.
//!
//! Test double for the two Orchard endpoints the pipeline exercises over the
//! wire: create and activate. State is a mutex-guarded map from orchard id to
//! workflow status. Also runnable standalone via `sprinkler fake-orchard`
//! for local end-to-end runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result as AnyResult;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{post, put},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct FakeWorkflow {
    #[allow(dead_code)]
    name: String,
    status: String,
}

/// The fake service and its observable state.
#[derive(Clone, Default)]
pub struct FakeOrchard {
    workflows: Arc<Mutex<HashMap<String, FakeWorkflow>>>,
}

#[derive(Debug, Deserialize)]
struct CreateWorkflowBody {
    name: String,
}

impl FakeOrchard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/workflow", post(post_workflow))
            .route("/v1/workflow/:id/activate", put(activate_workflow))
            .with_state(self.clone())
    }

    /// Serve until the process exits.
    pub async fn run(self, listener: TcpListener) -> AnyResult<()> {
        info!(addr = %listener.local_addr()?, "fake orchard listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Status of a workflow by orchard id, for assertions.
    pub fn status_of(&self, orchard_id: &str) -> Option<String> {
        let workflows = self.workflows.lock().expect("fake orchard poisoned");
        workflows.get(orchard_id).map(|w| w.status.clone())
    }

    pub fn workflow_count(&self) -> usize {
        let workflows = self.workflows.lock().expect("fake orchard poisoned");
        workflows.len()
    }
}

async fn post_workflow(
    State(orchard): State<FakeOrchard>,
    payload: Result<Json<CreateWorkflowBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let Ok(Json(body)) = payload else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let orchard_id = format!("wf-{}", Uuid::new_v4());
    let mut workflows = orchard.workflows.lock().expect("fake orchard poisoned");
    workflows.insert(
        orchard_id.clone(),
        FakeWorkflow {
            name: body.name,
            status: "pending".to_string(),
        },
    );
    Json(orchard_id).into_response()
}

async fn activate_workflow(State(orchard): State<FakeOrchard>, Path(id): Path<String>) -> Response {
    let mut workflows = orchard.workflows.lock().expect("fake orchard poisoned");
    match workflows.get_mut(&id) {
        Some(workflow) => {
            workflow.status = "activated".to_string();
            Json(id).into_response()
        }
        None => (StatusCode::NOT_FOUND, Json("not exist")).into_response(),
    }
}
