//! Queue status snapshot and its HTTP endpoint.
//!
//! `GET /status` returns per-state job counts and the most recently updated jobs as JSON.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::concurrency::StopFlag;
use crate::jobs::{utc_now, Job, JobState};
use crate::store::{JobStore, StoreError};

/// Recent jobs returned by default
pub const DEFAULT_RECENT_LIMIT: usize = 20;

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid bind address {0}")]
    Address(String),

    #[error("status server io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Point-in-time view of the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Count per job state, every state present
    pub counts: BTreeMap<String, u64>,
    /// Most recently updated jobs, newest first
    pub recent_jobs: Vec<Job>,
    pub generated_at: String,
}

/// Read counts and recent jobs from the store
pub fn status_snapshot(store: &JobStore, limit: usize) -> Result<StatusSnapshot, StoreError> {
    let mut counts: BTreeMap<String, u64> = JobState::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    counts.extend(store.stats()?);
    Ok(StatusSnapshot {
        counts,
        recent_jobs: store.recent_jobs(limit)?,
        generated_at: utc_now(),
    })
}

/// Store shared by request handlers
pub type SharedStore = Arc<Mutex<JobStore>>;

async fn get_status(
    State(store): State<SharedStore>,
) -> Result<Json<StatusSnapshot>, (StatusCode, String)> {
    let store = store
        .lock()
        .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "store lock poisoned".to_string()))?;
    status_snapshot(&store, DEFAULT_RECENT_LIMIT)
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(store: SharedStore) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(store)
}

/// Serve `GET /status` on `bind` until `stop` is raised.
pub async fn run_status_server(
    bind: &str,
    store: SharedStore,
    stop: StopFlag,
) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::Address(bind.to_string()))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("status server listening on {}", addr);

    axum::serve(listener, create_status_router(store))
        .with_graceful_shutdown(async move {
            while !stop.is_stopped() {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        })
        .await?;
    Ok(())
}
