//! In-process workflow runner.
//!
//! Stands in for a durable workflow runtime: one task per source drives
//! the indexing engine's batch loop, with single-run-per-source semantics
//! and cancellation at batch boundaries. Run records are kept in memory
//! for the `/workflows` endpoints; durable history lives in the analytics
//! store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::connector::{ConnectorRegistry, FetchRequest};
use crate::indexer::IndexingEngine;
use crate::models::{now_iso, Source};

/// Retained finished workflow records.
const MAX_FINISHED: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Running,
    Completed,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInfo {
    pub id: String,
    pub source: Source,
    pub status: WorkflowState,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct WorkflowEntry {
    info: WorkflowInfo,
    cancel: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct WorkflowRunner {
    engine: IndexingEngine,
    registry: Arc<ConnectorRegistry>,
    workflows: Arc<Mutex<HashMap<String, WorkflowEntry>>>,
}

impl WorkflowRunner {
    pub fn new(engine: IndexingEngine, registry: Arc<ConnectorRegistry>) -> Self {
        Self {
            engine,
            registry,
            workflows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start an indexing workflow for a source.
    ///
    /// Returns the workflow id, or an error when one is already running
    /// for the same source.
    pub fn start(&self, source: Source, request: FetchRequest) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let cancel = Arc::new(AtomicBool::new(false));

        {
            let mut workflows = self.workflows.lock().expect("workflow lock");
            let already_running = workflows
                .values()
                .any(|w| w.info.source == source && w.info.status == WorkflowState::Running);
            if already_running {
                anyhow::bail!("indexing already running for source '{}'", source);
            }
            workflows.insert(
                id.clone(),
                WorkflowEntry {
                    info: WorkflowInfo {
                        id: id.clone(),
                        source,
                        status: WorkflowState::Running,
                        started_at: now_iso(),
                        completed_at: None,
                        error: None,
                    },
                    cancel: cancel.clone(),
                },
            );
        }

        let runner = self.clone();
        let workflow_id = id.clone();
        tokio::spawn(async move {
            let outcome = {
                let Some(connector) = runner.registry.find(source) else {
                    runner.finish(&workflow_id, WorkflowState::Error, Some("unknown source".into()));
                    return;
                };
                runner
                    .engine
                    .run_source(connector, &request, &cancel, Some(workflow_id.clone()))
                    .await
            };

            match outcome {
                Ok(summary) => {
                    let state = if cancel.load(Ordering::Relaxed) {
                        WorkflowState::Cancelled
                    } else {
                        WorkflowState::Completed
                    };
                    info!(source = %source, workflow = %workflow_id,
                          documents = summary.documents_processed, "indexing run finished");
                    runner.finish(&workflow_id, state, None);
                }
                Err(e) => {
                    error!(source = %source, workflow = %workflow_id, error = %e, "indexing run failed");
                    runner.finish(&workflow_id, WorkflowState::Error, Some(e.to_string()));
                }
            }
        });

        Ok(id)
    }

    fn finish(&self, id: &str, state: WorkflowState, error: Option<String>) {
        let mut workflows = self.workflows.lock().expect("workflow lock");
        if let Some(entry) = workflows.get_mut(id) {
            entry.info.status = state;
            entry.info.completed_at = Some(now_iso());
            entry.info.error = error;
        }

        // Bound the finished history.
        let mut finished: Vec<(String, String)> = workflows
            .iter()
            .filter(|(_, w)| w.info.status != WorkflowState::Running)
            .map(|(id, w)| (w.info.started_at.clone(), id.clone()))
            .collect();
        if finished.len() > MAX_FINISHED {
            finished.sort();
            for (_, stale_id) in finished.iter().take(finished.len() - MAX_FINISHED) {
                workflows.remove(stale_id);
            }
        }
    }

    /// Request cancellation; takes effect at the next batch boundary.
    pub fn cancel(&self, id: &str) -> bool {
        let workflows = self.workflows.lock().expect("workflow lock");
        match workflows.get(id) {
            Some(entry) if entry.info.status == WorkflowState::Running => {
                entry.cancel.store(true, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<WorkflowInfo> {
        self.workflows
            .lock()
            .expect("workflow lock")
            .get(id)
            .map(|w| w.info.clone())
    }

    pub fn recent(&self) -> Vec<WorkflowInfo> {
        let workflows = self.workflows.lock().expect("workflow lock");
        let mut infos: Vec<WorkflowInfo> = workflows.values().map(|w| w.info.clone()).collect();
        infos.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        infos
    }

    /// Whether a workflow id exists and is still running. Used by the
    /// stale-status sweep.
    pub fn is_running(&self, id: &str) -> bool {
        self.workflows
            .lock()
            .expect("workflow lock")
            .get(id)
            .map(|w| w.info.status == WorkflowState::Running)
            .unwrap_or(false)
    }
}
