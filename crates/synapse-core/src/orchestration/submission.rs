//! Asynchronous submission: submit now, poll or wait for the result later.
//!
//! Every lookup is scoped by tenant. A submission owned by another tenant
//! is indistinguishable from one that does not exist.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use synapse_state::TenantId;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::{redact, ExecutionContext};
use crate::orchestration::error::OrchestrationError;
use crate::orchestration::result::{OrchestrationResult, OrchestrationStatus};
use crate::orchestration::scheduler::{OrchestrationRequest, Orchestrator};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionId(pub String);

impl SubmissionId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point-in-time view of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionStatus {
    pub status: OrchestrationStatus,
    pub result: Option<OrchestrationResult>,
    /// Redacted reason when the request was rejected outright.
    pub error: Option<String>,
}

impl SubmissionStatus {
    fn pending() -> Self {
        Self {
            status: OrchestrationStatus::Pending,
            result: None,
            error: None,
        }
    }
}

struct Entry {
    tenant_id: TenantId,
    state: Arc<watch::Sender<SubmissionStatus>>,
    cancel: CancellationToken,
}

/// Tracks orchestrations running in the background.
#[derive(Clone)]
pub struct SubmissionRegistry {
    orchestrator: Orchestrator,
    entries: Arc<RwLock<HashMap<SubmissionId, Entry>>>,
}

impl SubmissionRegistry {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start `request` in the background and return its id immediately.
    pub async fn submit_async(
        &self,
        request: OrchestrationRequest,
        ctx: ExecutionContext,
    ) -> SubmissionId {
        let id = SubmissionId::new();
        let cancel = CancellationToken::new();
        let (state, _) = watch::channel(SubmissionStatus::pending());
        let state = Arc::new(state);
        self.entries.write().await.insert(
            id.clone(),
            Entry {
                tenant_id: ctx.tenant_id.clone(),
                state: state.clone(),
                cancel: cancel.clone(),
            },
        );
        info!(submission_id = %id, tenant_id = %ctx.tenant_id, "submission accepted");

        let orchestrator = self.orchestrator.clone();
        let submission_id = id.clone();
        tokio::spawn(async move {
            state.send_modify(|s| s.status = OrchestrationStatus::Running);
            let finished = match orchestrator.submit_with_cancel(request, ctx, cancel).await {
                Ok(result) => SubmissionStatus {
                    status: result.status,
                    result: Some(result),
                    error: None,
                },
                Err(e) => SubmissionStatus {
                    status: OrchestrationStatus::Failed,
                    result: None,
                    error: Some(redact(&e.to_string())),
                },
            };
            debug!(submission_id = %submission_id, status = ?finished.status, "submission finished");
            state.send_replace(finished);
        });

        id
    }

    /// Current status, or `None` if unknown to `tenant_id`.
    pub async fn status(&self, id: &SubmissionId, tenant_id: &TenantId) -> Option<SubmissionStatus> {
        let entries = self.entries.read().await;
        let entry = entries.get(id).filter(|e| &e.tenant_id == tenant_id)?;
        let status = entry.state.borrow().clone();
        Some(status)
    }

    /// Wait until the submission reaches a terminal status.
    pub async fn wait(&self, id: &SubmissionId, tenant_id: &TenantId) -> Option<SubmissionStatus> {
        let mut rx = {
            let entries = self.entries.read().await;
            entries
                .get(id)
                .filter(|e| &e.tenant_id == tenant_id)?
                .state
                .subscribe()
        };
        let status = rx.wait_for(|s| s.status.is_terminal()).await.ok()?.clone();
        Some(status)
    }

    /// Cancel an in-flight submission.
    pub async fn cancel(&self, id: &SubmissionId, tenant_id: &TenantId) -> Result<(), OrchestrationError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(id)
            .filter(|e| &e.tenant_id == tenant_id)
            .ok_or_else(|| OrchestrationError::SubmissionNotFound(id.to_string()))?;
        info!(submission_id = %id, "submission cancelled");
        entry.cancel.cancel();
        Ok(())
    }

    /// Drop finished submissions. Returns how many were removed.
    pub async fn evict_finished(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.state.borrow().status.is_terminal());
        before - entries.len()
    }
}
