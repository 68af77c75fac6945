//! State Reporter
//!
//! Pushes [`AgentState`] into the twin's reported properties. Only the merge
//! patch between the last successful report and the new state is sent; the
//! first report after start sends everything.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::state::AgentState;
use crate::error::Result;
use crate::patch::{is_empty_patch, merge_diff};

/// Where reported-property patches go
#[async_trait]
pub trait ReportedPropertiesSink: Send + Sync {
    async fn update_reported_properties(&self, patch: &Value) -> Result<()>;
}

pub struct StateReporter {
    sink: Arc<dyn ReportedPropertiesSink>,
    // held across the send so reports never interleave
    last_reported: Mutex<Option<Value>>,
}

impl StateReporter {
    pub fn new(sink: Arc<dyn ReportedPropertiesSink>) -> Self {
        Self {
            sink,
            last_reported: Mutex::new(None),
        }
    }

    /// Report `state`. Failures are returned to the caller and leave the
    /// last reported snapshot untouched; nothing is retried here.
    pub async fn report_state(&self, state: &AgentState) -> Result<()> {
        let current = serde_json::to_value(state)?;
        let mut last_reported = self.last_reported.lock().await;

        let patch = match last_reported.as_ref() {
            Some(previous) => merge_diff(previous, &current),
            None => current.clone(),
        };

        if is_empty_patch(&patch) {
            debug!("Reported state unchanged");
            return Ok(());
        }

        self.sink.update_reported_properties(&patch).await?;
        info!(
            full = last_reported.is_none(),
            last_desired_version = ?state.last_desired_version,
            "Reported state"
        );
        *last_reported = Some(current);
        Ok(())
    }
}
