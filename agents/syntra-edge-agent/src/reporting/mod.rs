//! Reporting
//!
//! Collects the agent's state and keeps the twin's reported properties in
//! step with it.

pub mod collector;
pub mod reporter;
pub mod state;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::connection::agent::RefreshAction;
use crate::deployment::source::ConfigSource;
use crate::error::Result;

pub use collector::StateCollector;
pub use reporter::{ReportedPropertiesSink, StateReporter};
pub use state::{AgentState, DeploymentStatus};

use state::deployment_code;

/// Refresh action: fetch config, collect state, report it
pub struct StateRefresh {
    source: Arc<dyn ConfigSource>,
    collector: StateCollector,
    reporter: Arc<StateReporter>,
}

impl StateRefresh {
    pub fn new(
        source: Arc<dyn ConfigSource>,
        collector: StateCollector,
        reporter: Arc<StateReporter>,
    ) -> Self {
        Self {
            source,
            collector,
            reporter,
        }
    }
}

#[async_trait]
impl RefreshAction for StateRefresh {
    async fn refresh(&self) -> Result<()> {
        let (deployment, status) = match self.source.get_config().await {
            Ok(info) if info.is_empty() => (
                Some(info),
                DeploymentStatus::new(deployment_code::CONFIG_EMPTY, "deployment is empty"),
            ),
            Ok(info) if info.from_backup => (
                Some(info),
                DeploymentStatus::new(deployment_code::SUCCESSFUL, "running from local backup"),
            ),
            Ok(info) => (Some(info), DeploymentStatus::successful()),
            Err(e) => {
                warn!(error = %e, "No deployment available for state report");
                (None, DeploymentStatus::from_error(&e))
            }
        };

        let state = self.collector.collect(deployment.as_ref(), status).await?;
        self.reporter.report_state(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::types::DeploymentConfigInfo;
    use crate::error::AgentError;
    use crate::test_support::{RecordingSink, StaticConfigSource, StaticRuntime};

    #[tokio::test]
    async fn test_refresh_reports_deployment_status() {
        let sink = Arc::new(RecordingSink::default());
        let refresh = StateRefresh::new(
            Arc::new(StaticConfigSource::new(Ok(DeploymentConfigInfo::empty()))),
            StateCollector::new(Arc::new(StaticRuntime::with_modules(&["sensor"]))),
            Arc::new(StateReporter::new(sink.clone())),
        );

        refresh.refresh().await.unwrap();

        let patches = sink.patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0]["lastDesiredStatus"]["code"], deployment_code::CONFIG_EMPTY);
        assert_eq!(patches[0]["modules"]["sensor"]["type"], "docker");
    }

    #[tokio::test]
    async fn test_refresh_without_config_still_reports() {
        let sink = Arc::new(RecordingSink::default());
        let refresh = StateRefresh::new(
            Arc::new(StaticConfigSource::new(Err(AgentError::malformed_config("bad")))),
            StateCollector::new(Arc::new(StaticRuntime::with_modules(&[]))),
            Arc::new(StateReporter::new(sink.clone())),
        );

        refresh.refresh().await.unwrap();

        let patches = sink.patches();
        assert_eq!(
            patches[0]["lastDesiredStatus"]["code"],
            deployment_code::CONFIG_FORMAT_ERROR
        );
        assert!(patches[0].get("lastDesiredVersion").is_none());
    }
}
