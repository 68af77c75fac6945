//! Syntra Edge Agent Library
//!
//! Keeps an edge device in step with the deployment held in its cloud twin.
//! The agent receives desired-state pushes over the hub connection, keeps an
//! encrypted local backup of the last good deployment to run from while
//! offline, serves direct requests and log streams from the cloud, and
//! reports module state back through the twin's reported properties.

pub mod builder;
pub mod cli;
pub mod connection;
pub mod crypto;
pub mod deployment;
pub mod error;
pub mod logging;
pub mod logs;
pub mod patch;
pub mod reporting;
pub mod requests;
pub mod runtime;
pub mod streams;
pub mod tagged;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use builder::{assemble, build_agent, Agent, Collaborators};
pub use cli::config::Config;
pub use connection::{AgentConnection, CloudTransport, WebSocketTransport};
pub use deployment::{BackupConfigSource, ConfigSource, DeploymentConfigInfo, TwinConfigSource};
pub use error::{AgentError, Result};
pub use reporting::{AgentState, StateReporter};
pub use requests::{Request, RequestHandler, RequestManager, Response};
pub use runtime::adapter::RuntimeInfoProvider;
pub use runtime::docker::DockerRuntime;
