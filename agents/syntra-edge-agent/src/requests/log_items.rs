//! Module selection shared by the log request handlers

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::logs::{LogOptions, LogsContentType, LogsEncoding};
use crate::runtime::adapter::RuntimeInfoProvider;

/// One `{ id, filter }` entry of a logs request
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsRequestItem {
    /// Regex matched against module names
    pub id: String,
    #[serde(default)]
    pub filter: LogOptions,
}

/// Fields common to `getlogs` and `uploadlogs`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsRequest {
    pub schema_version: String,
    pub items: Vec<LogsRequestItem>,
    #[serde(default)]
    pub encoding: LogsEncoding,
    #[serde(default)]
    pub content_type: LogsContentType,
}

impl LogsRequest {
    pub fn validate(&self) -> Result<()> {
        if !self.schema_version.starts_with("1.") && self.schema_version != "1" {
            return Err(AgentError::invalid_request(format!(
                "unsupported schema version '{}'",
                self.schema_version
            )));
        }
        if self.items.is_empty() {
            return Err(AgentError::invalid_request("items must not be empty"));
        }
        Ok(())
    }
}

/// Resolve request items against the runtime's module list.
///
/// A module matched by several items uses the filter of the first one.
pub async fn resolve_modules(
    runtime: &dyn RuntimeInfoProvider,
    items: &[LogsRequestItem],
) -> Result<Vec<(String, LogOptions)>> {
    let patterns = items
        .iter()
        .map(|item| {
            Regex::new(&format!("^(?:{})$", item.id))
                .map(|regex| (regex, &item.filter))
                .map_err(|e| AgentError::invalid_request(format!("invalid id '{}': {}", item.id, e)))
        })
        .collect::<Result<Vec<_>>>()?;

    let modules = runtime.list_modules().await?;

    let mut selected = Vec::new();
    for module in modules {
        if let Some((_, filter)) = patterns.iter().find(|(regex, _)| regex.is_match(&module.name)) {
            selected.push((module.name, (*filter).clone()));
        }
    }

    if selected.is_empty() {
        return Err(AgentError::invalid_request("no module matches the requested ids"));
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StaticRuntime;

    fn item(id: &str, tail: Option<usize>) -> LogsRequestItem {
        LogsRequestItem {
            id: id.to_string(),
            filter: LogOptions {
                tail,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_first_matching_item_wins() {
        let runtime = StaticRuntime::with_modules(&["sensor", "filter", "edgeHub"]);
        let items = vec![item("sensor", Some(5)), item(".*", Some(100))];

        let selected = resolve_modules(&runtime, &items).await.unwrap();
        let sensor = selected.iter().find(|(name, _)| name == "sensor").unwrap();
        assert_eq!(sensor.1.tail, Some(5));
        assert_eq!(selected.len(), 3);
    }

    #[tokio::test]
    async fn test_ids_are_anchored() {
        let runtime = StaticRuntime::with_modules(&["sensor", "sensor2"]);
        let selected = resolve_modules(&runtime, &[item("sensor", None)]).await.unwrap();
        assert_eq!(selected.len(), 1);
    }

    #[tokio::test]
    async fn test_no_match_is_invalid_request() {
        let runtime = StaticRuntime::with_modules(&["sensor"]);
        let err = resolve_modules(&runtime, &[item("camera", None)]).await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidRequest(_)));
    }
}
