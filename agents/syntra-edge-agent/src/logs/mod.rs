//! Module Logs
//!
//! Contracts for reading module logs and shipping them off the device, plus
//! the filtering and encoding shared by the log request and stream handlers.

pub mod upload;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::TryStreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

pub use upload::HttpLogsUploader;

/// Default syslog severity for lines without a `<N>` prefix (informational)
pub const DEFAULT_SEVERITY: u8 = 6;

/// One parsed log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub module: String,
    pub level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub text: String,
}

/// Which logs to read
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogOptions {
    /// Only the last N lines
    #[serde(default)]
    pub tail: Option<usize>,
    /// Unix seconds
    #[serde(default)]
    pub since: Option<i64>,
    /// Unix seconds
    #[serde(default)]
    pub until: Option<i64>,
    /// Keep records at this syslog severity or more severe
    #[serde(default, alias = "loglevel")]
    pub log_level: Option<u8>,
    /// Keep records whose text matches
    #[serde(default)]
    pub regex: Option<String>,
    /// Keep following the log after the existing lines
    #[serde(default)]
    pub follow: bool,
}

/// Output layout of collected logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogsContentType {
    #[default]
    Json,
    Text,
}

/// Compression applied to collected logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogsEncoding {
    #[default]
    None,
    Zstd,
}

/// Reads logs of one module as a lazy, finite sequence.
///
/// Each call starts a fresh read. With `follow` set the sequence only ends
/// when the module stops or the consumer drops it.
pub trait LogsProvider: Send + Sync {
    fn get_logs(&self, module: &str, options: &LogOptions) -> BoxStream<'static, Result<LogRecord>>;
}

/// Ships an encoded log payload to a destination
#[async_trait]
pub trait LogsUploader: Send + Sync {
    async fn upload(&self, destination: &str, payload: Vec<u8>) -> Result<()>;
}

/// Parse a raw log line.
///
/// Accepts an optional leading RFC 3339 timestamp (as written by the runtime)
/// followed by an optional `<N>` syslog severity prefix.
pub fn parse_log_line(module: &str, line: &str) -> LogRecord {
    let line = line.trim_end_matches(['\r', '\n']);

    let (timestamp, rest) = match line.split_once(' ') {
        Some((head, tail)) => match DateTime::parse_from_rfc3339(head) {
            Ok(ts) => (Some(ts.with_timezone(&Utc)), tail),
            Err(_) => (None, line),
        },
        None => (None, line),
    };

    let (level, text) = parse_severity(rest);

    LogRecord {
        module: module.to_string(),
        level,
        timestamp,
        text: text.to_string(),
    }
}

fn parse_severity(text: &str) -> (u8, &str) {
    if let Some(stripped) = text.strip_prefix('<') {
        if let Some((digits, rest)) = stripped.split_once('>') {
            if let Ok(level) = digits.parse::<u8>() {
                if level <= 7 {
                    return (level, rest.trim_start());
                }
            }
        }
    }
    (DEFAULT_SEVERITY, text)
}

/// Record filter compiled from [`LogOptions`]
#[derive(Debug, Clone)]
pub struct LogFilter {
    max_level: Option<u8>,
    regex: Option<Regex>,
}

impl LogFilter {
    pub fn from_options(options: &LogOptions) -> Result<Self> {
        let regex = options
            .regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| AgentError::invalid_request(format!("invalid log regex: {}", e)))?;

        Ok(Self {
            max_level: options.log_level,
            regex,
        })
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        if let Some(max) = self.max_level {
            if record.level > max {
                return false;
            }
        }
        match &self.regex {
            Some(regex) => regex.is_match(&record.text),
            None => true,
        }
    }
}

/// Read and filter the logs of one module
pub async fn collect_logs(
    provider: &dyn LogsProvider,
    module: &str,
    options: &LogOptions,
) -> Result<Vec<LogRecord>> {
    let filter = LogFilter::from_options(options)?;
    let options = LogOptions {
        follow: false,
        ..options.clone()
    };

    provider
        .get_logs(module, &options)
        .try_filter(|record| futures_util::future::ready(filter.matches(record)))
        .try_collect()
        .await
}

/// Lay out and optionally compress collected records
pub fn encode_logs(
    records: &[LogRecord],
    content_type: LogsContentType,
    encoding: LogsEncoding,
) -> Result<Vec<u8>> {
    let raw = match content_type {
        LogsContentType::Json => serde_json::to_vec(records)?,
        LogsContentType::Text => records
            .iter()
            .map(|r| format!("<{}> {}\n", r.level, r.text))
            .collect::<String>()
            .into_bytes(),
    };

    match encoding {
        LogsEncoding::None => Ok(raw),
        LogsEncoding::Zstd => Ok(zstd::encode_all(raw.as_slice(), 3)?),
    }
}
