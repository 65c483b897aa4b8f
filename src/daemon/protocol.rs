//! Wire format between clients and the daemon.
//!
//! One newline-terminated JSON request per connection, answered by one
//! newline-terminated JSON response, after which the daemon closes the socket.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{KbError, KbResult};
use crate::fact::NewFact;
use crate::index::Freshness;
use crate::query::QueryFilters;

/// Literal carried by every `ping` reply. Nothing else the daemon sends can
/// contain it.
pub const PING_ACK: &str = "kb-daemon-pong/1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Append {
        fact: NewFact,
    },
    Query {
        text: String,
        #[serde(default)]
        filters: QueryFilters,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        top_k: Option<usize>,
    },
    Status,
    Stop,
    Admin {
        action: AdminAction,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Append { .. } => "append",
            Self::Query { .. } => "query",
            Self::Status => "status",
            Self::Stop => "stop",
            Self::Admin { .. } => "admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    Init,
    Rebuild,
    Validate,
    Repair,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Response {
    pub fn success(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(value) => Self {
                ok: true,
                result: Some(value),
                error: None,
                code: None,
            },
            Err(err) => Self::failure(&KbError::from(err)),
        }
    }

    pub fn failure(err: &KbError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(err.to_string()),
            code: Some(err.code().to_string()),
        }
    }

    /// Decode a successful result, or turn an error response into
    /// [`KbError::Remote`].
    pub fn into_result<T: DeserializeOwned>(self) -> KbResult<T> {
        if !self.ok {
            return Err(KbError::Remote {
                code: self.code.unwrap_or_else(|| "unknown".into()),
                message: self.error.unwrap_or_default(),
            });
        }
        Ok(serde_json::from_value(
            self.result.unwrap_or(serde_json::Value::Null),
        )?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Bound and answering `ping`/`status`; initial index load in progress.
    Starting,
    Ready,
    ShuttingDown,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting_down",
        })
    }
}

/// Result of the `status` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub phase: Phase,
    pub project_root: PathBuf,
    pub initialized: bool,
    pub fact_count: usize,
    pub freshness: Freshness,
    pub incremental_since_rebuild: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rebuild_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rebuilding: bool,
    pub uptime_secs: u64,
    pub pid: u32,
    pub skipped_lines: usize,
}
