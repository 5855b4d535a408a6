//! Mindcast wire shapes.
//!
//! Clients speak JSON-over-WebSocket: they send [`ClientCommand`]s and receive
//! [`ServerMessage`]s. Gateways and executors exchange [`Task`]s and
//! [`TaskResult`]s over the bus as JSON text.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

/// Action tags understood by the task executor.
pub mod actions {
    pub const UPSERT_MIND: &str = "upsert_mind";
    pub const GET_MIND: &str = "get_mind";
    pub const LIST_MINDS: &str = "list_minds";
    pub const APPEND_MENTAL: &str = "append_mental";
    pub const REMOVE_MENTAL: &str = "remove_mental";

    /// Synthetic tag for updates that arrive on the domain-update channel.
    pub const MIND_UPDATED: &str = "mind_updated";
}

/// Status marker carried by optimistic previews.
pub const STATUS_SAVING: &str = "saving";
/// Status marker carried by plain acknowledgements.
pub const STATUS_PROCESSING: &str = "processing";
/// Placeholder id for an entity the executor has not persisted yet.
pub const PENDING_ID: &str = "pending";

/// Whether a successful result for `action` should be fanned out to the
/// other connected clients.
pub fn is_state_mutating(action: &str) -> bool {
    matches!(
        action,
        actions::UPSERT_MIND | actions::APPEND_MENTAL | actions::REMOVE_MENTAL
    )
}

/// Inbound client command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCommand {
    pub action: String,
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ClientCommand {
    /// The caller-supplied correlation id, if it is present and non-empty.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// A unit of work for the task executor.
///
/// Decoding is forgiving about the fields the executor never acts on: a
/// missing `user_id` or `timestamp` is filled in, and a timestamp without an
/// offset is read as UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub action: String,
    #[serde(default = "empty_object")]
    pub data: Value,
    pub request_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub timestamp: DateTime<Utc>,
}

fn lenient_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    if let Ok(stamp) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(stamp.with_timezone(&Utc));
    }
    raw.parse::<NaiveDateTime>()
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

impl Task {
    pub fn new(
        action: impl Into<String>,
        data: Value,
        request_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            data,
            request_id: request_id.into(),
            user_id: user_id.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Error,
}

/// Outcome of one [`Task`], published by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub action: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn success(task: &Task, data: Value) -> Self {
        Self {
            request_id: Some(task.request_id.clone()),
            action: task.action.clone(),
            status: TaskStatus::Success,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(task: &Task, message: impl Into<String>) -> Self {
        Self {
            request_id: Some(task.request_id.clone()),
            action: task.action.clone(),
            status: TaskStatus::Error,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Error result for a task payload that could not be decoded.
    pub fn rejected(
        request_id: impl Into<String>,
        action: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Some(request_id.into()),
            action: action.into(),
            status: TaskStatus::Error,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

/// Server -> client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Optimistic echo of a create/update before the executor has run it.
    Preview {
        request_id: String,
        action: String,
        status: String,
        data: Value,
    },

    /// Receipt for every other command.
    Ack {
        request_id: String,
        action: String,
        status: String,
    },

    /// Authoritative result, delivered only to the originating connection.
    Response {
        request_id: String,
        action: String,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Fan-out notification of a state change.
    Update { action: String, data: Value },
}

impl ServerMessage {
    pub fn preview(request_id: impl Into<String>, action: impl Into<String>, mind: Value) -> Self {
        Self::Preview {
            request_id: request_id.into(),
            action: action.into(),
            status: STATUS_SAVING.into(),
            data: json!({ "mind": mind }),
        }
    }

    pub fn ack(request_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self::Ack {
            request_id: request_id.into(),
            action: action.into(),
            status: STATUS_PROCESSING.into(),
        }
    }

    pub fn response(request_id: impl Into<String>, result: &TaskResult) -> Self {
        Self::Response {
            request_id: request_id.into(),
            action: result.action.clone(),
            status: result.status,
            data: result.data.clone(),
            error: result.error.clone(),
        }
    }

    pub fn update(action: impl Into<String>, data: Value) -> Self {
        Self::Update {
            action: action.into(),
            data,
        }
    }
}

/// Build the optimistic preview entity for an `upsert_mind` submission.
///
/// Submitted fields are echoed; anything the executor would fill in gets a
/// placeholder. A missing or zero-ish `id` becomes [`PENDING_ID`].
pub fn preview_mind(data: &Value, now: DateTime<Utc>) -> Value {
    let field = |key: &str, default: Value| data.get(key).cloned().unwrap_or(default);

    let id = match data.get("id") {
        None | Some(Value::Null) => Value::from(PENDING_ID),
        Some(Value::String(s)) if s.is_empty() => Value::from(PENDING_ID),
        Some(Value::Number(n)) if n.as_f64() == Some(0.0) => Value::from(PENDING_ID),
        Some(other) => other.clone(),
    };
    let stamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);

    json!({
        "id": id,
        "name": field("name", json!("")),
        "detail": field("detail", json!("")),
        "color": field("color", json!("#FFFFFF")),
        "rec_status": field("rec_status", json!(true)),
        "position": field("position", json!([0, 0, 0])),
        "rotation": field("rotation", json!([0, 0, 0])),
        "scale": field("scale", json!(1.0)),
        "created_by": Value::Null,
        "mental_sphere_ids": [],
        "created_at": stamp,
        "updated_at": stamp,
        "_status": STATUS_SAVING,
    })
}
