//! Commands sent to the remote service and the runner that sends them.

use async_trait::async_trait;
use mooring_engine::{ClassName, ObjectId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A request to the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    /// Create an object; the response carries its server id
    Create { class_name: ClassName, body: Value },
    Update {
        class_name: ClassName,
        object_id: ObjectId,
        body: Value,
    },
    Delete {
        class_name: ClassName,
        object_id: ObjectId,
    },
    /// Any other request, passed through as given
    Raw {
        method: String,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
}

impl Command {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Create { .. } => "create",
            Command::Update { .. } => "update",
            Command::Delete { .. } => "delete",
            Command::Raw { .. } => "raw",
        }
    }
}

/// Response to a successful command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Response body
    pub data: Value,
    /// HTTP-style status code
    pub status: u16,
}

impl CommandResult {
    pub fn ok(data: Value) -> Self {
        Self { data, status: 200 }
    }
}

/// Why a command did not succeed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    /// Transient failure (connectivity, timeout, server overload); worth
    /// retrying.
    #[error("Retryable failure: {0}")]
    Retryable(String),

    /// The remote service rejected the command.
    #[error("Fatal failure ({code}): {message}")]
    Fatal { code: i64, message: String },

    /// The command was cancelled before it completed.
    #[error("Command cancelled")]
    Cancelled,
}

/// Per-run options handed to the runner.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Session the command was enqueued under
    pub session_token: Option<String>,
    /// Cancelled when the queue terminates
    pub cancel: CancellationToken,
}

/// Sends commands to the remote service.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &Command, options: RunOptions) -> Result<CommandResult, CommandError>;
}

/// Supplies the session token recorded with each queued command.
pub trait SessionProvider: Send + Sync {
    fn session_token(&self) -> Option<String>;
}

/// No signed-in user.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSession;

impl SessionProvider for NoSession {
    fn session_token(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_json_shape() {
        let command = Command::Update {
            class_name: "Post".into(),
            object_id: "p1".into(),
            body: json!({"title": "x"}),
        };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(
            value,
            json!({"command": "update", "className": "Post", "objectId": "p1", "body": {"title": "x"}})
        );
        let back: Command = serde_json::from_value(value).unwrap();
        assert_eq!(back, command);
        assert_eq!(back.name(), "update");
    }

    #[test]
    fn error_display() {
        let err = CommandError::Fatal {
            code: 101,
            message: "object not found".into(),
        };
        assert_eq!(err.to_string(), "Fatal failure (101): object not found");
        assert_eq!(CommandError::Cancelled.to_string(), "Command cancelled");
    }
}
