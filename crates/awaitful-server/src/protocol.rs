//! Todo socket protocol.
//!
//! Clients send [`ClientMessage`]s tagged by `type`. The server answers with
//! path-tagged pushes ([`ServerMessage`]), the same shape the core socket
//! façade routes into subscription cells.

use serde::{Deserialize, Serialize};

pub use awaitful_core::Push as ServerMessage;

/// Path carrying the list of todo ids.
pub const TODOS_PATH: &str = "/todos";

/// Path carrying one todo.
pub fn todo_path(id: u64) -> String {
    format!("/todo/{id}")
}

/// Parse the id out of a `/todo/{id}` path.
pub fn parse_todo_path(path: &str) -> Option<u64> {
    path.strip_prefix("/todo/")?.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub text: String,
    pub done: bool,
    pub id: u64,
}

/// Messages from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    CreateTodo { text: String },
    RemoveTodo { id: u64 },
    UpdateTodo { todo: Todo },
    /// Start receiving pushes for `path`.
    Subscribe { path: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_todo_paths() {
        assert_eq!(todo_path(3), "/todo/3");
        assert_eq!(parse_todo_path("/todo/3"), Some(3));
        assert_eq!(parse_todo_path("/todos"), None);
        assert_eq!(parse_todo_path("/todo/x"), None);
    }

    #[test]
    fn test_client_message_tags() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"RemoveTodo","id":4}"#).unwrap();
        assert_eq!(msg, ClientMessage::RemoveTodo { id: 4 });

        let json = serde_json::to_value(ClientMessage::UpdateTodo {
            todo: Todo {
                text: "milk".into(),
                done: true,
                id: 1,
            },
        })
        .unwrap();
        assert_eq!(json["type"], "UpdateTodo");
        assert_eq!(json["todo"]["done"], true);
    }
}
