//! Todo store shared by every socket connection.
//!
//! Mutations broadcast the pushes they invalidate; each connection forwards
//! only the paths it subscribed to.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::ServerResult;
use crate::protocol::{ServerMessage, TODOS_PATH, Todo, parse_todo_path, todo_path};

/// Capacity for the broadcast channel.
/// Subscribers that fall further behind lose the oldest pushes.
const PUSH_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct Store {
    todos: BTreeMap<u64, Todo>,
    next_id: u64,
}

impl Store {
    fn ids(&self) -> Vec<u64> {
        self.todos.keys().copied().collect()
    }
}

/// In-memory todo list with change broadcasting.
pub struct TodoHub {
    store: Mutex<Store>,
    tx: broadcast::Sender<ServerMessage>,
}

impl Default for TodoHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TodoHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        Self {
            store: Mutex::new(Store::default()),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to every push the hub emits.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.tx.subscribe()
    }

    /// Broadcast a push, ignoring the absence of receivers.
    fn broadcast(&self, msg: ServerMessage) {
        let _ = self.tx.send(msg);
    }

    pub fn create(&self, text: String) -> ServerResult<Todo> {
        let (todo, ids) = {
            let mut store = self.lock();
            store.next_id += 1;
            let todo = Todo {
                text,
                done: false,
                id: store.next_id,
            };
            store.todos.insert(todo.id, todo.clone());
            (todo, store.ids())
        };
        tracing::debug!(id = todo.id, "todo created");
        self.broadcast(ServerMessage::new(
            todo_path(todo.id),
            serde_json::to_value(&todo)?,
        ));
        self.broadcast(ServerMessage::new(TODOS_PATH, serde_json::to_value(ids)?));
        Ok(todo)
    }

    /// Remove a todo. Returns `false` if the id is unknown.
    pub fn remove(&self, id: u64) -> ServerResult<bool> {
        let ids = {
            let mut store = self.lock();
            if store.todos.remove(&id).is_none() {
                return Ok(false);
            }
            store.ids()
        };
        tracing::debug!(id, "todo removed");
        self.broadcast(ServerMessage::new(TODOS_PATH, serde_json::to_value(ids)?));
        Ok(true)
    }

    /// Replace a todo. Returns `false` if the id is unknown.
    pub fn update(&self, todo: Todo) -> ServerResult<bool> {
        {
            let mut store = self.lock();
            match store.todos.get_mut(&todo.id) {
                Some(existing) => *existing = todo.clone(),
                None => return Ok(false),
            }
        }
        self.broadcast(ServerMessage::new(
            todo_path(todo.id),
            serde_json::to_value(&todo)?,
        ));
        Ok(true)
    }

    pub fn get(&self, id: u64) -> Option<Todo> {
        self.lock().todos.get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.lock().ids()
    }

    /// Current data for a subscribable path, if it exists.
    pub fn snapshot(&self, path: &str) -> ServerResult<Option<ServerMessage>> {
        let data: Option<Value> = if path == TODOS_PATH {
            Some(serde_json::to_value(self.ids())?)
        } else if let Some(id) = parse_todo_path(path) {
            match self.get(id) {
                Some(todo) => Some(serde_json::to_value(todo)?),
                None => None,
            }
        } else {
            None
        };
        Ok(data.map(|data| ServerMessage::new(path, data)))
    }
}
