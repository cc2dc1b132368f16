//! Core of the awaitful component framework.
//!
//! This crate provides:
//! - Value cells with re-armable change notification, held in a registry
//! - Read sessions recording which cells a render pass touched
//! - Render loops that re-run exactly when a touched cell changes
//! - The named-resource façade (`state`, `prop`, `fetch`, `ws`)
//! - Render trees, a host abstraction and component mounting

pub mod cell;
pub mod component;
pub mod context;
pub mod error;
pub mod fetch;
pub mod host;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod scope;
pub mod session;
pub mod socket;
pub mod view;

pub use cell::{CellError, CellId, CellStatus, Handle, Producer, Snapshot};
pub use component::{Component, ComponentHandle, mount, mount_component};
pub use context::{Context, Derived, ResourceTables};
pub use error::{Error, Result};
pub use fetch::{Fetcher, HttpFetcher};
pub use host::{Event, Host, HostListener, MemoryHost, NodeId};
pub use protocol::{Push, SocketRequest};
pub use registry::Registry;
pub use runtime::{DEFAULT_RETRY_DELAY, Runtime, RuntimeBuilder, RuntimeConfig};
pub use scheduler::{LoopHandle, LoopState, LoopStats, RenderLoop};
pub use scope::Scope;
pub use session::{ReadSession, SessionMode, WaitSet, Wake};
pub use socket::{AsyncSocket, Connection, Connector, SocketContext, WsConnector};
pub use view::{Attr, Child, Element, h};
