//! LiveCanvas Core Library
//!
//! Platform-agnostic data structures and sync logic for the LiveCanvas
//! collaborative editor. The shared [`SharedStorage`] map is the source of
//! truth; the local [`Canvas`] is rebuilt from it by [`SyncAdapter`].

pub mod canvas;
pub mod collaboration;
pub mod comments;
pub mod config;
pub mod crdt;
pub mod input;
pub mod presence;
pub mod render;
pub mod session;
pub mod shapes;
pub mod storage;
pub mod sync;
pub mod throttle;
pub mod tools;

pub use canvas::{Canvas, CanvasDocument, CanvasEdit};
pub use collaboration::SyncAdapter;
pub use comments::{Comment, CommentError, CommentThread, ThreadId};
pub use config::{ClientConfig, ConfigError};
pub use crdt::{CrdtError, ShapeRecord, SharedStorage};
pub use input::{Action, KeyEvent, Modifiers, PointerEvent};
pub use presence::{BroadcastEvent, CursorMode, Presence, PresenceRoster, ReactionEvent};
pub use render::{RenderContext, Renderer, SvgRenderer};
pub use session::Session;
pub use shapes::{Shape, ShapeId, ShapeStyle};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
pub use sync::{
    ClientMessage, ConnectionState, PlatformWebSocket, ServerMessage, SyncError, SyncEvent, Transport,
};
pub use throttle::Throttle;
pub use tools::ToolKind;
