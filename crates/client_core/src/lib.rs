pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod normalize;
pub mod reconciler;
pub mod search;
pub mod session;

use shared::domain::{ChatId, ConnectionState, User, UserId};

pub use api::{ChatApi, HttpChatApi};
pub use config::{load_settings, ClientSettings, ReconnectPolicy};
pub use connection::{ConnectionManager, Subscription};
pub use error::{ClientError, ClientResult};
pub use normalize::InboundEvent;
pub use reconciler::{InboundOutcome, StateReconciler};
pub use search::DirectorySearch;
pub use session::ChatSession;

/// Notifications published by a [`ChatSession`]. Snapshot accessors on the
/// session hold the data; these only say what changed.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ChatsUpdated,
    MessagesUpdated {
        chat_id: ChatId,
    },
    ConnectionStateChanged(ConnectionState),
    Typing {
        chat_id: ChatId,
        user_id: Option<UserId>,
    },
    DirectoryUpdated,
    SearchResults {
        query: String,
        users: Vec<User>,
    },
    Authenticated {
        user_id: Option<UserId>,
        username: Option<String>,
    },
    ServerError(String),
    Error(String),
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
