//! Love Lock client core: backend seams, the sync reconciler and the session
//! actor that ties them together.

pub mod backend;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod session;

use tracing_subscriber::{fmt, EnvFilter};

pub use backend::{Backend, BackendError, ChangeEvent, ChangeFeed, MessageStore, SqliteBackend, Subscription};
pub use config::{ClientConfig, ConfigError};
pub use conversation::ConversationLog;
pub use error::{Result, SessionError};
pub use events::{IncomingAlert, SessionNotification};
pub use reconciler::{MergeOutcome, SyncReconciler, SyncState, SyncTicket};
pub use session::{spawn_session, SessionConfig, SessionHandle};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lovelock_client=debug,lovelock_store=info,warn"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();
}
