// Client-side chat synchronization engine.
//
// Keeps an in-memory, eventually-consistent view of chats and messages
// correct against an out-of-order push channel, REST pulls for hydration
// and reconciliation, locally-originated optimistic sends, and a TTL-bounded
// cache. The REST backend and the push transport are external collaborators
// behind the `transport` seam.

pub mod cache;
pub mod config;
pub mod error;
pub mod identity;
pub mod models;
pub mod ranking;
pub mod sync;
pub mod transport;
pub mod util;

// Re-export the main surface for convenience.
pub use config::SyncConfig;
pub use error::{ErrorCategory, SyncError};
pub use models::*;
pub use sync::{
    CanonicalEvent, EngineSnapshot, EngineUpdate, PageState, RawPushEvent, SendOutcome,
    SyncCoordinator,
};
pub use transport::RestClient;
