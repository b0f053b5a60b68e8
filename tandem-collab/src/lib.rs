//! # tandem-collab: operation-sequenced collaborative text sessions
//!
//! Clients edit a shared plain-text document through a WebSocket server that
//! assigns every edit a revision. The server is the only authority; clients
//! reconcile optimistic local edits against the sequenced stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │    JSON {type,data} │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Replica     │                     │ Session     │
//! │ DocumentSync│                     │ actor       │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ BroadcastGroup│
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`]: insert/delete/replace edits, apply and diff
//! - [`document`]: client-side confirmed/pending reconciliation
//! - [`presence`]: cursors, selections and activity
//! - [`comments`]: line-anchored comment threads
//! - [`protocol`]: JSON wire messages
//! - [`session`]: the pure per-session state machine
//! - [`broadcast`]: outbox fan-out with eviction
//! - [`sequencer`]: one actor task per session plus the registry
//! - [`analysis`]: relay to an external analysis service
//! - [`backoff`]: reconnect policy
//! - [`replica`]: the client's view of one session
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client with reconnect

pub mod operation;
pub mod document;
pub mod presence;
pub mod comments;
pub mod protocol;
pub mod session;
pub mod broadcast;
pub mod sequencer;
pub mod analysis;
pub mod backoff;
pub mod replica;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use operation::{diff, ApplyError, Edit, TextOperation};
pub use document::{DivergenceError, DocumentSync};
pub use presence::{color_for, Cursor, LocalPresence, PresenceTracker, Selection};
pub use comments::{Comment, CommentError, CommentStore};
pub use protocol::{
    ClientId, ClientMessage, Collaborator, ProtocolError, ServerMessage, SessionId, UserData,
};
pub use session::{Outbound, Recipient, Session, SessionError};
pub use broadcast::{BroadcastGroup, BroadcastStats, Outbox};
pub use sequencer::{DocumentSnapshot, SessionHandle, SessionRegistry};
pub use analysis::{AnalysisError, AnalysisRequest, AnalysisService, HttpAnalysisService};
pub use backoff::ReconnectPolicy;
pub use replica::{Reaction, Replica};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ClientConfig, ConnectionError, ConnectionState, SyncClient, SyncEvent};
