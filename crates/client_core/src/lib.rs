//! Client-side chat synchronization for project rooms.
//!
//! A [`RoomSession`] combines a durable REST channel ([`ChatApi`]) with a
//! reconnecting WebSocket ([`TransportConnection`]) and keeps one ordered,
//! de-duplicated message sequence per room in a [`ReconciliationStore`].

pub mod api;
pub mod config;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod session;
pub mod store;
pub mod transport;

pub use api::{ChatApi, RestChatApi};
pub use config::{load_settings, load_settings_from, ClientSettings};
pub use envelope::{check_envelope, is_valid_envelope, parse_envelope, EnvelopeRejection};
pub use error::{RequestError, SendError, SessionError, TransportError};
pub use filter::ChatFilter;
pub use session::{RoomSession, SessionEvent};
pub use store::{
    DedupStrategy, Delivery, MergeOutcome, MergePolicy, ReconciliationStore, StoredMessage,
};
pub use transport::{ConnectionState, TransportConnection, TransportEvent, TransportSettings};
