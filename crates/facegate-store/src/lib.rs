//! facegate-store — durable registry for identities and access events.

pub mod records;
pub mod store;

pub use records::{AccessEvent, Identity, RecognitionEntry, Statistics};
pub use store::{RegistryStore, StoreError, RECENT_EVENTS_LIMIT};
