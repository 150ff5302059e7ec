//! C5: Event Workers. Three durable at-least-once subscriptions on the
//! `mail`/`send`/`del` channels (SPEC_FULL.md §4.5), grounded on
//! `handler/mod.rs`'s semaphore-bounded bus-stream consumer loop.

mod del;
mod mail;
mod send;

pub use del::DelWorker;
pub use mail::MailWorker;
pub use send::SendWorker;

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::store;

/// Whether a failed delivery should be redelivered by the broker or ack'd as
/// a poison pill (SPEC_FULL.md §7's propagation policy).
pub(crate) fn is_transient(err: &store::Error) -> bool {
    matches!(err.kind(), store::ErrorKind::Transient)
}

/// Decodes an event payload, logging and acking (never redelivering) on
/// malformed JSON: a handler can't repair that by retrying.
pub(crate) fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Option<T> {
    match serde_json::from_slice(payload) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("dropping malformed event payload: {e}");
            None
        }
    }
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct MailEvent {
    pub list_id: String,
    pub msg_id: String,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct DelEvent {
    pub list_id: String,
}
