use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::bus::{EventStream, Handler, SubscribeOpts};
use crate::cascade::{CascadeCleanup, CascadeError};
use crate::worker::{DelEvent, decode_payload, is_transient};

/// Consumes the `del` channel: runs cascade cleanup for the referenced list
/// (SPEC_FULL.md §4.5's `del` worker).
pub struct DelWorker {
    cascade: Arc<CascadeCleanup>,
    events: Arc<dyn EventStream>,
    authdomain: String,
}

impl DelWorker {
    pub fn new(cascade: Arc<CascadeCleanup>, events: Arc<dyn EventStream>, authdomain: String) -> Self {
        Self {
            cascade,
            events,
            authdomain,
        }
    }

    pub fn spawn(self: Arc<Self>, concurrency: u32, opts: SubscribeOpts, shutdown: CancellationToken) {
        for _ in 0..concurrency.max(1) {
            let worker = self.clone();
            let events = self.events.clone();
            let shutdown = shutdown.clone();
            let authdomain = self.authdomain.clone();

            let handler: Handler = Arc::new(move |pinger, payload| {
                let worker = worker.clone();
                Box::pin(async move {
                    let Some(event) = decode_payload::<DelEvent>(&payload) else {
                        return true;
                    };

                    pinger.ping();

                    let now = chrono::Utc::now().timestamp_millis();
                    match worker.cascade.delete_list(&event.list_id, now).await {
                        Ok(()) => true,
                        Err(CascadeError::Storage(ref storage_err)) if !is_transient(storage_err) => {
                            error!(list_id = event.list_id, "del worker: non-retriable storage error, dropping: {storage_err}");
                            true
                        }
                        Err(e) => {
                            error!(list_id = event.list_id, "del worker failed, will redeliver: {e}");
                            false
                        }
                    }
                })
            });

            tokio::spawn(events.clone().subscribe(&authdomain, "del", "del-worker", handler, opts, shutdown));
        }
    }
}
