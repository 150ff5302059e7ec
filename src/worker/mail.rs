use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bus::{EventStream, SubscribeOpts};
use crate::thread::{ReconcileError, ThreadReconciler};
use crate::worker::{MailEvent, decode_payload, is_transient};

/// Consumes the `mail` channel: runs the thread reconciler, then publishes
/// `send` (SPEC_FULL.md §4.5's `mail` worker).
pub struct MailWorker {
    reconciler: Arc<ThreadReconciler>,
    events: Arc<dyn EventStream>,
    authdomain: String,
}

impl MailWorker {
    pub fn new(reconciler: Arc<ThreadReconciler>, events: Arc<dyn EventStream>, authdomain: String) -> Self {
        Self {
            reconciler,
            events,
            authdomain,
        }
    }

    /// Spawns `concurrency` subscriber tasks in the `mail-worker` consumer
    /// group, each independently pulling from the shared channel.
    pub fn spawn(self: Arc<Self>, concurrency: u32, opts: SubscribeOpts, shutdown: CancellationToken) {
        for _ in 0..concurrency.max(1) {
            let worker = self.clone();
            let events = self.events.clone();
            let shutdown = shutdown.clone();
            let authdomain = self.authdomain.clone();

            let handler: crate::bus::Handler = Arc::new(move |pinger, payload| {
                let worker = worker.clone();
                Box::pin(async move {
                    let Some(event) = decode_payload::<MailEvent>(&payload) else {
                        return true;
                    };

                    pinger.ping();

                    match worker.process(&event.list_id, &event.msg_id).await {
                        Ok(()) => true,
                        // A missing message is already-done, not a failure to
                        // retry (SPEC_FULL.md §7's poison-pill containment).
                        Err(ReconcileError::NotFound(..)) => true,
                        Err(ReconcileError::Storage(ref storage_err)) if !is_transient(storage_err) => {
                            error!(list_id = event.list_id, msg_id = event.msg_id, "mail worker: non-retriable storage error, dropping: {storage_err}");
                            true
                        }
                        Err(e) => {
                            error!(list_id = event.list_id, msg_id = event.msg_id, "mail worker failed, will redeliver: {e}");
                            false
                        }
                    }
                })
            });

            tokio::spawn(events.subscribe(&authdomain, "mail", "mail-worker", handler, opts, shutdown));
        }
    }

    async fn process(&self, list_id: &str, msg_id: &str) -> Result<(), crate::thread::ReconcileError> {
        let now = chrono::Utc::now().timestamp_millis();
        self.reconciler.reconcile(list_id, msg_id, now).await?;

        let payload = serde_json::json!({ "list_id": list_id, "msg_id": msg_id }).to_string();
        if let Err(e) = self.events.publish(&format!("{}.send", self.authdomain), payload.into_bytes()).await {
            error!("failed to publish send event: {e}");
        }

        info!(list_id, msg_id, "reconciled");
        Ok(())
    }
}
