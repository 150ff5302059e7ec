use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::bus::{AckPinger, EventStream, Handler, SubscribeOpts};
use crate::directory::{Mailer, MailerError, UserDirectory};
use crate::store::{self, MemberRepository, MessageRepository, ObjectStore, SentLogRepository};
use crate::worker::{MailEvent, decode_payload, is_transient};

/// Recipients handled per `send` worker loop iteration (SPEC_FULL.md §4.5's
/// `SEND_BATCH`).
const SEND_BATCH: i64 = 255;

#[derive(Debug, Error)]
enum SendError {
    #[error(transparent)]
    Storage(#[from] store::Error),
    #[error(transparent)]
    Blob(#[from] store::BlobError),
    #[error(transparent)]
    Directory(#[from] crate::directory::DirectoryError),
    #[error(transparent)]
    Mailer(#[from] MailerError),
}

/// Consumes the `send` channel: forwards a message to its list's unsent
/// members in batches, ack-pinging the broker between batches (SPEC_FULL.md
/// §4.5's `send` worker).
pub struct SendWorker {
    members: Arc<MemberRepository>,
    messages: Arc<MessageRepository>,
    sent_log: Arc<SentLogRepository>,
    blobs: Arc<dyn ObjectStore>,
    users: Arc<dyn UserDirectory>,
    mailer: Arc<dyn Mailer>,
    events: Arc<dyn EventStream>,
    authdomain: String,
    /// Delivery port used for every direct-to-domain hop; this crate does
    /// not perform MX-priority resolution, per DESIGN.md's `Mailer` note.
    outbound_port: u16,
}

impl SendWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        members: Arc<MemberRepository>,
        messages: Arc<MessageRepository>,
        sent_log: Arc<SentLogRepository>,
        blobs: Arc<dyn ObjectStore>,
        users: Arc<dyn UserDirectory>,
        mailer: Arc<dyn Mailer>,
        events: Arc<dyn EventStream>,
        authdomain: String,
        outbound_port: u16,
    ) -> Self {
        Self {
            members,
            messages,
            sent_log,
            blobs,
            users,
            mailer,
            events,
            authdomain,
            outbound_port,
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
                    let Some(event) = decode_payload::<MailEvent>(&payload) else {
                        return true;
                    };

                    match worker.process(&event.list_id, &event.msg_id, &pinger).await {
                        Ok(()) => true,
                        Err(SendError::Storage(ref storage_err)) if !is_transient(storage_err) => {
                            error!(list_id = event.list_id, msg_id = event.msg_id, "send worker: non-retriable storage error, dropping: {storage_err}");
                            true
                        }
                        Err(e) => {
                            error!(list_id = event.list_id, msg_id = event.msg_id, "send worker failed, will redeliver: {e}");
                            false
                        }
                    }
                })
            });

            tokio::spawn(events.clone().subscribe(&authdomain, "send", "send-worker", handler, opts, shutdown));
        }
    }

    async fn process(&self, list_id: &str, msg_id: &str, pinger: &AckPinger) -> Result<(), SendError> {
        let message = match self.messages.find(list_id, msg_id).await? {
            Some(m) => m,
            None => return Ok(()),
        };

        if message.sent || message.deleted {
            return Ok(());
        }

        let raw = self.blobs.get(list_id, msg_id).await?;
        let from = format!("list@{}", self.authdomain);

        loop {
            let unsent = self.members.unsent_recipients(list_id, msg_id, SEND_BATCH).await?;
            if unsent.is_empty() {
                self.messages.mark_sent(list_id, msg_id).await?;
                return Ok(());
            }

            let recipients = self.users.bulk_get_info(&unsent).await?;

            let mut by_domain: HashMap<String, Vec<String>> = HashMap::new();
            for user in &recipients {
                if let Some((_, domain)) = user.email.split_once('@') {
                    by_domain.entry(domain.to_owned()).or_default().push(user.email.clone());
                }
            }

            for (domain, emails) in &by_domain {
                self.mailer
                    .forward_stream(domain, self.outbound_port, &from, emails, &raw)
                    .await?;
            }

            self.sent_log
                .bulk_insert(list_id, msg_id, &unsent, chrono::Utc::now().timestamp())
                .await?;

            pinger.ping();
        }
    }
}
