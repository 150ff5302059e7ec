//! Generalizes this codebase's axum/broadcast-channel bus (`bus::client`,
//! `bus::server`) from one hardcoded `BusMessage` enum into the named-channel
//! `EventStream` collaborator of SPEC_FULL.md §6.4: `publish(channel, bytes)`
//! and `subscribe(stream, channel, consumer_group, handler, opts)`, with the
//! handler receiving `{ack-pinger, payload}`.
//!
//! `LocalEventStream` keeps messages in-process via `tokio::sync::mpsc`
//! rather than standing up the axum/websocket transport for every
//! `consumer_group`: one sender per group, round-robined across however many
//! subscribers join that group, which is enough for the single-binary
//! deployment this crate ships (SPEC_FULL.md §6.4's note on collaborators
//! being swappable by an embedding platform).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::SubscriptionConfig;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no subscribers for channel {0}")]
    NoSubscribers(String),
    #[error("channel at capacity: {0}")]
    Full(String),
}

#[derive(Debug, Clone, Copy)]
pub struct SubscribeOpts {
    pub ack_wait: Duration,
    pub max_deliver: u32,
    pub max_pending: u32,
}

impl From<SubscriptionConfig> for SubscribeOpts {
    fn from(c: SubscriptionConfig) -> Self {
        Self {
            ack_wait: c.ack_wait,
            max_deliver: c.max_deliver,
            max_pending: c.max_pending,
        }
    }
}

/// Handed to a handler so a long-running delivery (e.g. an outbound send
/// batch) can signal it is still alive instead of being treated as stuck.
#[derive(Clone)]
pub struct AckPinger {
    pings: Arc<AtomicUsize>,
}

impl AckPinger {
    fn new() -> Self {
        Self {
            pings: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn ping(&self) {
        self.pings.fetch_add(1, Ordering::Relaxed);
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
pub type Handler = Arc<dyn Fn(AckPinger, Vec<u8>) -> HandlerFuture + Send + Sync>;

#[async_trait]
pub trait EventStream: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn subscribe(
        self: Arc<Self>,
        stream: &str,
        channel: &str,
        consumer_group: &str,
        handler: Handler,
        opts: SubscribeOpts,
        shutdown: CancellationToken,
    );
}

struct Group {
    senders: Vec<mpsc::Sender<Vec<u8>>>,
    next: AtomicUsize,
}

#[derive(Default)]
pub struct LocalEventStream {
    groups: Mutex<HashMap<String, HashMap<String, Group>>>,
}

impl LocalEventStream {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStream for LocalEventStream {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let groups = self.groups.lock().await;
        let Some(by_group) = groups.get(channel) else {
            return Err(BusError::NoSubscribers(channel.to_owned()));
        };

        for group in by_group.values() {
            if group.senders.is_empty() {
                continue;
            }
            let idx = group.next.fetch_add(1, Ordering::Relaxed) % group.senders.len();
            if let Err(e) = group.senders[idx].try_send(payload.clone()) {
                warn!(channel, "event stream backlog, dropping message: {e}");
            }
        }

        Ok(())
    }

    async fn subscribe(
        self: Arc<Self>,
        stream: &str,
        channel: &str,
        consumer_group: &str,
        handler: Handler,
        opts: SubscribeOpts,
        shutdown: CancellationToken,
    ) {
        let full_channel = format!("{stream}.{channel}");
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(opts.max_pending as usize);

        {
            let mut groups = self.groups.lock().await;
            groups
                .entry(full_channel.clone())
                .or_default()
                .entry(consumer_group.to_owned())
                .or_insert_with(|| Group {
                    senders: Vec::new(),
                    next: AtomicUsize::new(0),
                })
                .senders
                .push(tx);
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                payload = rx.recv() => {
                    let Some(payload) = payload else { break };
                    Self::deliver(&full_channel, payload, &handler, opts).await;
                }
            }
        }
    }
}

impl LocalEventStream {
    async fn deliver(channel: &str, payload: Vec<u8>, handler: &Handler, opts: SubscribeOpts) {
        let pinger = AckPinger::new();

        for attempt in 1..=opts.max_deliver.max(1) {
            if handler(pinger.clone(), payload.clone()).await {
                return;
            }
            if attempt < opts.max_deliver {
                tokio::time::sleep(opts.ack_wait).await;
            }
        }

        error!(
            channel,
            max_deliver = opts.max_deliver,
            "handler failed on every delivery attempt, dropping message"
        );
    }
}
