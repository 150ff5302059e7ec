use std::sync::Arc;

use sqlx::PgPool;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod auth;
pub mod bus;
pub mod cascade;
pub mod config;
pub mod directory;
pub mod smtp;
pub mod store;
pub mod thread;
pub mod worker;

pub use config::Config;

use crate::auth::{AuthVerifier, DnsResolver};
use crate::bus::{EventStream, LocalEventStream, SubscribeOpts};
use crate::cascade::CascadeCleanup;
use crate::directory::{Mailer, PgAuthorizer, PgOrgDirectory, PgUserDirectory, SmtpMailer};
use crate::smtp::server::SmtpServer;
use crate::store::{
    ListRepository, LocalBlobStore, MemberRepository, MessageRepository, ObjectStore,
    SentLogRepository, TreeRepository,
};
use crate::thread::ThreadReconciler;
use crate::worker::{DelWorker, MailWorker, SendWorker};

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=trace,sqlx=warn,info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// The repositories and collaborators every binary wires up, regardless of
/// which of the SMTP listener / event workers it runs (SPEC_FULL.md §6.4's
/// note that this crate ships one concrete, in-process implementation per
/// collaborator trait, suitable for a single-binary deployment).
pub struct Services {
    pub config: Arc<Config>,
    pub auth: Arc<AuthVerifier>,
    pub lists: Arc<ListRepository>,
    pub members: Arc<MemberRepository>,
    pub messages: Arc<MessageRepository>,
    pub tree: Arc<TreeRepository>,
    pub sent_log: Arc<SentLogRepository>,
    pub blobs: Arc<dyn ObjectStore>,
    pub users: Arc<PgUserDirectory>,
    pub orgs: Arc<PgOrgDirectory>,
    pub authorizer: Arc<PgAuthorizer>,
    pub mailer: Arc<dyn Mailer>,
    pub events: Arc<dyn EventStream>,
}

impl Services {
    pub fn new(pool: PgPool, config: Config) -> Result<Self, auth::ResolverError> {
        let config = Arc::new(config);

        let resolver = match &config.mockdnssource {
            Some(path) => DnsResolver::new_mock(path)?,
            None => DnsResolver::new_real()?,
        };
        let auth = Arc::new(AuthVerifier::new(resolver, config.authdomain.clone()));

        let blobs: Arc<dyn ObjectStore> = Arc::new(LocalBlobStore::new(config.blobdir.clone()));
        let mailer: Arc<dyn Mailer> = Arc::new(SmtpMailer {
            helo_domain: config.authdomain.clone(),
            implicit_tls: false,
        });
        let events: Arc<dyn EventStream> = Arc::new(LocalEventStream::new());

        Ok(Self {
            lists: Arc::new(ListRepository::new(pool.clone())),
            members: Arc::new(MemberRepository::new(pool.clone())),
            messages: Arc::new(MessageRepository::new(pool.clone())),
            tree: Arc::new(TreeRepository::new(pool.clone())),
            sent_log: Arc::new(SentLogRepository::new(pool.clone())),
            users: Arc::new(PgUserDirectory::new(pool.clone())),
            orgs: Arc::new(PgOrgDirectory::new(pool.clone())),
            authorizer: Arc::new(PgAuthorizer::new(pool)),
            config,
            auth,
            blobs,
            mailer,
            events,
        })
    }
}

/// Spawns the SMTP listener (C3, backed by C1 and C2). Mirrors this
/// codebase's `run_mta` in shape: construct the session's collaborators,
/// then hand off a background task per service.
pub fn run_smtp(services: &Services, shutdown: CancellationToken) {
    let server = SmtpServer::new(
        services.config.clone(),
        services.auth.clone(),
        services.lists.clone(),
        services.members.clone(),
        services.messages.clone(),
        services.blobs.clone(),
        services.users.clone(),
        services.orgs.clone(),
        services.authorizer.clone(),
        services.events.clone(),
        shutdown,
    );

    server.spawn();
}

/// Spawns the three C5 event workers (`mail`, `send`, `del`), each as
/// `concurrency` subscriber tasks in its own consumer group.
pub fn run_workers(services: &Services, concurrency: u32, shutdown: CancellationToken) {
    let opts: SubscribeOpts = services.config.subscription.into();

    let reconciler = Arc::new(ThreadReconciler::new(services.messages.clone(), services.tree.clone()));
    let mail_worker = Arc::new(MailWorker::new(
        reconciler,
        services.events.clone(),
        services.config.authdomain.clone(),
    ));
    mail_worker.spawn(concurrency, opts, shutdown.clone());

    let send_worker = Arc::new(SendWorker::new(
        services.members.clone(),
        services.messages.clone(),
        services.sent_log.clone(),
        services.blobs.clone(),
        services.users.clone(),
        services.mailer.clone(),
        services.events.clone(),
        services.config.authdomain.clone(),
        services.config.outbound_port,
    ));
    send_worker.spawn(concurrency, opts, shutdown.clone());

    let cascade = Arc::new(CascadeCleanup::new(
        services.lists.clone(),
        services.members.clone(),
        services.messages.clone(),
        services.tree.clone(),
        services.sent_log.clone(),
        services.blobs.clone(),
    ));
    let del_worker = Arc::new(DelWorker::new(cascade, services.events.clone(), services.config.authdomain.clone()));
    del_worker.spawn(concurrency, opts, shutdown);
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
