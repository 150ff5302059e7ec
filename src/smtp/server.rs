use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use crate::auth::AuthVerifier;
use crate::bus::EventStream;
use crate::config::Config;
use crate::directory::{Authorizer, Mailer, OrgDirectory, UserDirectory};
use crate::smtp::connection::{self, ConnectionError};
use crate::smtp::session::SessionDeps;
use crate::store::{ListRepository, MemberRepository, MessageRepository, ObjectStore};

#[derive(Debug, Error)]
pub enum SmtpServerError {
    #[error("failed to listen on address: {0}")]
    Listen(io::Error),
}

/// Accepts plain-TCP inbound sessions only: TLS termination and PROXY
/// protocol unwrapping are the surrounding deployment's job, not this
/// listener's (SPEC_FULL.md §1 Non-goals).
pub struct SmtpServer {
    config: Arc<Config>,
    auth: Arc<AuthVerifier>,
    lists: Arc<ListRepository>,
    members: Arc<MemberRepository>,
    messages: Arc<MessageRepository>,
    blobs: Arc<dyn ObjectStore>,
    users: Arc<dyn UserDirectory>,
    orgs: Arc<dyn OrgDirectory>,
    authorizer: Arc<dyn Authorizer>,
    events: Arc<dyn EventStream>,
    shutdown: CancellationToken,
}

impl SmtpServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        auth: Arc<AuthVerifier>,
        lists: Arc<ListRepository>,
        members: Arc<MemberRepository>,
        messages: Arc<MessageRepository>,
        blobs: Arc<dyn ObjectStore>,
        users: Arc<dyn UserDirectory>,
        orgs: Arc<dyn OrgDirectory>,
        authorizer: Arc<dyn Authorizer>,
        events: Arc<dyn EventStream>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            auth,
            lists,
            members,
            messages,
            blobs,
            users,
            orgs,
            authorizer,
            events,
            shutdown,
        }
    }

    fn deps(&self) -> SessionDeps {
        SessionDeps {
            config: self.config.clone(),
            auth: self.auth.clone(),
            lists: self.lists.clone(),
            members: self.members.clone(),
            messages: self.messages.clone(),
            blobs: self.blobs.clone(),
            users: self.users.clone(),
            orgs: self.orgs.clone(),
            authorizer: self.authorizer.clone(),
            events: self.events.clone(),
        }
    }

    pub async fn serve(self) -> Result<(), SmtpServerError> {
        let listener = TcpListener::bind(self.config.listen_addr())
            .await
            .map_err(SmtpServerError::Listen)?;

        info!("smtp server on {}", self.config.listen_addr());

        let server_name = self.config.authdomain.clone();

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutting down smtp server");
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok((mut stream, peer_addr)) => {
                        trace!(
                            source_ip = peer_addr.ip().to_string(),
                            source_port = peer_addr.port(),
                            "new TCP connection"
                        );

                        let server_name = server_name.clone();
                        let deps = self.deps();

                        tokio::spawn(async move {
                            if let Err(err) = connection::handle(&mut stream, &server_name, peer_addr, deps).await {
                                match err {
                                    ConnectionError::Dropped => trace!("connection dropped by peer"),
                                    other => error!("failed to handle connection: {other}"),
                                }
                            }
                        });
                    }
                    Err(err) => {
                        error!("failed to accept connection: {err}");
                    }
                },
            }
        }
    }

    pub fn spawn(self) {
        tokio::spawn(async {
            if let Err(e) = self.serve().await {
                error!("smtp server error: {e:?}");
            }
        });
    }
}
