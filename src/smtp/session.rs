//! C3 session state machine (SPEC_FULL.md §4.3). One `SmtpSession` per
//! accepted connection; `handle()` enum-dispatches on the parsed command the
//! same way the teacher's authenticated session does, but every connection
//! here is anonymous — there is no AUTH command and no credential lookup.

use std::net::IpAddr;
use std::sync::Arc;

use base64ct::Encoding;
use mail_parser::MessageParser;
use smtp_proto::{EXT_8BIT_MIME, EXT_ENHANCED_STATUS_CODES, EhloResponse, Request};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::auth::{AuthVerifier, RejectReason, SpfVerdict};
use crate::bus::EventStream;
use crate::config::Config;
use crate::directory::{Authorizer, OrgDirectory, UserDirectory};
use crate::smtp::mailbox::{self, MailboxError};
use crate::smtp::reply::Reply;
use crate::store::{self, List, ListRepository, MemberRepository, MessageRepository, NewMessage, ObjectStore};

pub struct SessionDeps {
    pub config: Arc<Config>,
    pub auth: Arc<AuthVerifier>,
    pub lists: Arc<ListRepository>,
    pub members: Arc<MemberRepository>,
    pub messages: Arc<MessageRepository>,
    pub blobs: Arc<dyn ObjectStore>,
    pub users: Arc<dyn UserDirectory>,
    pub orgs: Arc<dyn OrgDirectory>,
    pub authorizer: Arc<dyn Authorizer>,
    pub events: Arc<dyn EventStream>,
}

enum State {
    Connected,
    Ready,
    Envelope {
        mail_from: String,
        client_ip: IpAddr,
        helo: String,
    },
    Recipient {
        mail_from: String,
        sender_user_id: String,
        client_ip: IpAddr,
        helo: String,
        list: List,
    },
    Receiving {
        mail_from: String,
        sender_user_id: String,
        client_ip: IpAddr,
        helo: String,
        list: List,
        buffer: Vec<u8>,
    },
}

pub enum SessionReply {
    ReplyAndContinue(u16, String),
    ReplyAndStop(u16, String),
    RawReply(Vec<u8>),
    IngestData(u16, String),
}

pub enum DataReply {
    ReplyAndContinue(u16, String),
    ContinueIngest,
}

#[derive(Debug, Error)]
enum PersistError {
    #[error(transparent)]
    Reject(#[from] RejectReason),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error("missing Message-ID header")]
    MissingMessageId,
    #[error(transparent)]
    Storage(#[from] store::Error),
    #[error(transparent)]
    Blob(#[from] crate::store::BlobError),
}

impl From<&PersistError> for Reply {
    fn from(err: &PersistError) -> Self {
        match err {
            PersistError::Reject(r) => Reply::from(r),
            PersistError::Mailbox(m) => Reply::from(m),
            PersistError::MissingMessageId => Reply::MalformedBody,
            PersistError::Storage(_) | PersistError::Blob(_) => Reply::DuplicateOrPersistenceFail,
        }
    }
}

pub struct SmtpSession {
    deps: SessionDeps,
    client_ip: IpAddr,
    session_id: String,
    peer_name: Option<String>,
    state: State,
}

impl SmtpSession {
    pub fn new(deps: SessionDeps, client_ip: IpAddr) -> Self {
        let mut bytes = [0u8; 16];
        rand::Rng::fill(&mut rand::rng(), &mut bytes);
        let session_id = base64ct::Base64UrlUnpadded::encode_string(&bytes);

        Self {
            deps,
            client_ip,
            session_id,
            peer_name: None,
            state: State::Connected,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[tracing::instrument(skip_all, fields(session_id = %self.session_id, client_ip = %self.client_ip))]
    pub async fn handle(&mut self, request: Result<Request<String>, smtp_proto::Error>) -> SessionReply {
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                debug!("failed to parse request: {e}");
                return SessionReply::ReplyAndContinue(500, "5.5.2 Syntax error".to_owned());
            }
        };

        trace!("received request: {request:?}");

        match request {
            Request::Ehlo { host } | Request::Helo { host } => {
                let mut response = EhloResponse::new(&host);
                response.capabilities = EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME;

                let mut buf = Vec::with_capacity(64);
                response.write(&mut buf).ok();

                self.peer_name = Some(host);
                self.state = State::Ready;

                SessionReply::RawReply(buf)
            }
            Request::Quit => SessionReply::ReplyAndStop(221, "2.0.0 Goodbye".to_owned()),
            _ignored if self.peer_name.is_none() => {
                SessionReply::ReplyAndContinue(503, "5.5.1 Be nice and say EHLO first".to_owned())
            }
            Request::Mail { from } => self.handle_mail(from.address).await,
            Request::Rcpt { to } => self.handle_rcpt(to.address).await,
            Request::Data => self.handle_data_command(),
            Request::Rset => {
                self.state = State::Ready;
                SessionReply::ReplyAndContinue(250, "2.0.0 Ok".to_owned())
            }
            Request::Noop { .. } => SessionReply::ReplyAndContinue(250, "2.0.0 Ok".to_owned()),
            _ => SessionReply::ReplyAndContinue(502, "5.5.1 Command not implemented".to_owned()),
        }
    }

    async fn handle_mail(&mut self, address: String) -> SessionReply {
        if !matches!(self.state, State::Ready) {
            let (code, detail) = Reply::SequenceError.render("Error: nested MAIL command");
            return SessionReply::ReplyAndContinue(code, detail);
        }

        if address.split_once('@').is_none_or(|(l, d)| l.is_empty() || d.is_empty()) {
            let (code, detail) = Reply::MalformedMailFrom.render("malformed MAIL FROM address");
            return SessionReply::ReplyAndContinue(code, detail);
        }

        let helo = self.peer_name.clone().unwrap_or_default();
        let spf = self
            .deps
            .auth
            .check_spf(self.client_ip, &helo, &address)
            .await;

        if let Some(reply) = Self::early_spf_reject(spf) {
            let (code, detail) = reply.render("");
            return SessionReply::ReplyAndContinue(code, detail);
        }

        self.state = State::Envelope {
            mail_from: address.clone(),
            client_ip: self.client_ip,
            helo,
        };

        SessionReply::ReplyAndContinue(250, format!("2.1.0 Originator <{address}> ok"))
    }

    fn early_spf_reject(spf: SpfVerdict) -> Option<Reply> {
        match spf {
            SpfVerdict::Fail | SpfVerdict::SoftFail => Some(Reply::SpfFail),
            SpfVerdict::TempError => Some(Reply::SpfTempError),
            SpfVerdict::PermError => Some(Reply::SpfPermError),
            _ => None,
        }
    }

    async fn handle_rcpt(&mut self, address: String) -> SessionReply {
        let State::Envelope {
            mail_from,
            client_ip,
            helo,
        } = &self.state
        else {
            return match self.state {
                State::Recipient { .. } | State::Receiving { .. } => {
                    let (code, detail) = Reply::TooManyRecipients.render("this list accepts one recipient per message");
                    SessionReply::ReplyAndContinue(code, detail)
                }
                _ => {
                    let (code, detail) = Reply::SequenceError.render("Use MAIL first");
                    SessionReply::ReplyAndContinue(code, detail)
                }
            };
        };

        let Some((local, domain)) = address.split_once('@') else {
            let (code, detail) = Reply::MalformedRcpt.render("malformed RCPT TO address");
            return SessionReply::ReplyAndContinue(code, detail);
        };

        match self.resolve_and_authorize(local, domain, mail_from).await {
            Ok((list, sender_user_id)) => {
                self.state = State::Recipient {
                    mail_from: mail_from.clone(),
                    sender_user_id,
                    client_ip: *client_ip,
                    helo: helo.clone(),
                    list,
                };
                SessionReply::ReplyAndContinue(250, format!("2.1.5 Recipient <{address}> ok"))
            }
            Err(err) => {
                warn!("rejecting recipient {address}: {err}");
                let reply = Reply::from(&err);
                let (code, detail) = reply.render("");
                SessionReply::ReplyAndContinue(code, detail)
            }
        }
    }

    async fn resolve_and_authorize(
        &self,
        local: &str,
        domain: &str,
        mail_from: &str,
    ) -> Result<(List, String), MailboxError> {
        let list_id = mailbox::resolve_mailbox_candidate(
            local,
            domain,
            &self.deps.config.usrdomain,
            &self.deps.config.orgdomain,
        )?;

        let list = self
            .deps
            .lists
            .find_by_id(&list_id)
            .await
            .map_err(|_| MailboxError::Misconfigured)?
            .ok_or(MailboxError::UnknownMailbox)?;

        let sender = self
            .deps
            .users
            .get_user_by_email(mail_from)
            .await
            .map_err(|_| MailboxError::Misconfigured)?
            .ok_or(MailboxError::Unauthorized)?;

        mailbox::check_sender_policy(
            &list,
            &sender.user_id,
            &self.deps.members,
            self.deps.authorizer.as_ref(),
            self.deps.orgs.as_ref(),
        )
        .await?;

        Ok((list, sender.user_id))
    }

    fn handle_data_command(&mut self) -> SessionReply {
        let (mail_from, sender_user_id, client_ip, helo, list) =
            match std::mem::replace(&mut self.state, State::Ready) {
                State::Recipient {
                    mail_from,
                    sender_user_id,
                    client_ip,
                    helo,
                    list,
                } => (mail_from, sender_user_id, client_ip, helo, list),
                other => {
                    self.state = other;
                    let (code, detail) = Reply::SequenceError.render("Bad sequence of commands");
                    return SessionReply::ReplyAndContinue(code, detail);
                }
            };

        self.state = State::Receiving {
            mail_from,
            sender_user_id,
            client_ip,
            helo,
            list,
            buffer: Vec::new(),
        };

        SessionReply::IngestData(354, "3.5.4 Start mail input; end with <CRLF>.<CRLF>".to_owned())
    }

    #[tracing::instrument(skip_all, fields(session_id = %self.session_id))]
    pub async fn handle_data(&mut self, chunk: &[u8]) -> DataReply {
        let State::Receiving { buffer, .. } = &mut self.state else {
            let (code, detail) = Reply::SequenceError.render("Bad sequence of commands");
            return DataReply::ReplyAndContinue(code, detail);
        };

        buffer.extend_from_slice(chunk);

        if buffer.len() as u64 > self.deps.config.maxmsgsize {
            self.state = State::Ready;
            let (code, detail) = Reply::MalformedBody.render("message too large");
            return DataReply::ReplyAndContinue(code, detail);
        }

        const DATA_END: &[u8] = b"\r\n.\r\n";
        if !(buffer.ends_with(DATA_END) || buffer.as_slice() == &DATA_END[2..]) {
            return DataReply::ContinueIngest;
        }

        let State::Receiving {
            mail_from,
            sender_user_id,
            client_ip,
            helo,
            list,
            mut buffer,
        } = std::mem::replace(&mut self.state, State::Ready)
        else {
            unreachable!("checked above");
        };
        buffer.truncate(buffer.len() - DATA_END.len());

        match self
            .persist(&mail_from, &sender_user_id, client_ip, &helo, &list, buffer)
            .await
        {
            Ok(reply) => {
                let (code, detail) = reply.render("");
                DataReply::ReplyAndContinue(code, detail)
            }
            Err(err) => {
                warn!("rejecting message: {err}");
                let (code, detail) = Reply::from(&err).render("");
                DataReply::ReplyAndContinue(code, detail)
            }
        }
    }

    /// The 8-step persistence algorithm of SPEC_FULL.md §4.3.
    async fn persist(
        &self,
        mail_from: &str,
        sender_user_id: &str,
        client_ip: IpAddr,
        helo: &str,
        list: &List,
        raw: Vec<u8>,
    ) -> Result<Reply, PersistError> {
        // Step 1: parse headers.
        let parsed = MessageParser::default()
            .parse(&raw)
            .ok_or(PersistError::MissingMessageId)?;
        let msg_id = parsed
            .message_id()
            .map(str::to_owned)
            .ok_or(PersistError::MissingMessageId)?;
        let subject = parsed.subject().unwrap_or_default().to_owned();
        let in_reply_to = parsed.in_reply_to().as_text().unwrap_or_default().to_owned();

        // Step 4 (short-circuit check; `insert_if_absent` below re-checks
        // atomically once the blob has been written).
        if self
            .deps
            .messages
            .find(&list.list_id, &msg_id)
            .await?
            .is_some()
        {
            return Ok(Reply::Ok);
        }

        // Step 2: run C2 over the raw bytes.
        let outcome = self
            .deps
            .auth
            .verify(mail_from, client_ip, helo, &raw)
            .await?;

        // Step 3: append Authentication-Results + synthesized Received, re-serialize.
        let now = chrono::Utc::now();
        let received = format!(
            "Received: from {helo} ({client_ip}) by {} with ESMTP id {}; {}\r\n",
            self.deps.config.authdomain,
            self.session_id,
            now.to_rfc2822(),
        );
        let authentication_results = format!(
            "Authentication-Results: {}\r\n",
            outcome.authentication_results
        );
        let mut reserialized = Vec::with_capacity(raw.len() + received.len() + authentication_results.len());
        reserialized.extend_from_slice(received.as_bytes());
        reserialized.extend_from_slice(authentication_results.as_bytes());
        reserialized.extend_from_slice(&raw);

        // Step 5: write the MIME blob.
        self.deps
            .blobs
            .put(&list.list_id, &msg_id, &reserialized)
            .await?;

        // Step 6: insert the pending message row.
        let new_message = NewMessage {
            list_id: list.list_id.clone(),
            msg_id: msg_id.clone(),
            user_id: sender_user_id.to_owned(),
            creation_time: now.timestamp_millis(),
            spf_pass: outcome.spf_pass,
            dkim_pass: outcome.dkim_pass,
            subject,
            in_reply_to,
        };

        if !self.deps.messages.insert_if_absent(&new_message).await? {
            return Ok(Reply::Ok);
        }

        // Step 7: touch the list.
        self.deps
            .lists
            .touch_list(&list.list_id, now.timestamp_millis())
            .await?;

        // Step 8: publish the `mail` event.
        let payload = serde_json::json!({ "list_id": list.list_id, "msg_id": msg_id }).to_string();
        if let Err(e) = self
            .deps
            .events
            .publish(&format!("{}.mail", self.deps.config.authdomain), payload.into_bytes())
            .await
        {
            warn!("failed to publish mail event: {e}");
        }

        Ok(Reply::MessageAccepted)
    }
}
