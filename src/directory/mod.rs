//! Abstract collaborator contracts (SPEC_FULL.md §6.4): user/org directory,
//! authorization, and outbound mail forwarding. Each is an explicit trait,
//! per the spec's instruction to favor named traits over ad-hoc dynamic
//! dispatch; each ships one Postgres-backed (or local) implementation
//! suitable for a single-binary deployment, plus a `#[cfg(test)]` in-memory
//! mock mirroring `handler/dns.rs`'s mock/real split.

use std::net::IpAddr;

use async_trait::async_trait;
use mail_send::smtp::message::Message as SmtpMessage;
use mail_send::{SmtpClientBuilder, smtp};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct UserInfo {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserInfo>, DirectoryError>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserInfo>, DirectoryError>;
    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<UserInfo>, DirectoryError>;
    async fn bulk_get_info(&self, user_ids: &[String]) -> Result<Vec<UserInfo>, DirectoryError>;
    async fn check_users_exist(&self, user_ids: &[String]) -> Result<Vec<String>, DirectoryError>;
}

#[async_trait]
pub trait OrgDirectory: Send + Sync {
    async fn get_by_name(&self, orgname: &str) -> Result<Option<String>, DirectoryError>;
    async fn is_member(&self, user_id: &str, org_creator_id: &str) -> Result<bool, DirectoryError>;
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn is_active_user(&self, user_id: &str) -> Result<bool, DirectoryError>;
}

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("temporary failure forwarding message")]
    Temporary,
    #[error("permanent failure forwarding message")]
    Permanent,
}

impl MailerError {
    /// Maps `mail-send`'s per-attempt errors the same way the outbound side
    /// of this codebase already does (`handler/mod.rs::send_single_upstream`).
    fn from_send_error(err: mail_send::Error) -> Self {
        match err {
            mail_send::Error::Io(_)
            | mail_send::Error::Tls(_)
            | mail_send::Error::Base64(_)
            | mail_send::Error::Auth(_)
            | mail_send::Error::UnparseableReply
            | mail_send::Error::InvalidTLSName
            | mail_send::Error::Timeout => MailerError::Temporary,
            mail_send::Error::UnexpectedReply(response)
            | mail_send::Error::AuthenticationFailed(response) => {
                if response.severity() == smtp_proto::Severity::TransientNegativeCompletion {
                    MailerError::Temporary
                } else {
                    MailerError::Permanent
                }
            }
            _ => MailerError::Permanent,
        }
    }
}

/// Outbound mailer (SPEC_FULL.md §6.4): forwards the raw MIME blob to every
/// recipient in one connection, the one step of C5's `send` worker that
/// actually talks SMTP upstream.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn forward_stream(
        &self,
        hostname: &str,
        port: u16,
        from: &str,
        recipients: &[String],
        raw_message: &[u8],
    ) -> Result<(), MailerError>;
}

/// Production mailer using `mail-send`'s plaintext/implicit-TLS client,
/// grounded on `handler/mod.rs::send_single_upstream`.
pub struct SmtpMailer {
    pub helo_domain: String,
    pub implicit_tls: bool,
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn forward_stream(
        &self,
        hostname: &str,
        port: u16,
        from: &str,
        recipients: &[String],
        raw_message: &[u8],
    ) -> Result<(), MailerError> {
        let message = SmtpMessage {
            mail_from: from.to_owned().into(),
            rcpt_to: recipients.iter().map(|r| r.clone().into()).collect(),
            body: raw_message.to_vec().into(),
        };

        let client = SmtpClientBuilder::new(hostname, port)
            .implicit_tls(self.implicit_tls)
            .say_ehlo(true)
            .helo_host(&self.helo_domain)
            .timeout(std::time::Duration::from_secs(60));

        let mut connection = if self.implicit_tls {
            client.connect().await
        } else {
            client.connect_plain().await
        }
        .map_err(MailerError::from_send_error)?;

        connection
            .send(message)
            .await
            .map_err(MailerError::from_send_error)
    }
}

/// Postgres-backed user directory. `users` is owned by the caller's wider
/// platform; this crate only reads from it (SPEC_FULL.md §6.4 note on
/// collaborators being swappable by an embedding caller).
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserInfo>, DirectoryError> {
        let row = sqlx::query_as!(
            UserInfo,
            r#"SELECT user_id, email FROM directory_users WHERE username = $1"#,
            username,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserInfo>, DirectoryError> {
        let row = sqlx::query_as!(
            UserInfo,
            r#"SELECT user_id, email FROM directory_users WHERE email = $1"#,
            email,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<UserInfo>, DirectoryError> {
        let row = sqlx::query_as!(
            UserInfo,
            r#"SELECT user_id, email FROM directory_users WHERE user_id = $1"#,
            user_id,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn bulk_get_info(&self, user_ids: &[String]) -> Result<Vec<UserInfo>, DirectoryError> {
        let rows = sqlx::query_as!(
            UserInfo,
            r#"SELECT user_id, email FROM directory_users WHERE user_id = ANY($1)"#,
            user_ids,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn check_users_exist(&self, user_ids: &[String]) -> Result<Vec<String>, DirectoryError> {
        let rows = sqlx::query_scalar!(
            r#"SELECT user_id FROM directory_users WHERE user_id = ANY($1)"#,
            user_ids,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

pub struct PgOrgDirectory {
    pool: PgPool,
}

impl PgOrgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrgDirectory for PgOrgDirectory {
    async fn get_by_name(&self, orgname: &str) -> Result<Option<String>, DirectoryError> {
        let id = sqlx::query_scalar!(
            r#"SELECT org_id FROM directory_orgs WHERE orgname = $1"#,
            orgname,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn is_member(&self, user_id: &str, org_creator_id: &str) -> Result<bool, DirectoryError> {
        let exists = sqlx::query_scalar!(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM directory_org_members
                WHERE user_id = $1 AND org_creator_id = $2
            )
            "#,
            user_id,
            org_creator_id,
        )
        .fetch_one(&self.pool)
        .await?
        .unwrap_or(false);
        Ok(exists)
    }
}

pub struct PgAuthorizer {
    pool: PgPool,
}

impl PgAuthorizer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Authorizer for PgAuthorizer {
    async fn is_active_user(&self, user_id: &str) -> Result<bool, DirectoryError> {
        let active = sqlx::query_scalar!(
            r#"SELECT active FROM directory_users WHERE user_id = $1"#,
            user_id,
        )
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(false);
        Ok(active)
    }
}

/// MX/IP pair resolved for an outbound hop, handed to the `Mailer` by the
/// `send` worker once it has looked up the recipient's domain.
#[derive(Debug, Clone)]
pub struct MailRoute {
    pub hostname: String,
    pub port: u16,
    pub source_ip: Option<IpAddr>,
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockDirectory {
        pub users: Mutex<HashMap<String, UserInfo>>,
        pub active: Mutex<HashMap<String, bool>>,
        pub orgs: Mutex<HashMap<String, String>>,
        pub org_members: Mutex<HashMap<(String, String), bool>>,
    }

    #[async_trait]
    impl UserDirectory for MockDirectory {
        async fn get_user_by_username(
            &self,
            username: &str,
        ) -> Result<Option<UserInfo>, DirectoryError> {
            Ok(self.users.lock().unwrap().get(username).cloned())
        }

        async fn get_user_by_email(&self, email: &str) -> Result<Option<UserInfo>, DirectoryError> {
            Ok(self
                .users
                .lock()
                .unwrap()
                .values()
                .find(|u| u.email == email)
                .cloned())
        }

        async fn get_user_by_id(&self, user_id: &str) -> Result<Option<UserInfo>, DirectoryError> {
            Ok(self
                .users
                .lock()
                .unwrap()
                .values()
                .find(|u| u.user_id == user_id)
                .cloned())
        }

        async fn bulk_get_info(&self, user_ids: &[String]) -> Result<Vec<UserInfo>, DirectoryError> {
            let users = self.users.lock().unwrap();
            Ok(user_ids
                .iter()
                .filter_map(|id| users.values().find(|u| &u.user_id == id).cloned())
                .collect())
        }

        async fn check_users_exist(&self, user_ids: &[String]) -> Result<Vec<String>, DirectoryError> {
            let users = self.users.lock().unwrap();
            Ok(user_ids
                .iter()
                .filter(|id| users.values().any(|u| &u.user_id == *id))
                .cloned()
                .collect())
        }
    }

    #[async_trait]
    impl Authorizer for MockDirectory {
        async fn is_active_user(&self, user_id: &str) -> Result<bool, DirectoryError> {
            Ok(self
                .active
                .lock()
                .unwrap()
                .get(user_id)
                .copied()
                .unwrap_or(false))
        }
    }

    #[async_trait]
    impl OrgDirectory for MockDirectory {
        async fn get_by_name(&self, orgname: &str) -> Result<Option<String>, DirectoryError> {
            Ok(self.orgs.lock().unwrap().get(orgname).cloned())
        }

        async fn is_member(&self, user_id: &str, org_creator_id: &str) -> Result<bool, DirectoryError> {
            Ok(self
                .org_members
                .lock()
                .unwrap()
                .get(&(user_id.to_owned(), org_creator_id.to_owned()))
                .copied()
                .unwrap_or(false))
        }
    }
}
