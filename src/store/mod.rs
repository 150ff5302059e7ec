//! C1: List Store. Persistent storage for lists, members, messages, thread
//! closure and the per-recipient delivery log.

mod blob;
mod list;
mod member;
mod message;
mod sent_log;
mod tree;

pub use blob::{BlobError, LocalBlobStore, ObjectStore};
pub use list::{List, ListRepository, MemberPolicy, NewList, SenderPolicy};
pub use member::{Member, MemberRepository, MEMBER_CAP};
pub use message::{Message, MessageRepository, NewMessage};
pub use sent_log::SentLogRepository;
pub use tree::{TreeEdge, TreeRepository};

use thiserror::Error;

/// Error taxonomy shared by every C1/C4/C6 repository, grounded on
/// `models/mod.rs`'s `Error` enum and its `From<sqlx::Error>` classification.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("foreign key violation")]
    ForeignKeyViolation,
    #[error("conflict")]
    Conflict,
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    InvalidInput(String),
}

impl From<sqlx::Error> for Error {
    fn from(sql: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &sql {
            if db_err.is_unique_violation() {
                return Error::Conflict;
            }
            if db_err.is_foreign_key_violation() {
                return Error::ForeignKeyViolation;
            }
        }
        if matches!(sql, sqlx::Error::RowNotFound) {
            return Error::NotFound("not found");
        }
        Error::Database(sql)
    }
}

impl Error {
    /// The error-handling-design kind from SPEC_FULL.md §7, used by C3 to map
    /// storage failures to SMTP reply codes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Database(_) => ErrorKind::Transient,
            Error::ForeignKeyViolation => ErrorKind::InvalidInput,
            Error::Conflict => ErrorKind::UniqueViolation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    UniqueViolation,
    Unauthorized,
    Transient,
    Fatal,
}
