//! Mailbox resolution and sender-policy evaluation (SPEC_FULL.md §4.3).

use thiserror::Error;

use crate::directory::{Authorizer, OrgDirectory};
use crate::store::{List, MemberRepository, SenderPolicy};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MailboxError {
    #[error("unknown mailbox")]
    UnknownMailbox,
    #[error("wrong system domain")]
    WrongSystemDomain,
    #[error("list archived")]
    ListArchived,
    #[error("unauthorized sender")]
    Unauthorized,
    #[error("mailbox misconfigured")]
    Misconfigured,
}

/// Parses `<creator>.<listname>@domain` and decides, from the domain alone,
/// whether `creator` names a user or an org (SPEC_FULL.md §4.3). Returns the
/// `list_id` candidate (`creator.listname`) the caller should look up in C1.
pub fn resolve_mailbox_candidate(
    rcpt_local: &str,
    rcpt_domain: &str,
    usrdomain: &str,
    orgdomain: &str,
) -> Result<String, MailboxError> {
    let (creator, listname) = rcpt_local
        .split_once('.')
        .ok_or(MailboxError::UnknownMailbox)?;
    if creator.is_empty() || listname.is_empty() {
        return Err(MailboxError::UnknownMailbox);
    }

    let creator_id = if rcpt_domain.eq_ignore_ascii_case(usrdomain) {
        creator.to_owned()
    } else if rcpt_domain.eq_ignore_ascii_case(orgdomain) {
        format!("org.{creator}")
    } else {
        return Err(MailboxError::WrongSystemDomain);
    };

    Ok(format!("{creator_id}.{listname}"))
}

/// Evaluates `list.sender_policy` for `sender_user_id` (SPEC_FULL.md §4.3).
pub async fn check_sender_policy(
    list: &List,
    sender_user_id: &str,
    members: &MemberRepository,
    authorizer: &dyn Authorizer,
    orgs: &dyn OrgDirectory,
) -> Result<(), MailboxError> {
    if list.archive {
        return Err(MailboxError::ListArchived);
    }

    match list.sender_policy {
        SenderPolicy::Owner => {
            let is_owner = if let Some(org_creator) = list.creator_id.strip_prefix("org.") {
                orgs.is_member(sender_user_id, org_creator)
                    .await
                    .map_err(|_| MailboxError::Misconfigured)?
            } else {
                sender_user_id == list.creator_id
            };
            if !is_owner {
                return Err(MailboxError::Unauthorized);
            }
        }
        SenderPolicy::Member => {
            let active = authorizer
                .is_active_user(sender_user_id)
                .await
                .map_err(|_| MailboxError::Misconfigured)?;
            let member = members
                .is_member(&list.list_id, sender_user_id)
                .await
                .map_err(|_| MailboxError::Misconfigured)?;
            if !active || !member {
                return Err(MailboxError::Unauthorized);
            }
        }
        SenderPolicy::User => {
            let active = authorizer
                .is_active_user(sender_user_id)
                .await
                .map_err(|_| MailboxError::Misconfigured)?;
            if !active {
                return Err(MailboxError::Unauthorized);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_user_domain() {
        let list_id =
            resolve_mailbox_candidate("alice.chatter", "lists.mail.localhost", "lists.mail.localhost", "org.lists.mail.localhost")
                .unwrap();
        assert_eq!(list_id, "alice.chatter");
    }

    #[test]
    fn parses_org_domain() {
        let list_id = resolve_mailbox_candidate(
            "acme.chatter",
            "org.lists.mail.localhost",
            "lists.mail.localhost",
            "org.lists.mail.localhost",
        )
        .unwrap();
        assert_eq!(list_id, "org.acme.chatter");
    }

    #[test]
    fn rejects_unknown_domain() {
        let err = resolve_mailbox_candidate(
            "alice.chatter",
            "evil.example",
            "lists.mail.localhost",
            "org.lists.mail.localhost",
        )
        .unwrap_err();
        assert_eq!(err, MailboxError::WrongSystemDomain);
    }
}
