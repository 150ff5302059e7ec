use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use super::Error;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Message {
    pub list_id: String,
    pub msg_id: String,
    pub user_id: String,
    pub creation_time: i64,
    pub spf_pass: bool,
    pub dkim_pass: bool,
    pub subject: String,
    pub in_reply_to: String,
    pub parent_id: String,
    pub thread_id: String,
    pub processed: bool,
    pub sent: bool,
    pub deleted: bool,
}

impl Message {
    pub fn is_thread_root(&self) -> bool {
        self.parent_id == self.msg_id
    }
}

/// A message as created by the SMTP session, before thread reconciliation
/// (SPEC_FULL.md §4.3, step 6).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub list_id: String,
    pub msg_id: String,
    pub user_id: String,
    pub creation_time: i64,
    pub spf_pass: bool,
    pub dkim_pass: bool,
    pub subject: String,
    pub in_reply_to: String,
}

#[derive(Debug, Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts the pending message row. Returns `Ok(true)` if a new row was
    /// inserted, `Ok(false)` if `(list_id, msg_id)` already existed — the
    /// duplicate-suppression no-op of SPEC_FULL.md §4.3 step 4.
    pub async fn insert_if_absent(&self, new: &NewMessage) -> Result<bool, Error> {
        let result = sqlx::query!(
            r#"
            INSERT INTO messages (list_id, msg_id, user_id, creation_time, spf_pass, dkim_pass,
                                   subject, in_reply_to, parent_id, thread_id, processed, sent, deleted)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, '', '', FALSE, FALSE, FALSE)
            ON CONFLICT (list_id, msg_id) DO NOTHING
            "#,
            new.list_id,
            new.msg_id,
            new.user_id,
            new.creation_time,
            new.spf_pass,
            new.dkim_pass,
            new.subject,
            new.in_reply_to,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn find(&self, list_id: &str, msg_id: &str) -> Result<Option<Message>, Error> {
        let message = sqlx::query_as!(
            Message,
            r#"
            SELECT list_id, msg_id, user_id, creation_time, spf_pass, dkim_pass, subject,
                   in_reply_to, parent_id, thread_id, processed, sent, deleted
            FROM messages WHERE list_id = $1 AND msg_id = $2
            "#,
            list_id,
            msg_id,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(message)
    }

    /// Children that arrived before `msg_id` and made themselves provisional
    /// roots (`thread_id=""`, `in_reply_to = msg_id`) — SPEC_FULL.md §4.4 step 5.
    pub async fn orphans_waiting_for(
        &self,
        list_id: &str,
        msg_id: &str,
    ) -> Result<Vec<Message>, Error> {
        let orphans = sqlx::query_as!(
            Message,
            r#"
            SELECT list_id, msg_id, user_id, creation_time, spf_pass, dkim_pass, subject,
                   in_reply_to, parent_id, thread_id, processed, sent, deleted
            FROM messages
            WHERE list_id = $1 AND thread_id = '' AND in_reply_to = $2
            "#,
            list_id,
            msg_id,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(orphans)
    }

    pub async fn set_parent_and_thread(
        &self,
        list_id: &str,
        msg_id: &str,
        parent_id: &str,
        thread_id: &str,
    ) -> Result<(), Error> {
        sqlx::query!(
            r#"
            UPDATE messages SET parent_id = $3, thread_id = $4
            WHERE list_id = $1 AND msg_id = $2
            "#,
            list_id,
            msg_id,
            parent_id,
            thread_id,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Propagates `thread_id` to the whole subtree currently carrying
    /// `old_thread_id` as a single bulk statement (SPEC_FULL.md §4.4 step 5b,
    /// §9's instruction to keep this a single `UPDATE ... WHERE thread_id=''`).
    pub async fn propagate_thread_id(
        &self,
        list_id: &str,
        old_thread_id: &str,
        new_thread_id: &str,
    ) -> Result<u64, Error> {
        let result = sqlx::query!(
            r#"
            UPDATE messages SET thread_id = $3
            WHERE list_id = $1 AND thread_id = $2
            "#,
            list_id,
            old_thread_id,
            new_thread_id,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Step 6: the single-row update that commits reconciliation
    /// (SPEC_FULL.md §4.4).
    pub async fn mark_processed(&self, list_id: &str, msg_id: &str) -> Result<(), Error> {
        sqlx::query!(
            "UPDATE messages SET processed = TRUE WHERE list_id = $1 AND msg_id = $2",
            list_id,
            msg_id,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_sent(&self, list_id: &str, msg_id: &str) -> Result<(), Error> {
        sqlx::query!(
            "UPDATE messages SET sent = TRUE WHERE list_id = $1 AND msg_id = $2",
            list_id,
            msg_id,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Scrubs PII fields rather than deleting the row, so tree edges stay
    /// valid (SPEC_FULL.md §4.6, §9 third open question).
    pub async fn scrub(&self, list_id: &str, msg_id: &str) -> Result<(), Error> {
        sqlx::query!(
            r#"
            UPDATE messages
            SET deleted = TRUE, user_id = '', subject = '', spf_pass = FALSE, dkim_pass = FALSE
            WHERE list_id = $1 AND msg_id = $2
            "#,
            list_id,
            msg_id,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Message ids for `list_id` in ascending batches, for cascade cleanup
    /// (SPEC_FULL.md §4.6).
    pub async fn msg_ids_for_list(
        &self,
        list_id: &str,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<String>, Error> {
        let ids = sqlx::query_scalar!(
            r#"
            SELECT msg_id FROM messages
            WHERE list_id = $1 AND ($2::text IS NULL OR msg_id > $2) AND NOT deleted
            ORDER BY msg_id
            LIMIT $3
            "#,
            list_id,
            after,
            limit,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::{ListRepository, NewList};

    async fn make_list(pool: &PgPool) -> String {
        let repo = ListRepository::new(pool.clone());
        repo.create(
            &NewList {
                creator_id: "u".to_owned(),
                listname: "chatter".to_owned(),
                display_name: String::new(),
                description: String::new(),
                sender_policy: crate::store::SenderPolicy::Member,
                member_policy: crate::store::MemberPolicy::Owner,
            },
            0,
        )
        .await
        .unwrap()
        .list_id
    }

    #[sqlx::test]
    async fn duplicate_insert_is_a_no_op(pool: PgPool) {
        let list_id = make_list(&pool).await;
        let repo = MessageRepository::new(pool);

        let new = NewMessage {
            list_id: list_id.clone(),
            msg_id: "<m1@example.org>".to_owned(),
            user_id: "alice".to_owned(),
            creation_time: 1,
            spf_pass: true,
            dkim_pass: true,
            subject: "Hi".to_owned(),
            in_reply_to: String::new(),
        };

        assert!(repo.insert_if_absent(&new).await.unwrap());
        assert!(!repo.insert_if_absent(&new).await.unwrap());

        let found = repo.find(&list_id, &new.msg_id).await.unwrap().unwrap();
        assert_eq!(found.subject, "Hi");
    }
}
