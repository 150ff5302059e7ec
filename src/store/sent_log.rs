use sqlx::PgPool;

use super::Error;

/// Per-(list, message, recipient) delivery log. Existence of a row means the
/// message was handed to the outbound mailer for that recipient
/// (SPEC_FULL.md §3, §4.1).
#[derive(Debug, Clone)]
pub struct SentLogRepository {
    pool: PgPool,
}

impl SentLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Bulk insert in `allow_conflict` mode: a retried `send` batch is
    /// idempotent because the unique key on (list_id, msg_id, user_id)
    /// silently absorbs duplicates (SPEC_FULL.md §4.1, §4.5).
    pub async fn bulk_insert(
        &self,
        list_id: &str,
        msg_id: &str,
        user_ids: &[String],
        now: i64,
    ) -> Result<(), Error> {
        if user_ids.is_empty() {
            return Ok(());
        }

        sqlx::query!(
            r#"
            INSERT INTO sent_log (list_id, msg_id, user_id, sent_time)
            SELECT $1, $2, u, $4 FROM UNNEST($3::text[]) AS u
            ON CONFLICT (list_id, msg_id, user_id) DO NOTHING
            "#,
            list_id,
            msg_id,
            user_ids,
            now,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete_for_list(&self, list_id: &str) -> Result<(), Error> {
        sqlx::query!("DELETE FROM sent_log WHERE list_id = $1", list_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
