use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use super::Error;

/// A list has at most `MEMBER_CAP` members (SPEC_FULL.md §3).
pub const MEMBER_CAP: i64 = 255;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Member {
    pub list_id: String,
    pub user_id: String,
    pub last_updated: i64,
}

#[derive(Debug, Clone)]
pub struct MemberRepository {
    pool: PgPool,
}

impl MemberRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn add(&self, list_id: &str, user_id: &str, now: i64) -> Result<(), Error> {
        let count = sqlx::query_scalar!(
            r#"SELECT COUNT(*) as "count!" FROM members WHERE list_id = $1"#,
            list_id,
        )
        .fetch_one(&self.pool)
        .await?;

        if count >= MEMBER_CAP {
            return Err(Error::InvalidInput(format!(
                "list {list_id} already has the maximum of {MEMBER_CAP} members"
            )));
        }

        sqlx::query!(
            r#"
            INSERT INTO members (list_id, user_id, last_updated)
            VALUES ($1, $2, $3)
            ON CONFLICT (list_id, user_id) DO UPDATE SET last_updated = EXCLUDED.last_updated
            "#,
            list_id,
            user_id,
            now,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove(&self, list_id: &str, user_id: &str) -> Result<(), Error> {
        sqlx::query!(
            "DELETE FROM members WHERE list_id = $1 AND user_id = $2",
            list_id,
            user_id,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn is_member(&self, list_id: &str, user_id: &str) -> Result<bool, Error> {
        let found = sqlx::query_scalar!(
            r#"SELECT EXISTS(SELECT 1 FROM members WHERE list_id = $1 AND user_id = $2) as "found!""#,
            list_id,
            user_id,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(found)
    }

    pub async fn list_for(&self, list_id: &str) -> Result<Vec<Member>, Error> {
        let members = sqlx::query_as!(
            Member,
            "SELECT list_id, user_id, last_updated FROM members WHERE list_id = $1 ORDER BY user_id",
            list_id,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(members)
    }

    /// `get_unsent_recipients`: up to `limit` members of `list_id` for which no
    /// sent-log row exists for `msg_id`, as a single anti-join (SPEC_FULL.md §4.1).
    pub async fn unsent_recipients(
        &self,
        list_id: &str,
        msg_id: &str,
        limit: i64,
    ) -> Result<Vec<String>, Error> {
        let ids = sqlx::query_scalar!(
            r#"
            SELECT m.user_id FROM members m
            LEFT JOIN sent_log s
                ON s.list_id = m.list_id AND s.user_id = m.user_id AND s.msg_id = $2
            WHERE m.list_id = $1 AND s.user_id IS NULL
            ORDER BY m.user_id
            LIMIT $3
            "#,
            list_id,
            msg_id,
            limit,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}
