use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use super::Error;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SenderPolicy {
    Owner,
    Member,
    User,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MemberPolicy {
    Owner,
    User,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct List {
    pub list_id: String,
    pub creator_id: String,
    pub listname: String,
    pub display_name: String,
    pub description: String,
    pub archive: bool,
    pub sender_policy: SenderPolicy,
    pub member_policy: MemberPolicy,
    pub last_updated: i64,
    pub creation_time: i64,
}

impl List {
    /// `list_id = creator_id ⊕ "." ⊕ listname` (SPEC_FULL.md §3).
    pub fn make_list_id(creator_id: &str, listname: &str) -> String {
        format!("{creator_id}.{listname}")
    }
}

#[derive(Debug, Clone)]
pub struct NewList {
    pub creator_id: String,
    pub listname: String,
    pub display_name: String,
    pub description: String,
    pub sender_policy: SenderPolicy,
    pub member_policy: MemberPolicy,
}

#[derive(Debug, Clone)]
pub struct ListRepository {
    pool: PgPool,
}

impl ListRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewList, now: i64) -> Result<List, Error> {
        let list_id = List::make_list_id(&new.creator_id, &new.listname);

        let list = sqlx::query_as!(
            List,
            r#"
            INSERT INTO lists (list_id, creator_id, listname, display_name, description,
                                sender_policy, member_policy, last_updated, creation_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING list_id, creator_id, listname, display_name, description, archive,
                      sender_policy as "sender_policy: _",
                      member_policy as "member_policy: _",
                      last_updated, creation_time
            "#,
            list_id,
            new.creator_id,
            new.listname,
            new.display_name,
            new.description,
            new.sender_policy as _,
            new.member_policy as _,
            now,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(list)
    }

    pub async fn find_by_id(&self, list_id: &str) -> Result<Option<List>, Error> {
        let list = sqlx::query_as!(
            List,
            r#"
            SELECT list_id, creator_id, listname, display_name, description, archive,
                   sender_policy as "sender_policy: _",
                   member_policy as "member_policy: _",
                   last_updated, creation_time
            FROM lists WHERE list_id = $1
            "#,
            list_id,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(list)
    }

    /// `touch_list(list_id, t)`: updates `last_updated` on the list row and
    /// every member row atomically (SPEC_FULL.md §4.1). Implemented as two
    /// statements in one transaction rather than a round trip per member.
    pub async fn touch_list(&self, list_id: &str, now: i64) -> Result<(), Error> {
        let mut tx = self.pool.begin().await.map_err(Error::from)?;

        sqlx::query!(
            "UPDATE lists SET last_updated = $2 WHERE list_id = $1",
            list_id,
            now,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query!(
            "UPDATE members SET last_updated = $2 WHERE list_id = $1",
            list_id,
            now,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await.map_err(Error::from)?;

        Ok(())
    }

    pub async fn set_archived(&self, list_id: &str, archive: bool) -> Result<(), Error> {
        sqlx::query!(
            "UPDATE lists SET archive = $2 WHERE list_id = $1",
            list_id,
            archive,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete(&self, list_id: &str) -> Result<(), Error> {
        sqlx::query!("DELETE FROM lists WHERE list_id = $1", list_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Lists owned by `creator_id`, paged for `creator_delete` (SPEC_FULL.md §4.6).
    pub async fn list_ids_for_creator(
        &self,
        creator_id: &str,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<String>, Error> {
        let ids = sqlx::query_scalar!(
            r#"
            SELECT list_id FROM lists
            WHERE creator_id = $1 AND ($2::text IS NULL OR list_id > $2)
            ORDER BY list_id
            LIMIT $3
            "#,
            creator_id,
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

    #[sqlx::test]
    async fn create_and_touch(pool: PgPool) {
        let repo = ListRepository::new(pool.clone());
        let members = super::super::MemberRepository::new(pool);

        let list = repo
            .create(
                &NewList {
                    creator_id: "u".to_owned(),
                    listname: "chatter".to_owned(),
                    display_name: "Chatter".to_owned(),
                    description: String::new(),
                    sender_policy: SenderPolicy::Member,
                    member_policy: MemberPolicy::Owner,
                },
                1_000,
            )
            .await
            .unwrap();
        assert_eq!(list.list_id, "u.chatter");

        members.add(&list.list_id, "alice", 1_000).await.unwrap();
        members.add(&list.list_id, "bob", 1_000).await.unwrap();

        repo.touch_list(&list.list_id, 2_000).await.unwrap();

        let reloaded = repo.find_by_id(&list.list_id).await.unwrap().unwrap();
        assert_eq!(reloaded.last_updated, 2_000);

        let all_members = members.list_for(&list.list_id).await.unwrap();
        assert!(all_members.iter().all(|m| m.last_updated == 2_000));
    }
}
