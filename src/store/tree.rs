use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use super::Error;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TreeEdge {
    pub list_id: String,
    pub msg_id: String,
    pub parent_id: String,
    pub depth: i32,
    pub creation_time: i64,
}

/// Relational encoding of the thread tree as the set of all
/// `(descendant, ancestor, distance)` triples (SPEC_FULL.md §3, §9).
#[derive(Debug, Clone)]
pub struct TreeRepository {
    pool: PgPool,
}

impl TreeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Step 3: the self-edge `(msg_id, msg_id, 0)` that exists for every
    /// reconciled message.
    pub async fn insert_self_edge(
        &self,
        list_id: &str,
        msg_id: &str,
        now: i64,
    ) -> Result<(), Error> {
        sqlx::query!(
            r#"
            INSERT INTO tree_edges (list_id, msg_id, parent_id, depth, creation_time)
            VALUES ($1, $2, $2, 0, $3)
            ON CONFLICT (list_id, msg_id, parent_id) DO NOTHING
            "#,
            list_id,
            msg_id,
            now,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Step 4: inserts `(msg_id, a, depth_a+1)` for every ancestor `a` of
    /// `parent_id`, by self-joining the tree table on `parent_id`'s existing
    /// ancestor rows — a single statement, per SPEC_FULL.md §9's instruction
    /// not to emulate this with per-row loops.
    pub async fn insert_ancestor_edges(
        &self,
        list_id: &str,
        msg_id: &str,
        parent_id: &str,
        now: i64,
    ) -> Result<(), Error> {
        sqlx::query!(
            r#"
            INSERT INTO tree_edges (list_id, msg_id, parent_id, depth, creation_time)
            SELECT $1, $2, t.parent_id, t.depth + 1, $4
            FROM tree_edges t
            WHERE t.list_id = $1 AND t.msg_id = $3
            ON CONFLICT (list_id, msg_id, parent_id) DO NOTHING
            "#,
            list_id,
            msg_id,
            parent_id,
            now,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Step 5c: cross-edges between every ancestor of `this` and every
    /// descendant of `provisional_root` (inclusive), at the combined depth.
    /// Single self-join-and-insert statement, per SPEC_FULL.md §9.
    pub async fn insert_cross_edges(
        &self,
        list_id: &str,
        this_msg_id: &str,
        provisional_root: &str,
        now: i64,
    ) -> Result<u64, Error> {
        let result = sqlx::query!(
            r#"
            INSERT INTO tree_edges (list_id, msg_id, parent_id, depth, creation_time)
            SELECT $1, descendant.msg_id, ancestor.parent_id,
                   ancestor.depth + descendant.depth + 1, $4
            FROM tree_edges ancestor
            CROSS JOIN tree_edges descendant
            WHERE ancestor.list_id = $1 AND ancestor.msg_id = $2
              AND descendant.list_id = $1 AND descendant.parent_id = $3
            ON CONFLICT (list_id, msg_id, parent_id) DO NOTHING
            "#,
            list_id,
            this_msg_id,
            provisional_root,
            now,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn ancestors_of(&self, list_id: &str, msg_id: &str) -> Result<Vec<TreeEdge>, Error> {
        let edges = sqlx::query_as!(
            TreeEdge,
            r#"
            SELECT list_id, msg_id, parent_id, depth, creation_time
            FROM tree_edges WHERE list_id = $1 AND msg_id = $2
            ORDER BY depth
            "#,
            list_id,
            msg_id,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(edges)
    }

    pub async fn delete_for_list(&self, list_id: &str) -> Result<(), Error> {
        sqlx::query!("DELETE FROM tree_edges WHERE list_id = $1", list_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
