//! C6: Cascade Cleanup. `delete_list` and `creator_delete` (SPEC_FULL.md §4.6).

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::store::{self, ListRepository, MemberRepository, MessageRepository, ObjectStore, SentLogRepository, TreeRepository};

const BATCH: i64 = 256;

#[derive(Debug, Error)]
pub enum CascadeError {
    #[error(transparent)]
    Storage(#[from] store::Error),
    #[error(transparent)]
    Blob(#[from] store::BlobError),
    #[error("cancelled")]
    Cancelled,
}

pub struct CascadeCleanup {
    lists: Arc<ListRepository>,
    members: Arc<MemberRepository>,
    messages: Arc<MessageRepository>,
    tree: Arc<TreeRepository>,
    sent_log: Arc<SentLogRepository>,
    blobs: Arc<dyn ObjectStore>,
}

impl CascadeCleanup {
    pub fn new(
        lists: Arc<ListRepository>,
        members: Arc<MemberRepository>,
        messages: Arc<MessageRepository>,
        tree: Arc<TreeRepository>,
        sent_log: Arc<SentLogRepository>,
        blobs: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            lists,
            members,
            messages,
            tree,
            sent_log,
            blobs,
        }
    }

    /// SPEC_FULL.md §4.6's four-step `delete_list`.
    #[tracing::instrument(skip(self))]
    pub async fn delete_list(&self, list_id: &str, now: i64) -> Result<(), CascadeError> {
        // Step 1: message batches — blobs, sent log, then scrub the row.
        let mut after = None;
        loop {
            let ids = self.messages.msg_ids_for_list(list_id, after.as_deref(), BATCH).await?;
            if ids.is_empty() {
                break;
            }

            for msg_id in &ids {
                self.blobs.del(list_id, msg_id).await.ok();
            }

            self.sent_log.delete_for_list(list_id).await?;

            for msg_id in &ids {
                self.messages.scrub(list_id, msg_id).await?;
            }

            after = ids.last().cloned();
        }

        // Step 2.
        self.tree.delete_for_list(list_id).await?;

        // Step 3.
        for member in self.members.list_for(list_id).await? {
            self.members.remove(list_id, &member.user_id).await?;
        }

        // Step 4.
        self.lists.delete(list_id).await?;

        info!(list_id, now, "list deleted");

        Ok(())
    }

    /// Pages through `creator_id`'s lists in batches of 256, pinging the
    /// caller between batches to keep the enclosing delivery lease alive
    /// (SPEC_FULL.md §4.6, §5's cancellation-between-batches requirement).
    pub async fn creator_delete(
        &self,
        creator_id: &str,
        now: i64,
        ping: impl Fn(),
        cancel: &CancellationToken,
    ) -> Result<(), CascadeError> {
        let mut after = None;
        loop {
            if cancel.is_cancelled() {
                return Err(CascadeError::Cancelled);
            }

            let ids = self.lists.list_ids_for_creator(creator_id, after.as_deref(), BATCH).await?;
            if ids.is_empty() {
                return Ok(());
            }

            for list_id in &ids {
                self.delete_list(list_id, now).await?;
            }

            after = ids.last().cloned();
            ping();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::{LocalBlobStore, MemberPolicy, NewList, SenderPolicy};
    use sqlx::PgPool;

    #[sqlx::test]
    async fn delete_list_removes_everything(pool: PgPool) {
        let lists = Arc::new(ListRepository::new(pool.clone()));
        let members = Arc::new(MemberRepository::new(pool.clone()));
        let messages = Arc::new(MessageRepository::new(pool.clone()));
        let tree = Arc::new(TreeRepository::new(pool.clone()));
        let sent_log = Arc::new(SentLogRepository::new(pool.clone()));
        let dir = std::env::temp_dir().join(format!("threadmail-cascade-{}", rand::random::<u64>()));
        let blobs: Arc<dyn ObjectStore> = Arc::new(LocalBlobStore::new(dir));

        let list = lists
            .create(
                &NewList {
                    creator_id: "u".to_owned(),
                    listname: "chatter".to_owned(),
                    display_name: String::new(),
                    description: String::new(),
                    sender_policy: SenderPolicy::User,
                    member_policy: MemberPolicy::User,
                },
                0,
            )
            .await
            .unwrap();
        members.add(&list.list_id, "u2", 0).await.unwrap();

        let cascade = CascadeCleanup::new(lists.clone(), members, messages, tree, sent_log, blobs);
        cascade.delete_list(&list.list_id, 1).await.unwrap();

        assert!(lists.find_by_id(&list.list_id).await.unwrap().is_none());
    }
}
