//! C4: Thread Reconciler. Assigns parent/thread identifiers and maintains the
//! transitive-closure tree (SPEC_FULL.md §4.4). Runs inside the `mail` worker.

use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::store::{self, MessageRepository, TreeRepository};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("message {0}/{1} not found")]
    NotFound(String, String),
    #[error(transparent)]
    Storage(#[from] store::Error),
}

pub struct ThreadReconciler {
    messages: Arc<MessageRepository>,
    tree: Arc<TreeRepository>,
}

impl ThreadReconciler {
    pub fn new(messages: Arc<MessageRepository>, tree: Arc<TreeRepository>) -> Self {
        Self { messages, tree }
    }

    /// Runs the full algorithm of SPEC_FULL.md §4.4 for `(list_id, msg_id)`.
    /// Idempotent: a message already marked `processed` is a no-op.
    #[tracing::instrument(skip(self), fields(list_id, msg_id))]
    pub async fn reconcile(&self, list_id: &str, msg_id: &str, now: i64) -> Result<(), ReconcileError> {
        // Step 1.
        let message = self
            .messages
            .find(list_id, msg_id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(list_id.to_owned(), msg_id.to_owned()))?;

        if message.processed {
            trace!("already processed, skipping");
            return Ok(());
        }

        // Step 2: parent resolution.
        let (parent_id, thread_id) = if message.in_reply_to.is_empty() {
            (msg_id.to_owned(), msg_id.to_owned())
        } else {
            match self.messages.find(list_id, &message.in_reply_to).await? {
                Some(parent) if parent.processed => (message.in_reply_to.clone(), parent.thread_id),
                _ => (msg_id.to_owned(), String::new()),
            }
        };

        self.messages
            .set_parent_and_thread(list_id, msg_id, &parent_id, &thread_id)
            .await?;

        // Step 3: self-edge.
        self.tree.insert_self_edge(list_id, msg_id, now).await?;

        // Step 4: ancestor edges, only when a processed parent was found.
        if parent_id != msg_id {
            self.tree
                .insert_ancestor_edges(list_id, msg_id, &parent_id, now)
                .await?;
        }

        // Step 5: late-parent reconciliation over provisional-root children.
        let orphans = self.messages.orphans_waiting_for(list_id, msg_id).await?;
        for orphan in orphans {
            let provisional_root = orphan.msg_id.clone();

            self.messages
                .set_parent_and_thread(list_id, &provisional_root, msg_id, &thread_id)
                .await?;

            self.messages
                .propagate_thread_id(list_id, &provisional_root, &thread_id)
                .await?;

            self.tree
                .insert_cross_edges(list_id, msg_id, &provisional_root, now)
                .await?;
        }

        // Step 6: commit.
        self.messages.mark_processed(list_id, msg_id).await?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::{ListRepository, NewList, NewMessage};
    use sqlx::PgPool;

    async fn setup(pool: &PgPool) -> (ThreadReconciler, MessageRepository, String) {
        let lists = ListRepository::new(pool.clone());
        let list = lists
            .create(
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
            .unwrap();

        let messages = MessageRepository::new(pool.clone());
        let tree = TreeRepository::new(pool.clone());
        let reconciler = ThreadReconciler::new(Arc::new(messages.clone()), Arc::new(tree));

        (reconciler, messages, list.list_id)
    }

    fn new_message(list_id: &str, msg_id: &str, in_reply_to: &str) -> NewMessage {
        NewMessage {
            list_id: list_id.to_owned(),
            msg_id: msg_id.to_owned(),
            user_id: "u".to_owned(),
            creation_time: 1,
            spf_pass: true,
            dkim_pass: true,
            subject: "hi".to_owned(),
            in_reply_to: in_reply_to.to_owned(),
        }
    }

    #[sqlx::test]
    async fn root_message_becomes_its_own_thread(pool: PgPool) {
        let (reconciler, messages, list_id) = setup(&pool).await;
        messages
            .insert_if_absent(&new_message(&list_id, "<root@x>", ""))
            .await
            .unwrap();

        reconciler.reconcile(&list_id, "<root@x>", 1).await.unwrap();

        let root = messages.find(&list_id, "<root@x>").await.unwrap().unwrap();
        assert!(root.is_thread_root());
        assert!(root.processed);
    }

    #[sqlx::test]
    async fn late_parent_reconciles_orphan_child(pool: PgPool) {
        let (reconciler, messages, list_id) = setup(&pool).await;

        // Child arrives first, referencing a parent that hasn't landed yet.
        messages
            .insert_if_absent(&new_message(&list_id, "<child@x>", "<root@x>"))
            .await
            .unwrap();
        reconciler.reconcile(&list_id, "<child@x>", 1).await.unwrap();

        let child = messages.find(&list_id, "<child@x>").await.unwrap().unwrap();
        assert_eq!(child.thread_id, "");
        assert_eq!(child.parent_id, "<child@x>");

        // Parent lands, should pull the child into its thread.
        messages
            .insert_if_absent(&new_message(&list_id, "<root@x>", ""))
            .await
            .unwrap();
        reconciler.reconcile(&list_id, "<root@x>", 2).await.unwrap();

        let child = messages.find(&list_id, "<child@x>").await.unwrap().unwrap();
        assert_eq!(child.parent_id, "<root@x>");
        assert_eq!(child.thread_id, "<root@x>");
    }
}
