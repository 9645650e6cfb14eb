//! 工作流存储
//!
//! 待恢复记录表与执行上下文表。存储对象显式注入编排器，测试可替换实现。
//! take_pending 原子地取走记录：同一实例的并发恢复只有一个能拿到。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::workflow::types::{ExecutionContext, PendingExecution};

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn put_pending(&self, pending: PendingExecution);

    /// 取走（认领）待恢复记录
    async fn take_pending(&self, instance_id: &str) -> Option<PendingExecution>;

    async fn peek_pending(&self, instance_id: &str) -> Option<PendingExecution>;

    async fn pending_ids(&self) -> Vec<String>;

    async fn put_context(&self, ctx: ExecutionContext);

    async fn context(&self, instance_id: &str) -> Option<ExecutionContext>;

    async fn remove_context(&self, instance_id: &str) -> Option<ExecutionContext>;
}

/// 进程内存储
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    pending: RwLock<HashMap<String, PendingExecution>>,
    contexts: RwLock<HashMap<String, ExecutionContext>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn put_pending(&self, pending: PendingExecution) {
        self.pending
            .write()
            .await
            .insert(pending.instance_id.clone(), pending);
    }

    async fn take_pending(&self, instance_id: &str) -> Option<PendingExecution> {
        self.pending.write().await.remove(instance_id)
    }

    async fn peek_pending(&self, instance_id: &str) -> Option<PendingExecution> {
        self.pending.read().await.get(instance_id).cloned()
    }

    async fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.pending.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn put_context(&self, ctx: ExecutionContext) {
        self.contexts
            .write()
            .await
            .insert(ctx.instance_id.clone(), ctx);
    }

    async fn context(&self, instance_id: &str) -> Option<ExecutionContext> {
        self.contexts.read().await.get(instance_id).cloned()
    }

    async fn remove_context(&self, instance_id: &str) -> Option<ExecutionContext> {
        self.contexts.write().await.remove(instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::WorkflowState;

    #[tokio::test]
    async fn test_take_pending_claims_once() {
        let store = InMemoryWorkflowStore::new();
        store
            .put_pending(PendingExecution::new(
                "wf-1",
                WorkflowState::Executing { current_agent_index: 0 },
                true,
            ))
            .await;
        assert_eq!(store.pending_ids().await, vec!["wf-1".to_string()]);
        assert!(store.take_pending("wf-1").await.is_some());
        assert!(store.take_pending("wf-1").await.is_none());
        assert!(store.peek_pending("wf-1").await.is_none());
    }

    #[tokio::test]
    async fn test_context_roundtrip() {
        let store = InMemoryWorkflowStore::new();
        store.put_context(ExecutionContext::new("wf-2", "task", false)).await;
        assert_eq!(store.context("wf-2").await.unwrap().task, "task");
        assert!(store.remove_context("wf-2").await.is_some());
        assert!(store.context("wf-2").await.is_none());
    }
}
