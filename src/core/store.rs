//! 任务状态存储与追加式轨迹日志
//!
//! TaskStore：task id → TaskState，首次引用时创建、终态时删除；每个 task id 一把独占锁，
//! 不同 task id 之间完全并行。TraceLog：独立于 TaskState 的只追加日志，回滚不会丢失历史。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::core::{TaskState, TraceEntry};

/// 任务 ID
pub type TaskId = String;

#[derive(Debug)]
struct Slot {
    state: TaskState,
    /// 已从 store 中删除；等待中的持有者需要重新查找
    retired: bool,
}

/// 任务状态存储：按 task id 加锁
#[derive(Debug, Default)]
pub struct TaskStore {
    slots: RwLock<HashMap<TaskId, Arc<Mutex<Slot>>>>,
}

/// 持有某个 task id 的独占锁；drop 时释放
pub struct TaskGuard {
    task_id: TaskId,
    slot: OwnedMutexGuard<Slot>,
    handle: Arc<Mutex<Slot>>,
    created: bool,
}

impl TaskGuard {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// 本次获取是否新建了 TaskState
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn state(&self) -> &TaskState {
        &self.slot.state
    }

    pub fn state_mut(&mut self) -> &mut TaskState {
        &mut self.slot.state
    }
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取 task id 的独占锁；不存在时用 init 创建
    pub async fn acquire<F>(&self, task_id: &str, init: F) -> TaskGuard
    where
        F: Fn() -> TaskState,
    {
        loop {
            let (handle, created) = {
                let existing = self.slots.read().await.get(task_id).cloned();
                match existing {
                    Some(h) => (h, false),
                    None => {
                        let mut slots = self.slots.write().await;
                        let mut created = false;
                        let h = slots
                            .entry(task_id.to_string())
                            .or_insert_with(|| {
                                created = true;
                                Arc::new(Mutex::new(Slot {
                                    state: init(),
                                    retired: false,
                                }))
                            })
                            .clone();
                        (h, created)
                    }
                }
            };

            let slot = handle.clone().lock_owned().await;
            if slot.retired {
                // 前一个持有者已将其删除，重新查找或创建
                continue;
            }
            return TaskGuard {
                task_id: task_id.to_string(),
                slot,
                handle,
                created,
            };
        }
    }

    /// 终态时删除 TaskState（持锁调用）
    pub async fn discard(&self, mut guard: TaskGuard) {
        guard.slot.retired = true;
        let mut slots = self.slots.write().await;
        if let Some(current) = slots.get(&guard.task_id) {
            if Arc::ptr_eq(current, &guard.handle) {
                slots.remove(&guard.task_id);
            }
        }
        tracing::debug!(task_id = %guard.task_id, "task state discarded");
    }

    /// 读取当前状态的拷贝（会等待该 task 的在途编排结束）
    pub async fn snapshot(&self, task_id: &str) -> Option<TaskState> {
        let handle = self.slots.read().await.get(task_id).cloned()?;
        let slot = handle.lock().await;
        if slot.retired {
            None
        } else {
            Some(slot.state.clone())
        }
    }

    pub async fn contains(&self, task_id: &str) -> bool {
        self.slots.read().await.contains_key(task_id)
    }

    pub async fn active_count(&self) -> usize {
        self.slots.read().await.len()
    }
}

/// 追加式轨迹日志接口
#[async_trait]
pub trait TraceLog: Send + Sync {
    async fn append(&self, task_id: &str, entry: TraceEntry);

    /// 某任务的全部轨迹（按追加顺序）
    async fn entries(&self, task_id: &str) -> Vec<TraceEntry>;
}

/// 内存轨迹日志
#[derive(Debug, Default)]
pub struct InMemoryTraceLog {
    entries: RwLock<HashMap<TaskId, Vec<TraceEntry>>>,
}

impl InMemoryTraceLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TraceLog for InMemoryTraceLog {
    async fn append(&self, task_id: &str, entry: TraceEntry) {
        self.entries
            .write()
            .await
            .entry(task_id.to_string())
            .or_default()
            .push(entry);
    }

    async fn entries(&self, task_id: &str) -> Vec<TraceEntry> {
        self.entries
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_create_on_first_use() {
        let store = TaskStore::new();
        let guard = store
            .acquire("t1", || TaskState::new(vec!["a".into()], Default::default()))
            .await;
        assert!(guard.created());
        assert_eq!(guard.state().plan, vec!["a".to_string()]);
        drop(guard);

        let guard = store.acquire("t1", TaskState::default).await;
        assert!(!guard.created());
        assert_eq!(guard.state().plan, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_discard_removes_state() {
        let store = TaskStore::new();
        let guard = store.acquire("t1", TaskState::default).await;
        store.discard(guard).await;
        assert!(!store.contains("t1").await);
        assert!(store.snapshot("t1").await.is_none());
    }

    #[tokio::test]
    async fn test_waiter_after_discard_gets_fresh_state() {
        let store = Arc::new(TaskStore::new());
        let mut guard = store.acquire("t1", TaskState::default).await;
        guard.state_mut().plan.push("old".into());

        let s = store.clone();
        let waiter = tokio::spawn(async move {
            let g = s.acquire("t1", TaskState::default).await;
            (g.created(), g.state().plan.clone())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.discard(guard).await;

        let (_, plan) = waiter.await.unwrap();
        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn test_same_task_is_serialized() {
        let store = Arc::new(TaskStore::new());
        let guard = store.acquire("t1", TaskState::default).await;

        let s = store.clone();
        let pending = tokio::spawn(async move {
            let _g = s.acquire("t1", TaskState::default).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        // 不同 task id 不受影响
        let other = store.acquire("t2", TaskState::default).await;
        assert!(other.created());

        drop(guard);
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn test_trace_log_appends_in_order() {
        let log = InMemoryTraceLog::new();
        log.append("t1", TraceEntry::new("a", "1")).await;
        log.append("t1", TraceEntry::new("b", "2")).await;
        log.append("t2", TraceEntry::new("c", "3")).await;
        let entries = log.entries("t1").await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].action, "b");
        assert!(log.entries("t3").await.is_empty());
    }
}
