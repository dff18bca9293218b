//! 任务监管：取消令牌管理
//!
//! 持有进程级根 CancellationToken；每次在途编排登记一个独立的子 token（同一 task id 可有多个），
//! cancel(task_id) 取消该 id 下登记的全部 token，cancel_all 取消全部。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 单次编排的取消令牌；结束时交回 `release`
#[derive(Debug, Clone)]
pub struct TaskTicket {
    id: u64,
    token: CancellationToken,
}

impl TaskTicket {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// 任务级生命周期管理：按 task id 登记 / 取消在途编排
#[derive(Debug)]
pub struct TaskSupervisor {
    root: CancellationToken,
    next_id: AtomicU64,
    tasks: RwLock<HashMap<String, HashMap<u64, CancellationToken>>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            next_id: AtomicU64::new(0),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// 为一次编排登记新的子 token
    pub async fn register(&self, task_id: &str) -> TaskTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.root.child_token();
        self.tasks
            .write()
            .await
            .entry(task_id.to_string())
            .or_default()
            .insert(id, token.clone());
        TaskTicket { id, token }
    }

    /// 取消某个任务的全部在途编排；返回是否有在途编排
    pub async fn cancel(&self, task_id: &str) -> bool {
        match self.tasks.read().await.get(task_id) {
            Some(calls) if !calls.is_empty() => {
                for token in calls.values() {
                    token.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// 取消全部任务（进程退出时）
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    /// 编排结束后注销；该 id 下最后一个注销时删除条目
    pub async fn release(&self, task_id: &str, ticket: &TaskTicket) {
        let mut tasks = self.tasks.write().await;
        if let Some(calls) = tasks.get_mut(task_id) {
            calls.remove(&ticket.id);
            if calls.is_empty() {
                tasks.remove(task_id);
            }
        }
    }

    /// 某任务当前登记的在途编排数
    pub async fn in_flight(&self, task_id: &str) -> usize {
        self.tasks.read().await.get(task_id).map_or(0, |c| c.len())
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
