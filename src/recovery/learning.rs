//! 学习信号采集：记录成功恢复的片段，用于后续策略改进
//!
//! 只有 RESUME 结果会写入 LearningRecord（只追加、写后不改）；每写入一条，
//! 向外部训练/改进流程发送一次「策略待更新」信号。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::core::{RecoveryError, TaskState, TraceEntry};

/// 一次恢复尝试的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryOutcome {
    Resume,
    Fallback,
}

/// 学习记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRecord {
    pub id: String,
    pub task_id: String,
    pub trace: Vec<TraceEntry>,
    pub diagnosis_report: Option<String>,
    pub outcome: RecoveryOutcome,
    /// 毫秒时间戳
    pub timestamp: i64,
}

/// 「策略待更新」信号
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyUpdate {
    pub record_id: String,
    pub task_id: String,
}

/// 只追加的学习记录存储
#[async_trait]
pub trait LearningStore: Send + Sync {
    async fn append(&self, record: &LearningRecord) -> Result<(), RecoveryError>;

    async fn records(&self) -> Result<Vec<LearningRecord>, RecoveryError>;
}

/// 内存存储
#[derive(Debug, Default)]
pub struct InMemoryLearningStore {
    records: RwLock<Vec<LearningRecord>>,
}

impl InMemoryLearningStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LearningStore for InMemoryLearningStore {
    async fn append(&self, record: &LearningRecord) -> Result<(), RecoveryError> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn records(&self) -> Result<Vec<LearningRecord>, RecoveryError> {
        Ok(self.records.read().await.clone())
    }
}

/// JSONL 文件存储：每条记录一行，只追加
#[derive(Debug)]
pub struct JsonlLearningStore {
    path: PathBuf,
    /// 串行化同一进程内的追加写
    write_lock: Mutex<()>,
}

impl JsonlLearningStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn store_err(e: impl std::fmt::Display) -> RecoveryError {
    RecoveryError::Store(e.to_string())
}

#[async_trait]
impl LearningStore for JsonlLearningStore {
    async fn append(&self, record: &LearningRecord) -> Result<(), RecoveryError> {
        let mut line = serde_json::to_string(record).map_err(store_err)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(store_err)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(store_err)?;
        file.write_all(line.as_bytes()).await.map_err(store_err)?;
        file.flush().await.map_err(store_err)
    }

    async fn records(&self) -> Result<Vec<LearningRecord>, RecoveryError> {
        if !tokio::fs::try_exists(&self.path).await.map_err(store_err)? {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&self.path).await.map_err(store_err)?;
        data.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(store_err))
            .collect()
    }
}

/// LearningSink：过滤 RESUME、写入存储、发送策略更新信号
pub struct LearningSink {
    store: Arc<dyn LearningStore>,
    signal_tx: mpsc::UnboundedSender<PolicyUpdate>,
}

impl LearningSink {
    /// 返回 sink 与策略更新信号接收端
    pub fn new(store: Arc<dyn LearningStore>) -> (Self, mpsc::UnboundedReceiver<PolicyUpdate>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        (Self { store, signal_tx }, signal_rx)
    }

    pub fn store(&self) -> &Arc<dyn LearningStore> {
        &self.store
    }

    /// 记录恢复结果；非 RESUME 不写入，返回 Ok(None)
    pub async fn record(
        &self,
        task_id: &str,
        state: &TaskState,
        outcome: RecoveryOutcome,
    ) -> Result<Option<LearningRecord>, RecoveryError> {
        if outcome != RecoveryOutcome::Resume {
            return Ok(None);
        }

        let record = LearningRecord {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            trace: state.trace.clone(),
            diagnosis_report: state.diagnosis_report.clone(),
            outcome,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.store.append(&record).await?;

        tracing::info!(record_id = %record.id, "recovery recorded, policy update due");
        if self
            .signal_tx
            .send(PolicyUpdate {
                record_id: record.id.clone(),
                task_id: task_id.to_string(),
            })
            .is_err()
        {
            tracing::debug!("no policy update listener");
        }
        Ok(Some(record))
    }
}
