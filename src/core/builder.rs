//! 编排器构建器：统一的组件初始化逻辑
//!
//! 未显式注入的外部服务按配置用 LLM 适配器补齐；学习存储按 [learning].path 选择 JSONL 或内存。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{AppConfig, TimeoutsSection};
use crate::core::orchestrator::{ActorRegistry, RecoveryOrchestrator};
use crate::core::{InMemoryTraceLog, TaskScheduler, TaskStore, TaskSupervisor, TraceLog};
use crate::llm::{create_llm_from_config, LlmClient};
use crate::recovery::{
    Critic, Diagnoser, Healer, InMemoryLearningStore, JsonlLearningStore, LearningSink,
    LearningStore, PolicyUpdate, RepairSandbox, Replanner,
};
use crate::services::{
    Actor, DiagnosisService, EchoActor, JudgmentService, LlmDiagnostician, LlmJudge, LlmRepairer,
    LlmReplanner, RepairService, ReplanService,
};

/// 各外部调用的超时
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceTimeouts {
    pub actor: Duration,
    pub judgment: Duration,
    pub diagnosis: Duration,
    pub repair: Duration,
    pub replan: Duration,
}

impl ServiceTimeouts {
    /// 所有调用使用同一超时（测试常用）
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            actor: timeout,
            judgment: timeout,
            diagnosis: timeout,
            repair: timeout,
            replan: timeout,
        }
    }
}

impl From<&TimeoutsSection> for ServiceTimeouts {
    fn from(t: &TimeoutsSection) -> Self {
        Self {
            actor: t.actor(),
            judgment: t.judgment(),
            diagnosis: t.diagnosis(),
            repair: t.repair(),
            replan: t.replan(),
        }
    }
}

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    actors: ActorRegistry,
    timeouts: ServiceTimeouts,
    judge: Option<Arc<dyn JudgmentService>>,
    diagnosis: Option<Arc<dyn DiagnosisService>>,
    repair: Option<Arc<dyn RepairService>>,
    replan: Option<Arc<dyn ReplanService>>,
    learning_store: Option<Arc<dyn LearningStore>>,
    trace_log: Option<Arc<dyn TraceLog>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        let timeouts = ServiceTimeouts::from(&config.recovery.timeouts);
        Self {
            config,
            actors: ActorRegistry::new(),
            timeouts,
            judge: None,
            diagnosis: None,
            repair: None,
            replan: None,
            learning_store: None,
            trace_log: None,
        }
    }

    /// 注册 Actor（类型名不区分大小写）
    pub fn with_actor(mut self, agent_type: &str, actor: Arc<dyn Actor>) -> Self {
        self.actors.register(agent_type, actor);
        self
    }

    pub fn with_timeouts(mut self, timeouts: ServiceTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn JudgmentService>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn with_diagnosis(mut self, diagnosis: Arc<dyn DiagnosisService>) -> Self {
        self.diagnosis = Some(diagnosis);
        self
    }

    pub fn with_repair(mut self, repair: Arc<dyn RepairService>) -> Self {
        self.repair = Some(repair);
        self
    }

    pub fn with_replan(mut self, replan: Arc<dyn ReplanService>) -> Self {
        self.replan = Some(replan);
        self
    }

    pub fn with_learning_store(mut self, store: Arc<dyn LearningStore>) -> Self {
        self.learning_store = Some(store);
        self
    }

    pub fn with_trace_log(mut self, trace_log: Arc<dyn TraceLog>) -> Self {
        self.trace_log = Some(trace_log);
        self
    }

    /// 构建 LLM 客户端
    pub fn build_llm(&self) -> Arc<dyn LlmClient> {
        create_llm_from_config(&self.config.llm)
    }

    /// 构建学习存储：配置了路径则用 JSONL，否则用内存
    pub fn build_learning_store(&self) -> Arc<dyn LearningStore> {
        match &self.config.learning.path {
            Some(path) => Arc::new(JsonlLearningStore::new(path)),
            None => Arc::new(InMemoryLearningStore::new()),
        }
    }

    /// 构建编排器，并返回策略更新信号接收端
    pub fn build(self) -> (RecoveryOrchestrator, mpsc::UnboundedReceiver<PolicyUpdate>) {
        let needs_llm = self.judge.is_none()
            || self.diagnosis.is_none()
            || self.repair.is_none()
            || self.replan.is_none();
        let llm = if needs_llm {
            Some(self.build_llm())
        } else {
            None
        };
        let prompts = &self.config.prompts;
        let llm_or_mock = || llm.clone().unwrap_or_else(|| self.build_llm());

        let judge: Arc<dyn JudgmentService> = match self.judge.clone() {
            Some(j) => j,
            None => Arc::new(LlmJudge::new(llm_or_mock(), prompts.judge.clone())),
        };
        let diagnosis: Arc<dyn DiagnosisService> = match self.diagnosis.clone() {
            Some(d) => d,
            None => Arc::new(LlmDiagnostician::new(llm_or_mock(), prompts.diagnosis.clone())),
        };
        let repair: Arc<dyn RepairService> = match self.repair.clone() {
            Some(r) => r,
            None => Arc::new(LlmRepairer::new(llm_or_mock(), prompts.repair.clone())),
        };
        let replan: Arc<dyn ReplanService> = match self.replan.clone() {
            Some(r) => r,
            None => Arc::new(LlmReplanner::new(llm_or_mock(), prompts.replan.clone())),
        };

        let learning_store = self
            .learning_store
            .clone()
            .unwrap_or_else(|| self.build_learning_store());
        let (learning, policy_rx) = LearningSink::new(learning_store);

        let recovery = &self.config.recovery;
        let sandbox = RepairSandbox::new(
            recovery.max_repair_ops,
            Duration::from_millis(recovery.max_backoff_ms),
        );

        let mut actors = self.actors;
        if actors.agent_types().is_empty() {
            actors.register("echo", Arc::new(EchoActor));
        }

        let orchestrator = RecoveryOrchestrator {
            actors,
            store: Arc::new(TaskStore::new()),
            trace_log: self
                .trace_log
                .unwrap_or_else(|| Arc::new(InMemoryTraceLog::new())),
            critic: Critic::new(judge, self.timeouts.judgment)
                .with_threshold(recovery.quality_threshold),
            diagnoser: Diagnoser::new(diagnosis, self.timeouts.diagnosis)
                .with_trace_window(recovery.trace_window),
            healer: Healer::new(repair, sandbox, self.timeouts.repair),
            replanner: Replanner::new(replan, self.timeouts.replan),
            learning,
            supervisor: TaskSupervisor::new(),
            scheduler: TaskScheduler::new(recovery.max_concurrent_tasks),
            actor_timeout: self.timeouts.actor,
        };
        (orchestrator, policy_rx)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

/// 便捷函数：从默认路径加载配置并创建构建器
pub fn create_orchestrator_builder(config_path: Option<PathBuf>) -> OrchestratorBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    OrchestratorBuilder::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ScriptedJudge;

    #[test]
    fn test_timeouts_from_config() {
        let t = ServiceTimeouts::from(&TimeoutsSection::default());
        assert_eq!(t.actor, Duration::from_secs(120));
        assert_eq!(t.replan, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_build_registers_echo_by_default() {
        let (orch, _rx) = OrchestratorBuilder::new(AppConfig::default())
            .with_judge(Arc::new(ScriptedJudge::score(4.0)))
            .build();
        assert_eq!(orch.actors().agent_types(), vec!["echo".to_string()]);
        assert!(orch.actors().get("ECHO").is_some());
    }
}
