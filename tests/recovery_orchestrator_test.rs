//! 恢复编排集成测试：成功、就地修复、重规划、回滚、取消、超时、串行化与生命周期

use std::sync::Arc;
use std::time::{Duration, Instant};

use rebound::config::AppConfig;
use rebound::core::{
    FaultKind, OrchestratorBuilder, RecoveryOrchestrator, ServiceTimeouts, StepRequest, StepStatus,
    Variables,
};
use rebound::recovery::{
    InMemoryLearningStore, LearningStore, PolicyUpdate, RepairOp, RepairProgram,
};
use rebound::services::{
    EchoActor, FailingActor, FailureSignal, ScriptedDiagnosis, ScriptedJudge, ScriptedRepair,
    ScriptedReplan, SlowActor,
};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

struct Harness {
    orchestrator: Arc<RecoveryOrchestrator>,
    policy_rx: UnboundedReceiver<PolicyUpdate>,
    learning: Arc<InMemoryLearningStore>,
    judge: Arc<ScriptedJudge>,
    diagnosis: Arc<ScriptedDiagnosis>,
    repair: Arc<ScriptedRepair>,
    replan: Arc<ScriptedReplan>,
    slow: Arc<SlowActor>,
}

struct Services {
    judge: ScriptedJudge,
    diagnosis: ScriptedDiagnosis,
    repair: ScriptedRepair,
    replan: ScriptedReplan,
    timeouts: ServiceTimeouts,
    slow_delay: Duration,
    max_concurrent_tasks: usize,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            judge: ScriptedJudge::score(4.0),
            diagnosis: ScriptedDiagnosis::external_fault("upstream unavailable"),
            repair: ScriptedRepair::unavailable(),
            replan: ScriptedReplan::plan(vec!["use cached data".into()]),
            timeouts: ServiceTimeouts::uniform(Duration::from_millis(200)),
            slow_delay: Duration::from_millis(150),
            max_concurrent_tasks: 8,
        }
    }
}

fn harness(services: Services) -> Harness {
    let judge = Arc::new(services.judge);
    let diagnosis = Arc::new(services.diagnosis);
    let repair = Arc::new(services.repair);
    let replan = Arc::new(services.replan);
    let learning = Arc::new(InMemoryLearningStore::new());
    let slow = Arc::new(SlowActor::new(services.slow_delay));

    let mut config = AppConfig::default();
    config.recovery.max_concurrent_tasks = services.max_concurrent_tasks;

    let (orchestrator, policy_rx) = OrchestratorBuilder::new(config)
        .with_actor("echo", Arc::new(EchoActor))
        .with_actor(
            "failing",
            Arc::new(FailingActor::new("HandleClosed", "connection handle is stale")),
        )
        .with_actor("slow", slow.clone())
        .with_judge(judge.clone())
        .with_diagnosis(diagnosis.clone())
        .with_repair(repair.clone())
        .with_replan(replan.clone())
        .with_learning_store(learning.clone())
        .with_timeouts(services.timeouts)
        .build();

    Harness {
        orchestrator: Arc::new(orchestrator),
        policy_rx,
        learning,
        judge,
        diagnosis,
        repair,
        replan,
        slow,
    }
}

fn request(task_id: &str, agent_type: &str) -> StepRequest {
    let mut context = Variables::new();
    context.insert("conn".into(), json!("stale-handle"));
    StepRequest {
        task_id: task_id.into(),
        agent_type: agent_type.into(),
        prompt: "summarize the report".into(),
        context,
        steps: vec!["fetch".into(), "summarize".into(), "publish".into()],
    }
}

#[tokio::test]
async fn test_success_discards_state() {
    let mut h = harness(Services::default());

    let result = h.orchestrator.execute_step(request("t1", "echo")).await;

    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.output, "Echo [fetch]: summarize the report");
    assert_eq!(result.actor_name, "echo");
    assert!(result.faults.is_empty());
    assert!(!h.orchestrator.store().contains("t1").await);
    assert_eq!(h.diagnosis.calls(), 0);
    assert!(h.learning.records().await.unwrap().is_empty());
    assert!(h.policy_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_agent_type_is_case_insensitive() {
    let h = harness(Services::default());
    let result = h.orchestrator.execute_step(request("t1", "ECHO")).await;
    assert_eq!(result.status, StepStatus::Success);
}

#[tokio::test]
async fn test_unknown_agent_type_fails_without_state() {
    let h = harness(Services::default());

    let result = h.orchestrator.execute_step(request("t1", "ghost")).await;

    assert_eq!(result.status, StepStatus::Failed);
    assert_eq!(result.output, "Unknown agent type: ghost");
    assert_eq!(result.actor_name, "orchestrator");
    assert!(result.final_state.is_none());
    assert_eq!(h.orchestrator.store().active_count().await, 0);
}

#[tokio::test]
async fn test_unknown_agent_type_is_reported_lowercased() {
    let h = harness(Services::default());
    let result = h.orchestrator.execute_step(request("t1", "Ghost")).await;
    assert_eq!(result.output, "Unknown agent type: ghost");
}

#[tokio::test]
async fn test_hard_fault_healed_in_place() {
    let program = RepairProgram::new(vec![
        RepairOp::ClearVariable { key: "conn".into() },
        RepairOp::SetVariable {
            key: "conn_retry".into(),
            value: json!(true),
        },
    ]);
    let mut h = harness(Services {
        diagnosis: ScriptedDiagnosis::state_fault("variable conn holds a closed handle"),
        repair: ScriptedRepair::program(program),
        ..Services::default()
    });

    let result = h.orchestrator.execute_step(request("t1", "failing")).await;

    assert_eq!(result.status, StepStatus::Recovered);
    assert_eq!(result.faults, vec![FaultKind::HardState, FaultKind::StateRepairable]);
    assert_eq!(
        result.diagnosis_report.as_deref(),
        Some("variable conn holds a closed handle")
    );
    // 硬故障不经过评分
    assert_eq!(h.judge.calls(), 0);

    let state = result.final_state.unwrap();
    assert!(!state.variables.contains_key("conn"));
    assert_eq!(state.variables.get("conn_retry"), Some(&json!(true)));
    assert!(state.fault_context.is_none());

    // 诊断收到硬故障文本
    let (failure, trace) = h.diagnosis.last_request().unwrap();
    assert_eq!(
        failure,
        FailureSignal::Fault("HandleClosed: connection handle is stale".into())
    );
    assert_eq!(trace.len(), 1);

    // RECOVERED 保留状态并产生学习记录与策略信号
    assert!(h.orchestrator.store().contains("t1").await);
    let records = h.learning.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].task_id, "t1");
    let update = h.policy_rx.try_recv().unwrap();
    assert_eq!(update.record_id, records[0].id);
}

#[tokio::test]
async fn test_soft_failure_replans_with_remaining_steps() {
    let mut h = harness(Services {
        judge: ScriptedJudge::score(2.0),
        diagnosis: ScriptedDiagnosis::external_fault("source API returned stale data"),
        replan: ScriptedReplan::plan(vec!["use cached data".into(), "publish".into()]),
        ..Services::default()
    });

    let result = h.orchestrator.execute_step(request("t1", "echo")).await;

    assert_eq!(result.status, StepStatus::Recovered);
    assert_eq!(result.faults, vec![FaultKind::SoftQuality, FaultKind::External]);

    let (report, remaining) = h.replan.last_request().unwrap();
    assert_eq!(report, "source API returned stale data");
    assert_eq!(remaining, vec!["summarize".to_string(), "publish".to_string()]);

    let state = result.final_state.unwrap();
    assert_eq!(state.plan, vec!["use cached data".to_string(), "publish".to_string()]);
    assert_eq!(h.learning.records().await.unwrap().len(), 1);
    assert!(h.policy_rx.try_recv().is_ok());
}

#[tokio::test]
async fn test_threshold_boundary_is_success() {
    let h = harness(Services {
        judge: ScriptedJudge::score(3.0),
        ..Services::default()
    });
    let result = h.orchestrator.execute_step(request("t1", "echo")).await;
    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(h.diagnosis.calls(), 0);
}

#[tokio::test]
async fn test_repair_execution_failure_rolls_back() {
    let program = RepairProgram::new(vec![
        RepairOp::SetVariable {
            key: "conn".into(),
            value: json!("fresh"),
        },
        RepairOp::ClearVariable {
            key: "missing".into(),
        },
    ]);
    let mut h = harness(Services {
        diagnosis: ScriptedDiagnosis::state_fault("stale handle"),
        repair: ScriptedRepair::program(program),
        ..Services::default()
    });

    let result = h.orchestrator.execute_step(request("t1", "failing")).await;

    assert_eq!(result.status, StepStatus::Failed);
    assert!(result.rolled_back);
    assert!(!result.cancelled);
    assert_eq!(result.diagnosis_report.as_deref(), Some("stale handle"));
    assert_eq!(
        result.faults,
        vec![
            FaultKind::HardState,
            FaultKind::StateRepairable,
            FaultKind::RepairExecution
        ]
    );

    // 回滚到调用前：变量未变，轨迹为空，无故障
    let state = result.final_state.unwrap();
    assert_eq!(state.variables.get("conn"), Some(&json!("stale-handle")));
    assert!(state.trace.is_empty());
    assert!(state.fault_context.is_none());
    assert!(state.diagnosis_report.is_none());

    assert!(!h.orchestrator.store().contains("t1").await);
    assert!(h.learning.records().await.unwrap().is_empty());
    assert!(h.policy_rx.try_recv().is_err());

    // 追加式轨迹日志不受回滚影响
    let entries = h.orchestrator.trace_log().entries("t1").await;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].output.contains("HandleClosed"));
}

#[tokio::test]
async fn test_repair_service_outage_rolls_back() {
    let h = harness(Services {
        diagnosis: ScriptedDiagnosis::state_fault("stale handle"),
        repair: ScriptedRepair::unavailable(),
        ..Services::default()
    });

    let result = h.orchestrator.execute_step(request("t1", "failing")).await;

    assert_eq!(result.status, StepStatus::Failed);
    assert!(result.rolled_back);
    assert!(result.output.contains("repair"));
    assert_eq!(h.repair.calls(), 1);
    assert!(!result.faults.contains(&FaultKind::RepairExecution));
}

#[tokio::test]
async fn test_replan_outage_rolls_back() {
    let h = harness(Services {
        judge: ScriptedJudge::score(1.5),
        replan: ScriptedReplan::unavailable(),
        ..Services::default()
    });

    let result = h.orchestrator.execute_step(request("t1", "echo")).await;

    assert_eq!(result.status, StepStatus::Failed);
    assert!(result.rolled_back);
    let state = result.final_state.unwrap();
    assert_eq!(state.plan.len(), 3);
    assert!(state.current_output.is_none());
    assert!(h.learning.records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_diagnosis_outage_defaults_to_replan() {
    let h = harness(Services {
        judge: ScriptedJudge::score(2.0),
        diagnosis: ScriptedDiagnosis::unavailable(),
        ..Services::default()
    });

    let result = h.orchestrator.execute_step(request("t1", "echo")).await;

    assert_eq!(result.status, StepStatus::Recovered);
    assert_eq!(h.replan.calls(), 1);
    assert_eq!(h.repair.calls(), 0);
    let report = result.diagnosis_report.unwrap();
    assert!(report.contains("diagnosis unavailable"));
    assert!(report.contains("score below threshold"));
}

#[tokio::test]
async fn test_judgment_timeout_routes_to_diagnosis() {
    let h = harness(Services {
        judge: ScriptedJudge::score(5.0).with_delay(Duration::from_millis(500)),
        timeouts: ServiceTimeouts {
            judgment: Duration::from_millis(50),
            ..ServiceTimeouts::uniform(Duration::from_secs(1))
        },
        ..Services::default()
    });

    let result = h.orchestrator.execute_step(request("t1", "echo")).await;

    assert_eq!(result.faults[0], FaultKind::SoftQuality);
    assert_eq!(h.diagnosis.calls(), 1);
    let (failure, _) = h.diagnosis.last_request().unwrap();
    assert_eq!(failure, FailureSignal::LowScore(None));
    assert_eq!(result.status, StepStatus::Recovered);
}

#[tokio::test]
async fn test_actor_timeout_is_hard_fault() {
    let h = harness(Services {
        slow_delay: Duration::from_millis(500),
        timeouts: ServiceTimeouts {
            actor: Duration::from_millis(50),
            ..ServiceTimeouts::uniform(Duration::from_secs(1))
        },
        ..Services::default()
    });

    let result = h.orchestrator.execute_step(request("t1", "slow")).await;

    assert_eq!(result.faults[0], FaultKind::HardState);
    assert_eq!(h.judge.calls(), 0);
    match h.diagnosis.last_request().unwrap().0 {
        FailureSignal::Fault(text) => assert!(text.contains("ActorTimeout")),
        other => panic!("expected hard fault, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_during_actor_leaves_state_untouched() {
    let h = harness(Services {
        slow_delay: Duration::from_millis(500),
        timeouts: ServiceTimeouts::uniform(Duration::from_secs(2)),
        ..Services::default()
    });

    let orch = h.orchestrator.clone();
    let handle = tokio::spawn(async move { orch.execute_step(request("t1", "slow")).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.orchestrator.cancel("t1").await);

    let result = handle.await.unwrap();
    assert_eq!(result.status, StepStatus::Failed);
    assert!(result.cancelled);
    assert!(!result.rolled_back);

    let state = h.orchestrator.store().snapshot("t1").await.unwrap();
    assert!(state.trace.is_empty());
    assert!(state.current_output.is_none());
    assert_eq!(state.plan.len(), 3);
    assert_eq!(h.judge.calls(), 0);
}

#[tokio::test]
async fn test_same_task_steps_are_serialized() {
    let h = harness(Services {
        slow_delay: Duration::from_millis(100),
        ..Services::default()
    });

    let started = Instant::now();
    let results = h
        .orchestrator
        .execute_many(vec![request("t1", "slow"), request("t1", "slow")])
        .await;

    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(results.iter().all(|r| r.status == StepStatus::Success));
    assert_eq!(h.slow.calls(), 2);
}

#[tokio::test]
async fn test_distinct_tasks_run_in_parallel() {
    let h = harness(Services {
        slow_delay: Duration::from_millis(150),
        ..Services::default()
    });

    let started = Instant::now();
    let results = h
        .orchestrator
        .execute_many(vec![
            request("a", "slow"),
            request("b", "slow"),
            request("c", "slow"),
        ])
        .await;

    assert!(started.elapsed() < Duration::from_millis(400));
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.status == StepStatus::Success));
}

#[tokio::test]
async fn test_recovered_state_carries_into_next_step() {
    let h = harness(Services {
        judge: ScriptedJudge::score(4.0),
        diagnosis: ScriptedDiagnosis::state_fault("stale handle"),
        repair: ScriptedRepair::program(RepairProgram::new(vec![RepairOp::SetVariable {
            key: "conn".into(),
            value: json!("fresh"),
        }])),
        ..Services::default()
    });

    let first = h.orchestrator.execute_step(request("t1", "failing")).await;
    assert_eq!(first.status, StepStatus::Recovered);

    // 已存在的任务忽略新请求的 context / steps
    let mut next = request("t1", "echo");
    next.context.clear();
    next.steps = vec!["ignored".into()];
    let second = h.orchestrator.execute_step(next).await;

    assert_eq!(second.status, StepStatus::Success);
    assert_eq!(second.output, "Echo [fetch]: summarize the report");
    let state = second.final_state.unwrap();
    assert_eq!(state.variables.get("conn"), Some(&json!("fresh")));
    assert_eq!(state.trace.len(), 3);
    assert!(!h.orchestrator.store().contains("t1").await);
}

#[tokio::test]
async fn test_same_task_backlog_does_not_starve_other_tasks() {
    let h = harness(Services {
        slow_delay: Duration::from_millis(300),
        max_concurrent_tasks: 2,
        ..Services::default()
    });

    let orch = h.orchestrator.clone();
    let backlog = tokio::spawn(async move {
        orch.execute_many(vec![
            request("a", "slow"),
            request("a", "slow"),
            request("a", "slow"),
        ])
        .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    // 排队等待 "a" 的调用不占用许可，"b" 立即拿到第二个许可
    let started = Instant::now();
    let result = h.orchestrator.execute_step(request("b", "echo")).await;
    assert_eq!(result.status, StepStatus::Success);
    assert!(started.elapsed() < Duration::from_millis(200));

    let results = backlog.await.unwrap();
    assert!(results.iter().all(|r| r.status == StepStatus::Success));
}

#[tokio::test]
async fn test_queued_call_stays_cancellable_after_first_finishes() {
    let h = harness(Services {
        slow_delay: Duration::from_millis(200),
        timeouts: ServiceTimeouts::uniform(Duration::from_secs(2)),
        ..Services::default()
    });

    let orch = h.orchestrator.clone();
    let handle = tokio::spawn(async move {
        orch.execute_many(vec![request("a", "slow"), request("a", "slow")]).await
    });

    // 第一次调用约 200ms 结束并删除状态，第二次仍在执行
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(h.orchestrator.cancel("a").await);

    let results = handle.await.unwrap();
    let succeeded = results.iter().filter(|r| r.status == StepStatus::Success).count();
    let cancelled = results.iter().filter(|r| r.cancelled).count();
    assert_eq!(succeeded, 1);
    assert_eq!(cancelled, 1);
    assert!(!h.orchestrator.cancel("a").await);
}

#[tokio::test]
async fn test_cancel_during_judgment_keeps_actor_output() {
    let h = harness(Services {
        judge: ScriptedJudge::score(4.0).with_delay(Duration::from_millis(500)),
        timeouts: ServiceTimeouts::uniform(Duration::from_secs(2)),
        ..Services::default()
    });

    let orch = h.orchestrator.clone();
    let handle = tokio::spawn(async move { orch.execute_step(request("t1", "echo")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.orchestrator.cancel("t1").await);

    let result = handle.await.unwrap();
    assert_eq!(result.status, StepStatus::Failed);
    assert!(result.cancelled);
    assert!(!result.rolled_back);
    assert!(result.faults.is_empty());

    // 只保留已完成的 Actor 步骤
    let state = h.orchestrator.store().snapshot("t1").await.unwrap();
    assert_eq!(state.trace.len(), 1);
    assert_eq!(
        state.current_output.as_deref(),
        Some("Echo [fetch]: summarize the report")
    );
    assert!(state.fault_context.is_none());
    assert!(state.diagnosis_report.is_none());
    assert_eq!(state.plan.len(), 3);
    assert_eq!(state.variables.get("conn"), Some(&json!("stale-handle")));
    assert_eq!(h.diagnosis.calls(), 0);
}

#[tokio::test]
async fn test_cancel_during_diagnosis_keeps_fault_context() {
    let h = harness(Services {
        diagnosis: ScriptedDiagnosis::state_fault("stale handle")
            .with_delay(Duration::from_millis(500)),
        timeouts: ServiceTimeouts::uniform(Duration::from_secs(2)),
        ..Services::default()
    });

    let orch = h.orchestrator.clone();
    let handle = tokio::spawn(async move { orch.execute_step(request("t1", "failing")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.orchestrator.cancel("t1").await);

    let result = handle.await.unwrap();
    assert!(result.cancelled);
    assert!(!result.rolled_back);
    assert_eq!(result.faults, vec![FaultKind::HardState]);

    let state = h.orchestrator.store().snapshot("t1").await.unwrap();
    assert_eq!(
        state.fault_context.as_deref(),
        Some("HandleClosed: connection handle is stale")
    );
    assert!(state.diagnosis_report.is_none());
    assert!(state.current_output.is_none());
    assert_eq!(state.trace.len(), 1);
    assert_eq!(h.repair.calls(), 0);
}

#[tokio::test]
async fn test_cancel_during_repair_proposal_leaves_variables() {
    let program = RepairProgram::new(vec![RepairOp::SetVariable {
        key: "conn".into(),
        value: json!("fresh"),
    }]);
    let h = harness(Services {
        diagnosis: ScriptedDiagnosis::state_fault("stale handle"),
        repair: ScriptedRepair::program(program).with_delay(Duration::from_millis(500)),
        timeouts: ServiceTimeouts::uniform(Duration::from_secs(2)),
        ..Services::default()
    });

    let orch = h.orchestrator.clone();
    let handle = tokio::spawn(async move { orch.execute_step(request("t1", "failing")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.orchestrator.cancel("t1").await);

    let result = handle.await.unwrap();
    assert_eq!(result.status, StepStatus::Failed);
    assert!(result.cancelled);
    assert!(!result.rolled_back);
    assert_eq!(result.faults, vec![FaultKind::HardState, FaultKind::StateRepairable]);

    let state = h.orchestrator.store().snapshot("t1").await.unwrap();
    assert_eq!(state.variables.get("conn"), Some(&json!("stale-handle")));
    assert_eq!(
        state.fault_context.as_deref(),
        Some("HandleClosed: connection handle is stale")
    );
    assert_eq!(state.diagnosis_report.as_deref(), Some("stale handle"));
    assert_eq!(state.trace.len(), 1);
    assert!(h.learning.records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_inside_repair_boundary_waits_for_commit() {
    let program = RepairProgram::new(vec![
        RepairOp::RetryWithBackoff { delay_ms: 300 },
        RepairOp::SetVariable {
            key: "conn".into(),
            value: json!("fresh"),
        },
    ]);
    let h = harness(Services {
        diagnosis: ScriptedDiagnosis::state_fault("stale handle"),
        repair: ScriptedRepair::program(program),
        timeouts: ServiceTimeouts::uniform(Duration::from_secs(2)),
        ..Services::default()
    });

    let orch = h.orchestrator.clone();
    let handle = tokio::spawn(async move { orch.execute_step(request("t1", "failing")).await });
    // 修复程序已进入退避等待
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.orchestrator.cancel("t1").await);

    let result = handle.await.unwrap();
    assert_eq!(result.status, StepStatus::Recovered);
    assert!(!result.cancelled);
    assert!(!result.rolled_back);

    let state = result.final_state.unwrap();
    assert_eq!(state.variables.get("conn"), Some(&json!("fresh")));
    assert!(state.fault_context.is_none());
    assert_eq!(h.learning.records().await.unwrap().len(), 1);
}
