//! 状态定义：TaskState、执行轨迹、检查点与编排阶段
//!
//! TaskState 是单个任务可变的进度记录；Checkpoint 是它在每次尝试开始前的独立值拷贝，
//! 之后对 TaskState 的任何修改都不会反映到检查点中。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 任务作用域内的工作数据（凭据、句柄等）
pub type Variables = BTreeMap<String, serde_json::Value>;

/// 轨迹条目：一次动作及其输出
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub action: String,
    pub output: String,
}

impl TraceEntry {
    pub fn new(action: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            output: output.into(),
        }
    }
}

/// 单个任务的可变状态（每个 task id 恰好一份）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    /// 剩余步骤，只由 Replanner / Healer 修改
    pub plan: Vec<String>,
    /// 只追加的执行轨迹
    pub trace: Vec<TraceEntry>,
    /// Actor 最近一次输出，每次尝试覆盖
    pub current_output: Option<String>,
    /// 只由 Healer 应用的修复程序修改
    pub variables: Variables,
    /// Actor 抛出硬故障时的描述；恢复成功后清空
    pub fault_context: Option<String>,
    /// 诊断服务给出的根因叙述
    pub diagnosis_report: Option<String>,
}

impl TaskState {
    pub fn new(plan: Vec<String>, variables: Variables) -> Self {
        Self {
            plan,
            variables,
            ..Self::default()
        }
    }

    /// 当前待执行的步骤（plan[0]）
    pub fn current_step(&self) -> Option<&str> {
        self.plan.first().map(String::as_str)
    }

    /// 去掉失败步骤后的剩余计划（plan[1:]）
    pub fn remaining_plan(&self) -> &[String] {
        self.plan.get(1..).unwrap_or(&[])
    }

    /// 最近 n 条轨迹
    pub fn recent_trace(&self, n: usize) -> &[TraceEntry] {
        &self.trace[self.trace.len().saturating_sub(n)..]
    }

    pub fn push_trace(&mut self, entry: TraceEntry) {
        self.trace.push(entry);
    }

    /// 对当前状态做一次结构化拷贝
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            snapshot: self.clone(),
        }
    }

    /// 用检查点整体覆盖当前状态，丢弃检查点之后的全部修改
    pub fn restore(&mut self, checkpoint: &Checkpoint) {
        *self = checkpoint.snapshot.clone();
    }
}

/// 不可变检查点：TaskState 的独立值拷贝
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    snapshot: TaskState,
}

impl Checkpoint {
    pub fn state(&self) -> &TaskState {
        &self.snapshot
    }
}

/// 编排阶段（状态机）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Executing,
    Assessing,
    Diagnosing,
    Healing,
    Replanning,
    FinalizeSuccess,
    FinalizeRecovered,
    FinalizeRolledBack,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::FinalizeSuccess | Phase::FinalizeRecovered | Phase::FinalizeRolledBack
        )
    }

    /// 合法转移：与状态机定义一一对应
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Init, Executing)
                | (Executing, Assessing)
                | (Assessing, FinalizeSuccess)
                | (Assessing, Diagnosing)
                | (Diagnosing, Healing)
                | (Diagnosing, Replanning)
                | (Healing, FinalizeRecovered)
                | (Healing, FinalizeRolledBack)
                | (Replanning, FinalizeRecovered)
                | (Replanning, FinalizeRolledBack)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Executing => "executing",
            Phase::Assessing => "assessing",
            Phase::Diagnosing => "diagnosing",
            Phase::Healing => "healing",
            Phase::Replanning => "replanning",
            Phase::FinalizeSuccess => "finalize_success",
            Phase::FinalizeRecovered => "finalize_recovered",
            Phase::FinalizeRolledBack => "finalize_rolled_back",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> TaskState {
        let mut vars = Variables::new();
        vars.insert("token".into(), serde_json::json!("abc"));
        let mut s = TaskState::new(vec!["fetch".into(), "summarize".into()], vars);
        s.push_trace(TraceEntry::new("fetch", "ok"));
        s
    }

    #[test]
    fn test_checkpoint_isolation() {
        let mut state = sample_state();
        let cp = state.checkpoint();

        state.plan.push("extra".into());
        state.push_trace(TraceEntry::new("summarize", "partial"));
        state.variables.insert("token".into(), serde_json::json!("changed"));
        state.current_output = Some("out".into());
        state.fault_context = Some("boom".into());
        state.diagnosis_report = Some("report".into());

        assert_eq!(cp.state(), &sample_state());
    }

    #[test]
    fn test_restore_overwrites_every_field() {
        let mut state = sample_state();
        let cp = state.checkpoint();
        state.variables.clear();
        state.plan.clear();
        state.fault_context = Some("boom".into());

        state.restore(&cp);
        assert_eq!(&state, cp.state());
    }

    #[test]
    fn test_remaining_plan_drops_head() {
        let state = sample_state();
        assert_eq!(state.remaining_plan(), &["summarize".to_string()]);
        assert!(TaskState::default().remaining_plan().is_empty());
    }

    #[test]
    fn test_recent_trace_window() {
        let mut state = TaskState::default();
        for i in 0..5 {
            state.push_trace(TraceEntry::new(format!("a{i}"), "o"));
        }
        let recent = state.recent_trace(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].action, "a2");
        assert_eq!(TaskState::default().recent_trace(3).len(), 0);
    }

    #[test]
    fn test_phase_transitions() {
        assert!(Phase::Init.can_transition_to(Phase::Executing));
        assert!(Phase::Healing.can_transition_to(Phase::FinalizeRolledBack));
        assert!(!Phase::Assessing.can_transition_to(Phase::Healing));
        assert!(!Phase::FinalizeSuccess.can_transition_to(Phase::Executing));
        assert!(Phase::FinalizeRecovered.is_terminal());
        assert!(!Phase::Diagnosing.is_terminal());
    }
}
