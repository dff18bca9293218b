//! 恢复层：Critic、Diagnoser、Healer（含受限修复边界）、Replanner、学习信号采集

pub mod critic;
pub mod diagnoser;
pub mod healer;
pub mod learning;
pub mod repair;
pub mod replanner;

pub use critic::{Critic, Route, Verdict, DEFAULT_QUALITY_THRESHOLD};
pub use diagnoser::{Diagnoser, RecoveryPath, DEFAULT_TRACE_WINDOW};
pub use healer::{HealOutcome, Healer};
pub use learning::{
    InMemoryLearningStore, JsonlLearningStore, LearningRecord, LearningSink, LearningStore,
    PolicyUpdate, RecoveryOutcome,
};
pub use repair::{RepairOp, RepairOpError, RepairProgram, RepairSandbox, RepairSummary};
pub use replanner::Replanner;
