//! 核心编排层：错误与故障分类、任务状态与检查点、任务存储、取消监管、并发调度、主控状态机

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod task_scheduler;

pub use builder::{create_orchestrator_builder, OrchestratorBuilder, ServiceTimeouts};
pub use error::{FaultKind, RecoveryError};
pub use orchestrator::{ActorRegistry, RecoveryOrchestrator, StepRequest, StepResult, StepStatus};
pub use state::{Checkpoint, Phase, TaskState, TraceEntry, Variables};
pub use store::{InMemoryTraceLog, TaskGuard, TaskId, TaskStore, TraceLog};
pub use supervisor::{TaskSupervisor, TaskTicket};
pub use task_scheduler::TaskScheduler;
