//! Rebound - 演示入口
//!
//! 用法：`rebound [task_id] [agent_type] [prompt...]`
//! 初始化日志与配置，构建编排器（未配置 API Key 时使用 Mock LLM），执行一步并以 JSON 打印结果。

use std::sync::Arc;

use anyhow::Context;
use rebound::core::{create_orchestrator_builder, StepRequest};
use rebound::services::{EchoActor, FailingActor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rebound::observability::init();

    let mut args = std::env::args().skip(1);
    let task_id = args.next().unwrap_or_else(|| "demo-task".to_string());
    let agent_type = args.next().unwrap_or_else(|| "echo".to_string());
    let prompt = {
        let rest: Vec<String> = args.collect();
        if rest.is_empty() {
            "summarize the quarterly report".to_string()
        } else {
            rest.join(" ")
        }
    };

    let (orchestrator, mut policy_rx) = create_orchestrator_builder(None)
        .with_actor("echo", Arc::new(EchoActor))
        .with_actor(
            "failing",
            Arc::new(FailingActor::new("ConnectionReset", "upstream closed the socket")),
        )
        .build();

    let request = StepRequest {
        task_id,
        agent_type,
        prompt,
        steps: vec![
            "fetch the report".to_string(),
            "summarize key figures".to_string(),
            "publish the summary".to_string(),
        ],
        ..Default::default()
    };

    let result = orchestrator.execute_step(request).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize step result")?
    );

    while let Ok(update) = policy_rx.try_recv() {
        tracing::info!(
            record_id = %update.record_id,
            task_id = %update.task_id,
            "policy update pending"
        );
    }
    Ok(())
}
