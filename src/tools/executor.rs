//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(tool_name, args) 在超时内调用 registry.execute，
//! 超时或失败时转为 EngineError（ToolTimeout / InvocationFailure）；每次调用输出结构化审计日志（JSON）。
//! 对引擎而言它就是工具调用服务：ToolInvoker::invoke 返回成功文本或错误文本。

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::timeout;

use crate::core::EngineError;
use crate::tools::ToolRegistry;

/// 工具调用服务边界：invoke(actionName, args) -> Result<Output, ErrorText>
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, action_name: &str, args: &BTreeMap<String, String>) -> Result<String, String>;

    /// 各动作的说明与参数 schema（拼入解释未知步骤的 prompt）；默认为空
    fn describe(&self) -> String {
        String::new()
    }
}

/// 工具执行器：对每次调用施加超时，并将结果映射为 EngineError
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 执行指定工具；超时返回 ToolTimeout，工具返回 Err 则转为 InvocationFailure；输出 JSON 审计日志
    pub async fn execute(
        &self,
        tool_name: &str,
        args: &BTreeMap<String, String>,
    ) -> Result<String, EngineError> {
        let start = Instant::now();
        let args_preview = args_preview(args);
        let result = timeout(self.timeout, self.registry.execute(tool_name, args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(EngineError::InvocationFailure(e)),
            Err(_) => Err(EngineError::ToolTimeout(tool_name.to_string())),
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

#[async_trait]
impl ToolInvoker for ToolExecutor {
    async fn invoke(&self, action_name: &str, args: &BTreeMap<String, String>) -> Result<String, String> {
        self.execute(action_name, args).await.map_err(|e| match e {
            EngineError::InvocationFailure(text) => text,
            other => other.to_string(),
        })
    }

    fn describe(&self) -> String {
        self.registry.to_schema_json()
    }
}

fn args_preview(args: &BTreeMap<String, String>) -> String {
    let s = serde_json::to_string(args).unwrap_or_default();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
