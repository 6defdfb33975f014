//! 引擎错误类型
//!
//! 除配置错误外，这些错误都不会让一次运行中止：调用失败与超出重试上限被记录为数据
//! （ExecutionOutcome / FailureRecord），后端解析失败只会让引擎降级或结束自适应循环。

use thiserror::Error;

use crate::llm::LlmError;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// 指令中没有编号结构；这是模式切换信号，不是真正的错误
    #[error("Instruction has no numbered steps")]
    ClassificationGap,

    /// 工具调用服务返回的错误文本
    #[error("Invocation failed: {0}")]
    InvocationFailure(String),

    /// 后端回复不符合要求的结构化格式
    #[error("Backend response did not match the expected shape: {0}")]
    BackendParseFailure(String),

    /// 单个步骤用尽重试与升级预算
    #[error("Step {ordinal} failed after {attempts} attempts")]
    CeilingExceeded { ordinal: usize, attempts: u32 },

    #[error("Backend error: {0}")]
    Backend(#[from] LlmError),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("Config error: {0}")]
    Config(String),
}
