//! LLM 客户端抽象
//!
//! 两层接口：
//! - `LlmClient`：单个模型的非流式完成（OpenAI 兼容 / Mock 实现）
//! - `CompletionBackend`：按能力档位（Tier）寻址的完成服务，引擎只依赖这一层

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::Tier;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 后端调用错误；引擎把它们一律当作普通失败记录，不会中断整个运行
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    /// 网络抖动、限流、超时等可重试错误
    #[error("Transient backend error: {0}")]
    Transient(String),

    #[error("Backend API error: {0}")]
    Api(String),

    /// 档位未配置客户端
    #[error("No client configured for tier {0}")]
    NoClient(Tier),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Transient(_))
    }
}

/// 单模型客户端：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 按档位寻址的完成服务：complete(tier, system, user) -> text
///
/// 每个调用点都显式传入 tier，不存在进程级的「当前模型」。
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, tier: Tier, system: &str, user: &str) -> Result<String, LlmError>;

    /// 每档调用次数（用于完成报告）；默认不统计
    fn call_counts(&self) -> Vec<(Tier, usize)> {
        Vec::new()
    }

    /// 累计 token 使用；默认 (0, 0, 0)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
