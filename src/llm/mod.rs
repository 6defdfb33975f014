//! LLM 层：档位升级链、按档位路由的完成服务、客户端实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod profile;
pub mod router;
pub mod traits;

pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage, DEEPSEEK_BASE_URL};
pub use profile::{BackendChain, BackendProfile, Tier};
pub use router::TierRouter;
pub use traits::{CompletionBackend, LlmClient, LlmError, Message, Role};
