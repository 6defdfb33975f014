//! 核心编排层：错误类型、运行进度状态、编排器

pub mod error;
pub mod orchestrator;
pub mod state;

pub use error::EngineError;
pub use orchestrator::{create_backend_from_config, create_tools_from_config, workspace_root, Orchestrator};
pub use state::{FailureRecord, ProgressState};
