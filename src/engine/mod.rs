//! 自适应任务分解与执行引擎
//!
//! - **classifier**: 指令文本 → 有序步骤
//! - **selector**: 动作类型 + 失败次数 → 档位
//! - **request**: 结构化后端回复的严格解析
//! - **executor**: 单步骤执行（重试、升级、隐式建父目录）
//! - **planner** / **analyzer** / **loop_**: 大任务的策略、分块与恢复

pub mod analyzer;
pub mod classifier;
pub mod executor;
pub mod loop_;
pub mod planner;
pub mod request;
pub mod selector;
pub mod types;

pub use analyzer::RecoveryAnalyzer;
pub use classifier::{classify, classify_fragment};
pub use executor::{BatchResult, StepExecutor};
pub use loop_::{AdaptiveLoop, LoopSummary};
pub use planner::ChunkPlanner;
pub use request::ActionRequest;
pub use selector::StrategySelector;
pub use types::{ActionType, Chunk, ExecutionOutcome, RunMode, RunReport, Step, StepRun, Strategy};
