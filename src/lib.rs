//! Stepwise - 自适应任务分解与执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、运行进度状态、编排器
//! - **engine**: 步骤分类、档位选择、步骤执行、分块规划与恢复分析
//! - **llm**: 档位升级链与完成服务（OpenAI 兼容 / Mock）
//! - **observability**: tracing 初始化
//! - **tools**: 工具调用服务（沙箱文件系统、白名单 Shell）与执行器

pub mod config;
pub mod core;
pub mod engine;
pub mod llm;
pub mod observability;
pub mod tools;

pub use crate::core::Orchestrator;
pub use crate::engine::{RunMode, RunReport};
