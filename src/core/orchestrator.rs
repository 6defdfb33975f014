//! 编排器：一次指令的完整运行
//!
//! 负责：按配置创建后端路由与工具执行器；对指令分类后选择执行路径
//! （无步骤 → 直接报告、少量步骤 → 顺序执行、大任务 → 自适应循环，策略失败时降级为顺序执行），
//! 最后汇总为 RunReport。任何步骤或后端错误都只会体现在报告计数里。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, EngineConfig, ExecutionMode, Provider};
use crate::core::{EngineError, ProgressState};
use crate::engine::analyzer::RecoveryAnalyzer;
use crate::engine::classifier::classify;
use crate::engine::executor::StepExecutor;
use crate::engine::loop_::AdaptiveLoop;
use crate::engine::planner::ChunkPlanner;
use crate::engine::selector::StrategySelector;
use crate::engine::types::{RunMode, RunReport, Step};
use crate::llm::{
    BackendChain, CompletionBackend, LlmClient, MockLlmClient, OpenAiClient, TierRouter, DEEPSEEK_BASE_URL,
};
use crate::tools::{
    CreateDirectoryTool, ListFilesTool, ReadFileTool, SafeFs, ShellTool, ToolExecutor, ToolInvoker,
    ToolRegistry, WriteFileTool,
};

/// 目标描述的最大长度（无策略时取自指令原文）
const GOAL_PREVIEW_CHARS: usize = 120;

/// 按配置与已有的 API Key 决定提供方；None 表示使用 Mock
fn resolve_provider(configured: &str, has_deepseek_key: bool, has_openai_key: bool) -> Option<Provider> {
    match configured.to_lowercase().as_str() {
        "mock" => None,
        "deepseek" if has_deepseek_key => Some(Provider::DeepSeek),
        _ if has_openai_key => Some(Provider::OpenAi),
        _ if has_deepseek_key => Some(Provider::DeepSeek),
        _ => None,
    }
}

/// 根据配置与环境变量创建按档位路由的后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_backend_from_config(cfg: &AppConfig) -> Arc<TierRouter> {
    let timeout = Duration::from_secs(cfg.llm.request_timeout_secs);
    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();

    let provider = resolve_provider(&cfg.llm.provider, deepseek_key.is_some(), openai_key.is_some());
    let key = match provider {
        Some(Provider::DeepSeek) => deepseek_key,
        Some(Provider::OpenAi) => openai_key,
        None => None,
    };

    match provider.zip(key) {
        Some((provider, key)) => {
            let section = cfg.llm.provider_section(provider);
            let base = match provider {
                Provider::DeepSeek => Some(
                    section
                        .base_url
                        .clone()
                        .unwrap_or_else(|| DEEPSEEK_BASE_URL.to_string()),
                ),
                Provider::OpenAi => section.base_url.clone(),
            };
            tracing::info!(provider = ?provider, base_url = ?base, "Using remote backend");
            let chain = cfg.llm.chain(provider);
            let mut router = TierRouter::new(chain.clone());
            for profile in chain.profiles() {
                let client = OpenAiClient::new(base.as_deref(), &profile.model, &key)
                    .with_deterministic(profile.supports_deterministic_params)
                    .with_timeout(timeout);
                tracing::info!(tier = %profile.tier, model = client.model(), "tier configured");
                router.add_client(profile.tier, Arc::new(client));
            }
            Arc::new(router)
        }
        None => {
            tracing::warn!("No API key set or provider is mock, using Mock backend");
            let mock: Arc<dyn LlmClient> = Arc::new(MockLlmClient);
            Arc::new(TierRouter::with_shared_client(cfg.llm.chain(Provider::OpenAi), mock))
        }
    }
}

/// 工作区根目录：配置 > 当前目录下的 workspace；不存在时创建
pub fn workspace_root(cfg: &AppConfig) -> Result<PathBuf, EngineError> {
    let workspace = match &cfg.app.workspace_root {
        Some(path) => path.clone(),
        None => std::env::current_dir()
            .map_err(|e| EngineError::Config(format!("cannot read current dir: {}", e)))?
            .join("workspace"),
    };
    std::fs::create_dir_all(&workspace)
        .map_err(|e| EngineError::Config(format!("cannot create workspace {}: {}", workspace.display(), e)))?;
    Ok(workspace.canonicalize().unwrap_or(workspace))
}

/// 注册内置的五个动作工具，返回带超时的执行器
pub fn create_tools_from_config(cfg: &AppConfig, workspace: &Path) -> ToolExecutor {
    let fs = SafeFs::new(workspace);
    let mut tools = ToolRegistry::new();
    tools.register(CreateDirectoryTool::new(fs.clone()));
    tools.register(WriteFileTool::new(fs.clone()));
    tools.register(ListFilesTool::new(fs.clone()));
    tools.register(ReadFileTool::new(fs));
    tools.register(ShellTool::new(
        cfg.tools.shell.allowed_commands.clone(),
        cfg.tools.tool_timeout_secs,
        workspace,
    ));
    ToolExecutor::new(tools, cfg.tools.tool_timeout_secs)
}

/// 编排器：持有后端、工具调用服务、升级链与引擎参数，可连续运行多条指令（每条状态独立）
pub struct Orchestrator {
    backend: Arc<dyn CompletionBackend>,
    tools: Arc<dyn ToolInvoker>,
    chain: BackendChain,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        tools: Arc<dyn ToolInvoker>,
        chain: BackendChain,
        config: EngineConfig,
    ) -> Self {
        Self {
            backend,
            tools,
            chain,
            config: config.normalized(),
        }
    }

    /// 由完整配置创建：工作区、后端路由、内置工具
    pub fn from_config(cfg: &AppConfig) -> Result<Self, EngineError> {
        let workspace = workspace_root(cfg)?;
        tracing::info!(workspace = %workspace.display(), "workspace ready");
        let router = create_backend_from_config(cfg);
        let chain = router.chain().clone();
        let tools = create_tools_from_config(cfg, &workspace);
        tracing::info!(tools = ?tools.tool_names(), "tools registered");
        Ok(Self::new(router, Arc::new(tools), chain, cfg.engine.clone()))
    }

    /// 执行一条指令，始终返回完成报告
    pub async fn run(&self, instruction: &str, cancel: CancellationToken) -> RunReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let steps = classify(instruction);
        let goal = goal_preview(instruction);
        tracing::info!(run_id = %run_id, steps = steps.len(), "instruction classified");

        if steps.is_empty() {
            tracing::info!(run_id = %run_id, reason = %EngineError::ClassificationGap, "nothing to execute");
            return self.report(run_id, goal, RunMode::Empty, &ProgressState::new(""), 0, false);
        }

        let mut progress = ProgressState::new(goal);
        progress.reserve_ordinals(steps.iter().map(|s| s.ordinal).max().unwrap_or(0));

        let selector = StrategySelector::new(self.chain.clone());
        let planning_tier = selector.planning_tier();
        let executor = StepExecutor::new(
            self.backend.clone(),
            self.tools.clone(),
            selector,
            self.config.max_attempts,
            Duration::from_millis(self.config.step_delay_ms),
        );

        let adaptive = match self.config.mode {
            ExecutionMode::Sequential => false,
            ExecutionMode::Adaptive => true,
            ExecutionMode::Auto => steps.len() >= self.config.adaptive_min_steps,
        };

        let (mode, chunk_cycles, cancelled) = if adaptive {
            let planner = ChunkPlanner::new(
                self.backend.clone(),
                planning_tier,
                self.config.chunk_min_steps,
                self.config.chunk_max_steps,
            );
            let analyzer = RecoveryAnalyzer::new(self.backend.clone(), planning_tier, self.config.max_remediation_steps);
            let mut adaptive_loop = AdaptiveLoop::new(planner, analyzer, &executor, &self.config);
            match adaptive_loop.run(instruction, &steps, &mut progress, &cancel).await {
                Ok(summary) => (RunMode::Adaptive, summary.chunk_cycles, summary.cancelled),
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "strategy unavailable, falling back to sequential execution");
                    let cancelled = self.run_sequential(&executor, &steps, &mut progress, &cancel).await;
                    (RunMode::FallbackSequential, 0, cancelled)
                }
            }
        } else {
            let cancelled = self.run_sequential(&executor, &steps, &mut progress, &cancel).await;
            (RunMode::Sequential, 0, cancelled)
        };

        let goal = progress.goal().to_string();
        self.report(run_id, goal, mode, &progress, chunk_cycles, cancelled)
    }

    async fn run_sequential(
        &self,
        executor: &StepExecutor,
        steps: &[Step],
        progress: &mut ProgressState,
        cancel: &CancellationToken,
    ) -> bool {
        let batch = executor.run_batch(steps, progress, cancel).await;
        tracing::info!(succeeded = batch.succeeded, attempted = batch.attempted, "sequential run finished");
        batch.cancelled
    }

    fn report(
        &self,
        run_id: String,
        goal: String,
        mode: RunMode,
        progress: &ProgressState,
        chunk_cycles: usize,
        cancelled: bool,
    ) -> RunReport {
        let report = RunReport {
            run_id,
            goal,
            mode,
            completed: progress.completed(),
            failed: progress.failed(),
            adaptation_count: progress.adaptation_count(),
            chunk_cycles,
            cancelled,
            backend_calls: self.backend.call_counts(),
            token_usage: self.backend.token_usage(),
        };
        tracing::info!(
            run_id = %report.run_id,
            mode = %report.mode,
            completed = report.completed,
            failed = report.failed,
            adaptations = report.adaptation_count,
            "run finished"
        );
        report
    }
}

/// 指令首行（截断）作为初始目标描述
fn goal_preview(instruction: &str) -> String {
    let first_line = instruction.trim().lines().next().unwrap_or("").trim();
    if first_line.chars().count() > GOAL_PREVIEW_CHARS {
        format!("{}...", first_line.chars().take(GOAL_PREVIEW_CHARS).collect::<String>())
    } else {
        first_line.to_string()
    }
}
