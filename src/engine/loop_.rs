//! 自适应执行循环（状态机）
//!
//! Start → StrategyCreated → Planning → Executing → Evaluating → (Planning | RecoveryNeeded | Done)
//!
//! - 策略生成失败时直接返回错误，由编排器降级为顺序执行（此时尚未执行任何步骤）
//! - 每轮执行一个分块，成功率低于阈值则进入恢复：适配次数 +1，执行补救步骤后继续规划
//! - 完成数达到估计步数的比例、规划器不再给出分块、或达到最大分块轮数时结束

use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::core::{EngineError, FailureRecord, ProgressState};
use crate::engine::analyzer::RecoveryAnalyzer;
use crate::engine::executor::{BatchResult, StepExecutor};
use crate::engine::planner::ChunkPlanner;
use crate::engine::types::{Chunk, Step};

/// 循环状态
#[derive(Debug)]
enum LoopState {
    Start,
    StrategyCreated,
    Planning,
    Executing(Chunk),
    Evaluating(BatchResult),
    RecoveryNeeded(Vec<FailureRecord>),
    Done,
}

/// 自适应循环的结果（计数都在 ProgressState 中）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub chunk_cycles: usize,
    pub cancelled: bool,
}

pub struct AdaptiveLoop<'a> {
    planner: ChunkPlanner,
    analyzer: RecoveryAnalyzer,
    executor: &'a StepExecutor,
    config: &'a EngineConfig,
}

impl<'a> AdaptiveLoop<'a> {
    pub fn new(
        planner: ChunkPlanner,
        analyzer: RecoveryAnalyzer,
        executor: &'a StepExecutor,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            planner,
            analyzer,
            executor,
            config,
        }
    }

    /// 运行整个状态机；只有策略生成失败会返回 Err
    pub async fn run(
        &mut self,
        instruction: &str,
        classified: &[Step],
        progress: &mut ProgressState,
        cancel: &CancellationToken,
    ) -> Result<LoopSummary, EngineError> {
        let mut summary = LoopSummary::default();
        let mut max_cycles = 1;
        let mut state = LoopState::Start;

        loop {
            state = match state {
                LoopState::Start => {
                    let strategy = self.planner.create_strategy(instruction, classified).await?;
                    max_cycles = self.config.max_chunk_cycles(strategy.estimated_total_steps);
                    progress.set_strategy(strategy);
                    LoopState::StrategyCreated
                }
                LoopState::StrategyCreated => LoopState::Planning,
                LoopState::Planning => {
                    if cancel.is_cancelled() {
                        summary.cancelled = true;
                        LoopState::Done
                    } else if self.goal_reached(progress) {
                        tracing::info!(completed = progress.completed(), "estimated work reached");
                        LoopState::Done
                    } else if summary.chunk_cycles >= max_cycles {
                        tracing::info!(cycles = summary.chunk_cycles, "chunk cycle limit reached");
                        LoopState::Done
                    } else if self.planner.is_exhausted() {
                        tracing::info!("planner has no further chunks");
                        LoopState::Done
                    } else {
                        match self.planner.next_chunk(instruction, progress).await {
                            Some(chunk) => LoopState::Executing(chunk),
                            None => LoopState::Done,
                        }
                    }
                }
                LoopState::Executing(chunk) => {
                    summary.chunk_cycles += 1;
                    let before = progress.completed();
                    let batch = self.executor.run_batch(&chunk.steps, progress, cancel).await;
                    log_checkpoints(progress, before);
                    if batch.cancelled {
                        summary.cancelled = true;
                        LoopState::Done
                    } else {
                        tracing::info!(
                            chunk_id = chunk.chunk_id,
                            succeeded = batch.succeeded,
                            attempted = batch.attempted,
                            "chunk executed"
                        );
                        LoopState::Evaluating(batch)
                    }
                }
                LoopState::Evaluating(batch) => {
                    let success_rate = batch.success_rate();
                    if success_rate < self.config.success_threshold {
                        tracing::warn!(success_rate, threshold = self.config.success_threshold, "chunk below threshold");
                        LoopState::RecoveryNeeded(batch.failures)
                    } else {
                        tracing::debug!(success_rate, "chunk accepted");
                        LoopState::Planning
                    }
                }
                LoopState::RecoveryNeeded(failures) => {
                    progress.record_adaptation();
                    if let Some(remediation) = self.analyzer.analyze(&failures, progress).await {
                        tracing::info!(steps = remediation.len(), "executing remediation");
                        let before = progress.completed();
                        let batch = self.executor.run_batch(&remediation, progress, cancel).await;
                        log_checkpoints(progress, before);
                        if batch.cancelled {
                            summary.cancelled = true;
                        }
                    }
                    if summary.cancelled {
                        LoopState::Done
                    } else {
                        LoopState::Planning
                    }
                }
                LoopState::Done => break,
            };
        }

        tracing::info!(
            cycles = summary.chunk_cycles,
            completed = progress.completed(),
            failed = progress.failed(),
            adaptations = progress.adaptation_count(),
            "adaptive loop finished"
        );
        Ok(summary)
    }

    fn goal_reached(&self, progress: &ProgressState) -> bool {
        match progress.strategy() {
            Some(strategy) => {
                progress.completed() as f64
                    >= strategy.estimated_total_steps as f64 * self.config.completion_ratio
            }
            None => false,
        }
    }
}

fn log_checkpoints(progress: &ProgressState, before: usize) {
    for checkpoint in progress.checkpoints_crossed(before) {
        tracing::info!(checkpoint, completed = progress.completed(), "strategy checkpoint reached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::engine::selector::StrategySelector;
    use crate::llm::{BackendChain, CompletionBackend, LlmError, Tier};
    use crate::tools::ToolInvoker;

    struct Script(Mutex<VecDeque<String>>);

    #[async_trait]
    impl CompletionBackend for Script {
        async fn complete(&self, _tier: Tier, _system: &str, _user: &str) -> Result<String, LlmError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LlmError::Api("script exhausted".into()))
        }
    }

    /// 路径中含 "bad" 的请求失败
    struct PickyTools;

    #[async_trait]
    impl ToolInvoker for PickyTools {
        async fn invoke(&self, _name: &str, args: &BTreeMap<String, String>) -> Result<String, String> {
            if args.values().any(|v| v.contains("bad")) {
                Err("permission denied".into())
            } else {
                Ok("ok".into())
            }
        }
    }

    async fn run_with(replies: Vec<String>, config: EngineConfig) -> (LoopSummary, ProgressState, usize) {
        let backend = Arc::new(Script(Mutex::new(replies.into())));
        let executor = StepExecutor::new(
            backend.clone(),
            Arc::new(PickyTools),
            StrategySelector::new(BackendChain::standard()),
            config.max_attempts,
            Duration::ZERO,
        );
        let planner = ChunkPlanner::new(backend.clone(), Tier::Heavyweight, 5, 10);
        let analyzer = RecoveryAnalyzer::new(backend.clone(), Tier::Heavyweight, 5);
        let mut progress = ProgressState::new("g");
        let summary = AdaptiveLoop::new(planner, analyzer, &executor, &config)
            .run("instruction", &[], &mut progress, &CancellationToken::new())
            .await
            .unwrap();
        let left = backend.0.lock().unwrap().len();
        (summary, progress, left)
    }

    fn chunk(dirs: &[&str], complete: bool) -> String {
        let steps: Vec<String> = dirs.iter().map(|d| format!("\"Create directory {d}\"")).collect();
        format!(r#"{{"steps": [{}], "complete": {}}}"#, steps.join(", "), complete)
    }

    fn strategy(total: usize) -> String {
        format!(r#"{{"goal": "dirs", "estimated_total_steps": {total}, "approach": "one by one", "checkpoints": []}}"#)
    }

    #[tokio::test]
    async fn low_success_rate_triggers_one_recovery() {
        let replies = vec![
            strategy(30),
            chunk(&["a1", "a2", "a3", "a4", "a5", "a6", "a7", "bad1", "bad2", "bad3"], false),
            r#"{"diagnosis": "names", "steps": ["Create directory fixed"]}"#.to_string(),
            chunk(&[], true),
        ];
        let (summary, progress, left) = run_with(replies, EngineConfig::default()).await;
        assert_eq!(summary.chunk_cycles, 1);
        assert_eq!(progress.adaptation_count(), 1);
        assert_eq!(progress.completed(), 8);
        assert_eq!(progress.failed(), 3);
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn unparseable_recovery_still_counts_and_planning_resumes() {
        let replies = vec![
            strategy(30),
            chunk(&["a1", "a2", "a3", "a4", "a5", "a6", "a7", "bad1", "bad2", "bad3"], false),
            "I think the names are wrong, try again.".to_string(),
            chunk(&["c1"], true),
        ];
        let (summary, progress, left) = run_with(replies, EngineConfig::default()).await;
        assert_eq!(progress.adaptation_count(), 1);
        assert_eq!(summary.chunk_cycles, 2);
        // 没有补救步骤：只有两批分块的结果
        assert_eq!(progress.completed(), 8);
        assert_eq!(progress.failed(), 3);
        assert_eq!(progress.outcome_log().len(), 7 + 3 * 3 + 1);
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn completion_ratio_ends_loop() {
        let replies = vec![
            strategy(10),
            chunk(&["a1", "a2", "a3", "a4", "a5"], false),
            chunk(&["b1", "b2", "b3", "b4"], false),
            chunk(&["never"], false),
        ];
        let (summary, progress, left) = run_with(replies, EngineConfig::default()).await;
        assert_eq!(summary.chunk_cycles, 2);
        assert_eq!(progress.completed(), 9);
        assert_eq!(progress.adaptation_count(), 0);
        assert_eq!(left, 1);
    }

    #[tokio::test]
    async fn cycle_limit_bounds_the_loop() {
        // 估计 7 步 → 最多 1 轮
        let replies = vec![
            strategy(7),
            chunk(&["a1", "a2"], false),
            chunk(&["b1", "b2"], false),
        ];
        let (summary, _progress, left) = run_with(replies, EngineConfig::default()).await;
        assert_eq!(summary.chunk_cycles, 1);
        assert_eq!(left, 1);
    }

    #[tokio::test]
    async fn strategy_failure_is_returned() {
        let backend = Arc::new(Script(Mutex::new(VecDeque::from(vec!["no json here".to_string()]))));
        let config = EngineConfig::default();
        let executor = StepExecutor::new(
            backend.clone(),
            Arc::new(PickyTools),
            StrategySelector::new(BackendChain::standard()),
            3,
            Duration::ZERO,
        );
        let mut lp = AdaptiveLoop::new(
            ChunkPlanner::new(backend.clone(), Tier::Heavyweight, 5, 10),
            RecoveryAnalyzer::new(backend, Tier::Heavyweight, 5),
            &executor,
            &config,
        );
        let mut progress = ProgressState::new("g");
        let result = lp.run("x", &[], &mut progress, &CancellationToken::new()).await;
        assert!(matches!(result, Err(EngineError::BackendParseFailure(_))));
        assert_eq!(progress.completed(), 0);
    }
}
