//! 分块规划器
//!
//! 大任务先在最高档位请求一次总体策略（目标、步数估计、做法），之后每轮根据进度计数请求下一批 5-10 个步骤。
//! 后端回复必须严格符合约定的 JSON 形状；解析失败时策略请求返回错误（调用方降级为顺序执行），
//! 分块请求返回 None（自适应循环正常结束）。

use std::sync::Arc;

use crate::core::{EngineError, ProgressState};
use crate::engine::classifier::classify_fragment;
use crate::engine::request::{parse_chunk, parse_strategy};
use crate::engine::types::{Chunk, Step, Strategy};
use crate::llm::{CompletionBackend, Tier};

const STRATEGY_SYSTEM_PROMPT: &str = "You plan large multi-step tasks that will be executed one small action at a time \
in a sandboxed workspace (create directories, write files, list files, read files, run shell commands).\n\
Respond with a single JSON object and nothing else:\n\
{\"goal\": string, \"estimated_total_steps\": integer > 0, \"approach\": string, \"checkpoints\": [integer]}\n\
\"checkpoints\" are completed-step counts at which the work should be verified.";

pub struct ChunkPlanner {
    backend: Arc<dyn CompletionBackend>,
    tier: Tier,
    min_steps: usize,
    max_steps: usize,
    next_chunk_id: u64,
    exhausted: bool,
}

impl ChunkPlanner {
    pub fn new(backend: Arc<dyn CompletionBackend>, tier: Tier, min_steps: usize, max_steps: usize) -> Self {
        let max_steps = max_steps.max(1);
        Self {
            backend,
            tier,
            min_steps: min_steps.clamp(1, max_steps),
            max_steps,
            next_chunk_id: 1,
            exhausted: false,
        }
    }

    /// 规划器已声明目标完成（或给不出下一批）
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// 一次性的总体策略请求
    pub async fn create_strategy(&self, instruction: &str, classified: &[Step]) -> Result<Strategy, EngineError> {
        let mut user = format!("Task instruction:\n{}\n", instruction.trim());
        if !classified.is_empty() {
            user.push_str(&format!(
                "\nThe instruction was pre-split into {} numbered steps.\n",
                classified.len()
            ));
        }

        let raw = self
            .backend
            .complete(self.tier, STRATEGY_SYSTEM_PROMPT, &user)
            .await?;
        tracing::debug!(response = %raw, "strategy response");

        let strategy = parse_strategy(&raw).ok_or_else(|| EngineError::BackendParseFailure("strategy".to_string()))?;
        tracing::info!(
            goal = %strategy.goal_description,
            estimated_total_steps = strategy.estimated_total_steps,
            "strategy created"
        );
        Ok(strategy)
    }

    /// 请求下一批步骤；序号从进度状态的单调计数器分配
    pub async fn next_chunk(&mut self, instruction: &str, progress: &mut ProgressState) -> Option<Chunk> {
        if self.exhausted {
            return None;
        }

        let system = format!(
            "You drive the execution of a large task in small batches. Propose the next {}-{} concrete steps, \
             each a short imperative sentence such as \"Create directory src\", \"Create file src/main.py with \\\"print(1)\\\"\", \
             \"List files in src\", \"Read file README.md\" or \"Run `python3 -m pytest`\".\n\
             Do not repeat work that is already done. Set \"complete\" to true once the goal is reached.\n\
             Respond with a single JSON object and nothing else:\n\
             {{\"steps\": [string], \"complete\": boolean}}",
            self.min_steps, self.max_steps
        );
        let user = format!("Task instruction:\n{}\n\nProgress:\n{}", instruction.trim(), progress.summary());

        let raw = match self.backend.complete(self.tier, &system, &user).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "chunk request failed, ending adaptive loop");
                self.exhausted = true;
                return None;
            }
        };
        tracing::debug!(response = %raw, "chunk response");

        let Some(proposal) = parse_chunk(&raw, self.max_steps) else {
            tracing::warn!(error = %EngineError::BackendParseFailure("chunk".to_string()), "no further chunk");
            self.exhausted = true;
            return None;
        };
        if proposal.complete {
            self.exhausted = true;
        }
        if proposal.steps.is_empty() {
            self.exhausted = true;
            return None;
        }
        if proposal.steps.len() < self.min_steps && !proposal.complete {
            tracing::debug!(steps = proposal.steps.len(), min = self.min_steps, "chunk smaller than requested");
        }

        let steps = proposal
            .steps
            .iter()
            .map(|text| classify_fragment(progress.allocate_ordinal(), text))
            .collect();
        let chunk = Chunk {
            chunk_id: self.next_chunk_id,
            steps,
        };
        self.next_chunk_id += 1;
        tracing::info!(chunk_id = chunk.chunk_id, steps = chunk.steps.len(), "chunk planned");
        Some(chunk)
    }
}
