//! 档位选择器
//!
//! 根据动作类型与该步骤已失败次数，从升级链中选出下一次尝试使用的档位：
//! - 可确定映射的动作（建目录 / 列目录 / 计数 / 读文件）从最低档开始
//! - 带内容或有副作用的动作（建文件 / 执行命令）以及 Unknown 从中间档开始
//! - 同一步骤每失败一次上升恰好一档，到顶后饱和，不回绕、不降级
//!
//! 标准三档链下 Unknown 第一次失败即升到最高档。

use crate::engine::types::ActionType;
use crate::llm::{BackendChain, Tier};

/// 档位选择器：持有升级链，本身无状态
#[derive(Debug, Clone)]
pub struct StrategySelector {
    chain: BackendChain,
}

impl StrategySelector {
    pub fn new(chain: BackendChain) -> Self {
        Self { chain }
    }

    pub fn chain(&self) -> &BackendChain {
        &self.chain
    }

    fn base_rank(&self, action: ActionType) -> usize {
        match action {
            ActionType::CreateDirectory
            | ActionType::ListFiles
            | ActionType::CountFiles
            | ActionType::ReadFile => self.chain.lowest().rank,
            ActionType::CreateFile | ActionType::RunCommand | ActionType::Unknown => {
                self.chain.nearest_rank(Tier::General)
            }
        }
    }

    /// 第 prior_failures + 1 次尝试应使用的档位
    pub fn select(&self, action: ActionType, prior_failures: u32) -> Tier {
        let rank = self.base_rank(action).saturating_add(prior_failures as usize);
        self.chain.at_rank(rank).tier
    }

    /// 连续 attempts 次尝试的档位序列
    pub fn escalation_path(&self, action: ActionType, attempts: u32) -> Vec<Tier> {
        (0..attempts).map(|failures| self.select(action, failures)).collect()
    }

    /// 规划、分块与恢复请求统一走最高档
    pub fn planning_tier(&self) -> Tier {
        self.chain.highest().tier
    }
}
