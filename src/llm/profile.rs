//! 能力档位与升级链
//!
//! 固定的三档升级链：fast（快速廉价）→ general（通用）→ heavyweight（重推理）。
//! `rank` 决定升级顺序；链在进程启动时构建，之后只读。

use std::fmt;

use serde::Deserialize;

/// 后端能力档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    General,
    Heavyweight,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::General => "general",
            Tier::Heavyweight => "heavyweight",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个档位的静态描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendProfile {
    pub tier: Tier,
    /// 在升级链中的位置（0 为最低）
    pub rank: usize,
    /// 是否接受固定采样参数（temperature = 0）；否则只能用模型默认值
    pub supports_deterministic_params: bool,
    /// 该档位使用的模型名
    pub model: String,
}

/// 升级链：按 rank 升序排列，至少一个档位
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendChain {
    profiles: Vec<BackendProfile>,
}

impl BackendChain {
    /// 按档位从低到高构建升级链（与配置中的书写顺序无关），rank 由排序后的位置决定；
    /// 重复档位只保留第一次出现
    pub fn new(mut entries: Vec<(Tier, String, bool)>) -> Option<Self> {
        entries.sort_by_key(|(tier, _, _)| *tier);
        let mut profiles: Vec<BackendProfile> = Vec::new();
        for (tier, model, deterministic) in entries {
            if profiles.iter().any(|p| p.tier == tier) {
                continue;
            }
            profiles.push(BackendProfile {
                tier,
                rank: profiles.len(),
                supports_deterministic_params: deterministic,
                model,
            });
        }
        if profiles.is_empty() {
            None
        } else {
            Some(Self { profiles })
        }
    }

    /// 默认三档链（模型名仅作占位，实际由配置覆盖）
    pub fn standard() -> Self {
        Self {
            profiles: vec![
                BackendProfile {
                    tier: Tier::Fast,
                    rank: 0,
                    supports_deterministic_params: true,
                    model: "gpt-4o-mini".to_string(),
                },
                BackendProfile {
                    tier: Tier::General,
                    rank: 1,
                    supports_deterministic_params: true,
                    model: "gpt-4o".to_string(),
                },
                BackendProfile {
                    tier: Tier::Heavyweight,
                    rank: 2,
                    supports_deterministic_params: false,
                    model: "o3".to_string(),
                },
            ],
        }
    }

    pub fn profiles(&self) -> &[BackendProfile] {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn lowest(&self) -> &BackendProfile {
        &self.profiles[0]
    }

    pub fn highest(&self) -> &BackendProfile {
        &self.profiles[self.profiles.len() - 1]
    }

    pub fn profile(&self, tier: Tier) -> Option<&BackendProfile> {
        self.profiles.iter().find(|p| p.tier == tier)
    }

    pub fn rank_of(&self, tier: Tier) -> Option<usize> {
        self.profile(tier).map(|p| p.rank)
    }

    /// 取 rank 对应档位，超出顶端时饱和到最高档
    pub fn at_rank(&self, rank: usize) -> &BackendProfile {
        let idx = rank.min(self.profiles.len() - 1);
        &self.profiles[idx]
    }

    /// 链中与目标档位最接近的 rank：档位不存在时取不超过它的最高档
    pub fn nearest_rank(&self, tier: Tier) -> usize {
        if let Some(rank) = self.rank_of(tier) {
            return rank;
        }
        self.profiles
            .iter()
            .filter(|p| p.tier <= tier)
            .map(|p| p.rank)
            .max()
            .unwrap_or(0)
    }
}

impl Default for BackendChain {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_chain_is_ranked_in_order() {
        let chain = BackendChain::standard();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.lowest().tier, Tier::Fast);
        assert_eq!(chain.highest().tier, Tier::Heavyweight);
        assert_eq!(chain.rank_of(Tier::General), Some(1));
    }

    #[test]
    fn at_rank_saturates_at_top() {
        let chain = BackendChain::standard();
        assert_eq!(chain.at_rank(7).tier, Tier::Heavyweight);
    }

    #[test]
    fn new_skips_duplicates_and_rejects_empty() {
        assert!(BackendChain::new(vec![]).is_none());
        let chain = BackendChain::new(vec![
            (Tier::General, "a".into(), true),
            (Tier::General, "b".into(), true),
            (Tier::Heavyweight, "c".into(), false),
        ])
        .unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.profile(Tier::General).unwrap().model, "a");
        assert_eq!(chain.rank_of(Tier::Heavyweight), Some(1));
    }

    #[test]
    fn rank_follows_tier_order_not_config_order() {
        let chain = BackendChain::new(vec![
            (Tier::Heavyweight, "big".into(), false),
            (Tier::Fast, "small".into(), true),
        ])
        .unwrap();
        assert_eq!(chain.lowest().tier, Tier::Fast);
        assert_eq!(chain.highest().model, "big");
        assert_eq!(chain.nearest_rank(Tier::General), 0);
    }

    #[test]
    fn nearest_rank_falls_back_to_lower_tier() {
        let chain = BackendChain::new(vec![
            (Tier::Fast, "a".into(), true),
            (Tier::Heavyweight, "c".into(), false),
        ])
        .unwrap();
        assert_eq!(chain.nearest_rank(Tier::General), 0);
        assert_eq!(chain.nearest_rank(Tier::Heavyweight), 1);
    }
}
