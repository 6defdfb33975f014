//! 档位路由器
//!
//! 把升级链中的每个档位映射到一个 LlmClient，实现 CompletionBackend：
//! complete(tier, system, user) 组装 [system, user] 两条消息后交给该档位的客户端。
//! 同时记录每档调用次数，供最终报告使用。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{BackendChain, CompletionBackend, LlmClient, LlmError, Message, Tier};

/// 档位路由器：Tier -> LlmClient
pub struct TierRouter {
    chain: BackendChain,
    clients: HashMap<Tier, Arc<dyn LlmClient>>,
    call_counts: HashMap<Tier, AtomicUsize>,
}

impl TierRouter {
    pub fn new(chain: BackendChain) -> Self {
        let call_counts = chain
            .profiles()
            .iter()
            .map(|p| (p.tier, AtomicUsize::new(0)))
            .collect();
        Self {
            chain,
            clients: HashMap::new(),
            call_counts,
        }
    }

    /// 为某档位挂载客户端；不在链中的档位会被忽略
    pub fn add_client(&mut self, tier: Tier, client: Arc<dyn LlmClient>) {
        if self.chain.profile(tier).is_none() {
            tracing::warn!(tier = %tier, "tier not in escalation chain, client ignored");
            return;
        }
        self.clients.insert(tier, client);
    }

    /// 所有档位共用同一个客户端（如 Mock）
    pub fn with_shared_client(chain: BackendChain, client: Arc<dyn LlmClient>) -> Self {
        let mut router = Self::new(chain);
        let tiers: Vec<Tier> = router.chain.profiles().iter().map(|p| p.tier).collect();
        for tier in tiers {
            router.clients.insert(tier, client.clone());
        }
        router
    }

    pub fn chain(&self) -> &BackendChain {
        &self.chain
    }

    /// 按链顺序返回 (tier, 调用次数)
    pub fn call_counts(&self) -> Vec<(Tier, usize)> {
        self.chain
            .profiles()
            .iter()
            .map(|p| {
                let count = self
                    .call_counts
                    .get(&p.tier)
                    .map(|c| c.load(Ordering::Relaxed))
                    .unwrap_or(0);
                (p.tier, count)
            })
            .collect()
    }

    /// 聚合所有档位的 token 使用（共享客户端只计一次）
    pub fn token_usage(&self) -> (u64, u64, u64) {
        let mut seen: Vec<*const ()> = Vec::new();
        let mut total = (0, 0, 0);
        for client in self.clients.values() {
            let ptr = Arc::as_ptr(client) as *const ();
            if seen.contains(&ptr) {
                continue;
            }
            seen.push(ptr);
            let (a, b, c) = client.token_usage();
            total = (total.0 + a, total.1 + b, total.2 + c);
        }
        total
    }
}

#[async_trait]
impl CompletionBackend for TierRouter {
    async fn complete(&self, tier: Tier, system: &str, user: &str) -> Result<String, LlmError> {
        let client = self.clients.get(&tier).ok_or(LlmError::NoClient(tier))?;

        if let Some(count) = self.call_counts.get(&tier) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(tier = %tier, system_len = system.len(), user_len = user.len(), "backend request");

        let messages = [Message::system(system), Message::user(user)];
        client.complete(&messages).await
    }

    fn call_counts(&self) -> Vec<(Tier, usize)> {
        TierRouter::call_counts(self)
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        TierRouter::token_usage(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    struct FixedClient(&'static str);

    #[async_trait]
    impl LlmClient for FixedClient {
        async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
            Ok(self.0.to_string())
        }

        fn token_usage(&self) -> (u64, u64, u64) {
            (1, 2, 3)
        }
    }

    #[tokio::test]
    async fn routes_by_tier_and_counts_calls() {
        let mut router = TierRouter::new(BackendChain::standard());
        router.add_client(Tier::Fast, Arc::new(FixedClient("fast")));
        router.add_client(Tier::Heavyweight, Arc::new(FixedClient("heavy")));

        let out = router.complete(Tier::Heavyweight, "sys", "user").await.unwrap();
        assert_eq!(out, "heavy");
        let out = router.complete(Tier::Fast, "sys", "user").await.unwrap();
        assert_eq!(out, "fast");

        let counts = router.call_counts();
        assert_eq!(counts, vec![(Tier::Fast, 1), (Tier::General, 0), (Tier::Heavyweight, 1)]);
    }

    #[tokio::test]
    async fn missing_client_is_an_error() {
        let router = TierRouter::new(BackendChain::standard());
        let err = router.complete(Tier::General, "s", "u").await.unwrap_err();
        assert!(matches!(err, LlmError::NoClient(Tier::General)));
    }

    #[test]
    fn shared_client_usage_counted_once() {
        let router = TierRouter::with_shared_client(
            BackendChain::standard(),
            Arc::new(FixedClient("x")),
        );
        assert_eq!(router.token_usage(), (1, 2, 3));
    }

    #[tokio::test]
    async fn shared_mock_serves_every_tier() {
        let router = TierRouter::with_shared_client(BackendChain::standard(), Arc::new(MockLlmClient));
        for tier in [Tier::Fast, Tier::General, Tier::Heavyweight] {
            assert!(router.complete(tier, "s", "u").await.is_ok());
        }
    }
}
