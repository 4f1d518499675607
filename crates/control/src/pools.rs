use std::collections::HashMap;
use std::sync::Arc;

use crate::Orchestrator;
use crate::broker::Broker;
use crate::dispatch::{self, Execution, ExecutionLimits};
use crate::error::{DispatchError, PoolError};
use crate::pool::{PoolConfig, WorkerPool};
use crate::protocol::{JobMessage, Language};
use crate::stats::PoolStatus;

/// One pool per enabled language.
pub struct PoolSet {
    pools: HashMap<Language, WorkerPool>,
}

impl PoolSet {
    /// Bootstraps every configured pool. If one fails, the pools already
    /// started are shut down and the error is returned.
    pub async fn start(
        configs: Vec<PoolConfig>,
        broker: Arc<dyn Broker>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Result<Self, PoolError> {
        let mut pools = HashMap::with_capacity(configs.len());
        for config in configs {
            let language = config.language;
            match WorkerPool::new(config, Arc::clone(&broker), Arc::clone(&orchestrator)).await {
                Ok(pool) => {
                    pools.insert(language, pool);
                }
                Err(err) => {
                    for pool in pools.values() {
                        pool.shutdown().await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self { pools })
    }

    pub fn from_pools(pools: impl IntoIterator<Item = WorkerPool>) -> Self {
        Self {
            pools: pools
                .into_iter()
                .map(|pool| (pool.language(), pool))
                .collect(),
        }
    }

    pub fn get(&self, language: Language) -> Option<&WorkerPool> {
        self.pools.get(&language)
    }

    pub fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.pools.keys().copied().collect();
        languages.sort_by_key(|language| language.as_str());
        languages
    }

    pub async fn execute(
        &self,
        language: Language,
        job: JobMessage,
        limits: ExecutionLimits,
    ) -> Result<Execution, DispatchError> {
        let pool = self
            .get(language)
            .ok_or(DispatchError::UnsupportedLanguage(language))?;
        dispatch::execute(pool, job, limits).await
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        self.languages()
            .into_iter()
            .filter_map(|language| self.get(language))
            .map(WorkerPool::status)
            .collect()
    }

    pub async fn shutdown(&self) {
        for pool in self.pools.values() {
            pool.shutdown().await;
        }
    }
}
