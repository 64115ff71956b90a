use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use scheduler_core::ids::validate_id;
use scheduler_core::traits::{JobProvider, JobProviderLookup};
use scheduler_core::{SchedulerError, SchedulerResult};
use tracing::{info, warn};

/// 按作业类型索引的提供者注册表
///
/// 同一类型后注册的提供者覆盖先注册的。
#[derive(Default)]
pub struct JobProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn JobProvider>>>,
}

impl JobProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn JobProvider>) -> SchedulerResult<()> {
        let types = provider.provided_types();
        if types.is_empty() {
            return Err(SchedulerError::config_error("作业提供者没有声明任何作业类型"));
        }
        for type_id in &types {
            validate_id(type_id, "作业类型")?;
        }
        let mut providers = self
            .providers
            .write()
            .map_err(|_| SchedulerError::Internal("提供者注册表锁已中毒".to_string()))?;
        for type_id in types {
            if providers.insert(type_id.clone(), provider.clone()).is_some() {
                warn!("作业类型 {} 的提供者被替换", type_id);
            } else {
                info!("注册作业类型: {}", type_id);
            }
        }
        Ok(())
    }

    pub fn unregister(&self, type_id: &str) -> bool {
        self.providers
            .write()
            .map(|mut providers| providers.remove(type_id).is_some())
            .unwrap_or(false)
    }

    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .providers
            .read()
            .map(|providers| providers.keys().cloned().collect())
            .unwrap_or_default();
        types.sort();
        types
    }
}

impl JobProviderLookup for JobProviderRegistry {
    fn find_provider(&self, type_id: &str) -> Option<Arc<dyn JobProvider>> {
        self.providers
            .read()
            .ok()
            .and_then(|providers| providers.get(type_id).cloned())
    }
}
