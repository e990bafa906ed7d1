//! Maps KP identifiers to their throttled batching engine.
//!
//! Registration and lookup are the only cross-engine shared mutable state
//! in this crate; everything else belongs to exactly one engine. A single
//! mutex around the map is enough, per the concurrency model's own
//! assessment of what needs protecting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::engine::{KPInfo, ThrottledEngine};
use crate::error::ThrottleError;

pub struct Registry {
    engines: Mutex<HashMap<String, Arc<ThrottledEngine>>>,
    client: Client,
}

impl Registry {
    pub fn new(client: Client) -> Self {
        Self {
            engines: Mutex::new(HashMap::new()),
            client,
        }
    }

    pub async fn register(&self, kp_id: String, info: KPInfo) -> Result<(), ThrottleError> {
        let mut engines = self.engines.lock().await;
        if engines.contains_key(&kp_id) {
            return Err(ThrottleError::Duplicate(kp_id));
        }
        let engine = ThrottledEngine::start(kp_id.clone(), info, self.client.clone());
        engines.insert(kp_id, engine);
        Ok(())
    }

    pub async fn unregister(&self, kp_id: &str) -> Result<(), ThrottleError> {
        let engine = {
            let mut engines = self.engines.lock().await;
            engines.remove(kp_id)
        };
        match engine {
            Some(engine) => {
                engine.stop().await;
                Ok(())
            }
            None => Err(ThrottleError::UnknownKP(kp_id.to_string())),
        }
    }

    pub async fn query(
        &self,
        kp_id: &str,
        query: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ThrottleError> {
        let engine = {
            let engines = self.engines.lock().await;
            engines.get(kp_id).cloned()
        };
        match engine {
            Some(engine) => engine.submit(query, timeout).await,
            None => Err(ThrottleError::UnknownKP(kp_id.to_string())),
        }
    }

    /// The registered upstream URL for `kp_id`, used by the
    /// `meta_knowledge_graph` passthrough route.
    pub async fn kp_url(&self, kp_id: &str) -> Result<String, ThrottleError> {
        let engines = self.engines.lock().await;
        engines
            .get(kp_id)
            .map(|engine| engine.url().to_string())
            .ok_or_else(|| ThrottleError::UnknownKP(kp_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> KPInfo {
        KPInfo {
            url: "http://127.0.0.1:1/query".to_string(),
            request_qty: 1,
            request_duration: Duration::from_secs(1),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn register_twice_is_rejected() {
        let registry = Registry::new(Client::new());
        registry.register("kp1".to_string(), sample_info()).await.unwrap();
        let err = registry
            .register("kp1".to_string(), sample_info())
            .await
            .unwrap_err();
        assert!(matches!(err, ThrottleError::Duplicate(id) if id == "kp1"));
        registry.unregister("kp1").await.unwrap();
    }

    #[tokio::test]
    async fn unregister_unknown_kp_errors() {
        let registry = Registry::new(Client::new());
        let err = registry.unregister("missing").await.unwrap_err();
        assert!(matches!(err, ThrottleError::UnknownKP(id) if id == "missing"));
    }

    #[tokio::test]
    async fn query_unknown_kp_errors() {
        let registry = Registry::new(Client::new());
        let err = registry
            .query("missing", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ThrottleError::UnknownKP(id) if id == "missing"));
    }
}
