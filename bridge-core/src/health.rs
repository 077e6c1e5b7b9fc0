//! Process liveness tracking.
//!
//! Components register with a deadline and ping their handle as they make
//! progress; a component that stops pinging past its deadline flips the
//! aggregate status to unhealthy. The binaries expose the aggregate on
//! their `/_liveness` route.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
struct ComponentStatus {
    last_reported: DateTime<Utc>,
    deadline_secs: u64,
}

#[derive(Default, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    components: HashMap<String, bool>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component that must report at least every `deadline`.
    /// Registration counts as the first report.
    pub fn register(&self, name: &str, deadline: Duration) -> HealthHandle {
        if let Ok(mut components) = self.components.write() {
            components.insert(
                name.to_string(),
                ComponentStatus {
                    last_reported: Utc::now(),
                    deadline_secs: deadline.as_secs(),
                },
            );
        }
        HealthHandle {
            name: name.to_string(),
            registry: self.clone(),
        }
    }

    pub fn status(&self) -> HealthStatus {
        let now = Utc::now();
        let components = match self.components.read() {
            Ok(components) => components
                .iter()
                .map(|(name, status)| {
                    let age = now - status.last_reported;
                    (
                        name.clone(),
                        age.num_seconds() >= 0
                            && (age.num_seconds() as u64) <= status.deadline_secs,
                    )
                })
                .collect::<HashMap<_, _>>(),
            Err(_) => HashMap::new(),
        };
        let healthy = !components.is_empty() && components.values().all(|ok| *ok);
        HealthStatus { healthy, components }
    }
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        match serde_json::to_string(&self) {
            Ok(body) => (code, body).into_response(),
            Err(err) => {
                warn!(error = %err, "failed to serialize health status");
                (StatusCode::INTERNAL_SERVER_ERROR, "{}".to_string()).into_response()
            }
        }
    }
}

#[derive(Clone)]
pub struct HealthHandle {
    name: String,
    registry: HealthRegistry,
}

impl HealthHandle {
    pub fn report_healthy(&self) {
        if let Ok(mut components) = self.registry.components.write() {
            if let Some(status) = components.get_mut(&self.name) {
                status.last_reported = Utc::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_not_healthy() {
        assert!(!HealthRegistry::new().status().healthy);
    }

    #[test]
    fn a_reporting_component_is_healthy() {
        let registry = HealthRegistry::new();
        let handle = registry.register("consumer", Duration::from_secs(30));
        handle.report_healthy();
        let status = registry.status();
        assert!(status.healthy);
        assert_eq!(status.components.get("consumer"), Some(&true));
    }

    #[test]
    fn a_component_past_its_deadline_flips_the_aggregate() {
        let registry = HealthRegistry::new();
        registry.register("consumer", Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(1100));
        assert!(!registry.status().healthy);
    }
}
