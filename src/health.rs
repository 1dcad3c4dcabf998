use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::RwLock;

// ============================================================================
// Health Reporting
// ============================================================================
//
// Components (publisher, consumer loop, transport) push their status into a
// shared registry; the /health endpoint renders the snapshot.
//
// ============================================================================

/// Health status of a component
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded(String),
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded(_) => 1,
            HealthStatus::Unhealthy(_) => 2,
        }
    }
}

/// Health information for a component
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ComponentHealth {
    pub fn new(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            last_check: Utc::now(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub service: &'static str,
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

#[derive(Debug, Default)]
pub struct HealthRegistry {
    components: RwLock<BTreeMap<String, ComponentHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, health: ComponentHealth) {
        if let Ok(mut components) = self.components.write() {
            let changed = components
                .get(&health.name)
                .map_or(true, |previous| previous.status != health.status);
            if changed {
                tracing::debug!(component = %health.name, status = ?health.status, "Health changed");
            }
            components.insert(health.name.clone(), health);
        }
    }

    pub fn get(&self, name: &str) -> Option<ComponentHealth> {
        self.components.read().ok()?.get(name).cloned()
    }

    /// Worst status across components; healthy when nothing has reported
    pub fn snapshot(&self) -> HealthReport {
        let components: Vec<ComponentHealth> = self
            .components
            .read()
            .map(|components| components.values().cloned().collect())
            .unwrap_or_default();

        let status = components
            .iter()
            .map(|component| &component.status)
            .max_by_key(|status| status.severity())
            .cloned()
            .unwrap_or(HealthStatus::Healthy);

        HealthReport {
            service: "star_dispatch",
            status,
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_status_is_the_worst_component() {
        let registry = HealthRegistry::new();
        assert!(registry.snapshot().status.is_healthy());

        registry.report(ComponentHealth::new("publisher", HealthStatus::Healthy));
        registry.report(ComponentHealth::new(
            "consumer",
            HealthStatus::Degraded("redelivering".into()),
        ));
        assert_eq!(
            registry.snapshot().status,
            HealthStatus::Degraded("redelivering".into())
        );

        registry.report(ComponentHealth::new(
            "publisher",
            HealthStatus::Unhealthy("circuit open".into()),
        ));
        let report = registry.snapshot();
        assert_eq!(report.status, HealthStatus::Unhealthy("circuit open".into()));
        assert_eq!(report.components.len(), 2);
    }

    #[test]
    fn test_report_serializes_with_tagged_status() {
        let registry = HealthRegistry::new();
        registry.report(
            ComponentHealth::new("consumer", HealthStatus::Degraded("slow".into()))
                .with_details("substrate=table"),
        );

        let json = serde_json::to_value(registry.snapshot()).unwrap();
        assert_eq!(json["status"]["state"], "degraded");
        assert_eq!(json["components"][0]["status"]["reason"], "slow");
        assert_eq!(json["components"][0]["details"], "substrate=table");
    }
}
