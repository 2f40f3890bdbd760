//! Per-user session-agent bus endpoints (C4).
//!
//! A managed user may have several active login sessions, each running its
//! own agent process that exposes a small D-Bus interface for
//! notifications. The registry caches `(bus_name, object_path)` per
//! username so the Enforcer can reach every session without re-discovering
//! endpoints on each tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};
use zbus::Connection;

use crate::error::BusError;

const CALL_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    pub bus_name: String,
    pub object_path: String,
}

/// Thin boundary around the actual D-Bus method calls, so the registry's
/// bookkeeping can be unit tested without a running bus.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn notify_user(
        &self,
        bus_name: &str,
        object_path: &str,
        message: &str,
        category: &str,
        deadline: Duration,
    ) -> Result<String, BusError>;

    async fn get_username(&self, bus_name: &str, object_path: &str, deadline: Duration) -> Result<String, BusError>;
}

#[zbus::proxy(
    default_service = "org.guardian.Agent",
    interface = "org.guardian.Agent1"
)]
trait Agent {
    async fn notify_user(&self, message: &str, category: &str) -> zbus::Result<String>;
    async fn get_username(&self) -> zbus::Result<String>;
}

pub struct ZbusAgentTransport {
    connection: Connection,
}

impl ZbusAgentTransport {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    async fn proxy(&self, bus_name: &str, object_path: &str) -> Result<AgentProxy<'_>, BusError> {
        AgentProxy::builder(&self.connection)
            .destination(bus_name.to_owned())
            .map_err(BusError::from)?
            .path(object_path.to_owned())
            .map_err(BusError::from)?
            .build()
            .await
            .map_err(BusError::from)
    }
}

#[async_trait]
impl AgentTransport for ZbusAgentTransport {
    async fn notify_user(
        &self,
        bus_name: &str,
        object_path: &str,
        message: &str,
        category: &str,
        deadline: Duration,
    ) -> Result<String, BusError> {
        let proxy = self.proxy(bus_name, object_path).await?;
        match timeout(deadline, proxy.notify_user(message, category)).await {
            Ok(result) => result.map_err(BusError::from),
            Err(_) => Err(BusError::Timeout(deadline)),
        }
    }

    async fn get_username(&self, bus_name: &str, object_path: &str, deadline: Duration) -> Result<String, BusError> {
        let proxy = self.proxy(bus_name, object_path).await?;
        match timeout(deadline, proxy.get_username()).await {
            Ok(result) => result.map_err(BusError::from),
            Err(_) => Err(BusError::Timeout(deadline)),
        }
    }
}

/// Degrades an unrecognized notification category to "info", matching the
/// agent-side fallback described for the notification interface.
pub fn normalize_category(category: &str) -> &'static str {
    match category {
        "warning" => "warning",
        "critical" => "critical",
        _ => "info",
    }
}

pub struct AgentRegistry {
    transport: Arc<dyn AgentTransport>,
    endpoints: RwLock<HashMap<String, Vec<AgentEndpoint>>>,
}

impl AgentRegistry {
    pub fn new(transport: Arc<dyn AgentTransport>) -> Self {
        Self {
            transport,
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Records a newly-discovered agent endpoint for `username`; a repeat
    /// registration for the same `(bus_name, object_path)` is a no-op.
    pub async fn register(&self, username: &str, endpoint: AgentEndpoint) {
        let mut table = self.endpoints.write().await;
        let entries = table.entry(username.to_string()).or_default();
        if !entries.contains(&endpoint) {
            debug!(username, bus_name = %endpoint.bus_name, "registered agent endpoint");
            entries.push(endpoint);
        }
    }

    /// Drops an endpoint, typically on the owning session's removal.
    pub async fn unregister(&self, username: &str, bus_name: &str) {
        let mut table = self.endpoints.write().await;
        if let Some(entries) = table.get_mut(username) {
            entries.retain(|e| e.bus_name != bus_name);
            if entries.is_empty() {
                table.remove(username);
            }
        }
    }

    pub async fn endpoints_for(&self, username: &str) -> Vec<AgentEndpoint> {
        self.endpoints
            .read()
            .await
            .get(username)
            .cloned()
            .unwrap_or_default()
    }

    /// Sends `message` to every known endpoint for `username`, returning
    /// the count of successful deliveries. A single failing endpoint does
    /// not prevent delivery to the others.
    pub async fn notify(&self, username: &str, message: &str, category: &str) -> usize {
        let category = normalize_category(category);
        let endpoints = self.endpoints_for(username).await;
        let mut delivered = 0;
        for endpoint in endpoints {
            match self
                .transport
                .notify_user(&endpoint.bus_name, &endpoint.object_path, message, category, CALL_DEADLINE)
                .await
            {
                Ok(_) => delivered += 1,
                Err(err) => warn!(username, bus_name = %endpoint.bus_name, error = %err, "notification delivery failed"),
            }
        }
        delivered
    }

    /// Verifies an endpoint's `GetUsername()` matches the expected owner
    /// before trusting it, as recommended for agents registering themselves.
    pub async fn verify_and_register(&self, expected_username: &str, endpoint: AgentEndpoint) -> Result<(), BusError> {
        let reported = self
            .transport
            .get_username(&endpoint.bus_name, &endpoint.object_path, CALL_DEADLINE)
            .await?;
        if reported != expected_username {
            return Err(BusError::Other(zbus::Error::Failure(format!(
                "agent at {} claims username {reported}, expected {expected_username}",
                endpoint.bus_name
            ))));
        }
        self.register(expected_username, endpoint).await;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeAgentTransport;
    use super::*;

    fn endpoint(bus_name: &str) -> AgentEndpoint {
        AgentEndpoint {
            bus_name: bus_name.to_string(),
            object_path: "/org/guardian/Agent".to_string(),
        }
    }

    #[test]
    fn unknown_category_degrades_to_info() {
        assert_eq!(normalize_category("bogus"), "info");
        assert_eq!(normalize_category("critical"), "critical");
    }

    #[tokio::test]
    async fn register_is_idempotent_for_same_endpoint() {
        let transport = Arc::new(FakeAgentTransport::new());
        let registry = AgentRegistry::new(transport);
        registry.register("alice", endpoint(":1.1")).await;
        registry.register("alice", endpoint(":1.1")).await;
        assert_eq!(registry.endpoints_for("alice").await.len(), 1);
    }

    #[tokio::test]
    async fn unregister_removes_only_matching_bus_name() {
        let transport = Arc::new(FakeAgentTransport::new());
        let registry = AgentRegistry::new(transport);
        registry.register("alice", endpoint(":1.1")).await;
        registry.register("alice", endpoint(":1.2")).await;
        registry.unregister("alice", ":1.1").await;

        let remaining = registry.endpoints_for("alice").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].bus_name, ":1.2");
    }

    #[tokio::test]
    async fn notify_delivers_to_all_endpoints_and_counts_successes() {
        let transport = Arc::new(FakeAgentTransport::new());
        let registry = AgentRegistry::new(transport.clone());
        registry.register("alice", endpoint(":1.1")).await;
        registry.register("alice", endpoint(":1.2")).await;

        let delivered = registry.notify("alice", "5 minutes left", "warning").await;
        assert_eq!(delivered, 2);
        assert_eq!(transport.notify_calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn notify_skips_failing_endpoint_but_delivers_to_others() {
        let transport = Arc::new(FakeAgentTransport::new());
        transport.fail_next(":1.1");
        let registry = AgentRegistry::new(transport.clone());
        registry.register("alice", endpoint(":1.1")).await;
        registry.register("alice", endpoint(":1.2")).await;

        let delivered = registry.notify("alice", "time over", "critical").await;
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn verify_and_register_rejects_mismatched_username() {
        let transport = Arc::new(FakeAgentTransport::new());
        transport.set_username(":1.1", "bob");
        let registry = AgentRegistry::new(transport);

        let result = registry.verify_and_register("alice", endpoint(":1.1")).await;
        assert!(result.is_err());
        assert!(registry.endpoints_for("alice").await.is_empty());
    }

    #[tokio::test]
    async fn verify_and_register_accepts_matching_username() {
        let transport = Arc::new(FakeAgentTransport::new());
        transport.set_username(":1.1", "alice");
        let registry = AgentRegistry::new(transport);

        registry.verify_and_register("alice", endpoint(":1.1")).await.unwrap();
        assert_eq!(registry.endpoints_for("alice").await.len(), 1);
    }
}
