//! Control-plane change feed.
//!
//! The control plane announces every project or app-project change on
//! `api_to_server_external_bus`. A notification only names what kind of set
//! changed; the relay then re-fetches that whole set.

use super::client::ControlPlane;
use crate::consumer::{start_consumer, DeliveryHandler};
use crate::directory::RouteDirectory;
use crate::topology::TopologyManager;
use backhaul_core::names;
use backhaul_core::{BoxFuture, Message, MessageBus, RelayError, RelayResult};
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// A change announced by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeNotification {
    ProjectCreated,
    ProjectDeleted,
    ProjectPatched,
    AppProjectCreated,
    AppProjectDeleted,
    AppProjectPatched,
}

impl ChangeNotification {
    pub fn affects_projects(self) -> bool {
        matches!(
            self,
            Self::ProjectCreated | Self::ProjectDeleted | Self::ProjectPatched
        )
    }
}

impl FromStr for ChangeNotification {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "PROJECT_CREATED" => Ok(Self::ProjectCreated),
            "PROJECT_DELETED" => Ok(Self::ProjectDeleted),
            "PROJECT_PATCHED" => Ok(Self::ProjectPatched),
            "APP_PROJECT_CREATED" => Ok(Self::AppProjectCreated),
            "APP_PROJECT_DELETED" => Ok(Self::AppProjectDeleted),
            "APP_PROJECT_PATCHED" => Ok(Self::AppProjectPatched),
            other => Err(RelayError::UnknownNotification(other.to_string())),
        }
    }
}

/// Keeps the route directory in step with the control plane.
pub struct DirectorySync {
    control: Arc<dyn ControlPlane>,
    directory: Arc<RouteDirectory>,
}

impl DirectorySync {
    pub fn new(control: Arc<dyn ControlPlane>, directory: Arc<RouteDirectory>) -> Self {
        Self { control, directory }
    }

    pub async fn refresh_projects(&self) -> RelayResult<usize> {
        let projects = self.control.fetch_active_projects().await?;
        Ok(self.directory.refresh(projects).await)
    }

    pub async fn refresh_app_projects(&self) -> RelayResult<usize> {
        let app_projects = self.control.fetch_active_app_projects().await?;
        Ok(self.directory.refresh_app_projects(app_projects).await)
    }

    /// Re-fetch whatever set `notification` says changed.
    pub async fn apply(&self, notification: ChangeNotification) -> RelayResult<usize> {
        if notification.affects_projects() {
            self.refresh_projects().await
        } else {
            self.refresh_app_projects().await
        }
    }

    /// Load both sets, then follow the change feed.
    pub async fn start(
        self: &Arc<Self>,
        bus: &dyn MessageBus,
        topology: &TopologyManager,
    ) -> RelayResult<JoinHandle<()>> {
        let projects = self.refresh_projects().await?;
        let app_projects = self.refresh_app_projects().await?;
        info!(projects, app_projects, "route directory loaded");

        topology.ensure_forward_queue(names::EXTERNAL_BUS_QUEUE).await?;
        start_consumer(bus, names::EXTERNAL_BUS_QUEUE, self.clone()).await
    }
}

impl DeliveryHandler for DirectorySync {
    fn handle<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, RelayResult<()>> {
        Box::pin(async move {
            let text = String::from_utf8_lossy(&message.body);
            let notification: ChangeNotification = text.parse()?;
            let count = self.apply(notification).await?;
            info!(notification = ?notification, count, "directory refreshed");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{app_project, project, StaticControlPlane};
    use backhaul_core::{DomainType, MemoryBus};
    use std::time::Duration;

    #[test]
    fn test_parse_notifications() {
        assert_eq!(
            " PROJECT_PATCHED\n".parse::<ChangeNotification>().unwrap(),
            ChangeNotification::ProjectPatched
        );
        let n: ChangeNotification = "APP_PROJECT_DELETED".parse().unwrap();
        assert!(!n.affects_projects());
        assert!(matches!(
            "project_created".parse::<ChangeNotification>(),
            Err(RelayError::UnknownNotification(_))
        ));
    }

    #[tokio::test]
    async fn test_notification_refetches_full_set() {
        let control = Arc::new(StaticControlPlane::default());
        control
            .set_projects(vec![project("alice", "acme", DomainType::Default)])
            .await;
        let directory = Arc::new(RouteDirectory::new(".app.example.com"));
        let sync = DirectorySync::new(control.clone(), directory.clone());

        sync.apply(ChangeNotification::ProjectCreated).await.unwrap();
        assert!(directory.resolve("acme.app.example.com").await.is_ok());

        control.set_projects(Vec::new()).await;
        sync.apply(ChangeNotification::ProjectDeleted).await.unwrap();
        assert!(directory.resolve("acme.app.example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_start_loads_and_follows_feed() {
        let control = Arc::new(StaticControlPlane::default());
        control
            .set_app_projects(vec![app_project("bob", 5000, None)])
            .await;
        let directory = Arc::new(RouteDirectory::new(".app.example.com"));
        let bus = Arc::new(MemoryBus::new());
        let topology = TopologyManager::new(bus.clone());
        let sync = Arc::new(DirectorySync::new(control.clone(), directory.clone()));

        sync.start(bus.as_ref(), &topology).await.unwrap();
        assert!(directory.resolve_app_project("bob", 5000).await.is_ok());

        control
            .set_projects(vec![project("carol", "carol.dev", DomainType::Custom)])
            .await;
        bus.publish("", "api_to_server_external_bus", Message::new("GARBAGE"))
            .await
            .unwrap();
        bus.publish("", "api_to_server_external_bus", Message::new("PROJECT_CREATED"))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while directory.resolve("carol.dev").await.is_err() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_when_control_plane_is_down() {
        let control = Arc::new(StaticControlPlane::default());
        control.fail_with("unreachable").await;
        let directory = Arc::new(RouteDirectory::new(".app.example.com"));
        let bus = Arc::new(MemoryBus::new());
        let topology = TopologyManager::new(bus.clone());
        let sync = Arc::new(DirectorySync::new(control, directory));
        assert!(sync.start(bus.as_ref(), &topology).await.is_err());
    }
}
