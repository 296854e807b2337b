//! Route directory: public hosts and port-forward endpoints.
//!
//! Projects are indexed by their derived host and replaced wholesale on every
//! refresh, so readers never observe a half-applied set. App-projects are
//! indexed twice, by `(username, internal port)` and by view id, and are
//! updated entry by entry.

use backhaul_core::{AppProject, Project, RelayError, RelayResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maps public hosts and port-forward keys to routing metadata.
pub struct RouteDirectory {
    /// Suffix appended to `Default`-type project domains.
    platform_suffix: String,
    /// Active projects by lowercased project host.
    projects: RwLock<Arc<HashMap<String, Project>>>,
    /// Both app-project indices, updated together.
    app_projects: RwLock<AppProjectIndex>,
}

#[derive(Default)]
struct AppProjectIndex {
    /// By `(customer username, internal port)`.
    by_port: HashMap<(String, u16), AppProject>,
    by_view: HashMap<Uuid, AppProject>,
}

impl RouteDirectory {
    /// Create an empty directory.
    pub fn new(platform_suffix: impl Into<String>) -> Self {
        Self {
            platform_suffix: platform_suffix.into(),
            projects: RwLock::new(Arc::new(HashMap::new())),
            app_projects: RwLock::new(AppProjectIndex::default()),
        }
    }

    /// Public host of `project` under this directory's platform suffix.
    pub fn project_host(&self, project: &Project) -> String {
        project.host(&self.platform_suffix)
    }

    /// Look up the active project serving `host`.
    pub async fn resolve(&self, host: &str) -> RelayResult<Project> {
        let projects = self.projects.read().await.clone();
        projects
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| RelayError::RouteNotFound(host.to_string()))
    }

    /// Look up an app-project by its owner's username and internal port.
    pub async fn resolve_app_project(&self, username: &str, port: u16) -> RelayResult<AppProject> {
        self.app_projects
            .read()
            .await
            .by_port
            .get(&(username.to_string(), port))
            .cloned()
            .ok_or_else(|| RelayError::RouteNotFound(format!("{username}:{port}")))
    }

    /// Look up an app-project by view id.
    pub async fn resolve_app_project_by_view(&self, view_id: Uuid) -> RelayResult<AppProject> {
        self.app_projects
            .read()
            .await
            .by_view
            .get(&view_id)
            .cloned()
            .ok_or_else(|| RelayError::RouteNotFound(view_id.to_string()))
    }

    /// Replace the project set. Inactive projects are skipped; when two
    /// projects resolve to the same host the first one wins.
    pub async fn refresh(&self, projects: Vec<Project>) -> usize {
        let mut next: HashMap<String, Project> = HashMap::new();
        for project in projects.into_iter().filter(Project::is_active) {
            let host = self.project_host(&project).to_ascii_lowercase();
            if let Some(existing) = next.get(&host) {
                warn!(
                    host = %host,
                    kept = existing.id,
                    ignored = project.id,
                    "duplicate project host"
                );
                continue;
            }
            next.insert(host, project);
        }

        let count = next.len();
        *self.projects.write().await = Arc::new(next);
        info!(count, "project routes refreshed");
        count
    }

    /// Upsert every active app-project into both indices.
    ///
    /// Entries missing from `app_projects` are left in place.
    pub async fn refresh_app_projects(&self, app_projects: Vec<AppProject>) -> usize {
        let active: Vec<AppProject> = app_projects
            .into_iter()
            .filter(AppProject::is_active)
            .collect();

        let mut index = self.app_projects.write().await;
        for ap in &active {
            index
                .by_port
                .insert((ap.customer.username.clone(), ap.internal_port), ap.clone());
            index.by_view.insert(ap.view_id, ap.clone());
        }
        drop(index);

        debug!(count = active.len(), "app-project routes updated");
        active.len()
    }

    /// Number of routable project hosts.
    pub async fn project_count(&self) -> usize {
        self.projects.read().await.len()
    }
}
