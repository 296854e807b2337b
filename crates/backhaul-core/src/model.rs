//! Tenant model as served by the control plane.
//!
//! Payloads are camelCase JSON. Enumerations arrive either by name or by
//! numeric value, so every enum here deserializes through [`EnumRepr`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire form of a control-plane enumeration: a number or a name.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum EnumRepr {
    Number(i64),
    Name(String),
}

/// How a project's public host is derived from its domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EnumRepr")]
pub enum DomainType {
    /// Subdomain of the platform suffix.
    Default,
    /// Fully custom domain, used verbatim.
    Custom,
}

impl TryFrom<EnumRepr> for DomainType {
    type Error = String;

    fn try_from(repr: EnumRepr) -> Result<Self, Self::Error> {
        match repr {
            EnumRepr::Number(1) => Ok(Self::Default),
            EnumRepr::Number(2) => Ok(Self::Custom),
            EnumRepr::Name(name) if name.eq_ignore_ascii_case("default") => Ok(Self::Default),
            EnumRepr::Name(name) if name.eq_ignore_ascii_case("custom") => Ok(Self::Custom),
            other => Err(format!("unknown domain type: {other:?}")),
        }
    }
}

/// Lifecycle state shared by projects and app-projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EnumRepr")]
pub enum ProjectState {
    Active,
    Inactive,
}

impl TryFrom<EnumRepr> for ProjectState {
    type Error = String;

    fn try_from(repr: EnumRepr) -> Result<Self, Self::Error> {
        match repr {
            EnumRepr::Number(1) => Ok(Self::Active),
            EnumRepr::Number(2) => Ok(Self::Inactive),
            EnumRepr::Name(name) if name.eq_ignore_ascii_case("active") => Ok(Self::Active),
            EnumRepr::Name(name) if name.eq_ignore_ascii_case("inactive") => Ok(Self::Inactive),
            other => Err(format!("unknown project state: {other:?}")),
        }
    }
}

/// Role of an app-project in a port-forward pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EnumRepr")]
pub enum AppProjectType {
    UsePort,
    SharePort,
}

impl TryFrom<EnumRepr> for AppProjectType {
    type Error = String;

    fn try_from(repr: EnumRepr) -> Result<Self, Self::Error> {
        match repr {
            EnumRepr::Number(1) => Ok(Self::UsePort),
            EnumRepr::Number(2) => Ok(Self::SharePort),
            EnumRepr::Name(name) if name.eq_ignore_ascii_case("useport") => Ok(Self::UsePort),
            EnumRepr::Name(name) if name.eq_ignore_ascii_case("shareport") => Ok(Self::SharePort),
            other => Err(format!("unknown app project type: {other:?}")),
        }
    }
}

/// A customer account. The username keys every per-tenant bus queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: i64,
    pub view_id: Uuid,
    #[serde(default)]
    pub external_id: String,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub family: String,
}

/// A public HTTP endpoint mapped to a private internal URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub view_id: Uuid,
    pub customer_id: i64,
    #[serde(default)]
    pub title: String,
    pub domain_type: DomainType,
    pub domain: String,
    pub internal_url: String,
    pub state: ProjectState,
    #[serde(default)]
    pub date_created: Option<String>,
    #[serde(default)]
    pub date_updated: Option<String>,
    pub customer: Customer,
}

impl Project {
    /// Externally visible hostname of this project.
    ///
    /// `Default` domains are subdomains of `platform_suffix`
    /// (e.g. `acme` + `.app.example.com`); `Custom` domains are used verbatim.
    pub fn host(&self, platform_suffix: &str) -> String {
        match self.domain_type {
            DomainType::Default => format!("{}{}", self.domain, platform_suffix),
            DomainType::Custom => self.domain.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ProjectState::Active
    }
}

/// A raw port-forward endpoint.
///
/// An entry with `app_project_view_id` set is a use-port whose traffic is
/// forwarded to the share-port identified by that view id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppProject {
    pub id: i64,
    pub view_id: Uuid,
    #[serde(default)]
    pub app_project_view_id: Option<Uuid>,
    pub customer_id: i64,
    #[serde(default)]
    pub title: String,
    pub app_project_type: AppProjectType,
    pub internal_port: u16,
    pub state: ProjectState,
    #[serde(default)]
    pub date_created: Option<String>,
    #[serde(default)]
    pub date_updated: Option<String>,
    pub customer: Customer,
}

impl AppProject {
    pub fn is_active(&self) -> bool {
        self.state == ProjectState::Active
    }

    /// Forwarding destination, if this entry is a use-port.
    pub fn forward_target(&self) -> Option<Uuid> {
        self.app_project_view_id
    }
}

/// Builders for tests in this workspace.
#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures {
    use super::*;

    pub fn customer(username: &str) -> Customer {
        Customer {
            id: 1,
            view_id: Uuid::new_v4(),
            external_id: String::new(),
            username: username.to_string(),
            email: format!("{username}@example.com"),
            name: username.to_string(),
            family: String::new(),
        }
    }

    pub fn project(username: &str, domain: &str, domain_type: DomainType) -> Project {
        Project {
            id: 1,
            view_id: Uuid::new_v4(),
            customer_id: 1,
            title: domain.to_string(),
            domain_type,
            domain: domain.to_string(),
            internal_url: "http://localhost:3000".to_string(),
            state: ProjectState::Active,
            date_created: None,
            date_updated: None,
            customer: customer(username),
        }
    }

    /// An active app-project. Entries with a `link` are use-ports.
    pub fn app_project(username: &str, port: u16, link: Option<Uuid>) -> AppProject {
        AppProject {
            id: 1,
            view_id: Uuid::new_v4(),
            app_project_view_id: link,
            customer_id: 1,
            title: format!("{username}:{port}"),
            app_project_type: if link.is_some() {
                AppProjectType::UsePort
            } else {
                AppProjectType::SharePort
            },
            internal_port: port,
            state: ProjectState::Active,
            date_created: None,
            date_updated: None,
            customer: customer(username),
        }
    }
}
