//! Payloads exchanged with the remote dev session API and with local
//! function request handlers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of Connected Pages project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    /// Web page extension (served through the local HTTPS proxy)
    #[serde(alias = "web-page")]
    WebPage,
    /// Mobile page extension (served through the local HTTPS proxy)
    #[serde(alias = "mobile-page")]
    MobilePage,
    /// Serverless function (served by the local request-handler server)
    Function,
    /// Shared library (compiled only, never tunneled)
    Library,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::WebPage => "webpage",
            ProjectType::MobilePage => "mobilepage",
            ProjectType::Function => "function",
            ProjectType::Library => "library",
        }
    }

    /// Whether a dev session for this kind exposes a public tunnel.
    pub fn is_tunneled(&self) -> bool {
        !matches!(self, ProjectType::Library)
    }
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ProjectType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webpage" | "web-page" => Ok(ProjectType::WebPage),
            "mobilepage" | "mobile-page" => Ok(ProjectType::MobilePage),
            "function" => Ok(ProjectType::Function),
            "library" => Ok(ProjectType::Library),
            other => Err(format!("unknown project type '{other}'")),
        }
    }
}

/// Body of `POST /pkgr/dev/start-session`.
///
/// The same payload is re-sent as the session heartbeat, so the remote side
/// must treat it as idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevSessionStart {
    pub url: String,
    pub name: String,
    #[serde(rename = "type")]
    pub project_type: ProjectType,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Body of `POST /pkgr/dev/stop-session`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevSessionStop {
    pub url: String,
}

/// One HTTP request handed to a function handler process as a JSON line on
/// its stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// UTF-8 body text (lossy for binary payloads)
    #[serde(default)]
    pub body: String,
}

/// The JSON line a function handler process writes back on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
}

fn default_status() -> u16 {
    200
}

impl FunctionResponse {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        Self {
            status,
            headers,
            body: body.into(),
        }
    }
}
