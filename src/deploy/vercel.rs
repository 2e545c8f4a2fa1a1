use super::{read_hosting_json, DeployClient, StartedDeployment};
use crate::constants::VERCEL_API_BASE;
use crate::types::{DeployState, DeploymentOutcome, HostingProvider, PatchflowError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VercelDeployment {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    inspector_url: Option<String>,
    #[serde(default)]
    ready_state: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl VercelDeployment {
    fn public_url(&self) -> Option<String> {
        self.url.as_ref().map(|u| {
            if u.starts_with("http") {
                u.clone()
            } else {
                format!("https://{}", u)
            }
        })
    }
}

pub fn map_ready_state(state: &str) -> DeployState {
    match state.to_ascii_uppercase().as_str() {
        "READY" => DeployState::Ready,
        "ERROR" | "CANCELED" | "DELETED" => DeployState::Error,
        "BUILDING" | "INITIALIZING" | "DEPLOYING" => DeployState::Building,
        _ => DeployState::Pending,
    }
}

/// REST client for `api.vercel.com` deployments.
pub struct VercelClient {
    client: reqwest::Client,
    token: String,
    team_id: Option<String>,
    base_url: String,
}

impl VercelClient {
    pub fn new(client: reqwest::Client, token: impl Into<String>, team_id: Option<String>) -> Self {
        Self {
            client,
            token: token.into(),
            team_id: team_id.filter(|t| !t.trim().is_empty()),
            base_url: VERCEL_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        match &self.team_id {
            Some(team) => vec![("teamId", team.clone())],
            None => Vec::new(),
        }
    }

    async fn get(&self, path: &str, extra: &[(&'static str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("[⚙️  -> 🚀] GET {}", url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&self.query())
            .query(extra)
            .send()
            .await
            .map_err(PatchflowError::Network)?;
        read_hosting_json(HostingProvider::Vercel, response).await
    }
}

#[async_trait]
impl DeployClient for VercelClient {
    fn provider(&self) -> HostingProvider {
        HostingProvider::Vercel
    }

    async fn start(&self, body: &Value) -> Result<StartedDeployment> {
        let url = format!("{}/v13/deployments", self.base_url);
        tracing::debug!("[⚙️  -> 🚀] POST {}", url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .query(&self.query())
            .query(&[("skipAutoDetectionConfirmation", "1")])
            .json(body)
            .send()
            .await
            .map_err(PatchflowError::Network)?;
        let value = read_hosting_json(HostingProvider::Vercel, response).await?;
        let deployment: VercelDeployment = serde_json::from_value(value)?;
        Ok(StartedDeployment {
            url: deployment.public_url(),
            diagnostics_ref: deployment.inspector_url,
            id: deployment.id,
        })
    }

    async fn status(&self, deployment_id: &str) -> Result<DeploymentOutcome> {
        let value = self.get(&format!("/v13/deployments/{}", deployment_id), &[]).await?;
        let deployment: VercelDeployment = serde_json::from_value(value)?;
        let state = match deployment.ready_state.as_deref() {
            Some(s) => map_ready_state(s),
            None => DeployState::Pending,
        };
        Ok(DeploymentOutcome {
            state,
            url: deployment.public_url(),
            id: deployment.id,
            diagnostics_ref: deployment.inspector_url,
            error_code: deployment.error_code,
            error_message: deployment.error_message,
        })
    }

    async fn fetch_logs(&self, deployment_id: &str) -> Result<String> {
        let value = self
            .get(
                &format!("/v3/deployments/{}/events", deployment_id),
                &[("builds", "1".to_string()), ("limit", "-1".to_string())],
            )
            .await?;
        Ok(events_to_text(&value))
    }
}

/// Flattens the build event list into plain log lines.
pub fn events_to_text(events: &Value) -> String {
    let Some(items) = events.as_array() else {
        return String::new();
    };
    items
        .iter()
        .filter_map(|event| {
            event
                .pointer("/payload/text")
                .or_else(|| event.get("text"))
                .and_then(Value::as_str)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ready_state_mapping() {
        assert_eq!(map_ready_state("READY"), DeployState::Ready);
        assert_eq!(map_ready_state("ERROR"), DeployState::Error);
        assert_eq!(map_ready_state("CANCELED"), DeployState::Error);
        assert_eq!(map_ready_state("BUILDING"), DeployState::Building);
        assert_eq!(map_ready_state("QUEUED"), DeployState::Pending);
    }

    #[test]
    fn test_deployment_parse_prefixes_url() {
        let parsed: VercelDeployment = match serde_json::from_value(json!({
            "id": "dpl_1",
            "url": "shop-abc.vercel.app",
            "inspectorUrl": "https://vercel.com/acme/shop/dpl_1",
            "readyState": "ERROR",
            "errorCode": "BUILD_FAILED",
            "errorMessage": "Command \"npm run build\" exited with 1"
        })) {
            Ok(d) => d,
            Err(e) => panic!("Expected deployment, got {}", e),
        };
        assert_eq!(parsed.public_url().as_deref(), Some("https://shop-abc.vercel.app"));
        assert_eq!(parsed.error_code.as_deref(), Some("BUILD_FAILED"));
    }

    #[test]
    fn test_events_to_text() {
        let events = json!([
            { "type": "stdout", "payload": { "text": "Installing" } },
            { "type": "stderr", "text": "Error: missing module" },
            { "type": "delimiter" }
        ]);
        assert_eq!(events_to_text(&events), "Installing\nError: missing module");
        assert_eq!(events_to_text(&json!({})), "");
    }
}
