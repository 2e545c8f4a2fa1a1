use super::{read_hosting_json, DeployClient, StartedDeployment};
use crate::constants::RENDER_API_BASE;
use crate::types::{DeployState, DeploymentOutcome, HostingProvider, PatchflowError, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Render deployments are addressed by service and deploy; both travel in one id.
const ID_SEPARATOR: char = ':';

fn split_id(deployment_id: &str) -> Result<(&str, &str)> {
    deployment_id
        .split_once(ID_SEPARATOR)
        .filter(|(service, deploy)| !service.is_empty() && !deploy.is_empty())
        .ok_or_else(|| {
            PatchflowError::Hosting {
                provider: HostingProvider::Render,
                status: None,
                message: format!("malformed deployment id: {}", deployment_id),
            }
            .into()
        })
}

pub fn map_deploy_status(status: &str) -> DeployState {
    match status {
        "live" => DeployState::Ready,
        "build_failed" | "update_failed" | "pre_deploy_failed" | "canceled" | "deactivated" => {
            DeployState::Error
        }
        "build_in_progress" | "update_in_progress" | "pre_deploy_in_progress" => DeployState::Building,
        _ => DeployState::Pending,
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

/// REST client for `api.render.com`. Each candidate creates a service, which
/// triggers its first deploy.
pub struct RenderClient {
    client: reqwest::Client,
    token: String,
    owner_id: String,
    base_url: String,
}

impl RenderClient {
    pub fn new(client: reqwest::Client, token: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            client,
            token: token.into(),
            owner_id: owner_id.into(),
            base_url: RENDER_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("[⚙️  -> 🚀] GET {}", url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .map_err(PatchflowError::Network)?;
        read_hosting_json(HostingProvider::Render, response).await
    }
}

#[async_trait]
impl DeployClient for RenderClient {
    fn provider(&self) -> HostingProvider {
        HostingProvider::Render
    }

    async fn start(&self, body: &Value) -> Result<StartedDeployment> {
        let mut body = body.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("ownerId".to_string(), Value::String(self.owner_id.clone()));
        }
        let url = format!("{}/services", self.base_url);
        tracing::debug!("[⚙️  -> 🚀] POST {}", url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(PatchflowError::Network)?;
        let created = read_hosting_json(HostingProvider::Render, response).await?;

        let (Some(service_id), Some(deploy_id)) =
            (str_at(&created, "/service/id"), str_at(&created, "/deployId"))
        else {
            return Err(PatchflowError::Hosting {
                provider: HostingProvider::Render,
                status: None,
                message: "service created without an initial deploy".to_string(),
            }
            .into());
        };
        Ok(StartedDeployment {
            id: format!("{}{}{}", service_id, ID_SEPARATOR, deploy_id),
            url: str_at(&created, "/service/serviceDetails/url").map(str::to_string),
            diagnostics_ref: str_at(&created, "/service/dashboardUrl").map(str::to_string),
        })
    }

    async fn status(&self, deployment_id: &str) -> Result<DeploymentOutcome> {
        let (service_id, deploy_id) = split_id(deployment_id)?;
        let deploy = self
            .get(&format!("/services/{}/deploys/{}", service_id, deploy_id), &[])
            .await?;
        let status = str_at(&deploy, "/status").unwrap_or("created");
        let state = map_deploy_status(status);
        let (error_code, error_message) = match state {
            DeployState::Error => (
                Some(status.to_ascii_uppercase()),
                Some(format!("deploy {} ended as {}", deploy_id, status)),
            ),
            _ => (None, None),
        };
        Ok(DeploymentOutcome {
            state,
            id: deployment_id.to_string(),
            url: None,
            diagnostics_ref: None,
            error_code,
            error_message,
        })
    }

    async fn fetch_logs(&self, deployment_id: &str) -> Result<String> {
        let (service_id, _) = split_id(deployment_id)?;
        let logs = self
            .get(
                "/logs",
                &[
                    ("ownerId", self.owner_id.as_str()),
                    ("resource", service_id),
                    ("type", "build"),
                    ("direction", "backward"),
                    ("limit", "100"),
                ],
            )
            .await?;
        Ok(logs_to_text(&logs))
    }
}

/// Render returns newest-first when reading backward; emit oldest first.
pub fn logs_to_text(logs: &Value) -> String {
    let Some(items) = logs.get("logs").and_then(Value::as_array) else {
        return String::new();
    };
    let mut lines: Vec<&str> = items
        .iter()
        .filter_map(|entry| entry.get("message").and_then(Value::as_str))
        .collect();
    lines.reverse();
    lines.join("\n")
}
