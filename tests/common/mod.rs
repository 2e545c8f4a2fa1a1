#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use patchflow::deploy::{DeployClient, StartedDeployment};
use patchflow::repository::{CommitRef, RepositoryApply, RepositoryMetadataSource};
use patchflow::transport::{ProviderRequest, UpstreamResponse, UpstreamTransport};
use patchflow::*;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

/// One scripted upstream reply.
pub enum Scripted {
    Reply {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        chunks: Vec<String>,
    },
    NetworkError,
}

impl Scripted {
    pub fn ok(chunks: Vec<String>) -> Self {
        Self::Reply {
            status: 200,
            headers: Vec::new(),
            chunks,
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self::Reply {
            status,
            headers: Vec::new(),
            chunks: vec![body.to_string()],
        }
    }
}

/// SSE chunks for an OpenAI-style stream of `pieces`, ending in `[DONE]`.
pub fn openai_sse(pieces: &[&str]) -> Vec<String> {
    let mut chunks: Vec<String> = pieces
        .iter()
        .map(|p| {
            format!(
                "data: {}\n\n",
                serde_json::json!({ "choices": [ { "delta": { "content": p } } ] })
            )
        })
        .collect();
    chunks.push("data: [DONE]\n\n".to_string());
    chunks
}

#[derive(Default)]
pub struct FakeTransport {
    script: Mutex<VecDeque<Scripted>>,
    pub requests: Mutex<Vec<ProviderRequest>>,
}

impl FakeTransport {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        match self.requests.lock() {
            Ok(r) => r.len(),
            Err(p) => p.into_inner().len(),
        }
    }

    pub fn models(&self) -> Vec<String> {
        let requests = match self.requests.lock() {
            Ok(r) => r.clone(),
            Err(p) => p.into_inner().clone(),
        };
        requests
            .iter()
            .filter_map(|r| r.body.get("model").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl UpstreamTransport for FakeTransport {
    async fn send(&self, request: ProviderRequest) -> Result<UpstreamResponse> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(request);
        }
        let next = match self.script.lock() {
            Ok(mut s) => s.pop_front(),
            Err(_) => None,
        };
        match next {
            Some(Scripted::Reply {
                status,
                headers,
                chunks,
            }) => {
                let mut map = HeaderMap::new();
                for (name, value) in headers {
                    map.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
                }
                let body = futures_util::stream::iter(
                    chunks.into_iter().map(|c| Ok::<Bytes, std::io::Error>(Bytes::from(c))),
                )
                .boxed();
                Ok(UpstreamResponse {
                    status,
                    headers: map,
                    body,
                })
            }
            Some(Scripted::NetworkError) => Err(PatchflowError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            ))
            .into()),
            None => Err(PatchflowError::Configuration("transport script exhausted".into()).into()),
        }
    }
}

/// Scripted status sequence per started deployment.
pub struct FakeDeployClient {
    pub provider: HostingProvider,
    /// One entry per `start` call; `None` means the start itself fails.
    starts: Mutex<VecDeque<Option<Vec<std::result::Result<DeployState, String>>>>>,
    statuses: Mutex<std::collections::HashMap<String, VecDeque<std::result::Result<DeployState, String>>>>,
    pub started_bodies: Mutex<Vec<Value>>,
    pub log_text: String,
}

impl FakeDeployClient {
    pub fn new(starts: Vec<Option<Vec<std::result::Result<DeployState, String>>>>) -> Self {
        Self {
            provider: HostingProvider::Vercel,
            starts: Mutex::new(starts.into()),
            statuses: Mutex::new(Default::default()),
            started_bodies: Mutex::new(Vec::new()),
            log_text: "Error: Cannot find module 'react'".to_string(),
        }
    }

    pub fn start_count(&self) -> usize {
        match self.started_bodies.lock() {
            Ok(b) => b.len(),
            Err(p) => p.into_inner().len(),
        }
    }

    pub fn bodies(&self) -> Vec<Value> {
        match self.started_bodies.lock() {
            Ok(b) => b.clone(),
            Err(p) => p.into_inner().clone(),
        }
    }
}

#[async_trait]
impl DeployClient for FakeDeployClient {
    fn provider(&self) -> HostingProvider {
        self.provider
    }

    async fn start(&self, body: &Value) -> Result<StartedDeployment> {
        let index = {
            let mut bodies = match self.started_bodies.lock() {
                Ok(b) => b,
                Err(p) => p.into_inner(),
            };
            bodies.push(body.clone());
            bodies.len()
        };
        let next = match self.starts.lock() {
            Ok(mut s) => s.pop_front().flatten(),
            Err(_) => None,
        };
        match next {
            Some(states) => {
                let id = format!("dpl_{}", index);
                if let Ok(mut map) = self.statuses.lock() {
                    map.insert(id.clone(), states.into());
                }
                Ok(StartedDeployment {
                    diagnostics_ref: Some(format!("https://inspect.example/{}", id)),
                    url: Some(format!("https://{}.example.app", id)),
                    id,
                })
            }
            None => Err(PatchflowError::Hosting {
                provider: self.provider,
                status: Some(409),
                message: "project name taken".into(),
            }
            .into()),
        }
    }

    async fn status(&self, deployment_id: &str) -> Result<DeploymentOutcome> {
        let next = match self.statuses.lock() {
            Ok(mut map) => map.get_mut(deployment_id).and_then(|q| q.pop_front()),
            Err(_) => None,
        };
        let state = match next {
            Some(Ok(state)) => state,
            Some(Err(message)) => {
                return Err(PatchflowError::Hosting {
                    provider: self.provider,
                    status: Some(503),
                    message,
                }
                .into())
            }
            None => DeployState::Building,
        };
        let failed = state == DeployState::Error;
        Ok(DeploymentOutcome {
            state,
            id: deployment_id.to_string(),
            url: None,
            diagnostics_ref: None,
            error_code: failed.then(|| "BUILD_FAILED".to_string()),
            error_message: failed.then(|| "npm run build exited with 1".to_string()),
        })
    }

    async fn fetch_logs(&self, _deployment_id: &str) -> Result<String> {
        Ok(self.log_text.clone())
    }
}

#[derive(Default)]
pub struct FakeRepository {
    pub fail: bool,
    pub commits: Mutex<Vec<(String, String, Vec<FileChange>)>>,
}

impl FakeRepository {
    pub fn commit_count(&self) -> usize {
        match self.commits.lock() {
            Ok(c) => c.len(),
            Err(p) => p.into_inner().len(),
        }
    }
}

#[async_trait]
impl RepositoryApply for FakeRepository {
    async fn apply(
        &self,
        _repo: &RepoRef,
        branch: &str,
        commit_message: &str,
        files: &[FileChange],
    ) -> Result<CommitRef> {
        if self.fail {
            return Err(PatchflowError::Apply("protected branch".into()).into());
        }
        let mut commits = match self.commits.lock() {
            Ok(c) => c,
            Err(p) => p.into_inner(),
        };
        commits.push((branch.to_string(), commit_message.to_string(), files.to_vec()));
        Ok(CommitRef {
            sha: format!("c0ffee{}", commits.len()),
            url: None,
        })
    }
}

pub struct FakeMetadata(pub Vec<String>);

#[async_trait]
impl RepositoryMetadataSource for FakeMetadata {
    async fn list_paths(&self, _repo: &RepoRef, _branch: &str) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

pub fn ready_after(polls: usize) -> Option<Vec<std::result::Result<DeployState, String>>> {
    let mut states: Vec<std::result::Result<DeployState, String>> =
        (0..polls).map(|_| Ok(DeployState::Building)).collect();
    states.push(Ok(DeployState::Ready));
    Some(states)
}

pub fn build_error() -> Option<Vec<std::result::Result<DeployState, String>>> {
    Some(vec![Ok(DeployState::Building), Ok(DeployState::Error)])
}
