mod common;

use common::{build_error, ready_after, FakeDeployClient, FakeMetadata};
use patchflow::config::PollConfig;
use patchflow::deploy::{DeployEngine, DeployRequest, POLL_TIMEOUT, START_FAILED, STATUS_UNAVAILABLE};
use patchflow::repository::NoRepositoryMetadata;
use patchflow::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast_poll(max_polls: u32) -> PollConfig {
    PollConfig {
        interval: Duration::ZERO,
        max_polls,
        max_status_errors: 2,
    }
}

fn request() -> DeployRequest {
    DeployRequest {
        provider: HostingProvider::Vercel,
        repo: RepoRef::new("acme", "shop"),
        branch: "fix/build".into(),
        project_name: "shop".into(),
    }
}

fn engine(client: Arc<FakeDeployClient>, paths: &[&str], poll: PollConfig) -> DeployEngine {
    let metadata = FakeMetadata(paths.iter().map(|p| p.to_string()).collect());
    DeployEngine::new(client, Arc::new(metadata), poll)
}

#[tokio::test]
async fn test_first_candidate_ready() {
    let client = Arc::new(FakeDeployClient::new(vec![ready_after(2)]));
    let outcome = engine(client.clone(), &[], fast_poll(10))
        .run_deploy_attempt(&request(), &CancellationToken::new())
        .await;

    match outcome {
        Ok(o) => {
            assert_eq!(o.state, DeployState::Ready);
            assert_eq!(o.id, "dpl_1");
            assert_eq!(o.diagnostics_ref.as_deref(), Some("https://inspect.example/dpl_1"));
            assert_eq!(o.url.as_deref(), Some("https://dpl_1.example.app"));
        }
        Err(e) => panic!("Expected ready deployment, got {}", e),
    }
    assert_eq!(client.start_count(), 1);
}

#[tokio::test]
async fn test_candidates_tried_in_order_until_success() {
    // First start is rejected, the second build errors, the third deploys.
    let client = Arc::new(FakeDeployClient::new(vec![None, build_error(), ready_after(0)]));
    let outcome = engine(client.clone(), &["frontend/package.json"], fast_poll(10))
        .run_deploy_attempt(&request(), &CancellationToken::new())
        .await;

    match outcome {
        Ok(o) => assert_eq!(o.id, "dpl_3"),
        Err(e) => panic!("Expected third candidate to deploy, got {}", e),
    }
    let names: Vec<String> = client
        .bodies()
        .iter()
        .map(|b| b["name"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(names, vec!["shop", "shop-fix-build", "acme-shop"]);
}

#[tokio::test]
async fn test_all_candidates_fail_with_aggregate_error() {
    // Only the repository root is known; a feature branch yields three name variants.
    let client = Arc::new(FakeDeployClient::new(vec![None, build_error(), build_error()]));
    let result = DeployEngine::new(client.clone(), Arc::new(NoRepositoryMetadata), fast_poll(10))
        .run_deploy_attempt(&request(), &CancellationToken::new())
        .await;

    match result {
        Err(e) => match e.inner {
            PatchflowError::DeployFailed { last, attempts } => {
                assert_eq!(attempts.len(), 3);
                assert_eq!(attempts[0].error_code, START_FAILED);
                assert!(attempts[0].deployment_id.is_none());
                assert_eq!(last.error_code, "BUILD_FAILED");
                assert_eq!(last.deployment_id.as_deref(), Some("dpl_3"));
                assert_eq!(last.diagnostics_ref.as_deref(), Some("https://inspect.example/dpl_3"));
                assert_eq!(last.strategy_label, "root=. name=acme-shop");
            }
            other => panic!("Expected DeployFailed, got {}", other),
        },
        Ok(o) => panic!("Expected failure, got {:?}", o),
    }
    assert_eq!(client.start_count(), 3);
}

#[tokio::test]
async fn test_poll_budget_exhaustion_is_a_timeout() {
    let client = Arc::new(FakeDeployClient::new(vec![ready_after(50), None, None]));
    let result = DeployEngine::new(client, Arc::new(NoRepositoryMetadata), fast_poll(3))
        .run_deploy_attempt(&request(), &CancellationToken::new())
        .await;

    match result {
        Err(e) => match e.inner {
            PatchflowError::DeployFailed { attempts, .. } => {
                assert_eq!(attempts[0].error_code, POLL_TIMEOUT);
            }
            other => panic!("Expected DeployFailed, got {}", other),
        },
        Ok(o) => panic!("Expected timeout, got {:?}", o),
    }
}

#[tokio::test]
async fn test_transient_status_errors_are_tolerated() {
    let states = Some(vec![
        Err("gateway timeout".to_string()),
        Err("gateway timeout".to_string()),
        Ok(DeployState::Ready),
    ]);
    let client = Arc::new(FakeDeployClient::new(vec![states]));
    let result = DeployEngine::new(client, Arc::new(NoRepositoryMetadata), fast_poll(10))
        .run_deploy_attempt(&request(), &CancellationToken::new())
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_persistent_status_errors_abandon_candidate() {
    let failing = Some(vec![
        Err("down".to_string()),
        Err("down".to_string()),
        Err("down".to_string()),
    ]);
    let client = Arc::new(FakeDeployClient::new(vec![failing, None, None]));
    let result = DeployEngine::new(client, Arc::new(NoRepositoryMetadata), fast_poll(10))
        .run_deploy_attempt(&request(), &CancellationToken::new())
        .await;

    match result {
        Err(e) => match e.inner {
            PatchflowError::DeployFailed { attempts, .. } => {
                assert_eq!(attempts[0].error_code, STATUS_UNAVAILABLE);
            }
            other => panic!("Expected DeployFailed, got {}", other),
        },
        Ok(o) => panic!("Expected failure, got {:?}", o),
    }
}

#[tokio::test]
async fn test_cancellation_stops_polling() {
    let client = Arc::new(FakeDeployClient::new(vec![ready_after(1_000)]));
    let cancel = CancellationToken::new();
    let poll = PollConfig {
        interval: Duration::from_millis(20),
        max_polls: 1_000,
        max_status_errors: 2,
    };
    let engine = DeployEngine::new(client.clone(), Arc::new(NoRepositoryMetadata), poll);

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        trigger.cancel();
    });

    match engine.run_deploy_attempt(&request(), &cancel).await {
        Err(e) => assert!(e.is_cancelled()),
        Ok(o) => panic!("Expected cancellation, got {:?}", o),
    }
    assert_eq!(client.start_count(), 1);
}

#[tokio::test]
async fn test_mismatched_provider_is_configuration_error() {
    let client = Arc::new(FakeDeployClient::new(vec![ready_after(0)]));
    let mut req = request();
    req.provider = HostingProvider::Render;
    let result = DeployEngine::new(client.clone(), Arc::new(NoRepositoryMetadata), fast_poll(1))
        .run_deploy_attempt(&req, &CancellationToken::new())
        .await;

    match result {
        Err(e) => assert!(matches!(e.inner, PatchflowError::Configuration(_))),
        Ok(o) => panic!("Expected configuration error, got {:?}", o),
    }
    assert_eq!(client.start_count(), 0);
}
