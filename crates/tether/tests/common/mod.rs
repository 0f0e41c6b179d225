//! Shared harness for integration tests: a registry wired to in-memory
//! collaborators and a throwaway data directory.

use std::sync::Arc;
use std::time::Duration;

use tether::crypto::TokenSealer;
use tether::directory::{GitState, MemoryDirectory, UserProfile};
use tether::events::MemoryEventBus;
use tether::github::GitProviderClient;
use tether::sandbox::StaticProvisioner;
use tether::session::{
    SessionDeps, SessionHandle, SessionRegistry, SessionStatus, StartRequest,
};
use tether_protocol::{ClientEvent, RunnerCommand};
use tokio::sync::mpsc::UnboundedReceiver;

pub const RUNNER_TOKEN: &str = "test-runner-token";
pub const OWNER: &str = "u1";

pub struct TestEnv {
    pub registry: Arc<SessionRegistry>,
    pub directory: Arc<MemoryDirectory>,
    pub provisioner: Arc<StaticProvisioner>,
    pub events: Arc<MemoryEventBus>,
    pub sealer: TokenSealer,
    _tmp: tempfile::TempDir,
}

pub fn test_env() -> TestEnv {
    let tmp = tempfile::tempdir().expect("tempdir");
    let directory = Arc::new(MemoryDirectory::new());
    let provisioner = StaticProvisioner::new();
    let events = Arc::new(MemoryEventBus::new());
    let sealer = TokenSealer::new("integration-test-secret");

    directory.seed_user(UserProfile {
        id: OWNER.to_string(),
        name: Some("Sam".to_string()),
        email: Some("sam@example.com".to_string()),
        avatar: None,
        git_name: Some("Sam Doe".to_string()),
        git_email: Some("sam@git.example.com".to_string()),
    });

    let registry = SessionRegistry::new(
        tmp.path().to_path_buf(),
        SessionDeps {
            directory: directory.clone(),
            provisioner: provisioner.clone(),
            events: events.clone(),
            git: GitProviderClient::default(),
            sealer: sealer.clone(),
            default_idle_timeout_ms: 60_000,
        },
    );

    TestEnv {
        registry,
        directory,
        provisioner,
        events,
        sealer,
        _tmp: tmp,
    }
}

/// A start request with provisioner endpoints but no inline sandbox.
pub fn start_request_provisioned() -> StartRequest {
    StartRequest {
        user_id: OWNER.to_string(),
        workspace: "/workspace".to_string(),
        runner_token: RUNNER_TOKEN.to_string(),
        sandbox_id: None,
        tunnels: None,
        backend_url: Some("http://provisioner/spawn".to_string()),
        terminate_url: Some("http://provisioner/terminate".to_string()),
        hibernate_url: Some("http://provisioner/hibernate".to_string()),
        restore_url: Some("http://provisioner/restore".to_string()),
        idle_timeout_ms: None,
        spawn_request: Some(Default::default()),
        initial_prompt: None,
        initial_model: None,
    }
}

/// A start request carrying inline sandbox info (running immediately).
pub fn start_request_inline() -> StartRequest {
    StartRequest {
        sandbox_id: Some("sb-inline".to_string()),
        tunnels: Some(Default::default()),
        ..start_request_provisioned()
    }
}

pub fn seed_git_state(env: &TestEnv, session_id: &str) {
    env.directory.seed_git_state(
        session_id,
        GitState {
            repo_url: Some("https://github.com/acme/app".to_string()),
            branch: Some("feat-x".to_string()),
            base_branch: Some("main".to_string()),
            ..Default::default()
        },
    );
}

/// Poll the session until it reaches the wanted lifecycle status.
pub async fn wait_for_status(handle: &SessionHandle, wanted: SessionStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if let Ok(snapshot) = handle.status().await {
            if snapshot.status == wanted {
                return;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("session never reached status {}", wanted);
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
}

/// Next command from the runner channel, within a timeout.
pub async fn next_command(rx: &mut UnboundedReceiver<RunnerCommand>) -> RunnerCommand {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for runner command")
        .expect("runner channel closed")
}

/// Next client event matching the predicate; unrelated events are skipped.
pub async fn next_event_where(
    rx: &mut UnboundedReceiver<ClientEvent>,
    mut pred: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for client event");
        let event = tokio::time::timeout(remaining, rx.recv())
            .await
            .expect("timed out waiting for client event")
            .expect("client channel closed");
        if pred(&event) {
            return event;
        }
    }
}
