//! Update agent talking to a real router in-process

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use hotpush_lib::engine::api::{create_router, ApiState};
use hotpush_lib::engine::delta::{self, ReleaseTree};
use hotpush_lib::engine::packages::PackageStore;
use hotpush_lib::engine::protocol::{
    CheckUpdateRequest, CheckUpdateResponse, ReportInstallRequest, DEPLOYMENT_KEY_HEADER,
};
use hotpush_lib::engine::publish::PublishRequest;
use hotpush_lib::engine::release::{MemoryReleaseStore, Platform, ReleaseStore, Scope};
use hotpush_lib::engine::resolver::FixedSampler;
use hotpush_lib::engine::updater::{
    AgentConfig, AgentError, CancelFlag, PackageBody, UpdateAgent, UpdateStatus, UpdateTransport,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{tempdir, TempDir};
use tower::ServiceExt;

const PUBLIC_URL: &str = "http://updates.test";
const KEY: &str = "deploy-key";

/// Routes agent requests straight into the router
struct RouterTransport {
    router: Router,
}

impl RouterTransport {
    async fn send(&self, request: Request<Body>) -> Result<Vec<u8>, AgentError> {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .map_err(|e| AgentError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AgentError::Network(format!("HTTP {}", response.status())));
        }
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .map_err(|e| AgentError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn json(uri: &str, body: String) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .header(DEPLOYMENT_KEY_HEADER, KEY)
            .body(Body::from(body))
            .unwrap()
    }
}

impl UpdateTransport for RouterTransport {
    async fn check_update(
        &self,
        request: &CheckUpdateRequest,
    ) -> Result<CheckUpdateResponse, AgentError> {
        let body = serde_json::to_string(request).unwrap();
        let bytes = self.send(Self::json("/api/check-update", body)).await?;
        serde_json::from_slice(&bytes).map_err(|e| AgentError::Network(e.to_string()))
    }

    async fn download(&self, url: &str) -> Result<PackageBody, AgentError> {
        let path = url
            .strip_prefix(PUBLIC_URL)
            .ok_or_else(|| AgentError::Network(format!("unexpected host in {}", url)))?;
        let request = Request::get(path)
            .header(DEPLOYMENT_KEY_HEADER, KEY)
            .body(Body::empty())
            .unwrap();
        let bytes = self.send(request).await?;

        // Deliver in small chunks to exercise progress accounting
        let chunks: Vec<Result<Vec<u8>, AgentError>> =
            bytes.chunks(1024).map(|c| Ok(c.to_vec())).collect();
        Ok(PackageBody {
            content_length: Some(bytes.len() as u64),
            stream: futures_util::stream::iter(chunks).boxed(),
        })
    }

    async fn report_install(&self, report: &ReportInstallRequest) -> Result<(), AgentError> {
        let body = serde_json::to_string(report).unwrap();
        self.send(Self::json("/api/report-install", body)).await?;
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
    state: ApiState,
    store: Arc<MemoryReleaseStore>,
    bundled_dir: PathBuf,
    asset: Vec<u8>,
}

fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (path, bytes) in files {
        let target = root.join(path);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(target, bytes).unwrap();
    }
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryReleaseStore::new());
        let packages = PackageStore::open(&dir.path().join("packages")).unwrap();
        let state = ApiState::new(store.clone(), packages, Arc::new(FixedSampler(0)), PUBLIC_URL);

        let mut asset = vec![0u8; 32 * 1024];
        StdRng::seed_from_u64(11).fill(&mut asset[..]);
        let bundled_dir = dir.path().join("bundled");
        write_tree(
            &bundled_dir,
            &[("index.bundle", &b"release 1.0.0"[..]), ("assets/splash.png", &asset[..])],
        );

        Self {
            dir,
            state,
            store,
            bundled_dir,
            asset,
        }
    }

    fn scope(&self) -> Scope {
        Scope::new(KEY, Platform::Android)
    }

    /// Publish the bundled tree with `index.bundle` replaced
    fn publish(&self, version: &str, index: &str) {
        let root = self.dir.path().join("releases").join(version);
        write_tree(
            &root,
            &[("index.bundle", index.as_bytes()), ("assets/splash.png", &self.asset[..])],
        );

        let package = delta::build_full_package(&ReleaseTree::open(&root).unwrap()).unwrap();
        self.state
            .publisher
            .publish(&self.scope(), PublishRequest::new(version, package))
            .unwrap();
    }

    fn config(&self) -> AgentConfig {
        AgentConfig::new(
            &self.dir.path().join("device"),
            PUBLIC_URL,
            KEY,
            Platform::Android,
            "1.0.0",
        )
    }

    fn agent(&self) -> UpdateAgent<RouterTransport> {
        self.agent_with(self.config().with_bundled_dir(&self.bundled_dir))
    }

    fn agent_with(&self, config: AgentConfig) -> UpdateAgent<RouterTransport> {
        let transport = RouterTransport {
            router: create_router(self.state.clone()),
        };
        UpdateAgent::open(config, Arc::new(transport)).unwrap()
    }

    fn running_index(&self, agent: &UpdateAgent<RouterTransport>) -> String {
        let dir = agent.current_bundle_dir().unwrap();
        fs::read_to_string(dir.join("index.bundle")).unwrap()
    }
}

#[tokio::test]
async fn test_delta_update_is_staged_applied_and_confirmed() {
    let fixture = Fixture::new();
    fixture.publish("1.0.0", "release 1.0.0");
    fixture.publish("1.1.0", "release 1.1.0");
    let mut agent = fixture.agent();

    let info = agent.check_for_update().await.unwrap().unwrap();
    assert_eq!(info.version, "1.1.0");
    assert!(info.is_diff);

    let mut last_progress = (0, 0);
    let package = agent
        .download(&info, &CancelFlag::new(), |done, total| {
            last_progress = (done, total)
        })
        .await
        .unwrap();
    assert_eq!(last_progress, (info.size, info.size));
    agent.stage_download(package, &info.version).unwrap();
    assert_eq!(agent.pending_version(), Some("1.1.0"));
    assert_eq!(agent.current_version(), "1.0.0");

    let outcome = agent.launch().unwrap();
    assert!(outcome.applied);
    assert_eq!(outcome.version, "1.1.0");
    assert_eq!(fixture.running_index(&agent), "release 1.1.0");
    assert!(agent
        .current_bundle_dir()
        .unwrap()
        .join("assets/splash.png")
        .is_file());

    agent.notify_update_success().unwrap();
    agent.flush_reports().await;
    assert!(matches!(agent.status(), UpdateStatus::Confirmed { .. }));

    let releases = fixture.store.list(&fixture.scope()).unwrap();
    assert_eq!(releases[0].version, "1.1.0");
    assert_eq!(releases[0].stats.installs, 1);
    assert_eq!(releases[0].stats.downloads, 1);

    // Nothing newer to offer afterwards
    assert!(agent.check_for_update().await.unwrap().is_none());
}

#[tokio::test]
async fn test_unconfirmed_update_rolls_back_to_bundled() {
    let fixture = Fixture::new();
    fixture.publish("1.1.0", "release 1.1.0");
    let mut agent = fixture.agent();

    let info = agent.check_for_update().await.unwrap().unwrap();
    assert!(!info.is_diff);
    let package = agent
        .download(&info, &CancelFlag::new(), |_, _| {})
        .await
        .unwrap();
    agent.stage_download(package, &info.version).unwrap();

    assert_eq!(agent.launch().unwrap().version, "1.1.0");
    assert!(!agent.launch().unwrap().rolled_back);
    let third = agent.launch().unwrap();
    assert!(third.rolled_back);
    assert_eq!(third.version, "1.0.0");
    assert_eq!(agent.current_bundle_dir(), Some(fixture.bundled_dir.clone()));
}

#[tokio::test]
async fn test_failed_update_is_reported_and_rolled_back() {
    let fixture = Fixture::new();
    fixture.publish("1.1.0", "release 1.1.0");
    let mut agent = fixture.agent();

    let info = agent.check_for_update().await.unwrap().unwrap();
    let package = agent
        .download(&info, &CancelFlag::new(), |_, _| {})
        .await
        .unwrap();
    agent.stage_download(package, &info.version).unwrap();
    agent.launch().unwrap();

    assert!(agent.notify_update_failed().unwrap());
    agent.flush_reports().await;
    assert_eq!(agent.current_version(), "1.0.0");

    let releases = fixture.store.list(&fixture.scope()).unwrap();
    assert_eq!(releases[0].stats.failures, 1);
}

#[tokio::test]
async fn test_tampered_hash_discards_download() {
    let fixture = Fixture::new();
    fixture.publish("1.1.0", "release 1.1.0");
    let mut agent = fixture.agent();

    let mut info = agent.check_for_update().await.unwrap().unwrap();
    info.hash = "0".repeat(64);
    let result = agent.download(&info, &CancelFlag::new(), |_, _| {}).await;

    assert!(matches!(result, Err(AgentError::VerificationFailed { .. })));
    assert!(matches!(agent.status(), UpdateStatus::Failed { .. }));
    assert_eq!(agent.pending_version(), None);
    assert_eq!(agent.current_version(), "1.0.0");
}

#[tokio::test]
async fn test_no_update_when_scope_is_empty() {
    let fixture = Fixture::new();
    let mut agent = fixture.agent();
    assert!(agent.check_for_update().await.unwrap().is_none());
    assert!(matches!(agent.status(), UpdateStatus::NoUpdate));

    let response = create_router(fixture.state.clone())
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_agent_without_bundled_tree_gets_full_package() {
    let fixture = Fixture::new();
    fixture.publish("1.0.0", "release 1.0.0");
    fixture.publish("1.1.0", "release 1.1.0");
    let mut agent = fixture.agent_with(fixture.config());
    assert_eq!(agent.current_bundle_dir(), None);

    let info = agent.check_for_update().await.unwrap().unwrap();
    assert_eq!(info.version, "1.1.0");
    assert!(!info.is_diff);

    let package = agent
        .download(&info, &CancelFlag::new(), |_, _| {})
        .await
        .unwrap();
    agent.stage_download(package, &info.version).unwrap();
    assert!(agent.launch().unwrap().applied);
    assert_eq!(fixture.running_index(&agent), "release 1.1.0");
    agent.notify_update_success().unwrap();

    // Once running a hot generation, deltas apply on top of it
    fixture.publish("1.2.0", "release 1.2.0");
    let next = agent.check_for_update().await.unwrap().unwrap();
    assert_eq!(next.version, "1.2.0");
    assert!(next.is_diff);
    let package = agent
        .download(&next, &CancelFlag::new(), |_, _| {})
        .await
        .unwrap();
    agent.stage_download(package, &next.version).unwrap();
    agent.launch().unwrap();
    assert_eq!(fixture.running_index(&agent), "release 1.2.0");
    agent.flush_reports().await;
}
