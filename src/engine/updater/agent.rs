//! Update Agent
//!
//! Per-installation pipeline: check, download, verify, stage, apply on the
//! next launch, then confirm or roll back.
//!
//! Every slot change is a single atomic rewrite of `state.json`. Generation
//! directories are materialized completely before the state names them and
//! removed only after the state stops naming them, so a crash at any point
//! leaves a loadable `current`.

use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::download::{download_to_temp, CancelFlag, DownloadedPackage};
use super::generations::GenerationStore;
use super::state::{AgentState, Confirmation, Generation, UpdateStatus};
use super::transport::{HttpTransport, UpdateTransport};
use super::verify;
use super::AgentError;
use crate::engine::delta;
use crate::engine::protocol::{CheckUpdateRequest, InstallStatus, ReportInstallRequest, UpdateInfo};
use crate::engine::release::Platform;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Where state and generations live
    pub root_dir: PathBuf,
    pub server_url: String,
    pub deployment_key: String,
    pub platform: Platform,
    /// Version of the bundle shipped inside the host binary
    pub bundled_version: String,
    /// On-disk copy of the shipped bundle, needed to apply a delta on top of
    /// it. Without one the agent asks for full packages while on the bundled
    /// version.
    pub bundled_dir: Option<PathBuf>,
    /// Host binary version, matched against release binary ranges
    pub app_version: Option<String>,
    pub environment: Option<String>,
    /// Unconfirmed launches tolerated before rolling back
    pub rollback_threshold: u32,
}

impl AgentConfig {
    pub const DEFAULT_ROLLBACK_THRESHOLD: u32 = 3;

    pub fn new(
        root_dir: &Path,
        server_url: &str,
        deployment_key: &str,
        platform: Platform,
        bundled_version: &str,
    ) -> Self {
        Self {
            root_dir: root_dir.to_path_buf(),
            server_url: server_url.to_string(),
            deployment_key: deployment_key.to_string(),
            platform,
            bundled_version: bundled_version.to_string(),
            bundled_dir: None,
            app_version: None,
            environment: None,
            rollback_threshold: Self::DEFAULT_ROLLBACK_THRESHOLD,
        }
    }

    /// Config rooted in the platform's local data directory
    pub fn in_data_dir(
        server_url: &str,
        deployment_key: &str,
        platform: Platform,
        bundled_version: &str,
    ) -> Result<Self, AgentError> {
        let root = GenerationStore::default_base_dir().ok_or_else(|| {
            AgentError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no local data directory on this platform",
            ))
        })?;
        Ok(Self::new(
            &root,
            server_url,
            deployment_key,
            platform,
            bundled_version,
        ))
    }

    pub fn with_bundled_dir(mut self, dir: &Path) -> Self {
        self.bundled_dir = Some(dir.to_path_buf());
        self
    }

    pub fn with_app_version(mut self, version: &str) -> Self {
        self.app_version = Some(version.to_string());
        self
    }

    pub fn with_environment(mut self, environment: &str) -> Self {
        self.environment = Some(environment.to_string());
        self
    }
}

/// What happened during [`UpdateAgent::launch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub applied: bool,
    pub rolled_back: bool,
    /// Version the runtime should load now
    pub version: String,
}

pub struct UpdateAgent<T: UpdateTransport + 'static> {
    config: AgentConfig,
    transport: Arc<T>,
    store: GenerationStore,
    state: AgentState,
    reports: Vec<JoinHandle<()>>,
}

impl UpdateAgent<HttpTransport> {
    pub fn open_http(config: AgentConfig) -> Result<Self, AgentError> {
        let transport = HttpTransport::new(&config.server_url, &config.deployment_key);
        Self::open(config, Arc::new(transport))
    }
}

impl<T: UpdateTransport + 'static> UpdateAgent<T> {
    /// Load persisted state, drop references to missing generations and
    /// clean up leftovers from an interrupted run
    pub fn open(config: AgentConfig, transport: Arc<T>) -> Result<Self, AgentError> {
        let store = GenerationStore::with_base_dir(config.root_dir.clone());
        store.init()?;
        let state = AgentState::load(&store.state_path(), &config.bundled_version)?;

        let mut agent = Self {
            config,
            transport,
            store,
            state,
            reports: Vec::new(),
        };
        if agent.repair() {
            warn!("Agent state referenced missing generations; repaired");
        }
        agent.save()?;
        agent.collect_garbage();
        Ok(agent)
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn status(&self) -> &UpdateStatus {
        &self.state.status
    }

    pub fn current_version(&self) -> &str {
        self.state.current_version()
    }

    pub fn pending_version(&self) -> Option<&str> {
        self.state.generations.pending.as_ref().map(Generation::version)
    }

    pub fn backup_version(&self) -> Option<&str> {
        self.state.generations.backup.as_ref().map(Generation::version)
    }

    pub fn confirmation(&self, version: &str) -> Option<&Confirmation> {
        self.state.confirmations.get(version)
    }

    /// Directory the runtime should load. `None` means the copy embedded in
    /// the host binary.
    pub fn current_bundle_dir(&self) -> Option<PathBuf> {
        match &self.state.generations.current {
            Generation::Hot { id, .. } => Some(self.store.generation_path(id)),
            Generation::Bundled { .. } => self.config.bundled_dir.clone(),
        }
    }

    fn save(&self) -> Result<(), AgentError> {
        self.state.save(&self.store.state_path())?;
        Ok(())
    }

    /// Status changes that do not touch the slots are persisted best-effort
    fn record_status(&mut self, status: UpdateStatus) {
        self.state.status = status;
        if let Err(e) = self.save() {
            warn!(error = %e, "Failed to persist agent status");
        }
    }

    fn collect_garbage(&self) {
        let referenced = self.state.generations.referenced_ids();
        if let Err(e) = self.store.collect_garbage(&referenced) {
            warn!(error = %e, "Failed to collect unreferenced generations");
        }
    }

    fn repair(&mut self) -> bool {
        let store = &self.store;
        let installed = |g: &Generation| g.id().map_or(true, |id| store.is_installed(id));
        let slots = &mut self.state.generations;
        let mut changed = false;

        if slots.pending.as_ref().is_some_and(|g| !installed(g)) {
            slots.pending = None;
            changed = true;
        }
        if slots.backup.as_ref().is_some_and(|g| !installed(g)) {
            slots.backup = None;
            changed = true;
        }
        if !installed(&slots.current) {
            let bundled = &self.config.bundled_version;
            slots.current = slots.backup.take().unwrap_or_else(|| Generation::Bundled {
                version: bundled.clone(),
            });
            changed = true;
        }
        changed
    }

    /// Ask the endpoint whether an update exists for the current version
    pub async fn check_for_update(&mut self) -> Result<Option<UpdateInfo>, AgentError> {
        self.state.status = UpdateStatus::Checking;
        self.state.last_check = Some(Utc::now());

        let request = CheckUpdateRequest {
            current_version: self.current_version().to_string(),
            platform: self.config.platform,
            app_version: self.config.app_version.clone(),
            environment: self.config.environment.clone(),
            // A delta cannot be applied without a base tree on disk
            full_package_only: self.current_bundle_dir().is_none(),
        };

        let response = match self.transport.check_update(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Update check failed");
                self.record_status(UpdateStatus::Failed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        match response.into_update() {
            None => {
                debug!(current = %request.current_version, "No update available");
                self.record_status(UpdateStatus::NoUpdate);
                Ok(None)
            }
            Some(info) => {
                info!(
                    current = %request.current_version,
                    version = %info.version,
                    is_diff = info.is_diff,
                    "Update available"
                );
                self.record_status(UpdateStatus::Downloading {
                    version: info.version.clone(),
                    total_bytes: info.size,
                });
                Ok(Some(info))
            }
        }
    }

    /// Stream the offered package and verify it against the advertised hash.
    ///
    /// On any failure the received bytes are discarded and the slots are
    /// untouched.
    pub async fn download<F>(
        &mut self,
        info: &UpdateInfo,
        cancel: &CancelFlag,
        on_progress: F,
    ) -> Result<DownloadedPackage, AgentError>
    where
        F: FnMut(u64, u64),
    {
        self.state.status = UpdateStatus::Downloading {
            version: info.version.clone(),
            total_bytes: info.size,
        };

        let package = match self.fetch(info, cancel, on_progress).await {
            Ok(package) => package,
            Err(e) => {
                warn!(version = %info.version, error = %e, "Download failed");
                self.record_status(UpdateStatus::Failed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        self.state.status = UpdateStatus::Verifying {
            version: info.version.clone(),
        };
        if let Err(e) = verify::verify_digest(&info.hash, package.hash()) {
            warn!(version = %info.version, error = %e, "Discarding package");
            self.record_status(UpdateStatus::Failed {
                reason: e.to_string(),
            });
            return Err(e);
        }

        debug!(version = %info.version, size = package.size(), "Package verified");
        Ok(package)
    }

    async fn fetch<F>(
        &self,
        info: &UpdateInfo,
        cancel: &CancelFlag,
        on_progress: F,
    ) -> Result<DownloadedPackage, AgentError>
    where
        F: FnMut(u64, u64),
    {
        let body = self.transport.download(&info.download_url).await?;
        let total = body.content_length.unwrap_or(info.size);
        download_to_temp(
            body.stream,
            &self.store.downloads_dir(),
            total,
            cancel,
            on_progress,
        )
        .await
    }

    /// Materialize a package as the pending generation, replacing any prior one
    pub fn stage(&mut self, package: &[u8], version: &str) -> Result<(), AgentError> {
        let staging = self.store.new_staging_path();
        let installed = self
            .materialize(package, &staging)
            .and_then(|()| self.store.install(&staging).map_err(AgentError::from));
        let id = match installed {
            Ok(id) => id,
            Err(e) => {
                remove_quietly(&staging);
                warn!(version, error = %e, "Staging failed");
                self.record_status(UpdateStatus::Failed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let previous = self.state.generations.clone();
        let previous_status = self.state.status.clone();
        self.state.generations = previous.stage(Generation::Hot {
            version: version.to_string(),
            id: id.clone(),
        });
        self.state.status = UpdateStatus::StagedPending {
            version: version.to_string(),
        };
        if let Err(e) = self.save() {
            self.state.generations = previous;
            self.state.status = previous_status;
            remove_quietly(&self.store.generation_path(&id));
            return Err(e);
        }

        info!(version, "Staged update");
        self.collect_garbage();
        Ok(())
    }

    pub fn stage_download(
        &mut self,
        mut package: DownloadedPackage,
        version: &str,
    ) -> Result<(), AgentError> {
        let bytes = package.read_bytes()?;
        self.stage(&bytes, version)
    }

    fn materialize(&self, package: &[u8], staging: &Path) -> Result<(), AgentError> {
        if delta::is_delta_package(package)? {
            let base = self.current_bundle_dir().ok_or_else(|| {
                AgentError::InvalidPackage(
                    "delta package needs the bundled tree, but its location is unknown"
                        .to_string(),
                )
            })?;
            delta::apply_package_to_copy(&base, staging, package)?;
        } else {
            delta::extract_full_package(staging, package)?;
        }
        Ok(())
    }

    /// Promote `pending` to `current`. Returns `false` when nothing is pending.
    pub fn apply_on_next_launch(&mut self) -> Result<bool, AgentError> {
        let Some(next) = self.state.generations.apply() else {
            return Ok(false);
        };
        if next.current.id().is_some_and(|id| !self.store.is_installed(id)) {
            warn!(version = next.current.version(), "Pending generation is missing; discarding");
            self.state.generations = self.state.generations.discard_pending();
            self.save()?;
            return Ok(false);
        }

        let version = next.current.version().to_string();
        let previous = std::mem::replace(&mut self.state.generations, next);
        let previous_confirmation = self
            .state
            .confirmations
            .insert(version.clone(), Confirmation::default());
        let previous_status = std::mem::replace(
            &mut self.state.status,
            UpdateStatus::AppliedUnconfirmed {
                version: version.clone(),
            },
        );

        if let Err(e) = self.save() {
            self.state.generations = previous;
            self.state.status = previous_status;
            match previous_confirmation {
                Some(confirmation) => self.state.confirmations.insert(version, confirmation),
                None => self.state.confirmations.remove(&version),
            };
            return Err(e);
        }

        info!(from = previous.current.version(), to = %version, "Applied pending update");
        self.collect_garbage();
        Ok(true)
    }

    /// Process start: apply any pending update, then count this launch
    /// against an unconfirmed current version
    pub fn launch(&mut self) -> Result<LaunchOutcome, AgentError> {
        let applied = self.apply_on_next_launch()?;
        let mut rolled_back = false;

        if !self.state.current_is_confirmed() {
            let version = self.current_version().to_string();
            let confirmation = self.state.confirmations.entry(version.clone()).or_default();
            confirmation.launch_count += 1;
            let launches = confirmation.launch_count;
            self.save()?;

            if launches >= self.config.rollback_threshold {
                warn!(version = %version, launches, "Update never confirmed; rolling back");
                rolled_back = self.rollback()?;
            }
        }

        Ok(LaunchOutcome {
            applied,
            rolled_back,
            version: self.current_version().to_string(),
        })
    }

    /// The running update works: confirm it and report success
    pub fn notify_update_success(&mut self) -> Result<(), AgentError> {
        if self.state.generations.current.is_bundled() {
            return Ok(());
        }
        let version = self.current_version().to_string();
        self.state
            .confirmations
            .entry(version.clone())
            .or_default()
            .confirmed = true;
        self.state.status = UpdateStatus::Confirmed {
            version: version.clone(),
        };
        self.save()?;

        info!(version = %version, "Update confirmed");
        self.report(&version, InstallStatus::Success);
        Ok(())
    }

    /// The running update is broken: report it, then roll back
    pub fn notify_update_failed(&mut self) -> Result<bool, AgentError> {
        if !self.state.generations.current.is_bundled() {
            let version = self.current_version().to_string();
            self.report(&version, InstallStatus::Failure);
        }
        self.rollback()
    }

    /// Swap `backup` back into `current`. Returns `false` (and changes
    /// nothing) when there is no backup.
    pub fn rollback(&mut self) -> Result<bool, AgentError> {
        let Some(next) = self.state.generations.rollback() else {
            info!(version = self.current_version(), "No backup generation to roll back to");
            return Ok(false);
        };

        let failed = self.current_version().to_string();
        let restored = next.current.version().to_string();
        let previous_state = self.state.clone();

        self.state.generations = next;
        if failed != restored {
            self.state.confirmations.remove(&failed);
        }
        self.state.status = UpdateStatus::RolledBack {
            from: failed.clone(),
            to: restored.clone(),
        };

        if let Err(e) = self.save() {
            self.state = previous_state;
            return Err(e);
        }

        warn!(from = %failed, to = %restored, "Rolled back update");
        self.collect_garbage();
        Ok(true)
    }

    /// Forget every hot update and return to the bundled version
    pub fn clear_updates(&mut self) -> Result<(), AgentError> {
        self.state = AgentState::fresh(&self.config.bundled_version);
        self.save()?;
        self.collect_garbage();
        info!(version = %self.config.bundled_version, "Cleared hot updates");
        Ok(())
    }

    /// Fire-and-forget install telemetry
    fn report(&mut self, version: &str, status: InstallStatus) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(version, "No async runtime; install report skipped");
            return;
        };
        let report = ReportInstallRequest {
            deployment_key: self.config.deployment_key.clone(),
            platform: self.config.platform,
            version: version.to_string(),
            status,
            environment: self.config.environment.clone(),
        };
        let transport = Arc::clone(&self.transport);

        self.reports.retain(|handle| !handle.is_finished());
        self.reports.push(runtime.spawn(async move {
            if let Err(e) = transport.report_install(&report).await {
                warn!(version = %report.version, error = %e, "Install report failed");
            }
        }));
    }

    /// Wait for outstanding install reports
    pub async fn flush_reports(&mut self) {
        for handle in self.reports.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Install report task failed");
            }
        }
    }
}

fn remove_quietly(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_dir_all(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove directory");
        }
    }
}
