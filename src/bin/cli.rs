//! HotPush CLI - Main entry point for CLI binary
//!
//! This binary provides the `hotpush` tool for packaging releases, managing
//! the local release store and running the distribution endpoint.

use anyhow::{bail, Context, Result};
use clap::Parser;
use hotpush_lib::engine::{
    admin::{self, PatchFields},
    api::{self, ApiState},
    audit::{AuditAction, AuditEntry, AuditLog},
    cli::formatter::{format_size, CliFormatter},
    cli::{Cli, Commands, OutputFormat, ScopeArgs},
    config::{ServerConfig, CONFIG_FILE},
    delta::{self, ReleaseTree},
    hasher::hash_bytes,
    packages::PackageStore,
    publish::{PublishRequest, Publisher},
    release::{JsonReleaseStore, Platform, ReleaseStore, Scope},
};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run_cli(cli) {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli) -> Result<()> {
    let config_dir = cli.get_config_dir();
    let json = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Init { force } => cmd_init(&config_dir, force, json),
        Commands::Serve { port, host } => cmd_serve(&config_dir, host, port),
        Commands::Bundle { dir, output } => cmd_bundle(&dir, &output, json),
        Commands::Diff { old, new, output } => cmd_diff(&old, &new, &output, json),
        Commands::Apply {
            base,
            package,
            output,
        } => cmd_apply(&base, &package, &output, json),
        Commands::Publish {
            package,
            scope,
            version,
            description,
            mandatory,
            rollout,
            target_binary_version,
        } => {
            let mut request = PublishRequest::new(&version, Vec::new());
            request.description = description;
            request.mandatory = mandatory;
            request.rollout = rollout;
            request.target_binary_version = target_binary_version;
            cmd_publish(&config_dir, &package, &scope, request, json)
        }
        Commands::Releases { scope } => cmd_releases(&config_dir, &scope, json),
        Commands::Patch {
            version,
            scope,
            disable,
            enable,
            rollout,
            mandatory,
            target_binary_version,
            description,
        } => {
            let fields = PatchFields {
                disabled: match (disable, enable) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                },
                rollout,
                mandatory,
                target_binary_version,
                description,
            };
            cmd_patch(&config_dir, &scope, &version, &fields, json)
        }
        Commands::Audit { action, limit } => cmd_audit(&config_dir, action, limit, json),
        Commands::Promote {
            key,
            platform,
            from,
            to,
            rollout,
        } => {
            let platforms = if platform.is_empty() {
                Platform::ALL.to_vec()
            } else {
                platform
            };
            cmd_promote(&config_dir, &key, &platforms, &from, &to, rollout, json)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Stores named by the config in `config_dir`
struct Workspace {
    config: ServerConfig,
    store: Arc<JsonReleaseStore>,
    packages: PackageStore,
    audit: AuditLog,
}

impl Workspace {
    fn open(config_dir: &Path) -> Result<Self> {
        let config = ServerConfig::load_or_default(config_dir)?;
        let store = Arc::new(
            JsonReleaseStore::open(&config.releases_dir()).context("opening release store")?,
        );
        let packages = PackageStore::open(&config.packages_dir()).context("opening package store")?;
        let audit = AuditLog::open(&config.audit_log()).context("opening audit log")?;
        Ok(Self {
            config,
            store,
            packages,
            audit,
        })
    }

    fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.append(&entry) {
            CliFormatter::warning(&format!("Audit log not written: {}", e));
        }
    }
}

fn scope_of(args: &ScopeArgs) -> Scope {
    Scope::new(&args.key, args.platform).with_environment(&args.environment)
}

fn cmd_init(config_dir: &Path, force: bool, json: bool) -> Result<()> {
    let path = config_dir.join(CONFIG_FILE);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    fs::create_dir_all(config_dir)?;
    let config = ServerConfig::default_for_dir(config_dir);
    config.save(config_dir)?;

    if json {
        print_json(&serde_json::json!({ "config": path }))?;
    } else {
        CliFormatter::success(&format!("Wrote {}", path.display()));
        CliFormatter::kv("Releases", &config.releases_dir().display().to_string());
        CliFormatter::kv("Packages", &config.packages_dir().display().to_string());
        CliFormatter::kv("Endpoint", &config.public_url());
    }
    Ok(())
}

#[tokio::main]
async fn cmd_serve(config_dir: &Path, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = ServerConfig::load_or_default(config_dir)?;
    if let Some(host) = host {
        config.api.host = host;
    }
    if let Some(port) = port {
        config.api.port = port;
    }

    let state = ApiState::from_config(&config).context("opening stores")?;
    let addr = config.bind_addr();

    CliFormatter::header("HotPush distribution endpoint");
    CliFormatter::kv("Listening", &format!("http://{}", addr));
    CliFormatter::kv("Public URL", &config.public_url());
    CliFormatter::kv("Releases", &config.releases_dir().display().to_string());
    CliFormatter::info("Press Ctrl+C to stop");

    api::serve(state, &addr).await?;
    Ok(())
}

fn cmd_bundle(dir: &Path, output: &Path, json: bool) -> Result<()> {
    let tree = ReleaseTree::open(dir).with_context(|| format!("reading {}", dir.display()))?;
    let bytes = delta::build_full_package(&tree)?;
    fs::write(output, &bytes).with_context(|| format!("writing {}", output.display()))?;
    let hash = hash_bytes(&bytes);

    if json {
        print_json(&serde_json::json!({
            "package": output,
            "hash": hash,
            "size": bytes.len(),
            "files": tree.files.file_hashes().len(),
        }))?;
    } else {
        CliFormatter::success(&format!("Bundled {}", dir.display()));
        CliFormatter::kv("Package", &output.display().to_string());
        CliFormatter::kv("Hash", &hash);
        CliFormatter::kv("Size", &format_size(bytes.len() as u64));
    }
    Ok(())
}

fn cmd_diff(old: &Path, new: &Path, output: &Path, json: bool) -> Result<()> {
    let old_tree = ReleaseTree::open(old).with_context(|| format!("reading {}", old.display()))?;
    let new_tree = ReleaseTree::open(new).with_context(|| format!("reading {}", new.display()))?;
    let manifest = delta::diff(&old_tree.files, &new_tree.files);
    let (bytes, stats) = delta::build_package(&new_tree, &manifest)?;
    fs::write(output, &bytes).with_context(|| format!("writing {}", output.display()))?;

    if json {
        print_json(&serde_json::json!({
            "package": output,
            "manifest": manifest,
            "stats": stats,
        }))?;
    } else {
        CliFormatter::success(&format!("Wrote delta package {}", output.display()));
        CliFormatter::kv("Added", &manifest.added.len().to_string());
        CliFormatter::kv("Modified", &manifest.modified.len().to_string());
        CliFormatter::kv("Deleted", &manifest.deleted.len().to_string());
        CliFormatter::kv(
            "Size",
            &format!(
                "{} of {} ({}% saved)",
                format_size(stats.delta_size),
                format_size(stats.full_size),
                stats.saved_percent
            ),
        );
    }
    Ok(())
}

fn cmd_apply(base: &Path, package: &Path, output: &Path, json: bool) -> Result<()> {
    if output.exists() && fs::read_dir(output)?.next().is_some() {
        bail!("{} exists and is not empty", output.display());
    }
    let bytes = fs::read(package).with_context(|| format!("reading {}", package.display()))?;

    let is_delta = delta::is_delta_package(&bytes)?;
    if is_delta {
        delta::apply_package_to_copy(base, output, &bytes)?;
    } else {
        delta::extract_full_package(output, &bytes)?;
    }
    let files = ReleaseTree::open(output)?.files.file_hashes().len();

    if json {
        print_json(&serde_json::json!({
            "output": output,
            "isDiff": is_delta,
            "files": files,
        }))?;
    } else {
        CliFormatter::success(&format!(
            "Reconstructed {} files into {}",
            files,
            output.display()
        ));
    }
    Ok(())
}

fn cmd_publish(
    config_dir: &Path,
    package: &Path,
    scope_args: &ScopeArgs,
    mut request: PublishRequest,
    json: bool,
) -> Result<()> {
    let workspace = Workspace::open(config_dir)?;
    let scope = scope_of(scope_args);

    request.package = fs::read(package).with_context(|| format!("reading {}", package.display()))?;
    if request.package.len() > workspace.config.publish.max_package_bytes {
        bail!(
            "package is {} but the limit is {}",
            format_size(request.package.len() as u64),
            format_size(workspace.config.publish.max_package_bytes as u64)
        );
    }

    let publisher = Publisher::new(
        workspace.store.clone(),
        workspace.packages.clone(),
        workspace.config.publish.diff_history,
    );
    let outcome = publisher.publish(&scope, request)?;
    workspace.record(
        AuditEntry::new(AuditAction::Publish, &scope, &outcome.release.version).with_details(
            serde_json::json!({
                "contentHash": outcome.release.content_hash,
                "deltas": outcome.deltas.len(),
            }),
        ),
    );

    if json {
        return print_json(&outcome);
    }
    CliFormatter::success(&format!(
        "Published {} to {}/{}",
        outcome.release.version, scope.platform, scope.environment
    ));
    CliFormatter::kv("Hash", &outcome.release.content_hash);
    CliFormatter::kv("Size", &format_size(outcome.release.size_bytes));
    CliFormatter::kv("Rollout", &format!("{}%", outcome.release.rollout_percent));
    for summary in &outcome.deltas {
        CliFormatter::item(&format!(
            "delta from {}: {} ({}% saved)",
            summary.from_version,
            format_size(summary.stats.delta_size),
            summary.stats.saved_percent
        ));
    }
    Ok(())
}

fn cmd_releases(config_dir: &Path, scope_args: &ScopeArgs, json: bool) -> Result<()> {
    let workspace = Workspace::open(config_dir)?;
    let releases = workspace.store.list(&scope_of(scope_args))?;

    if json {
        return print_json(&releases);
    }
    if releases.is_empty() {
        CliFormatter::info("No releases in this scope");
        return Ok(());
    }
    CliFormatter::header(&format!(
        "Releases for {} ({})",
        scope_args.platform, scope_args.environment
    ));
    CliFormatter::release_table_header();
    for release in &releases {
        CliFormatter::release_row(release);
    }
    CliFormatter::blank();
    Ok(())
}

fn cmd_patch(
    config_dir: &Path,
    scope_args: &ScopeArgs,
    version: &str,
    fields: &PatchFields,
    json: bool,
) -> Result<()> {
    let workspace = Workspace::open(config_dir)?;
    let scope = scope_of(scope_args);
    let release = admin::patch(workspace.store.as_ref(), &scope, version, fields)?;
    workspace.record(
        AuditEntry::new(AuditAction::Patch, &scope, &release.version)
            .with_details(serde_json::to_value(fields)?),
    );

    if json {
        return print_json(&release);
    }
    CliFormatter::success(&format!("Patched {}", release.version));
    CliFormatter::release_table_header();
    CliFormatter::release_row(&release);
    Ok(())
}

fn cmd_audit(
    config_dir: &Path,
    action: Option<AuditAction>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let workspace = Workspace::open(config_dir)?;
    let entries = workspace.audit.recent(action, limit)?;

    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        CliFormatter::info(&format!(
            "No audit entries in {}",
            workspace.audit.path().display()
        ));
        return Ok(());
    }
    CliFormatter::header("Audit log (newest first)");
    for entry in &entries {
        CliFormatter::audit_row(entry);
    }
    Ok(())
}

fn cmd_promote(
    config_dir: &Path,
    key: &str,
    platforms: &[Platform],
    from: &str,
    to: &str,
    rollout: Option<u32>,
    json: bool,
) -> Result<()> {
    let workspace = Workspace::open(config_dir)?;
    let outcomes =
        admin::promote_platforms(workspace.store.as_ref(), key, platforms, from, to, rollout);

    let mut failed = 0;
    let mut results = Vec::new();
    for outcome in &outcomes {
        match &outcome.result {
            Ok(release) => {
                let target = Scope::new(key, outcome.platform).with_environment(to);
                workspace.record(
                    AuditEntry::new(AuditAction::Promote, &target, &release.version)
                        .with_details(serde_json::json!({ "from": from })),
                );
                if !json {
                    CliFormatter::success(&format!(
                        "{}: promoted {} from {} to {}",
                        outcome.platform, release.version, from, to
                    ));
                }
                results.push(serde_json::json!({
                    "platform": outcome.platform,
                    "success": true,
                    "release": release,
                }));
            }
            Err(e) => {
                failed += 1;
                if !json {
                    CliFormatter::error(&format!("{}: {}", outcome.platform, e));
                }
                results.push(serde_json::json!({
                    "platform": outcome.platform,
                    "success": false,
                    "error": e.to_string(),
                }));
            }
        }
    }

    if json {
        print_json(&serde_json::json!({ "results": results }))?;
    }
    if failed > 0 {
        bail!("{} of {} platforms failed to promote", failed, outcomes.len());
    }
    Ok(())
}
