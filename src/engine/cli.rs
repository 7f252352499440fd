//! HotPush CLI Module
//! Command-line interface for packaging, publishing and serving hot updates

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::audit::AuditAction;
use crate::engine::release::{Platform, DEFAULT_ENVIRONMENT};

#[derive(Parser, Debug)]
#[command(name = "hotpush")]
#[command(version)]
#[command(about = "Hot update distribution: packaging, delta diffing and rollout control", long_about = None)]
pub struct Cli {
    /// Directory holding hotpush.config.json (defaults to current directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default hotpush.config.json
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Run the distribution endpoint
    Serve {
        /// Port to listen on (overrides the config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides the config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Zip a release directory into a full package
    Bundle {
        /// Release directory
        dir: PathBuf,

        /// Package file to write
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Build a delta package between two release directories
    Diff {
        /// Previous release directory
        old: PathBuf,

        /// Next release directory
        new: PathBuf,

        /// Delta package file to write
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Reconstruct a release from a base directory and a package
    Apply {
        /// Base release directory (left untouched)
        base: PathBuf,

        /// Full or delta package
        package: PathBuf,

        /// Directory to write the reconstructed release to
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Publish a full package to the local release store
    Publish {
        /// Package file
        package: PathBuf,

        #[command(flatten)]
        scope: ScopeArgs,

        /// Release version
        #[arg(short, long)]
        version: String,

        /// Release notes
        #[arg(short, long, default_value = "")]
        description: String,

        /// Clients must install this update
        #[arg(long)]
        mandatory: bool,

        /// Percentage of update checks that are offered this release
        #[arg(short, long, default_value = "100")]
        rollout: u32,

        /// Host binary versions this release targets
        #[arg(short, long, default_value = "*")]
        target_binary_version: String,
    },

    /// List releases of a scope, newest first
    Releases {
        #[command(flatten)]
        scope: ScopeArgs,
    },

    /// Edit fields of an existing release
    Patch {
        /// Release version to edit
        version: String,

        #[command(flatten)]
        scope: ScopeArgs,

        /// Disable the release
        #[arg(long, conflicts_with = "enable")]
        disable: bool,

        /// Re-enable the release
        #[arg(long)]
        enable: bool,

        #[arg(short, long)]
        rollout: Option<u32>,

        #[arg(long)]
        mandatory: Option<bool>,

        #[arg(short, long)]
        target_binary_version: Option<String>,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Show recent administrative operations
    Audit {
        /// Only show one kind of operation (publish, patch, promote)
        #[arg(short, long)]
        action: Option<AuditAction>,

        /// Maximum number of entries
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Copy the newest release of one environment into another
    Promote {
        /// Deployment key
        #[arg(short, long)]
        key: String,

        /// Platforms to promote (defaults to all)
        #[arg(short, long)]
        platform: Vec<Platform>,

        /// Source environment
        #[arg(long, default_value = "staging")]
        from: String,

        /// Target environment
        #[arg(long, default_value = DEFAULT_ENVIRONMENT)]
        to: String,

        /// Rollout percentage for the promoted release
        #[arg(short, long)]
        rollout: Option<u32>,
    },
}

/// Deployment key, platform and environment of one release list
#[derive(clap::Args, Debug, Clone)]
pub struct ScopeArgs {
    /// Deployment key
    #[arg(short, long)]
    pub key: String,

    #[arg(short, long)]
    pub platform: Platform,

    #[arg(short, long, default_value = DEFAULT_ENVIRONMENT)]
    pub environment: String,
}

impl Cli {
    pub fn get_config_dir(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_publish() {
        let cli = Cli::parse_from([
            "hotpush", "publish", "app.zip", "--key", "k", "--platform", "ios", "--version",
            "1.2.0", "--rollout", "25",
        ]);
        match cli.command {
            Commands::Publish {
                scope, rollout, version, ..
            } => {
                assert_eq!(scope.platform, Platform::Ios);
                assert_eq!(scope.environment, "production");
                assert_eq!(rollout, 25);
                assert_eq!(version, "1.2.0");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_promote_defaults() {
        let cli = Cli::parse_from(["hotpush", "--format", "json", "promote", "--key", "k"]);
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Promote {
                platform, from, to, ..
            } => {
                assert!(platform.is_empty());
                assert_eq!(from, "staging");
                assert_eq!(to, "production");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_audit_filter() {
        let cli = Cli::parse_from(["hotpush", "audit", "--action", "patch", "-n", "5"]);
        match cli.command {
            Commands::Audit { action, limit } => {
                assert_eq!(action, Some(AuditAction::Patch));
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_disable_conflicts_with_enable() {
        let result = Cli::try_parse_from([
            "hotpush", "patch", "1.0.0", "--key", "k", "--platform", "android", "--disable",
            "--enable",
        ]);
        assert!(result.is_err());
    }
}
