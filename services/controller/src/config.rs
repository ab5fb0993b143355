use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::reconciler::DEFAULT_CHILD_IMAGE;

/// Token mounted into every pod that runs under a service account.
const IN_CLUSTER_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Debug, Clone, Parser)]
#[command(name = "taskrun-controller", version, about = "Runs one child pod per Task")]
pub struct Config {
    /// Address of the cluster API server.
    #[arg(long, env = "TASKRUN_MASTER", default_value = "http://127.0.0.1:8001")]
    pub master: String,

    /// File holding a bearer token. Defaults to the in-cluster service
    /// account token when present.
    #[arg(long, env = "TASKRUN_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    #[arg(long, env = "TASKRUN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Period for re-delivering every cached task as an update.
    #[arg(long, env = "TASKRUN_RESYNC_SECS", default_value_t = 30)]
    pub resync_secs: u64,

    /// Delay before restarting a reconcile loop that died.
    #[arg(
        long,
        env = "TASKRUN_RECONCILE_PERIOD_SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub reconcile_period_secs: u64,

    #[arg(
        long,
        env = "TASKRUN_GC_PERIOD_SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub gc_period_secs: u64,

    /// How long a succeeded child pod is kept after it started.
    #[arg(long, env = "TASKRUN_CHILD_RETENTION_SECS", default_value_t = 300)]
    pub child_retention_secs: u64,

    #[arg(long, env = "TASKRUN_CHILD_IMAGE", default_value = DEFAULT_CHILD_IMAGE)]
    pub child_image: String,

    #[arg(
        long,
        env = "TASKRUN_REQUEST_TIMEOUT_SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub request_timeout_secs: u64,
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    pub fn reconcile_period(&self) -> Duration {
        Duration::from_secs(self.reconcile_period_secs)
    }

    pub fn gc_period(&self) -> Duration {
        Duration::from_secs(self.gc_period_secs)
    }

    pub fn child_retention(&self) -> Duration {
        Duration::from_secs(self.child_retention_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reads the bearer token, if one is configured or mounted.
    pub fn load_token(&self) -> Result<Option<String>> {
        let path = match &self.token_file {
            Some(path) => path.as_path(),
            None if Path::new(IN_CLUSTER_TOKEN_PATH).exists() => Path::new(IN_CLUSTER_TOKEN_PATH),
            None => return Ok(None),
        };

        let token = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read token file {}", path.display()))?;
        Ok(Some(token.trim().to_string()))
    }
}
