// ABOUTME: Replicator configuration built from CLI flags and environment variables
// ABOUTME: Validated once into an immutable ReplicatorConfig shared by all components

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Default region code stamped on every row (`cob`).
pub const DEFAULT_REGION_CODE: &str = "52";

/// How pages are written to the destination.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Plain INSERT. A retried page may leave duplicates behind.
    #[default]
    Append,
    /// INSERT ... ON CONFLICT DO NOTHING over a unique
    /// (data, hora, teleatendente, fila) index.
    SkipDuplicates,
}

/// A host/port pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// SSH jump host used to reach the source database.
#[derive(Clone, PartialEq, Eq)]
pub struct BastionConfig {
    pub endpoint: Endpoint,
    pub user: String,
    pub password: Option<String>,
}

impl std::fmt::Debug for BastionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BastionConfig")
            .field("endpoint", &self.endpoint)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Remote MySQL database holding the call records.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceConfig {
    /// Database host/port as seen from the bastion
    pub endpoint: Endpoint,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub table: String,
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("endpoint", &self.endpoint)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("table", &self.table)
            .finish()
    }
}

/// Everything a sync cycle needs. Built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// SSH jump host; `None` connects to the source directly
    pub bastion: Option<BastionConfig>,
    pub source: SourceConfig,
    /// PostgreSQL connection string of the destination
    pub destination_url: String,
    /// Value written to the `cob` column
    pub region_code: String,
    /// Wait between the end of one cycle and the start of the next
    pub sync_interval: Duration,
    /// Rows per extracted page
    pub batch_size: usize,
    /// Deadline for the tunnel to start accepting connections
    pub tunnel_timeout: Duration,
    /// Upper bound on a single cycle, if any
    pub cycle_timeout: Option<Duration>,
    /// Persisted watermark file, if enabled
    pub checkpoint_path: Option<PathBuf>,
    pub load_mode: LoadMode,
}

/// Connection and tuning flags shared by every command.
///
/// Each flag falls back to the environment variable named in its `env`
/// attribute, so a `.env` file is enough to configure a deployment.
#[derive(Args, Debug, Clone)]
pub struct ReplicatorArgs {
    /// SSH bastion host (leave unset to reach the source directly)
    #[arg(long, env = "SSH_HOST")]
    pub ssh_host: Option<String>,
    /// SSH bastion port
    #[arg(long, env = "SSH_PORT", default_value_t = 22)]
    pub ssh_port: u16,
    /// SSH user on the bastion
    #[arg(long, env = "SSH_USER")]
    pub ssh_user: Option<String>,
    /// SSH password (uses sshpass); omit to rely on keys or an agent
    #[arg(long, env = "SSH_PASS", hide_env_values = true)]
    pub ssh_pass: Option<String>,
    /// Source MySQL host as seen from the bastion
    #[arg(long, env = "REMOTE_DB_HOST", default_value = "127.0.0.1")]
    pub remote_db_host: String,
    /// Source MySQL port
    #[arg(long, env = "REMOTE_DB_PORT", default_value_t = 3306)]
    pub remote_db_port: u16,
    /// Source MySQL user
    #[arg(long, env = "REMOTE_DB_USER")]
    pub remote_db_user: String,
    /// Source MySQL password
    #[arg(long, env = "REMOTE_DB_PASS", hide_env_values = true)]
    pub remote_db_pass: Option<String>,
    /// Source MySQL database name
    #[arg(long, env = "REMOTE_DB_NAME")]
    pub remote_db_name: String,
    /// Source table holding the call records
    #[arg(long, env = "SOURCE_TABLE", default_value = "meso_detalhe")]
    pub source_table: String,
    /// Destination PostgreSQL connection string
    #[arg(long, env = "LOCAL_DB_URL", hide_env_values = true)]
    pub local_db_url: String,
    /// Region code written to the cob column
    #[arg(long, env = "COB_ID", default_value = DEFAULT_REGION_CODE)]
    pub cob: String,
    /// Seconds to wait between sync cycles
    #[arg(long, env = "SYNC_INTERVAL_SECS", default_value_t = 120)]
    pub sync_interval: u64,
    /// Rows per extracted page
    #[arg(long, env = "BATCH_SIZE", default_value_t = 1000)]
    pub batch_size: usize,
    /// Seconds to wait for the SSH tunnel to come up
    #[arg(long, env = "TUNNEL_TIMEOUT_SECS", default_value_t = 30)]
    pub tunnel_timeout: u64,
    /// Abort a sync cycle that runs longer than this many seconds
    #[arg(long, env = "CYCLE_TIMEOUT_SECS")]
    pub cycle_timeout: Option<u64>,
    /// Persist the watermark to this JSON file between cycles
    #[arg(long, env = "CHECKPOINT_FILE")]
    pub checkpoint_file: Option<PathBuf>,
    /// How pages are written to the destination
    #[arg(long, env = "LOAD_MODE", value_enum, default_value = "append")]
    pub load_mode: LoadMode,
}

impl ReplicatorArgs {
    /// Validate the flags and freeze them into a [`ReplicatorConfig`].
    pub fn into_config(self) -> Result<ReplicatorConfig> {
        if self.batch_size == 0 {
            bail!("--batch-size must be greater than zero");
        }
        if self.cob.is_empty() || self.cob.chars().count() > 3 {
            bail!(
                "Region code '{}' must be 1 to 3 characters (cob is VARCHAR(3))",
                self.cob
            );
        }
        if self.source_table.trim().is_empty() {
            bail!("--source-table cannot be empty");
        }

        let bastion = match self.ssh_host {
            Some(host) if !host.trim().is_empty() => {
                let user = self
                    .ssh_user
                    .filter(|u| !u.is_empty())
                    .context("SSH_USER is required when SSH_HOST is set")?;
                Some(BastionConfig {
                    endpoint: Endpoint {
                        host,
                        port: self.ssh_port,
                    },
                    user,
                    password: self.ssh_pass.filter(|p| !p.is_empty()),
                })
            }
            _ => None,
        };

        Ok(ReplicatorConfig {
            bastion,
            source: SourceConfig {
                endpoint: Endpoint {
                    host: self.remote_db_host,
                    port: self.remote_db_port,
                },
                user: self.remote_db_user,
                password: self.remote_db_pass,
                database: self.remote_db_name,
                table: self.source_table,
            },
            destination_url: self.local_db_url,
            region_code: self.cob,
            sync_interval: Duration::from_secs(self.sync_interval),
            batch_size: self.batch_size,
            tunnel_timeout: Duration::from_secs(self.tunnel_timeout),
            cycle_timeout: self.cycle_timeout.map(Duration::from_secs),
            checkpoint_path: self.checkpoint_file,
            load_mode: self.load_mode,
        })
    }
}
