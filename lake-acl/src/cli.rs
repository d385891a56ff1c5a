use crate::logging::LogOptions;
use clap::{Args, Parser, Subcommand};
use lake_acl_core::auth::{AuthMethod, AuthOptions};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "lake-acl", version)]
#[command(about = "Declare data lake directory entries in YAML and apply or export them")]
pub struct Cli {
    /// Debug output with timestamps, levels and targets
    #[arg(long, global = true)]
    pub debug: bool,

    /// Do not log to stdout
    #[arg(long, global = true)]
    pub silent: bool,

    /// Also write the log to FILE (truncated on start)
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            debug: self.debug,
            silent: self.silent,
            file: self.log_file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply the entries declared in FILE
    SetAcl {
        file: PathBuf,

        #[command(flatten)]
        connection: ConnectionArgs,
    },

    /// Export the entries of every container in ACCOUNT to OUTFILE
    GetAcl {
        account: String,

        outfile: PathBuf,

        /// Leave out owner, owning group, mask and other entries
        #[arg(long)]
        omit_special: bool,

        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// default, environment, workload, managedid, azurecli, azureps,
    /// azuredevcli or token
    #[arg(long, default_value = "default", value_parser = parse_method)]
    pub auth_method: AuthMethod,

    /// Credential option, e.g. tenant_id=..., client_id=..., token=...
    #[arg(long = "auth-opt", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub auth_opts: Vec<(String, String)>,

    /// DNS suffix of the storage endpoint
    #[arg(long, value_name = "SUFFIX")]
    pub dfs_suffix: Option<String>,
}

impl ConnectionArgs {
    pub fn auth_options(&self) -> AuthOptions {
        let mut options = AuthOptions::new();
        for (key, value) in &self.auth_opts {
            options.insert(key.clone(), value.clone());
        }
        options
    }
}

fn parse_method(s: &str) -> Result<AuthMethod, String> {
    AuthMethod::parse(s).map_err(|e| e.to_string())
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got `{}`", s)),
    }
}
