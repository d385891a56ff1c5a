use crate::cli::{Cli, Commands, ConnectionArgs};
use crate::settings::{load_settings, Settings};
use anyhow::{bail, Context, Result};
use lake_acl_core::auth::credential_for;
use lake_acl_core::backend::datalake::DataLakeConfig;
use lake_acl_core::{
    AccountSnapshot, AclBackend, AclDocument, DataLakeBackend, Reconciler, Tree,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, Dispatch};

pub async fn run(cli: Cli, dispatch: Dispatch) -> Result<()> {
    match cli.command {
        Commands::SetAcl { file, connection } => {
            let settings = load_settings(connection.dfs_suffix.as_deref())?;
            set_acl(
                &file,
                |account| connect(account, &connection, &settings),
                &settings,
                Some(dispatch),
            )
            .await
        }
        Commands::GetAcl {
            account,
            outfile,
            omit_special,
            connection,
        } => {
            let settings = load_settings(connection.dfs_suffix.as_deref())?;
            let backend = connect(&account, &connection, &settings)?;
            get_acl(
                &account,
                &outfile,
                omit_special,
                backend,
                &settings,
                Some(dispatch),
            )
            .await
            .map(|_| ())
        }
    }
}

/// Storage backend for `account` with the selected credential.
pub fn connect(
    account: &str,
    connection: &ConnectionArgs,
    settings: &Settings,
) -> Result<Arc<dyn AclBackend>> {
    let credential = credential_for(connection.auth_method, &connection.auth_options())
        .with_context(|| format!("cannot use authentication method {}", connection.auth_method))?;
    let config = DataLakeConfig {
        account: account.to_string(),
        dfs_suffix: settings.dfs_suffix.clone(),
        api_version: settings.api_version.clone(),
    };
    let backend = DataLakeBackend::new(config, credential)?;
    info!("Connected to {}", backend.account_url());
    Ok(Arc::new(backend))
}

fn reconciler(
    backend: Arc<dyn AclBackend>,
    settings: &Settings,
    dispatch: Option<Dispatch>,
) -> Reconciler {
    let reconciler = Reconciler::new(backend).with_options(settings.reconcile.clone());
    match dispatch {
        Some(dispatch) => reconciler.with_dispatch(dispatch),
        None => reconciler,
    }
}

/// Read and validate the whole document. Nothing is sent to the service
/// unless every container in it is valid.
pub fn load_trees(path: &Path) -> Result<(AclDocument, Vec<Tree>)> {
    let document = AclDocument::load(path)
        .with_context(|| format!("cannot load {}", path.display()))?;
    let trees = document
        .trees()
        .with_context(|| format!("invalid declaration in {}", path.display()))?;
    Ok((document, trees))
}

/// Apply every container declared in `path`, in document order.
pub async fn set_acl<F>(
    path: &Path,
    connect: F,
    settings: &Settings,
    dispatch: Option<Dispatch>,
) -> Result<()>
where
    F: FnOnce(&str) -> Result<Arc<dyn AclBackend>>,
{
    let (document, trees) = load_trees(path)?;
    info!(
        "Loaded {} container(s) for account {}",
        trees.len(),
        document.account
    );
    let backend = connect(&document.account)?;
    let reconciler = reconciler(backend, settings, dispatch);
    for mut tree in trees {
        let name = tree.name(tree.root()).to_string();
        reconciler
            .apply(&mut tree)
            .await
            .with_context(|| format!("failed to apply container {}", name))?;
    }
    info!("Done");
    Ok(())
}

/// Export the account to `outfile`. The file is written even when some
/// containers were skipped; the run still fails in that case.
pub async fn get_acl(
    account: &str,
    outfile: &Path,
    omit_special: bool,
    backend: Arc<dyn AclBackend>,
    settings: &Settings,
    dispatch: Option<Dispatch>,
) -> Result<AccountSnapshot> {
    let snapshot = reconciler(backend, settings, dispatch)
        .snapshot_account(account, omit_special)
        .await
        .with_context(|| format!("failed to read account {}", account))?;
    snapshot
        .document
        .save(outfile)
        .with_context(|| format!("cannot write {}", outfile.display()))?;
    info!(
        "Wrote {} container(s) to {}",
        snapshot.document.containers.len(),
        outfile.display()
    );
    if !snapshot.is_complete() {
        let reasons: Vec<String> = snapshot.skipped.iter().map(|e| e.to_string()).collect();
        bail!("some containers were skipped: {}", reasons.join("; "));
    }
    Ok(snapshot)
}
