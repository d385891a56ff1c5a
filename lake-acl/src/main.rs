use anyhow::Result;
use clap::Parser;
use lake_acl::cli::Cli;
use lake_acl::{commands, logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dispatch = logging::build_dispatch(&cli.log_options())?;
    let _guard = tracing::dispatcher::set_default(&dispatch);

    commands::run(cli, dispatch).await
}
