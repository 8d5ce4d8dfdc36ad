use std::{process, sync::Arc};

use clap::Parser;
use log::{error, info};

use neatnote::{App, Cli, Result, Workspace, WorkspacePaths};

pub fn initialize_logger(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .format_module_path(true)
        .init();

    info!("Logger initialized");
}

async fn run(cli: Cli) -> Result<()> {
    let paths = match cli.data_dir {
        Some(dir) => WorkspacePaths::in_dir(dir),
        None => WorkspacePaths::default_location()?,
    };

    let workspace = Arc::new(Workspace::open(paths)?);
    let app = App::new(Arc::clone(&workspace), cli.verbose);
    app.run(cli.command).await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    initialize_logger(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
