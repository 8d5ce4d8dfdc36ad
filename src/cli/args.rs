use std::path::PathBuf;

use clap::Parser;

use crate::Commands;

/// Main CLI application arguments and command structure
#[derive(Parser)]
#[clap(
    name = "neatnote",
    version,
    about = "A personal notebook of notes and categories"
)]
pub struct Cli {
    /// Directory holding notebook.json and the backups folder
    #[clap(short = 'd', long, value_parser)]
    pub data_dir: Option<PathBuf>,

    /// Verbose output mode
    #[clap(short, long)]
    pub verbose: bool,

    /// Subcommands for the neatnote application
    #[clap(subcommand)]
    pub command: Commands,
}
