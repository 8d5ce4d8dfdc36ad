//! NeatNote notebook library
//!
//! This library keeps a personal notebook of notes and categories in a single
//! JSON document, with compressed bodies, schema migrations, routine zip
//! backups and a background save scheduler.

mod backup;
mod cli;
pub mod codec;
mod config;
mod document;
mod errors;
mod helper;
mod migrator;
mod scheduler;
mod store;
mod types;
mod workspace;

// Re-export key components
pub use backup::*;
pub use cli::*;
pub use config::*;
pub use document::*;
pub use errors::*;
pub use helper::*;
pub use migrator::*;
pub use scheduler::*;
pub use store::*;
pub use types::*;
pub use workspace::*;
