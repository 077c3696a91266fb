use std::path::Path;
use std::sync::Arc;

use memview_core::{snapshot, DetachedSource, DocumentRegistry, MemviewConfig, MemviewError};

use super::args::*;
use crate::exit_codes::{EXIT_BAD_INPUT, EXIT_SUCCESS};

pub mod dump;
pub mod list;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::List(args) => list::run(args).await,
        Command::Dump(args) => dump::run(args).await,
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(EXIT_SUCCESS)
        }
    }
}

/// Restore a snapshot into a registry with no debugger behind it.
///
/// Bad input is reported on stderr and returned as an exit code.
pub(crate) async fn load_registry(path: &Path) -> anyhow::Result<Result<DocumentRegistry, i32>> {
    if !path.exists() {
        eprintln!("error: snapshot not found: {}", path.display());
        return Ok(Err(EXIT_BAD_INPUT));
    }

    let mut registry = DocumentRegistry::new(Arc::new(DetachedSource), MemviewConfig::from_env());
    match snapshot::restore(path, &mut registry).await {
        Ok(_) => Ok(Ok(registry)),
        Err(e @ (MemviewError::Snapshot { .. } | MemviewError::InvalidDescriptor { .. })) => {
            eprintln!("error: {}", e);
            Ok(Err(EXIT_BAD_INPUT))
        }
        Err(e) => Err(e.into()),
    }
}
