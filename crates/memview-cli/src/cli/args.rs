use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "memview",
    version,
    about = "Inspect saved debugger memory views offline"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List the documents in a snapshot
    List(ListArgs),
    /// Export a document's saved pages
    Dump(DumpArgs),
    Version,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ListArgs {
    /// Snapshot file written by the memory view host
    pub snapshot: PathBuf,

    /// Print the listing as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DumpArgs {
    /// Snapshot file written by the memory view host
    pub snapshot: PathBuf,

    /// Document to export (default: the current document)
    #[arg(long = "doc", value_name = "ID")]
    pub doc_id: Option<String>,

    /// Write raw bytes instead of a hex listing
    #[arg(long)]
    pub binary: bool,

    /// Output file (default: stdout)
    #[arg(long, value_name = "FILE")]
    pub out: Option<PathBuf>,
}
