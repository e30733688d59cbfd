use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "keeper",
    about = "Keeper: content-addressable blob store",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Store root directory (overrides the config file)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Front the store with a write-back cache using this many workers
    #[arg(long, global = true)]
    pub cache_workers: Option<usize>,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Store a file (or stdin) and print its key
    Put(PutArgs),
    /// Store a text value and print its key
    PutText(PutTextArgs),
    /// Write a value's data to stdout or a file
    Get(GetArgs),
    /// Show a value's metadata
    Meta(KeyArgs),
    /// Exit successfully if the key is present
    Contains(KeyArgs),
    /// Delete a value
    Delete(KeyArgs),
    /// List all keys
    List,
    /// Print the number of stored values
    Count,
}

#[derive(Args)]
pub struct MetaArgs {
    #[arg(long)]
    pub mime: Option<String>,
    /// Extension attribute as NAME=VALUE (repeatable)
    #[arg(long = "ext", value_name = "NAME=VALUE")]
    pub extensions: Vec<String>,
}

#[derive(Args)]
pub struct PutArgs {
    /// File to store; `-` reads stdin
    pub path: PathBuf,
    #[arg(long)]
    pub encoding: Option<String>,
    #[command(flatten)]
    pub meta: MetaArgs,
}

#[derive(Args)]
pub struct PutTextArgs {
    pub text: String,
    #[command(flatten)]
    pub meta: MetaArgs,
}

#[derive(Args)]
pub struct GetArgs {
    pub key: String,
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct KeyArgs {
    pub key: String,
}
