use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "packgen")]
#[command(about = "Story-pack compiler: narrated script in, playback container out")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compile a story script into a binary pack
    Compile {
        /// Story script (JSON)
        script: PathBuf,

        /// Where to write the compiled pack
        #[arg(short, long, default_value = "story.pack")]
        output: PathBuf,

        /// Voice model, overriding configuration
        #[arg(long)]
        voice: Option<String>,

        /// Parallel narration workers
        #[arg(long)]
        workers: Option<usize>,

        /// Report every failing node instead of stopping at the first
        #[arg(long)]
        keep_going: bool,
    },

    /// Print the structure of a compiled pack
    Inspect {
        /// Compiled pack file
        pack: PathBuf,
    },

    /// Walk a compiled pack interactively, the way the player device would
    Simulate {
        /// Compiled pack file
        pack: PathBuf,

        /// Entry node to start from (default: the pack's first entry point)
        #[arg(long)]
        entry: Option<String>,
    },
}
