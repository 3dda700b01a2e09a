//! `mdl`: markdown-declared action orchestrator.
//!
//! Declares actions in markdown, resolves a contextual dependency graph, and
//! executes it on a worker pool with per-action capture and checkpointing.

use mudyla::{cli, logging};

fn main() {
    logging::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let project_root = cli::find_project_root();
    std::process::exit(cli::run_with_args(&project_root, &args));
}
