//! I/O boundaries: definition files, the run store, child processes, and
//! script rendering.

pub mod document;
pub mod process;
pub mod run_store;
pub mod script_render;
