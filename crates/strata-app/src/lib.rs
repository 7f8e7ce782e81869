//! Headless Strata: runs a world offline, as a host, or joined to a host,
//! with a scripted player walking through it.

pub mod collab;
pub mod game_loop;
pub mod runner;
pub mod walker;

pub use collab::{ConsoleUi, CountingPhysics, StdinUi};
pub use game_loop::{FIXED_DT, GameLoop, MAX_FRAME_TIME};
pub use runner::{AppError, RunOptions, RunSummary, StopReason, run_host, run_join, run_offline};
pub use walker::FocusWalker;
