//! CursorFlow: a DAG-based multi-agent orchestration engine that runs AI
//! coding agents in parallel Git worktrees.
//!
//! `core` holds the pure, deterministic data model and algorithms; `io`
//! holds every side-effecting adapter (filesystem, git, process execution).
//! The top-level modules (`lane`, `dag`, `resume`, `run_service`) wire the
//! two together into the engine's orchestration surface.

pub mod cancel;
pub mod core;
pub mod dag;
pub mod exit_codes;
pub mod io;
pub mod lane;
pub mod logging;
pub mod resume;
pub mod run_service;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
