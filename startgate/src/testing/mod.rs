//! Testing utilities.
//!
//! Recording and scripted doubles for every seam the startup sequence and
//! build graph reach through, plus fixture configurations and graphs.

mod fixtures;
mod mocks;

pub use fixtures::{chain_graph, diamond_graph, fixture_config, fixture_vars, FIXTURE_DATABASE_URI};
pub use mocks::{
    RecordingExecutor, RecordingLauncher, ScriptedHealthChecker, ScriptedProbe, StaticIdentities,
};
