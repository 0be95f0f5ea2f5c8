//! Tests for driftmon.
//!
//! Everything here runs against the in-memory broker implementation, except
//! the orchestrator tests, which additionally build throwaway git
//! repositories with the `git` CLI to exercise real clones.

mod helper;

mod events;
mod orchestrator;
mod queue;
mod worker;
