//! Dependency graph construction for provisioning: depth-first expansion
//! with explicit-wins conflict resolution, deterministic install ordering,
//! patch association, the engine-version gate, and update-plan diffs.

pub mod graph;
pub mod layout;
pub mod update;
