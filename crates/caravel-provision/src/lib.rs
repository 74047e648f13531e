//! Provisioning operations: per-pack package and config selection, the
//! feature/config merge engine, the staged commit runtime, and the shared
//! engine-version cache.

pub mod engine;
pub mod merge;
pub mod runtime;
pub mod selection;
