//! Online capacity extension
//!
//! Grows a volume on the storage side. Basic volumes are a single
//! expand; active-active volumes need a strictly ordered pipeline that
//! tears down and rebuilds the replication relationship around the
//! growth. A failed pipeline leaves a durable barrier file that blocks
//! further extensions until an operator repairs the volume.

pub mod barrier;
pub mod engine;

pub use barrier::ExtensionBarrier;
pub use engine::{ArrayCommands, ArrayCommandsRef, CopySide, ExtensionEngine, VolumeCopy};
