// Typed records shared across components (phases, run options, checkpoint file format).

pub mod checkpoint;
pub mod options;
pub mod phase;
