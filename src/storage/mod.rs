// Durable control record (periodic checkpoints of the GXID counter)

pub mod control;

pub use control::ControlFile;
