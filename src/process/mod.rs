//! Encoder process supervision: spawning, pause/resume/cancel and exit handling.

pub mod controller;
pub mod suspend;

pub use controller::{ControlMessage, ControlRequest, ControllerSettings, ProcessController};
pub use suspend::{NoSuspend, ProcessSuspender, SignalSuspender};
