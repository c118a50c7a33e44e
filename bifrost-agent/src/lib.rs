//! Backend agent library: the control loop that keeps one connection to
//! the server alive, and the dialer sessions it spawns per tunneled
//! request. `main.rs` is a thin CLI wrapper around [`control::run`].

pub mod control;
pub mod dialer;

pub use control::AgentConfig;
