//! Domain logic and background tasks that sit beside the HTTP handlers.

pub mod health;
mod maintenance;
mod scheduler;

pub use maintenance::*;
pub use scheduler::*;
