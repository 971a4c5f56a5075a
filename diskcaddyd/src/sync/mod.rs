pub mod engine;
pub mod names;
pub mod queue;
pub mod session;
