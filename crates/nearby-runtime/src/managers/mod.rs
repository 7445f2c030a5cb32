//! Stateful managers owned by the engine worker

pub mod session;

pub use session::{initiates, Direction, SessionManager, SessionOutcome, SessionStats};
