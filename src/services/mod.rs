pub mod generation;
pub mod polling;
pub mod prompt;
pub mod scheduler;
pub mod submission;
