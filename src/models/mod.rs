pub mod api;
pub mod generation;
pub mod job;
