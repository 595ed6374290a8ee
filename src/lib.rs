//! Image generation job queue
//!
//! This library provides the core functionality for the image-gen-queue
//! system, which submits prompts stored in PostgreSQL to the FusionBrain
//! (Kandinsky) generation API and polls the results back into the table.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;
