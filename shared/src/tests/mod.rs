//! Test modules for the shared crate

mod config_tests;
mod task_tests;
