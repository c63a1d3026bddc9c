//! Test modules for the server crate

mod database_tests;
mod dispatcher_tests;
mod scheduler_tests;
