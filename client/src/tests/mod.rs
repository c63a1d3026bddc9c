//! Test modules for the client crate

mod client_tests;
