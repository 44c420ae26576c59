//! Autoflow CLI library: command implementations shared by the `autoflow`
//! binary and its integration tests.

pub mod commands;
