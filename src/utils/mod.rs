//! Utility functions shared by the binaries and controllers.

pub mod bootstrap;
pub mod names;
pub mod retry;
