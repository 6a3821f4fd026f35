//! SchemaHero - declarative database schema management
//!
//! Tables, views, functions, extensions and data migrations are declared as
//! Kubernetes resources. The manager plans DDL for them through out-of-process
//! engine plugins, records each plan as a `Migration`, and applies approved
//! migrations with short-lived apply pods.

pub mod api;
pub mod apply;
pub mod config;
pub mod controllers;
pub mod plugin;
pub mod secrets;
pub mod store;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
