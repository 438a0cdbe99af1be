//! raycon controller library.
//!
//! This crate ships a `raycon-controller` binary, but exposes its pieces as
//! a library so the reconciler and worker pool can be driven from
//! integration tests.

pub mod config;
pub mod controller;
pub mod manifest;
pub mod model;
pub mod store;
