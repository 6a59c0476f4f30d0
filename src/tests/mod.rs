//! Unit tests for the amd_ucode crate.
//!
//! This module contains the test helpers shared by the per-module tests and
//! end-to-end tests of the request/apply cycle.

pub(crate) mod mock;
