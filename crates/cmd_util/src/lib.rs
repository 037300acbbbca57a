//! Process-level plumbing shared by services and tests: environment knobs
//! and tracing setup.

pub mod env;
