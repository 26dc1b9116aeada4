//! Small helpers shared by the binaries.

pub mod bootstrap;
