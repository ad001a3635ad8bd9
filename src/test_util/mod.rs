//! This module contains utilities for testing code on top of the network stack: an in-memory
//!  network with explicit topology that runs any number of stacks in a single process. They
//!  are used for testing the stack itself, but they are also exported for application testing.

pub mod sim;
