//! x86 (32-bit, PAE) architecture support.
//!
//! Privileged instruction and register accessors carry two builds: inline
//! assembly on the bare-metal target, and an emulated register file
//! everywhere else so that kernel logic can be exercised by host tests.

pub mod cpuid;
pub mod instructions;
pub mod registers;
pub mod structures;
