//! Small helpers shared by the autokit crates.
//!
//! # Features
//!
//! - `resolvable`: Local files that can be resolved into a reader and its size.
//! - `retry`: Bounded retry and bounded wait primitives.

#[cfg(feature = "resolvable")]
pub mod resolvable;
#[cfg(feature = "retry")]
pub mod retry;
