//! Runtime registry
//!
//! Language environment definitions and the immutable lookup table built from them.

pub mod environment;
pub mod languages;
pub mod registry;
