//! Integration test suite.
//!
//! 1. Session capture and apply round trips
//! 2. Changegroup merging
//! 3. Changeset log sync between replicas
//! 4. Codec properties

pub mod changegroup_tests;
pub mod codec_property_tests;
pub mod helpers;
pub mod repository_tests;
pub mod session_apply_tests;
