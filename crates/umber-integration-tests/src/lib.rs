//! Integration test crate for the Umber trade engine.
//!
//! This crate has no library code — it only contains integration tests
//! that exercise complete buy flows against in-process mock peers
//! (a fake coordinator and a fake seller worker).
//!
//! Run all integration tests:
//! ```sh
//! cargo test -p umber-integration-tests
//! ```
