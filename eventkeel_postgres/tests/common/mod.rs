#![allow(dead_code)]

pub mod helpers;

// One fixture for both crates' integration tests.
#[path = "../../../eventkeel/tests/common/test_aggregate.rs"]
pub mod test_aggregate;
