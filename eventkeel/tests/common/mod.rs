#![allow(dead_code)]

pub mod helpers;
pub mod test_aggregate;
