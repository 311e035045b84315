// Driver test suite
#![cfg(test)]

pub mod harness;

pub mod bo_tests;
pub mod engine_tests;
pub mod clock_tests;
pub mod connector_tests;
