pub mod harness_binary_tests;
pub mod runner_tests;
