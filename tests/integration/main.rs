//! Integration tests for the Bluetooth core driven by an in-memory platform

mod mock_platform;
mod supervisor_tests;
