//! Bit-flip mutation fuzzer module for `plugfuzz`.
//!
//! Built as a `cdylib`, the library drops into the host's plugin location and
//! registers a single `BitFlipFuzzer`.

pub mod harness;

pub use harness::{
    BitFlipFuzzer, HarnessArgs, MODULE_NAME, STATUS_FAILURE_LIMIT, STATUS_IO_FAILED,
    STATUS_SETUP_FAILED,
};

plugfuzz_core::export_plugins!(BitFlipFuzzer);
