//! Integration tests for Framerelay
//!
//! These tests drive the supervisor, relay, classifier and descriptor
//! builder together against in-memory stub transcoders, plus a few runs
//! against real short-lived Unix processes.

#[path = "integration/common.rs"]
mod common;

#[path = "integration/pipeline_e2e.rs"]
mod pipeline_e2e;

#[path = "integration/restart_supervision.rs"]
mod restart_supervision;

#[path = "integration/relay_framing.rs"]
mod relay_framing;

#[path = "integration/process_pipeline.rs"]
mod process_pipeline;
