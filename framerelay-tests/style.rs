//! Style Enforcement Tests
//!
//! Scans the production sources of the workspace for patterns clippy does
//! not reject on its own.
//!
//! - `production_code` - No panicking unwraps and no `#[allow(dead_code)]`
//!   outside test modules

#[path = "style/production_code.rs"]
mod production_code;
