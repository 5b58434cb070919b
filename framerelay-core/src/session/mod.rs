//! Session negotiation artifact consumed by the input transcoder.

pub mod descriptor;

pub use descriptor::{DescriptorError, Direction, SessionDescriptor};
