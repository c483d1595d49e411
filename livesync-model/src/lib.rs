//! Payload model for the live entity sync engine.
//!
//! The engine never inspects entity payloads. It only needs two things from
//! them, both supplied by the caller through the [`Payload`] trait:
//! - apply a partial patch on top of a full value (shallow, field-level)
//! - fold two patches into one when a newer optimistic update supersedes an older one
//!
//! [`JsonPatch`] provides the implementation for `serde_json::Value`, which is
//! what most transports deliver.

mod json;
mod payload;

pub use json::{JsonPatch, json_patch};
pub use payload::Payload;
