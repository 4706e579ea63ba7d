//! Core engine behind the VideoSentinel batch re-encoder: media probing,
//! quality policy, the encoder driver, batch control, the network pipeline,
//! perceptual hashing, and duplicate grouping.

pub mod batch;
pub mod cache;
pub mod common;
pub mod copier;
pub mod duplicates;
pub mod encoder;
pub mod error;
pub mod hasher;
pub mod job;
pub mod logging;
pub mod media_info;
pub mod pipeline;
pub mod quality_policy;
pub mod shutdown;
pub mod subprocess;
