#![forbid(unsafe_code)]

//! Download-and-postprocessing pipeline for recorded spaces.
//!
//! One [`pipeline::Archiver::run`] call takes a source URL through
//! acquisition, verification, tagging, placement and deduplication. Every
//! other module is a single step of that pipeline and can be driven on its
//! own.

pub mod acquire;
pub mod cancel;
pub mod classify;
pub mod config;
pub mod content_id;
pub mod dedupe;
pub mod locator;
pub mod naming;
pub mod pipeline;
pub mod probe;
pub mod report;
pub mod split;
pub mod tagging;
pub mod throttle;
pub mod tools;
pub mod transcode;
pub mod verify;

#[cfg(test)]
mod test_support;
