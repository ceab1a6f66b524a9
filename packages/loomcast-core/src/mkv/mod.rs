//! MKV packaging.
//!
//! [`MkvGenerator`] turns frames into the container byte stream: a
//! self-contained stream header on demand, cluster headers at fragment
//! boundaries, SimpleBlocks for frames, and Tag elements for metadata.

pub mod ebml;
mod generator;
pub mod nal;

pub use generator::{EncodedFrameInfo, GeneratorState, MkvGenerator};
