//! Media types shared by the ingestion pipeline.
//!
//! This crate defines the frame and stream description types that producers
//! hand to the ingestion service. Frames are immutable once built; payloads are
//! reference-counted `Bytes` so buffering and batching never copy pixel data.

#![warn(clippy::pedantic)]

pub mod frame;
pub mod stream;

pub use frame::{Frame, FrameFormat};
pub use stream::{StreamConfig, StreamDescription};
