
//! A GPU-style intra-only wavelet video codec for networked real-time
//! delivery: five levels of CDF 9/7 decomposition, per-block rate control
//! against a byte budget, and a packet-oriented bitstream that tolerates
//! loss. This library uses no unsafe Rust.
//!
//! Every frame is compressed independently. The encoder turns three planar
//! YCbCr input planes into block packets plus a meta index; the packetizer
//! groups them into MTU-sized wire packets. The decoder ingests whatever
//! packets arrive, and reconstructs a frame once all announced blocks, or
//! more than half of them if the caller accepts partial frames, have been
//! delivered.

#![warn(
    rust_2018_idioms,
    future_incompatible,
    unused_extern_crates,
    unused,

    missing_copy_implementations,
    missing_debug_implementations,
)]

#![deny(
    unused_variables,
    unused_assignments,
    dead_code,
    unused_must_use,
    trivial_numeric_casts,
    redundant_semicolons
)]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod math;
pub mod io;

pub mod config;
pub mod device;
pub mod buffers;
pub mod transform;
pub mod quant;
pub mod bitstream;

pub mod encode;
pub mod decode;
pub mod container;

/// Export the most important items.
pub mod prelude {

    pub use crate::buffers::Plane;
    pub use crate::config::{ChromaSubsampling, CodecConfig, Precision};
    pub use crate::decode::{DecodeState, Decoder};
    pub use crate::device::{Device, DeviceCaps};
    pub use crate::encode::{BitstreamBuffers, BitstreamPacket, Encoder, Packet};

    // error handling
    pub use crate::error::{Error, Result};

    // re-export external stuff
    pub use half::f16;
    pub use smallvec::SmallVec;
}
