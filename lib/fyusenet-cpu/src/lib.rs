//! Host-memory buffer storage and the channel-major/GPU-layout conversions an upload or
//! download layer round-trips tensors through.

pub mod buffer;
pub mod layout;

pub use buffer::{buffer_from_raw, CpuBuffer, MappedBuffer};
