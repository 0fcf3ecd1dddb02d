//! Buffer specifications: the port-level descriptors the buffer manager matches producers
//! against consumers with.

use crate::shape::{BufferShape, DataOrder};

/// Which device a buffer spec's data lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Gpu,
}

/// Texture sampling mode requested for a GPU port. `Any` matches either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interpolation {
    Nearest,
    Linear,
    Any,
}

impl Interpolation {
    /// Whether `self` (a producer's interpolation) satisfies `requested` (a consumer's).
    pub fn compatible(self, other: Interpolation) -> bool {
        self == Interpolation::Any || other == Interpolation::Any || self == other
    }
}

/// How a buffer spec's underlying storage is meant to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Usage {
    Normal,
    /// Feeds an element-wise residual addition rather than the primary input.
    ResidualSource,
    /// Output aliases the producer's own input at the same channel index; no allocation.
    PassThrough,
    /// Destination is an OES external texture (skips the ShallowGPU format-adoption rule).
    OesDest,
}

/// A port descriptor attached to one input or output port of a layer.
#[derive(Debug, Clone, Copy)]
pub struct BufferSpec {
    shape: BufferShape,
    port: i32,
    channel_index: i32,
    device: Device,
    interpolation: Interpolation,
    usage: Usage,
    multiplicity: u32,
    lock: bool,
}

impl BufferSpec {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shape: BufferShape,
        port: i32,
        channel_index: i32,
        device: Device,
        interpolation: Interpolation,
        usage: Usage,
        multiplicity: u32,
        lock: bool,
    ) -> Self {
        debug_assert!(multiplicity >= 1, "multiplicity must be at least 1");
        Self {
            shape,
            port,
            channel_index,
            device,
            interpolation,
            usage,
            multiplicity: multiplicity.max(1),
            lock,
        }
    }

    pub fn shape(&self) -> &BufferShape {
        &self.shape
    }

    pub fn port(&self) -> i32 {
        self.port
    }

    pub fn channel_index(&self) -> i32 {
        self.channel_index
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn multiplicity(&self) -> u32 {
        self.multiplicity
    }

    pub fn lock_requested(&self) -> bool {
        self.lock
    }

    /// Whether `self` (an output spec) may feed `input` (a downstream input spec) per the
    /// buffer manager's matching rule in the connection protocol.
    pub fn matches_input(&self, input: &BufferSpec) -> bool {
        if self.device != input.device {
            return false;
        }
        if self.channel_index != input.channel_index {
            return false;
        }
        if self.shape.width() != input.shape.width() || self.shape.height() != input.shape.height() {
            return false;
        }
        if !self.interpolation.compatible(input.interpolation) {
            return false;
        }
        if self.device == Device::Cpu && self.shape.channels() != input.shape.channels() {
            return false;
        }
        if self.shape.dtype() != input.shape.dtype() {
            // Differing internal formats only ever unify for ShallowGPU, non-OES-destination
            // ports, and only within the same integral/float family; the producer's format wins
            // (the buffer manager allocates using the producer's shape on a fresh match).
            if self.shape.order() != DataOrder::ShallowGpu || input.usage == Usage::OesDest {
                return false;
            }
            if self.shape.dtype().is_integral() != input.shape.dtype().is_integral() {
                return false;
            }
        }
        true
    }
}
