//! The common layer state and trait shared by every layer kind, plus the builder used to
//! construct it. Generalizes the original's `dynamic_cast`-based kind discovery into an
//! explicit tag (`LayerKind`), per the design notes.

use bitflags::bitflags;

use fyusenet_common::error::Result;

use crate::async_layer::AsyncLayer;
use crate::param::ParameterProvider;
use crate::spec::BufferSpec;
use crate::state::StateToken;

bitflags! {
    /// Misc per-layer flags governing fused post-processing, mirroring the original's
    /// activation/residual/batchnorm flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LayerFlags: u32 {
        const NONE = 0;
        const ACTIVATION = 1 << 0;
        const RESIDUAL_INPUT = 1 << 1;
        const BATCHNORM = 1 << 2;
        const POST_CONCAT = 1 << 3;
    }
}

/// Which physical device a layer's computation runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeDevice {
    Cpu,
    Gpu,
}

/// Explicit layer-kind tag. Replaces the original's `dynamic_cast`-based dispatch: the engine
/// switches on this directly instead of probing the layer's concrete type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    CpuLayer,
    SyncGpuLayer,
    UploadLayer,
    DownloadLayer,
    DeepDownloadLayer,
}

impl LayerKind {
    /// Whether this kind is ever dispatched through the async layer contract. `false` for
    /// every kind here; a concrete upload/download layer additionally implements `AsyncLayer`
    /// and is asked for `is_async()` at connection time — the kind tag alone only tells the
    /// engine *which* forward entry point and dependency bookkeeping to use, not whether this
    /// particular instance happens to run asynchronously.
    pub fn is_transfer(self) -> bool {
        matches!(
            self,
            LayerKind::UploadLayer | LayerKind::DownloadLayer | LayerKind::DeepDownloadLayer
        )
    }
}

/// State shared by every layer implementation, embedded by value in concrete layer structs.
#[derive(Debug, Clone)]
pub struct LayerCommon {
    name: String,
    number: i32,
    flags: LayerFlags,
    width: u32,
    height: u32,
    input_channels: u32,
    output_channels: u32,
    input_padding: u32,
    output_padding: u32,
    residual_padding: u32,
    device: ComputeDevice,
    kind: LayerKind,
    has_parameters: bool,
    valid: bool,
    input_ports_connected: Vec<i32>,
    output_connected: bool,
}

impl LayerCommon {
    #[allow(clippy::too_many_arguments)]
    pub fn new(builder: &LayerBuilder) -> Self {
        Self {
            name: builder.name.clone(),
            number: builder.number,
            flags: builder.flags,
            width: builder.width,
            height: builder.height,
            input_channels: builder.input_channels,
            output_channels: builder.output_channels,
            input_padding: builder.input_padding,
            output_padding: builder.output_padding,
            residual_padding: builder.residual_padding,
            device: builder.device,
            kind: builder.kind,
            has_parameters: builder.has_parameters,
            valid: false,
            input_ports_connected: Vec::new(),
            output_connected: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn number(&self) -> i32 {
        self.number
    }

    pub fn flags(&self) -> LayerFlags {
        self.flags
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn num_input_channels(&self) -> u32 {
        self.input_channels
    }

    pub fn num_output_channels(&self) -> u32 {
        self.output_channels
    }

    pub fn input_padding(&self) -> u32 {
        self.input_padding
    }

    pub fn output_padding(&self) -> u32 {
        self.output_padding
    }

    pub fn residual_padding(&self) -> u32 {
        self.residual_padding
    }

    pub fn device(&self) -> ComputeDevice {
        self.device
    }

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn has_parameters(&self) -> bool {
        self.has_parameters
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn mark_valid(&mut self) {
        self.valid = true;
    }

    pub fn is_connected(&self) -> bool {
        self.output_connected && !self.input_ports_connected.is_empty()
    }

    pub fn is_port_connected(&self, port: i32) -> bool {
        self.input_ports_connected.contains(&port)
    }

    pub fn mark_input_connected(&mut self, port: i32) {
        if !self.input_ports_connected.contains(&port) {
            self.input_ports_connected.push(port);
        }
    }

    pub fn mark_output_connected(&mut self) {
        self.output_connected = true;
    }

    pub fn is_output_connected(&self) -> bool {
        self.output_connected
    }
}

/// Fluent builder for `LayerCommon`, analogous to the original's `LayerBuilder` hierarchy.
#[derive(Debug, Clone)]
pub struct LayerBuilder {
    name: String,
    number: i32,
    flags: LayerFlags,
    width: u32,
    height: u32,
    input_channels: u32,
    output_channels: u32,
    input_padding: u32,
    output_padding: u32,
    residual_padding: u32,
    device: ComputeDevice,
    kind: LayerKind,
    has_parameters: bool,
}

impl LayerBuilder {
    pub fn new(name: impl Into<String>, number: i32, device: ComputeDevice, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            number,
            flags: LayerFlags::NONE,
            width: 0,
            height: 0,
            input_channels: 0,
            output_channels: 0,
            input_padding: 0,
            output_padding: 0,
            residual_padding: 0,
            device,
            kind,
            has_parameters: false,
        }
    }

    pub fn extents(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn channels(mut self, input: u32, output: u32) -> Self {
        self.input_channels = input;
        self.output_channels = output;
        self
    }

    pub fn padding(mut self, input: u32, output: u32, residual: u32) -> Self {
        self.input_padding = input;
        self.output_padding = output;
        self.residual_padding = residual;
        self
    }

    pub fn flags(mut self, flags: LayerFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn has_parameters(mut self, has: bool) -> Self {
        self.has_parameters = has;
        self
    }
}

/// Interface implemented by every network layer, regardless of which device it runs on.
///
/// Concrete layers embed a `LayerCommon` and delegate the accessor methods to it; the
/// behavioral methods (`setup`, `cleanup`, `forward`, buffer specs) are where a layer's actual
/// logic lives.
pub trait Layer: Send + Sync {
    fn common(&self) -> &LayerCommon;
    fn common_mut(&mut self) -> &mut LayerCommon;

    /// One-time GPU/CPU initialization. Preconditions: for GPU layers, the right context must
    /// be current on the calling thread.
    fn setup(&mut self) -> Result<()>;

    /// Release resources allocated during `setup`. Must be called before dropping a GPU layer.
    fn cleanup(&mut self);

    /// Load this layer's parameters (weights, biases, ...) from a provider. Empty default for
    /// parameter-free layers.
    fn load_parameters(&mut self, _weights: &dyn ParameterProvider) -> Result<()> {
        Ok(())
    }

    fn required_input_buffers(&self) -> Vec<BufferSpec>;
    fn required_output_buffers(&self) -> Vec<BufferSpec>;

    /// Run this layer's forward computation for `sequence_no`.
    fn forward(&mut self, sequence_no: u64, state: Option<&StateToken>) -> Result<()>;

    /// Debug hook: dump this layer's current output to `file_name`. No-op unless the engine's
    /// intermediate-output toggle is enabled.
    fn write_result(&self, _file_name: &str, _include_padding: bool) -> Result<()> {
        Ok(())
    }

    fn number(&self) -> i32 {
        self.common().number()
    }

    fn name(&self) -> &str {
        self.common().name()
    }

    fn kind(&self) -> LayerKind {
        self.common().kind()
    }

    fn device(&self) -> ComputeDevice {
        self.common().device()
    }

    fn is_connected(&self) -> bool {
        self.common().is_connected()
    }

    /// Downcast to the async transfer contract. `None` for every layer except upload/download
    /// layers, which override this to expose themselves; lets the engine dispatch an async-
    /// capable layer through `AsyncLayer` without `CompiledLayers` needing to know concrete
    /// layer types.
    fn as_async_mut(&mut self) -> Option<&mut dyn AsyncLayer> {
        None
    }
}
