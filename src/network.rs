//! The compiled, runnable network: an execution engine paired with the buffer manager that
//! resolved its layer-to-layer wiring. Grounded on `fyusenet/base/neuralnetwork.h`/`.cpp`.

use std::sync::Arc;

use fyusenet_base::StateToken;
use fyusenet_cpu::CpuBuffer;
use fyusenet_common::error::Result;
use fyusenet_common::{EngineConfig, PerformanceTracker};
use fyusenet_engine::{Callbacks, Engine, ExecState};
use fyusenet_gpu::{BufferManager, GpuContext, GpuTextureSet};

/// A compiled network, ready to run. Produced by [`crate::NetworkBuilder::compile`].
pub struct NeuralNetwork<C: GpuContext + 'static> {
    engine: Engine<C>,
    buffer_manager: BufferManager,
    context: Arc<C>,
}

impl<C: GpuContext + 'static> NeuralNetwork<C> {
    pub(crate) fn new(
        context: Arc<C>,
        config: EngineConfig,
        async_mode: bool,
        callbacks: Callbacks,
        layers: fyusenet_base::CompiledLayers,
        buffer_manager: BufferManager,
    ) -> Result<Self> {
        let engine = Engine::new(context.clone(), config, async_mode, callbacks);
        engine.setup(layers)?;
        Ok(Self { engine, buffer_manager, context })
    }

    /// Admit a new inference run. See [`fyusenet_engine::ExecState`] for what the three return
    /// variants mean.
    pub fn forward(&self, state: Option<StateToken>) -> Result<ExecState> {
        self.engine.forward(state)
    }

    /// Block until every admitted run has retired.
    pub fn finish(&self) -> Result<()> {
        self.engine.finish()
    }

    /// Ask the engine to stop; in-flight runs observe this cooperatively.
    pub fn stop(&self) {
        self.engine.stop()
    }

    pub fn performance(&self) -> &PerformanceTracker {
        self.engine.performance()
    }

    pub fn gpu_input(&self, consumer_number: i32, port: i32) -> Option<&Arc<GpuTextureSet>> {
        self.buffer_manager.gpu_input_of(consumer_number, port)
    }

    pub fn cpu_input(&self, consumer_number: i32, port: i32) -> Option<&Arc<CpuBuffer>> {
        self.buffer_manager.cpu_input_of(consumer_number, port)
    }

    /// Release every layer's GPU resources and the buffer manager's pooled textures. The GPU
    /// context must be current on the calling thread; call only after `stop`/`finish`.
    pub fn cleanup(&mut self) {
        self.engine.cleanup();
        self.buffer_manager.cleanup(self.context.as_ref());
    }
}
