//! Accumulates layers and port connections before compiling them into a runnable
//! [`crate::NeuralNetwork`]. Mirrors the original's pattern of declaring layers and wiring them
//! up before a single `setup`/`connect` pass runs.

use std::sync::Arc;

use fyusenet_base::{CompiledLayers, Layer, ParameterProvider};
use fyusenet_common::error::{FyuseNetError, Result};
use fyusenet_common::EngineConfig;
use fyusenet_engine::Callbacks;
use fyusenet_gpu::{BufferManager, GpuContext};

use crate::network::NeuralNetwork;

/// One port-to-port wiring to be resolved by the buffer manager at compile time.
#[derive(Debug, Clone, Copy)]
pub struct LayerConnection {
    pub producer: i32,
    pub consumer: i32,
    pub consumer_port: i32,
    pub lock_hint: bool,
}

impl LayerConnection {
    pub fn new(producer: i32, consumer: i32, consumer_port: i32, lock_hint: bool) -> Self {
        Self { producer, consumer, consumer_port, lock_hint }
    }
}

/// Accumulates a network's layers and connections prior to `compile`.
#[derive(Default)]
pub struct NetworkBuilder {
    layers: CompiledLayers,
    connections: Vec<LayerConnection>,
}

impl NetworkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a layer at its own layer number. Fails on a duplicate or negative number.
    pub fn add_layer(mut self, layer: Box<dyn Layer>) -> Result<Self> {
        self.layers.insert(layer)?;
        Ok(self)
    }

    /// Wire `producer`'s output ports into `consumer`'s input port `consumer_port`. `lock_hint`
    /// forces the buffer manager to exclude the resulting buffer from pool reuse, which is
    /// required when the producer is an async upload/download layer.
    pub fn connect(mut self, producer: i32, consumer: i32, consumer_port: i32, lock_hint: bool) -> Self {
        self.connections.push(LayerConnection::new(producer, consumer, consumer_port, lock_hint));
        self
    }

    /// Resolve every declared connection through the buffer manager, load parameters, run every
    /// layer's `setup`, and hand the result to a fresh [`NeuralNetwork`].
    pub fn compile<C: GpuContext + 'static>(
        mut self,
        context: Arc<C>,
        config: EngineConfig,
        async_mode: bool,
        callbacks: Callbacks,
        parameters: Option<&dyn ParameterProvider>,
    ) -> Result<NeuralNetwork<C>> {
        let mut buffer_manager = BufferManager::new();

        for conn in &self.connections {
            let producer_specs = self
                .layers
                .get(conn.producer)
                .ok_or_else(|| FyuseNetError::InvalidArgument(format!("no layer registered at index {}", conn.producer)))?
                .required_output_buffers();
            let consumer_specs = self
                .layers
                .get(conn.consumer)
                .ok_or_else(|| FyuseNetError::InvalidArgument(format!("no layer registered at index {}", conn.consumer)))?
                .required_input_buffers();

            let producer_layer = self
                .layers
                .get_mut(conn.producer)
                .ok_or_else(|| FyuseNetError::InvalidArgument(format!("no layer registered at index {}", conn.producer)))?;
            let async_producer = producer_layer.as_async_mut();

            buffer_manager.connect(
                context.as_ref(),
                conn.producer,
                &producer_specs,
                conn.consumer,
                conn.consumer_port,
                &consumer_specs,
                conn.lock_hint,
                async_producer,
            )?;
        }

        if let Some(provider) = parameters {
            for (_, layer) in self.layers.iter_mut() {
                layer.load_parameters(provider)?;
            }
        }

        NeuralNetwork::new(context, config, async_mode, callbacks, self.layers, buffer_manager)
    }
}
