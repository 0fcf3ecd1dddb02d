//! The buffer manager: walks a connected graph of layers in layer-number order, allocating or
//! reusing GPU textures and CPU buffers so each declared output is satisfied and each
//! downstream input is wired to a matching producer output. Grounded on `buffermanager.h`/`.cpp`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use fyusenet_base::{BufferSpec, Device, Usage};
use fyusenet_common::error::{FyuseNetError, Result};
use fyusenet_cpu::CpuBuffer;

use fyusenet_base::AsyncLayer;

use crate::context::GpuContext;
use crate::texture::GpuTextureSet;

struct PoolTexture {
    resource: Arc<GpuTextureSet>,
    interpolation: fyusenet_base::Interpolation,
    locked: bool,
    last_input_layer_number: i32,
    producer_number: i32,
}

struct PoolCpu {
    resource: Arc<CpuBuffer>,
    locked: bool,
    last_input_layer_number: i32,
    producer_number: i32,
}

/// Owns every pooled GPU texture and CPU buffer created while connecting a network, plus the
/// bookkeeping needed to decide when a pool entry may be handed out again.
#[derive(Default)]
pub struct BufferManager {
    textures: Vec<PoolTexture>,
    cpu_buffers: Vec<PoolCpu>,
    gpu_output_index: HashMap<(i32, i32), usize>,
    cpu_output_index: HashMap<(i32, i32), usize>,
    gpu_input: HashMap<(i32, i32), Arc<GpuTextureSet>>,
    cpu_input: HashMap<(i32, i32), Arc<CpuBuffer>>,
    output_connected: HashSet<(i32, i32)>,
    input_connected: HashSet<(i32, i32)>,
}

impl BufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gpu_input_of(&self, consumer_number: i32, port: i32) -> Option<&Arc<GpuTextureSet>> {
        self.gpu_input.get(&(consumer_number, port))
    }

    pub fn cpu_input_of(&self, consumer_number: i32, port: i32) -> Option<&Arc<CpuBuffer>> {
        self.cpu_input.get(&(consumer_number, port))
    }

    pub fn texture_pool_size(&self) -> usize {
        self.textures.len()
    }

    pub fn cpu_pool_size(&self) -> usize {
        self.cpu_buffers.len()
    }

    /// Connect producer `producer_number`'s outputs to consumer `consumer_number`'s port
    /// `consumer_port`. `async_producer` is `Some` when the producer is an upload/download
    /// layer capable of the async contract (§4.6); passing `None` for a synchronous producer
    /// is correct and skips the async registration step.
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        &mut self,
        ctx: &dyn GpuContext,
        producer_number: i32,
        producer_specs: &[BufferSpec],
        consumer_number: i32,
        consumer_port: i32,
        consumer_specs: &[BufferSpec],
        lock_hint: bool,
        mut async_producer: Option<&mut dyn AsyncLayer>,
    ) -> Result<()> {
        if producer_specs.is_empty() || consumer_specs.is_empty() {
            return Err(FyuseNetError::InvalidArgument("connect called with no declared buffer specs".into()));
        }
        if self.input_connected.contains(&(consumer_number, consumer_port)) {
            return Err(FyuseNetError::AlreadyConnected);
        }

        let inputs: Vec<&BufferSpec> = consumer_specs.iter().filter(|s| s.port() == consumer_port).collect();
        if inputs.is_empty() {
            return Err(FyuseNetError::InvalidArgument(format!(
                "consumer {consumer_number} declares no input spec on port {consumer_port}"
            )));
        }

        let mut connected = false;
        'outer: for input in &inputs {
            for output in producer_specs {
                if !output.matches_input(input) {
                    continue;
                }
                match output.device() {
                    Device::Gpu => {
                        self.connect_gpu(
                            ctx,
                            producer_number,
                            output,
                            consumer_number,
                            consumer_port,
                            lock_hint,
                            async_producer.as_deref_mut(),
                        )?;
                    }
                    Device::Cpu => {
                        self.connect_cpu(producer_number, output, consumer_number, consumer_port, lock_hint)?;
                    }
                }
                connected = true;
                break 'outer;
            }
        }

        if !connected {
            return Err(FyuseNetError::NoIoMatch);
        }
        self.input_connected.insert((consumer_number, consumer_port));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn connect_gpu(
        &mut self,
        ctx: &dyn GpuContext,
        producer_number: i32,
        output: &BufferSpec,
        consumer_number: i32,
        consumer_port: i32,
        lock_hint: bool,
        async_producer: Option<&mut dyn AsyncLayer>,
    ) -> Result<()> {
        let mut lock = lock_hint;
        if let Some(producer) = async_producer {
            if producer.is_async() {
                lock = true;
                producer.add_consumer(consumer_number, output.channel_index());
            }
        }

        let key = (producer_number, output.channel_index());

        if let Some(&idx) = self.gpu_output_index.get(&key) {
            let entry = &mut self.textures[idx];
            entry.last_input_layer_number = entry.last_input_layer_number.max(consumer_number);
            if lock {
                entry.locked = true;
            }
            let resource = entry.resource.clone();
            self.gpu_input.insert((consumer_number, consumer_port), resource);
            self.output_connected.insert((producer_number, output.port()));
            return Ok(());
        }

        if output.usage() == Usage::PassThrough {
            let resource = self
                .gpu_input
                .get(&(producer_number, output.channel_index()))
                .cloned()
                .ok_or_else(|| {
                    FyuseNetError::InvalidArgument(format!(
                        "passthrough producer {producer_number} has no input texture at channel {}",
                        output.channel_index()
                    ))
                })?;
            let idx = self.textures.len();
            self.textures.push(PoolTexture {
                resource: resource.clone(),
                interpolation: output.interpolation(),
                locked: lock,
                last_input_layer_number: consumer_number,
                producer_number,
            });
            self.gpu_output_index.insert(key, idx);
            self.gpu_input.insert((consumer_number, consumer_port), resource);
            self.output_connected.insert((producer_number, output.port()));
            return Ok(());
        }

        if !lock {
            if let Some(idx) = self.find_reusable_texture(output, consumer_number, producer_number) {
                let entry = &mut self.textures[idx];
                entry.last_input_layer_number = consumer_number;
                entry.producer_number = producer_number;
                let resource = entry.resource.clone();
                self.gpu_output_index.insert(key, idx);
                self.gpu_input.insert((consumer_number, consumer_port), resource);
                self.output_connected.insert((producer_number, output.port()));
                return Ok(());
            }
        }

        let mut set = GpuTextureSet::allocate(ctx, *output.shape())?;
        let mut locked = lock;
        if output.multiplicity() > 1 {
            set.add_shadows(ctx, output.multiplicity() - 1)?;
            locked = true;
        }
        let resource = Arc::new(set);
        let idx = self.textures.len();
        self.textures.push(PoolTexture {
            resource: resource.clone(),
            interpolation: output.interpolation(),
            locked,
            last_input_layer_number: consumer_number,
            producer_number,
        });
        self.gpu_output_index.insert(key, idx);
        self.gpu_input.insert((consumer_number, consumer_port), resource);
        self.output_connected.insert((producer_number, output.port()));
        Ok(())
    }

    fn find_reusable_texture(&self, output: &BufferSpec, consumer_number: i32, producer_number: i32) -> Option<usize> {
        self.textures
            .iter()
            .position(|entry| gpu_reuse_eligible(entry, output, consumer_number, producer_number))
    }

    fn connect_cpu(
        &mut self,
        producer_number: i32,
        output: &BufferSpec,
        consumer_number: i32,
        consumer_port: i32,
        lock_hint: bool,
    ) -> Result<()> {
        let key = (producer_number, output.channel_index());

        if let Some(&idx) = self.cpu_output_index.get(&key) {
            let entry = &mut self.cpu_buffers[idx];
            entry.last_input_layer_number = entry.last_input_layer_number.max(consumer_number);
            if lock_hint {
                entry.locked = true;
            }
            let resource = entry.resource.clone();
            self.cpu_input.insert((consumer_number, consumer_port), resource);
            self.output_connected.insert((producer_number, output.port()));
            return Ok(());
        }

        if output.usage() == Usage::PassThrough {
            let resource = self
                .cpu_input
                .get(&(producer_number, output.channel_index()))
                .cloned()
                .ok_or_else(|| {
                    FyuseNetError::InvalidArgument(format!(
                        "passthrough producer {producer_number} has no input buffer at channel {}",
                        output.channel_index()
                    ))
                })?;
            let idx = self.cpu_buffers.len();
            self.cpu_buffers.push(PoolCpu {
                resource: resource.clone(),
                locked: lock_hint,
                last_input_layer_number: consumer_number,
                producer_number,
            });
            self.cpu_output_index.insert(key, idx);
            self.cpu_input.insert((consumer_number, consumer_port), resource);
            self.output_connected.insert((producer_number, output.port()));
            return Ok(());
        }

        if !lock_hint {
            if let Some(idx) = self.find_reusable_cpu(output, consumer_number, producer_number) {
                let entry = &mut self.cpu_buffers[idx];
                entry.last_input_layer_number = consumer_number;
                entry.producer_number = producer_number;
                let resource = entry.resource.clone();
                self.cpu_output_index.insert(key, idx);
                self.cpu_input.insert((consumer_number, consumer_port), resource);
                self.output_connected.insert((producer_number, output.port()));
                return Ok(());
            }
        }

        let buffer = Arc::new(CpuBuffer::new(*output.shape()));
        let idx = self.cpu_buffers.len();
        self.cpu_buffers.push(PoolCpu {
            resource: buffer.clone(),
            locked: lock_hint,
            last_input_layer_number: consumer_number,
            producer_number,
        });
        self.cpu_output_index.insert(key, idx);
        self.cpu_input.insert((consumer_number, consumer_port), buffer);
        self.output_connected.insert((producer_number, output.port()));
        Ok(())
    }

    fn find_reusable_cpu(&self, output: &BufferSpec, consumer_number: i32, producer_number: i32) -> Option<usize> {
        self.cpu_buffers
            .iter()
            .position(|entry| cpu_reuse_eligible(entry, output, consumer_number, producer_number))
    }

    /// Destroy all pooled GPU textures (deduplicating resources shared via passthrough
    /// aliasing) and drop all CPU buffers. The GPU context must be current on the calling
    /// thread.
    pub fn cleanup(&mut self, ctx: &dyn GpuContext) {
        let mut seen = HashSet::new();
        for entry in self.textures.drain(..) {
            if seen.insert(Arc::as_ptr(&entry.resource)) {
                entry.resource.destroy(ctx);
            }
        }
        self.cpu_buffers.clear();
        self.gpu_output_index.clear();
        self.cpu_output_index.clear();
        self.gpu_input.clear();
        self.cpu_input.clear();
        self.output_connected.clear();
        self.input_connected.clear();
    }
}

fn gpu_reuse_eligible(entry: &PoolTexture, output: &BufferSpec, consumer_number: i32, producer_number: i32) -> bool {
    if entry.locked {
        return false;
    }
    let shape = entry.resource.shape();
    if shape.width() != output.shape().width() || shape.height() != output.shape().height() {
        return false;
    }
    if shape.dtype() != output.shape().dtype() {
        return false;
    }
    if !entry.interpolation.compatible(output.interpolation()) {
        return false;
    }
    entry.last_input_layer_number < consumer_number - 1 && producer_number > entry.last_input_layer_number
}

fn cpu_reuse_eligible(entry: &PoolCpu, output: &BufferSpec, consumer_number: i32, producer_number: i32) -> bool {
    if entry.locked {
        return false;
    }
    if entry.resource.bytes() < output.shape().bytes() {
        return false;
    }
    entry.last_input_layer_number < consumer_number - 1 && producer_number > entry.last_input_layer_number
}
