//! End-to-end scheduler scenarios (S1, S2, S3, S6) run against `MockGpuContext`. Pool-sizing and
//! passthrough-aliasing scenarios (S4, S5) live as unit tests in `fyusenet-gpu`'s buffer manager,
//! since they exercise connection-time behavior rather than dispatch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fyusenet_base::{AsyncCallback, AsyncLayer, AsyncState as AsyncOutcome, BufferSpec, ComputeDevice, Layer, LayerBuilder, LayerCommon, LayerKind, StateToken};
use fyusenet_common::{EngineConfig, FyuseNetError, Result};
use fyusenet_engine::{Callbacks, Engine, ExecState, SequenceOutcome};
use fyusenet_gpu::context::mock::{FenceBehavior, MockGpuContext};
use fyusenet_gpu::GpuContext;

/// A layer that just copies whatever bytes it was last handed into a shared log, tagging each
/// entry with the sequence number it ran under. Stands in for both the compute layers between
/// transfers and (when given a `downstream` slot) a terminal sync download.
struct RelayLayer {
    common: LayerCommon,
    upstream: Arc<Mutex<Vec<u8>>>,
    log: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
}

impl RelayLayer {
    fn new(name: &str, number: i32, kind: LayerKind, upstream: Arc<Mutex<Vec<u8>>>, log: Arc<Mutex<Vec<(u64, Vec<u8>)>>>) -> Self {
        let builder = LayerBuilder::new(name, number, ComputeDevice::Cpu, kind);
        Self { common: LayerCommon::new(&builder), upstream, log }
    }
}

impl Layer for RelayLayer {
    fn common(&self) -> &LayerCommon {
        &self.common
    }
    fn common_mut(&mut self) -> &mut LayerCommon {
        &mut self.common
    }
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }
    fn cleanup(&mut self) {}
    fn required_input_buffers(&self) -> Vec<BufferSpec> {
        Vec::new()
    }
    fn required_output_buffers(&self) -> Vec<BufferSpec> {
        Vec::new()
    }
    fn forward(&mut self, sequence_no: u64, _state: Option<&StateToken>) -> Result<()> {
        let bytes = self.upstream.lock().unwrap().clone();
        self.log.lock().unwrap().push((sequence_no, bytes));
        Ok(())
    }
}

/// Async upload stand-in carrying its "current" visible bytes in a shared slot that consumer
/// `RelayLayer`s read from directly, plus an in-flight "pending" slot promoted on
/// `swap_output_textures`. Tracks how many times `swap_output_textures`/`unlock` fired.
struct MockUploadLayer {
    common: LayerCommon,
    next_input: Arc<Mutex<Vec<u8>>>,
    pending: Arc<Mutex<Option<Vec<u8>>>>,
    current: Arc<Mutex<Vec<u8>>>,
    consumers: Vec<i32>,
    swap_count: Arc<AtomicUsize>,
    unlock_count: Arc<AtomicUsize>,
    delay: Duration,
}

impl MockUploadLayer {
    fn new(number: i32, next_input: Arc<Mutex<Vec<u8>>>, current: Arc<Mutex<Vec<u8>>>, delay: Duration) -> Self {
        let builder = LayerBuilder::new("upload", number, ComputeDevice::Gpu, LayerKind::UploadLayer);
        Self {
            common: LayerCommon::new(&builder),
            next_input,
            pending: Arc::new(Mutex::new(None)),
            current,
            consumers: Vec::new(),
            swap_count: Arc::new(AtomicUsize::new(0)),
            unlock_count: Arc::new(AtomicUsize::new(0)),
            delay,
        }
    }
}

impl Layer for MockUploadLayer {
    fn common(&self) -> &LayerCommon {
        &self.common
    }
    fn common_mut(&mut self) -> &mut LayerCommon {
        &mut self.common
    }
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }
    fn cleanup(&mut self) {}
    fn required_input_buffers(&self) -> Vec<BufferSpec> {
        Vec::new()
    }
    fn required_output_buffers(&self) -> Vec<BufferSpec> {
        Vec::new()
    }
    fn forward(&mut self, _sequence_no: u64, _state: Option<&StateToken>) -> Result<()> {
        *self.current.lock().unwrap() = self.next_input.lock().unwrap().clone();
        Ok(())
    }
    fn as_async_mut(&mut self) -> Option<&mut dyn AsyncLayer> {
        Some(self)
    }
}

impl AsyncLayer for MockUploadLayer {
    fn is_async(&self) -> bool {
        true
    }
    fn add_consumer(&mut self, consumer_number: i32, _channel_offset: i32) {
        if !self.consumers.contains(&consumer_number) {
            self.consumers.push(consumer_number);
        }
    }
    fn first_consumer(&self) -> Option<i32> {
        self.consumers.iter().min().copied()
    }
    fn last_consumer(&self) -> Option<i32> {
        self.consumers.iter().max().copied()
    }
    fn async_forward(&mut self, sequence_no: u64, _state: Option<&StateToken>, mut callback: AsyncCallback) -> Result<bool> {
        let bytes = self.next_input.lock().unwrap().clone();
        let pending = self.pending.clone();
        let delay = self.delay;
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            *pending.lock().unwrap() = Some(bytes);
            callback(sequence_no, AsyncOutcome::Success);
        });
        Ok(true)
    }
    fn forward(&mut self, _sequence_no: u64, _state: Option<&StateToken>) -> Result<()> {
        Ok(())
    }
    fn swap_output_textures(&mut self, _sequence_no: u64) {
        if let Some(bytes) = self.pending.lock().unwrap().take() {
            *self.current.lock().unwrap() = bytes;
        }
        self.swap_count.fetch_add(1, Ordering::SeqCst);
    }
    fn unlock(&mut self, _sequence_no: u64) {
        self.unlock_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Async download stand-in: copies its upstream slot into a shared log on a delayed worker.
struct MockDownloadLayer {
    common: LayerCommon,
    upstream: Arc<Mutex<Vec<u8>>>,
    log: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    delay: Duration,
}

impl MockDownloadLayer {
    fn new(number: i32, upstream: Arc<Mutex<Vec<u8>>>, log: Arc<Mutex<Vec<(u64, Vec<u8>)>>>, delay: Duration) -> Self {
        let builder = LayerBuilder::new("download", number, ComputeDevice::Gpu, LayerKind::DownloadLayer);
        Self { common: LayerCommon::new(&builder), upstream, log, delay }
    }
}

impl Layer for MockDownloadLayer {
    fn common(&self) -> &LayerCommon {
        &self.common
    }
    fn common_mut(&mut self) -> &mut LayerCommon {
        &mut self.common
    }
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }
    fn cleanup(&mut self) {}
    fn required_input_buffers(&self) -> Vec<BufferSpec> {
        Vec::new()
    }
    fn required_output_buffers(&self) -> Vec<BufferSpec> {
        Vec::new()
    }
    fn forward(&mut self, sequence_no: u64, _state: Option<&StateToken>) -> Result<()> {
        let bytes = self.upstream.lock().unwrap().clone();
        self.log.lock().unwrap().push((sequence_no, bytes));
        Ok(())
    }
    fn as_async_mut(&mut self) -> Option<&mut dyn AsyncLayer> {
        Some(self)
    }
}

impl AsyncLayer for MockDownloadLayer {
    fn is_async(&self) -> bool {
        true
    }
    fn add_consumer(&mut self, _consumer_number: i32, _channel_offset: i32) {}
    fn first_consumer(&self) -> Option<i32> {
        None
    }
    fn last_consumer(&self) -> Option<i32> {
        None
    }
    fn async_forward(&mut self, sequence_no: u64, _state: Option<&StateToken>, mut callback: AsyncCallback) -> Result<bool> {
        let bytes = self.upstream.lock().unwrap().clone();
        let log = self.log.clone();
        let delay = self.delay;
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            log.lock().unwrap().push((sequence_no, bytes));
            callback(sequence_no, AsyncOutcome::Success);
        });
        Ok(true)
    }
    fn forward(&mut self, _sequence_no: u64, _state: Option<&StateToken>) -> Result<()> {
        Ok(())
    }
}

/// A layer that times out waiting on a GPU fence that never resolves, reported as a `GpuError`.
struct NeverFencingLayer {
    common: LayerCommon,
    context: Arc<MockGpuContext>,
}

impl Layer for NeverFencingLayer {
    fn common(&self) -> &LayerCommon {
        &self.common
    }
    fn common_mut(&mut self) -> &mut LayerCommon {
        &mut self.common
    }
    fn setup(&mut self) -> Result<()> {
        Ok(())
    }
    fn cleanup(&mut self) {}
    fn required_input_buffers(&self) -> Vec<BufferSpec> {
        Vec::new()
    }
    fn required_output_buffers(&self) -> Vec<BufferSpec> {
        Vec::new()
    }
    fn as_async_mut(&mut self) -> Option<&mut dyn AsyncLayer> {
        Some(self)
    }
    fn forward(&mut self, _sequence_no: u64, _state: Option<&StateToken>) -> Result<()> {
        Ok(())
    }
}

impl AsyncLayer for NeverFencingLayer {
    fn is_async(&self) -> bool {
        true
    }
    fn add_consumer(&mut self, _consumer_number: i32, _channel_offset: i32) {}
    fn first_consumer(&self) -> Option<i32> {
        None
    }
    fn last_consumer(&self) -> Option<i32> {
        None
    }
    fn async_forward(&mut self, sequence_no: u64, _state: Option<&StateToken>, mut callback: AsyncCallback) -> Result<bool> {
        let fence = self.context.issue_fence();
        let ctx = self.context.clone();
        std::thread::spawn(move || {
            // `FenceBehavior::Never` sleeps out the full wait before failing; passing an hours-long
            // bound here means the worker never reports back within this test's lifetime, modeling
            // a transfer whose completion callback truly never arrives.
            let outcome = match ctx.wait_client_sync(fence, Duration::from_secs(3600)) {
                Ok(()) => AsyncOutcome::Success,
                Err(_) => AsyncOutcome::Failed,
            };
            callback(sequence_no, outcome);
        });
        Ok(true)
    }
    fn forward(&mut self, _sequence_no: u64, _state: Option<&StateToken>) -> Result<()> {
        Ok(())
    }
}

#[test]
fn s1_single_synchronous_inference_round_trips_byte_for_byte() {
    let input: Vec<u8> = (0u8..64).collect();
    let shared_a = Arc::new(Mutex::new(input.clone()));
    let shared_b = Arc::new(Mutex::new(Vec::new()));
    let download_log = Arc::new(Mutex::new(Vec::new()));

    let mut layers = fyusenet_base::CompiledLayers::new();
    // layer #1 "upload": a plain sync relay seeding shared_a into shared_b.
    layers.insert(Box::new(RelayLayer::new("upload", 1, LayerKind::UploadLayer, shared_a.clone(), Arc::new(Mutex::new(Vec::new()))))).unwrap();
    // identity compute layer, reads shared_a and republishes into shared_b.
    struct Identity {
        common: LayerCommon,
        src: Arc<Mutex<Vec<u8>>>,
        dst: Arc<Mutex<Vec<u8>>>,
    }
    impl Layer for Identity {
        fn common(&self) -> &LayerCommon {
            &self.common
        }
        fn common_mut(&mut self) -> &mut LayerCommon {
            &mut self.common
        }
        fn setup(&mut self) -> Result<()> {
            Ok(())
        }
        fn cleanup(&mut self) {}
        fn required_input_buffers(&self) -> Vec<BufferSpec> {
            Vec::new()
        }
        fn required_output_buffers(&self) -> Vec<BufferSpec> {
            Vec::new()
        }
        fn forward(&mut self, _sequence_no: u64, _state: Option<&StateToken>) -> Result<()> {
            *self.dst.lock().unwrap() = self.src.lock().unwrap().clone();
            Ok(())
        }
    }
    let builder = LayerBuilder::new("identity", 2, ComputeDevice::Gpu, LayerKind::SyncGpuLayer);
    layers
        .insert(Box::new(Identity { common: LayerCommon::new(&builder), src: shared_a.clone(), dst: shared_b.clone() }))
        .unwrap();
    layers.insert(Box::new(RelayLayer::new("download", 3, LayerKind::DownloadLayer, shared_b.clone(), download_log.clone()))).unwrap();

    let ctx = Arc::new(MockGpuContext::new());
    let engine = Engine::new(ctx, EngineConfig::default(), false, Callbacks::default());
    engine.setup(layers).unwrap();

    let result = engine.forward(None).unwrap();
    assert_eq!(result, ExecState::Done);

    let log = download_log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].0, 1);
    assert_eq!(log[0].1, input);
}

#[test]
fn s2_async_upload_serializes_across_two_sequences() {
    let next_input = Arc::new(Mutex::new(vec![0xAAu8; 16]));
    let current = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut layers = fyusenet_base::CompiledLayers::new();
    let mut upload = MockUploadLayer::new(1, next_input.clone(), current.clone(), Duration::from_millis(15));
    upload.add_consumer(2, 0);
    upload.add_consumer(3, 0);
    let swap_count = upload.swap_count.clone();
    let unlock_count = upload.unlock_count.clone();
    layers.insert(Box::new(upload)).unwrap();
    layers
        .insert(Box::new(RelayLayer::new("consumer_a", 2, LayerKind::SyncGpuLayer, current.clone(), log.clone())))
        .unwrap();
    layers
        .insert(Box::new(RelayLayer::new("consumer_b", 3, LayerKind::SyncGpuLayer, current.clone(), log.clone())))
        .unwrap();
    layers
        .insert(Box::new(RelayLayer::new("download", 4, LayerKind::DownloadLayer, current.clone(), log.clone())))
        .unwrap();

    let ctx = Arc::new(MockGpuContext::new());
    let done = Arc::new(Mutex::new(Vec::new()));
    let done_clone = done.clone();
    let callbacks = Callbacks {
        on_sequence_done: Some(Box::new(move |seq, outcome| done_clone.lock().unwrap().push((seq, outcome)))),
        ..Default::default()
    };
    let engine = Engine::new(ctx, EngineConfig::default(), true, callbacks);
    engine.setup(layers).unwrap();

    *next_input.lock().unwrap() = vec![b'A'; 16];
    assert_eq!(engine.forward(None).unwrap(), ExecState::Deferred);

    // give the first transfer a head start before queuing B, matching "B never appears in the
    // computation for sequenceNo 1".
    std::thread::sleep(Duration::from_millis(5));
    *next_input.lock().unwrap() = vec![b'B'; 16];
    // `forward` never executes a layer itself in async mode: it only enqueues the initial
    // ExecutionState for the looper and returns, so this is always `Deferred`.
    let second = engine.forward(None).unwrap();
    assert_eq!(second, ExecState::Deferred);

    engine.finish().unwrap();

    let done = done.lock().unwrap();
    assert_eq!(done.len(), 2);
    assert_eq!(done[0], (1, SequenceOutcome::Done));
    assert_eq!(done[1], (2, SequenceOutcome::Done));

    assert_eq!(swap_count.load(Ordering::SeqCst), 2);
    assert_eq!(unlock_count.load(Ordering::SeqCst), 2);

    let log = log.lock().unwrap();
    for (seq, bytes) in log.iter() {
        let expected = if *seq == 1 { b'A' } else { b'B' };
        assert!(bytes.iter().all(|&b| b == expected), "sequence {seq} observed bytes from the other sequence");
    }
}

#[test]
fn s3_masked_layer_is_skipped_but_async_download_still_resolves() {
    let counters: Vec<Arc<AtomicUsize>> = (0..5).map(|_| Arc::new(AtomicUsize::new(0))).collect();

    struct CountingLayer {
        common: LayerCommon,
        counter: Arc<AtomicUsize>,
    }
    impl Layer for CountingLayer {
        fn common(&self) -> &LayerCommon {
            &self.common
        }
        fn common_mut(&mut self) -> &mut LayerCommon {
            &mut self.common
        }
        fn setup(&mut self) -> Result<()> {
            Ok(())
        }
        fn cleanup(&mut self) {}
        fn required_input_buffers(&self) -> Vec<BufferSpec> {
            Vec::new()
        }
        fn required_output_buffers(&self) -> Vec<BufferSpec> {
            Vec::new()
        }
        fn forward(&mut self, _sequence_no: u64, _state: Option<&StateToken>) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let mut layers = fyusenet_base::CompiledLayers::new();
    for n in 0..3 {
        let builder = LayerBuilder::new(format!("l{n}"), n, ComputeDevice::Cpu, LayerKind::CpuLayer);
        layers
            .insert(Box::new(CountingLayer { common: LayerCommon::new(&builder), counter: counters[n as usize].clone() }))
            .unwrap();
    }
    let upstream = Arc::new(Mutex::new(vec![7u8; 8]));
    let log = Arc::new(Mutex::new(Vec::new()));
    let download = MockDownloadLayer::new(4, upstream, log.clone(), Duration::from_millis(5));
    layers.insert(Box::new(download)).unwrap();

    let ctx = Arc::new(MockGpuContext::new());
    let done = Arc::new(Mutex::new(Vec::new()));
    let done_clone = done.clone();
    let callbacks = Callbacks {
        on_sequence_done: Some(Box::new(move |seq, outcome| done_clone.lock().unwrap().push((seq, outcome)))),
        ..Default::default()
    };
    let engine = Engine::new(ctx, EngineConfig::default(), true, callbacks);
    engine.setup(layers).unwrap();

    // `forward` never walks the layer set itself in async mode: it hands the initial
    // ExecutionState to the looper and returns `Deferred` immediately. The looper runs the
    // whole chain (skipping the masked layer, dispatching the terminal async download, which has
    // no downstream reader so nothing parks on it) in the background; `finish()` below is what
    // actually waits for that to land.
    let token = StateToken::new().with_masked_layers([1]);
    let result = engine.forward(Some(token)).unwrap();
    assert_eq!(result, ExecState::Deferred);

    engine.finish().unwrap();

    assert_eq!(counters[0].load(Ordering::SeqCst), 1);
    assert_eq!(counters[1].load(Ordering::SeqCst), 0, "masked layer must not run");
    assert_eq!(counters[2].load(Ordering::SeqCst), 1);
    assert_eq!(log.lock().unwrap().len(), 1);
    assert_eq!(done.lock().unwrap().as_slice(), &[(1, SequenceOutcome::Done)]);
}

#[test]
fn s6_fence_that_never_resolves_times_out_without_leaking_textures() {
    let ctx = Arc::new(MockGpuContext::new());
    ctx.set_fence_behavior(FenceBehavior::Never);

    let mut layers = fyusenet_base::CompiledLayers::new();
    let builder = LayerBuilder::new("never_fences", 0, ComputeDevice::Gpu, LayerKind::DownloadLayer);
    layers
        .insert(Box::new(NeverFencingLayer { common: LayerCommon::new(&builder), context: ctx.clone() }))
        .unwrap();

    let mut config = EngineConfig::default();
    config.finish_timeout = Duration::from_millis(200);
    config.finish_poll_interval = Duration::from_millis(5);

    let engine = Engine::new(ctx.clone(), config, true, Callbacks::default());
    engine.setup(layers).unwrap();

    // `forward` only enqueues the initial ExecutionState for the looper in async mode and
    // returns `Deferred`; the looper dispatches the never-fencing layer in the background, where
    // the stuck transfer shows up as outstanding work for `finish()` below to wait on.
    assert_eq!(engine.forward(None).unwrap(), ExecState::Deferred);

    let result = engine.finish();
    assert!(matches!(result, Err(FyuseNetError::FinishTimeout)));
    assert_eq!(ctx.live_texture_count(), 0, "mock context never allocated a texture, so none should leak");
}
