//! The execution engine: walks the compiled layer set in layer-number order for each admitted
//! sequence, dispatching transfer layers through the async contract when the engine runs in
//! async mode and falling back to their synchronous `forward` otherwise.
//!
//! Grounded on `fyusenet/base/engine.h`. The original's `readyStates_` list plus its four
//! dependency lists and two waiter lists are collapsed here into [`crate::async_state::AsyncState`]
//! plus a `crossbeam_channel` of [`Completion`] events that the looper drains; see DESIGN.md for
//! why. The original's five-mutex hierarchy (`run_guard` > `sequence_lock` > `upload_issue_lock`
//! > `async_state_lock` > `looper_lock`) is narrowed to four primitives here since the
//! `layers` mutex's critical section already gives upload dispatch the exclusion
//! `upload_issue_lock` existed for.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, ReentrantMutex};

use fyusenet_base::{AsyncState as AsyncOutcome, CompiledLayers, StateToken};
use fyusenet_common::error::{FyuseNetError, Result};
use fyusenet_common::{EngineConfig, PerformanceTracker};
use fyusenet_gpu::GpuContext;

use crate::async_state::AsyncState;
use crate::dependency::{ExecState, ExecutionState};

/// Final disposition of an admitted sequence, reported to [`Callbacks::sequence_done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    Done,
    Stopped,
    Failed,
}

/// The four time-critical, non-blocking callbacks an embedder may install. Each one is invoked
/// from whichever thread happened to finish the triggering work (the calling thread for a
/// wholly-synchronous run, the looper thread for anything resumed after a parked dependency), so
/// implementations must not block or re-enter the engine.
#[derive(Default)]
pub struct Callbacks {
    pub on_new_sequence: Option<Box<dyn Fn(u64) + Send + Sync>>,
    pub on_sequence_done: Option<Box<dyn Fn(u64, SequenceOutcome) + Send + Sync>>,
    pub on_download_ready: Option<Box<dyn Fn(u64, i32) + Send + Sync>>,
    pub on_upload_ready: Option<Box<dyn Fn(u64, i32) + Send + Sync>>,
}

enum Completion {
    TransferLanded { producer: i32, sequence_no: u64, outcome: AsyncOutcome },
    Resume(ExecutionState),
    Quit,
}

struct Shared<C: GpuContext> {
    context: Arc<C>,
    config: EngineConfig,
    async_mode: bool,
    layers: Mutex<CompiledLayers>,
    async_state: ReentrantMutex<RefCell<AsyncState>>,
    next_sequence: AtomicU64,
    admission: Mutex<u64>,
    admission_cond: Condvar,
    quit: AtomicBool,
    performance: PerformanceTracker,
    callbacks: Callbacks,
    completion_tx: Sender<Completion>,
    /// Lets a method holding only `&self` spawn a fence-wait task that needs an owned,
    /// 'static handle back onto this same `Shared`.
    self_weak: Weak<Shared<C>>,
}

/// The network execution engine. Generic over the GPU backend so tests can run it against
/// [`fyusenet_gpu::context::mock::MockGpuContext`] without a real graphics context.
pub struct Engine<C: GpuContext + 'static> {
    shared: Arc<Shared<C>>,
    /// Guards the synchronous path: only one wholly-synchronous `forward` call runs at a time.
    /// Unused in async mode, where concurrent sequences are expected up to `sequence_lookahead`.
    run_guard: Mutex<()>,
    looper: Mutex<Option<JoinHandle<()>>>,
}

impl<C: GpuContext + 'static> Engine<C> {
    pub fn new(context: Arc<C>, config: EngineConfig, async_mode: bool, callbacks: Callbacks) -> Self {
        let (tx, rx) = unbounded();
        let shared = Arc::new_cyclic(|weak| Shared {
            context,
            config,
            async_mode,
            layers: Mutex::new(CompiledLayers::new()),
            async_state: ReentrantMutex::new(RefCell::new(AsyncState::new())),
            next_sequence: AtomicU64::new(1),
            admission: Mutex::new(0),
            admission_cond: Condvar::new(),
            quit: AtomicBool::new(false),
            performance: PerformanceTracker::new(),
            callbacks,
            completion_tx: tx,
            self_weak: weak.clone(),
        });
        shared.performance.set_enabled(shared.config.timings_enabled);

        let looper = if async_mode {
            let worker = Arc::clone(&shared);
            Some(std::thread::Builder::new()
                .name("fyusenet-looper".into())
                .spawn(move || looper_main(worker, rx))
                .expect("failed to spawn the engine's looper thread"))
        } else {
            None
        };

        Self {
            shared,
            run_guard: Mutex::new(()),
            looper: Mutex::new(looper),
        }
    }

    /// Run the compiled layer set's `setup` (one-time GPU/CPU initialization, in layer-number
    /// order) and install it as the layer set this engine dispatches.
    pub fn setup(&self, mut layers: CompiledLayers) -> Result<()> {
        for (_, layer) in layers.iter_mut() {
            layer.setup()?;
        }
        *self.shared.layers.lock() = layers;
        Ok(())
    }

    pub fn performance(&self) -> &PerformanceTracker {
        &self.shared.performance
    }

    pub fn context(&self) -> &Arc<C> {
        &self.shared.context
    }

    /// Admit a new sequence and run it until it finishes, parks on an async dependency, or the
    /// engine is stopped. Blocks the caller while `sequence_lookahead` sequences are already in
    /// flight.
    pub fn forward(&self, state_token: Option<StateToken>) -> Result<ExecState> {
        if self.shared.quit.load(Ordering::Acquire) {
            return Ok(ExecState::Stopped);
        }
        {
            let mut in_flight = self.shared.admission.lock();
            while *in_flight >= self.shared.config.sequence_lookahead {
                self.shared.admission_cond.wait(&mut in_flight);
            }
            *in_flight += 1;
        }
        let sequence_no = self.shared.next_sequence.fetch_add(1, Ordering::SeqCst);
        if let Some(cb) = &self.shared.callbacks.on_new_sequence {
            cb(sequence_no);
        }

        let start_layer = self.shared.layers.lock().min_number().unwrap_or(0);
        let state = ExecutionState::new(sequence_no, start_layer, state_token);

        if self.shared.async_mode {
            // The caller's thread never touches the GPU after setup: it only constructs the
            // initial ExecutionState and hands it to the looper, which owns every layer dispatch
            // (including this sequence's first segment) from here on.
            let _ = self.shared.completion_tx.send(Completion::Resume(state));
            Ok(ExecState::Deferred)
        } else {
            let _run_guard = self.run_guard.lock();
            self.shared.execute(state)
        }
    }

    /// Block until every admitted sequence has retired (or `config.finish_timeout` elapses).
    pub fn finish(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            let quiescent = {
                let in_flight = *self.shared.admission.lock();
                let outstanding = self.shared.async_state.lock().borrow().outstanding();
                in_flight == 0 && outstanding == 0
            };
            if quiescent {
                return Ok(());
            }
            if start.elapsed() >= self.shared.config.finish_timeout {
                return Err(FyuseNetError::FinishTimeout);
            }
            std::thread::sleep(self.shared.config.finish_poll_interval);
        }
    }

    /// Cooperatively stop the engine: in-flight runs observe the quit flag at their next layer
    /// boundary and return `ExecState::Stopped` instead of continuing.
    pub fn stop(&self) {
        self.shared.quit.store(true, Ordering::Release);
        self.shared.admission_cond.notify_all();
        let _ = self.shared.completion_tx.send(Completion::Quit);
        if let Some(handle) = self.looper.lock().take() {
            let _ = handle.join();
        }
    }

    /// Release every layer's GPU resources. The context used to build them must be current on
    /// the calling thread; call only after `stop`/`finish`.
    pub fn cleanup(&self) {
        debug_assert!(self.shared.context.is_current(), "GPU context must be current for cleanup");
        self.shared.layers.lock().cleanup();
    }
}

impl<C: GpuContext + 'static> Drop for Engine<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn looper_main<C: GpuContext + 'static>(shared: Arc<Shared<C>>, rx: Receiver<Completion>) {
    if let Err(err) = thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max) {
        log::info!("failed to raise the engine looper thread's priority: {err}");
    }
    while let Ok(msg) = rx.recv() {
        match msg {
            Completion::Quit => break,
            Completion::TransferLanded { producer, sequence_no, outcome } => {
                shared.handle_transfer_landed(producer, sequence_no, outcome);
            }
            Completion::Resume(state) => shared.resume(state),
        }
    }
}

impl<C: GpuContext + 'static> Shared<C> {
    fn retire(&self, sequence_no: u64, outcome: SequenceOutcome) {
        {
            let mut in_flight = self.admission.lock();
            *in_flight = in_flight.saturating_sub(1);
        }
        self.admission_cond.notify_one();
        if let Some(cb) = &self.callbacks.on_sequence_done {
            cb(sequence_no, outcome);
        }
    }

    fn resume(&self, state: ExecutionState) {
        let sequence_no = state.sequence_no;
        match self.execute(state) {
            Ok(_) => {}
            Err(err) => {
                log::error!("sequence {sequence_no} failed resuming at a parked layer: {err}");
                self.retire(sequence_no, SequenceOutcome::Failed);
            }
        }
    }

    fn handle_transfer_landed(&self, producer: i32, sequence_no: u64, outcome: AsyncOutcome) {
        if outcome == AsyncOutcome::Failed {
            log::error!("async transfer at layer {producer} failed for sequence {sequence_no}");
            self.async_state.lock().borrow_mut().resolve_transfer(producer, sequence_no);
            self.retire(sequence_no, SequenceOutcome::Failed);
            return;
        }
        let kind = self.layers.lock().get(producer).map(|l| l.kind());
        {
            let mut layers = self.layers.lock();
            if let Some(layer) = layers.get_mut(producer) {
                if let Some(async_layer) = layer.as_async_mut() {
                    async_layer.swap_output_textures(sequence_no);
                }
            }
        }
        match kind {
            Some(fyusenet_base::LayerKind::UploadLayer) => {
                if let Some(cb) = &self.callbacks.on_upload_ready {
                    cb(sequence_no, producer);
                }
            }
            Some(fyusenet_base::LayerKind::DownloadLayer) | Some(fyusenet_base::LayerKind::DeepDownloadLayer) => {
                if let Some(cb) = &self.callbacks.on_download_ready {
                    cb(sequence_no, producer);
                }
            }
            _ => {}
        }
        let released = self.async_state.lock().borrow_mut().resolve_transfer(producer, sequence_no);
        for state in released {
            self.resume(state);
        }
    }

    /// `consumer_number` just finished running for `sequence_no`: free any producer whose late
    /// dependency that satisfies. An upload producer goes through the fence/swap protocol before
    /// it is actually unlocked; anything else (a download producer has no textures of its own to
    /// guard) is unlocked right away.
    fn retry_freed_producers(&self, consumer_number: i32, sequence_no: u64) {
        let freed = self
            .async_state
            .lock()
            .borrow_mut()
            .notify_consumer_ran(consumer_number, sequence_no);
        for producer in freed {
            let is_upload = self.layers.lock().get(producer).map(|l| l.kind()) == Some(fyusenet_base::LayerKind::UploadLayer);
            if is_upload {
                if let Some(shared) = self.self_weak.upgrade() {
                    shared.fence_then_unlock(producer, sequence_no);
                }
            } else {
                self.unlock_and_retry(producer, sequence_no);
            }
        }
    }

    /// Release `producer`'s double-buffer lock and its busy slot for `sequence_no`, then, if a
    /// parked retry is waiting for it, hand that retry to the looper. Called either immediately
    /// (a download producer, or any producer with no last consumer to fence against) or once a
    /// pending fence has cleared (an upload producer).
    fn unlock_and_retry(&self, producer: i32, sequence_no: u64) {
        if let Some(layer) = self.layers.lock().get_mut(producer) {
            if let Some(async_layer) = layer.as_async_mut() {
                async_layer.unlock(sequence_no);
            }
        }
        self.async_state.lock().borrow_mut().free_producer(producer, sequence_no);
        let retry = self.async_state.lock().borrow_mut().take_retry_if_free(producer);
        if let Some(retry_state) = retry {
            let _ = self.completion_tx.send(Completion::Resume(retry_state));
        }
    }

    /// Fence/swap protocol for an upload producer's late-dependency resolution: issue a GPU
    /// fence at this point in the command stream, then spawn a background task that waits for
    /// it to clear before unlocking `producer`. This guarantees `producer`'s previous output textures
    /// are never overwritten before the GPU has actually finished the last consumer's reads of
    /// them. A fence that never clears leaves the producer locked (and therefore never
    /// redispatched) rather than risk a still-being-read texture being overwritten.
    fn fence_then_unlock(self: Arc<Self>, producer: i32, sequence_no: u64) {
        let fence = self.context.issue_fence();
        let timeout = self.config.fence_timeout;
        std::thread::spawn(move || match self.context.wait_client_sync(fence, timeout) {
            Ok(()) => self.unlock_and_retry(producer, sequence_no),
            Err(_) => log::error!(
                "{}: producer layer {producer} stays locked, sequence {sequence_no} never released it",
                FyuseNetError::PipelineTimeout
            ),
        });
    }

    /// Walk the compiled layer set from `state.current_layer` onward, dispatching each layer
    /// synchronously or (in async mode, for an async-capable transfer layer) through
    /// [`fyusenet_base::AsyncLayer::async_forward`]. Returns once the sequence finishes, parks
    /// on an unresolved dependency, or the engine is asked to stop.
    fn execute(&self, mut state: ExecutionState) -> Result<ExecState> {
        loop {
            if self.quit.load(Ordering::Acquire) {
                return Ok(ExecState::Stopped);
            }

            let mut layers = self.layers.lock();
            let Some((number, layer)) = layers.from_mut(state.current_layer).next() else {
                drop(layers);
                self.retire(state.sequence_no, SequenceOutcome::Done);
                return Ok(ExecState::Done);
            };

            // Check the async gate before the mask: a masked layer that also happens to be the
            // first consumer gating a transfer must still make the walk wait for that transfer
            // to land, even though it will be skipped once unblocked. Checking the mask first
            // would let a later consumer race ahead of data that hasn't landed yet.
            if self.async_state.lock().borrow().is_blocked(number, state.sequence_no) {
                drop(layers);
                self.async_state.lock().borrow_mut().park(number, state);
                return Ok(ExecState::Deferred);
            }

            if state.state_token.as_ref().is_some_and(|t| t.masks(number)) {
                state.current_layer = number + 1;
                continue;
            }

            let is_async_dispatch = self.async_mode
                && layer
                    .as_async_mut()
                    .map(|a| a.is_async())
                    .unwrap_or(false);

            if is_async_dispatch {
                if self.async_state.lock().borrow().producer_busy(number) {
                    drop(layers);
                    self.async_state.lock().borrow_mut().push_retry(number, state);
                    return Ok(ExecState::Deferred);
                }
                let async_layer = layer.as_async_mut().expect("checked above");
                let first_consumer = async_layer.first_consumer();
                let last_consumer = async_layer.last_consumer();
                let tx = self.completion_tx.clone();
                let dispatched = async_layer.async_forward(
                    state.sequence_no,
                    state.state_token.as_ref(),
                    Box::new(move |sequence_no, outcome| {
                        let _ = tx.send(Completion::TransferLanded {
                            producer: number,
                            sequence_no,
                            outcome,
                        });
                    }),
                )?;
                if !dispatched {
                    drop(layers);
                    self.async_state.lock().borrow_mut().push_retry(number, state);
                    return Ok(ExecState::Deferred);
                }
                self.async_state
                    .lock()
                    .borrow_mut()
                    .register_dispatch(number, state.sequence_no, first_consumer, last_consumer);
                drop(layers);
                self.retry_freed_producers(number, state.sequence_no);
                state.current_layer = number + 1;
                continue;
            }

            let sequence_no = state.sequence_no;
            let token = state.state_token.clone();
            let result = self
                .performance
                .time_layer(number, || layer.forward(sequence_no, token.as_ref()));
            result?;
            if self.config.intermediate_output_enabled {
                let _ = layer.write_result(&format!("layer_{number:04}_seq_{sequence_no}.bin"), true);
            }
            drop(layers);

            self.retry_freed_producers(number, sequence_no);
            state.current_layer = number + 1;
        }
    }
}
