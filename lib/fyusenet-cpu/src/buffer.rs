//! Host-memory tensor storage, grounded on `cpubuffer.h`'s `CPUBuffer`: owns a byte vector sized
//! by its shape, exposes mutually-exclusive mapped access, and converts between the data orders
//! a GPU upload/download layer round-trips through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use fyusenet_base::{BufferShape, DType, DataOrder};
use fyusenet_common::error::{FyuseNetError, Result};

use crate::layout::{channelwise_index, deep_index, element_count, shallow_index};

/// A heap-allocated tensor buffer. Mutual exclusion between readers/writers is enforced by
/// [`CpuBuffer::map`]/[`CpuBuffer::unmap`] rather than by Rust's borrow checker, since the
/// buffer is typically shared between the engine's calling thread and a background transfer
/// thread via `Arc`.
pub struct CpuBuffer {
    shape: BufferShape,
    data: Mutex<Vec<u8>>,
    sequence: AtomicU64,
}

/// An exclusive, typed view into a mapped [`CpuBuffer`]. Dropping it releases the mapping; an
/// explicit call to [`MappedBuffer::unmap`] releases it earlier.
pub struct MappedBuffer<'a, T> {
    guard: Option<parking_lot::MutexGuard<'a, Vec<u8>>>,
    _marker: std::marker::PhantomData<T>,
}

impl<'a, T: Copy> MappedBuffer<'a, T> {
    pub fn as_slice(&self) -> &[T] {
        let bytes = self.guard.as_ref().expect("mapping released");
        let len = bytes.len() / std::mem::size_of::<T>();
        // SAFETY: buffer was sized by `element_count`/`shape.bytes()` in units of this element
        // type when allocated; len is derived from the same byte length.
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const T, len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let bytes = self.guard.as_mut().expect("mapping released");
        let len = bytes.len() / std::mem::size_of::<T>();
        unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut T, len) }
    }

    /// Explicitly release the mapping. Equivalent to dropping, spelled out because the original
    /// contract names `unmap` as a distinct step.
    pub fn unmap(mut self) {
        self.guard.take();
    }
}

impl CpuBuffer {
    pub fn new(shape: BufferShape) -> Self {
        let bytes = shape.bytes();
        Self {
            shape,
            data: Mutex::new(vec![0u8; bytes]),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn shape(&self) -> &BufferShape {
        &self.shape
    }

    pub fn bytes(&self) -> usize {
        self.shape.bytes()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn associate_to(&self, sequence_no: u64) {
        self.sequence.store(sequence_no, Ordering::Release);
    }

    /// Acquire exclusive typed access. If `wait` is `false` and another mapping is live,
    /// returns `InvalidArgument` immediately rather than blocking (the original's
    /// `try_lock`-then-fail behavior); if `wait` is `true`, blocks until available.
    pub fn map<T: Copy>(&self, wait: bool) -> Result<MappedBuffer<'_, T>> {
        let guard = if wait {
            self.data.lock()
        } else {
            self.data
                .try_lock()
                .ok_or_else(|| FyuseNetError::InvalidArgument("buffer is already mapped".into()))?
        };
        Ok(MappedBuffer {
            guard: Some(guard),
            _marker: std::marker::PhantomData,
        })
    }

    /// Map, run `func`, then release. Convenience wrapper around `map`/`unmap`.
    pub fn with<T: Copy, R>(&self, wait: bool, func: impl FnOnce(&mut MappedBuffer<'_, T>) -> R) -> Result<R> {
        let mut mapped = self.map(wait)?;
        Ok(func(&mut mapped))
    }

    /// Fill the whole buffer with repetitions of `value`. Fails if the buffer holds zero bytes.
    pub fn fill<T: Copy>(&self, value: T) -> Result<()> {
        if self.shape.bytes() == 0 {
            return Err(FyuseNetError::InvalidArgument("cannot fill a zero-sized buffer".into()));
        }
        self.with::<T, ()>(true, |mapped| {
            let slice = mapped.as_mut_slice();
            slice.fill(value);
        })
    }

    /// Raw byte copy into `dest`. Fails if the byte sizes differ.
    pub fn copy_to(&self, dest: &CpuBuffer) -> Result<()> {
        let src = self.data.lock();
        let mut dst = dest.data.lock();
        if src.len() != dst.len() {
            return Err(FyuseNetError::InvalidArgument(format!(
                "copy_to size mismatch: {} vs {} bytes",
                src.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(&src);
        dest.sequence.store(self.sequence(), Ordering::Release);
        Ok(())
    }

    /// Dump raw bytes in channel-major order to `path`, converting first if this buffer is not
    /// already `Channelwise`. No padding is included in the dump.
    pub fn write_to_file(&self, path: &std::path::Path) -> Result<()> {
        let channel_major = if self.shape.order() == DataOrder::Channelwise {
            None
        } else {
            Some(self.to_channel_wise()?)
        };
        let source = channel_major.as_ref().unwrap_or(self);
        let guard = source.data.lock();
        let padding = source.shape.padding();
        if padding == 0 {
            std::fs::write(path, &*guard)
                .map_err(|e| FyuseNetError::InvalidArgument(format!("write_to_file failed: {e}")))?;
        } else {
            let unpadded = strip_channelwise_padding(&guard, &source.shape);
            std::fs::write(path, unpadded)
                .map_err(|e| FyuseNetError::InvalidArgument(format!("write_to_file failed: {e}")))?;
        }
        Ok(())
    }

    pub fn to_channel_wise(&self) -> Result<CpuBuffer> {
        self.reorder_to(DataOrder::Channelwise)
    }

    pub fn to_gpu_shallow(&self) -> Result<CpuBuffer> {
        self.reorder_to(DataOrder::ShallowGpu)
    }

    pub fn to_gpu_deep(&self) -> Result<CpuBuffer> {
        self.reorder_to(DataOrder::DeepGpu)
    }

    fn reorder_to(&self, target: DataOrder) -> Result<CpuBuffer> {
        if self.shape.order() == target {
            let out = CpuBuffer::new(self.shape);
            self.copy_to(&out)?;
            return Ok(out);
        }
        let new_shape = self.shape.as_order(target)?;
        let out = CpuBuffer::new(new_shape);
        reorder_bytes(self, &out, self.shape.dtype())?;
        out.associate_to(self.sequence());
        Ok(out)
    }
}

/// Element-type-dispatching byte reshuffle between `src`'s native order and `dst`'s native
/// order (they must agree on width/height/channels/padding/dtype, differing only in order).
fn reorder_bytes(src: &CpuBuffer, dst: &CpuBuffer, dtype: DType) -> Result<()> {
    match dtype {
        DType::Float32 => reorder_typed::<f32>(src, dst),
        DType::Int32 | DType::Uint32 => reorder_typed::<u32>(src, dst),
        DType::Float16 | DType::Int16 | DType::Uint16 => reorder_typed::<u16>(src, dst),
        DType::Int8 | DType::Uint8 => reorder_typed::<u8>(src, dst),
    }
}

fn reorder_typed<T: Copy + Default>(src: &CpuBuffer, dst: &CpuBuffer) -> Result<()> {
    let src_guard = src.data.lock();
    let mut dst_guard = dst.data.lock();
    let src_elems = as_typed_slice::<T>(&src_guard);
    let dst_elems = as_typed_mut_slice::<T>(&mut dst_guard);

    let (height, width, channels, padding) = (
        src.shape.height(),
        src.shape.width(),
        src.shape.channels(),
        src.shape.padding(),
    );

    for c in 0..channels {
        for y in 0..height + 2 * padding {
            for x in 0..width + 2 * padding {
                let src_idx = order_index(src.shape.order(), c, y, x, channels, height, width, padding);
                let dst_idx = order_index(dst.shape.order(), c, y, x, channels, height, width, padding);
                if src_idx < src_elems.len() && dst_idx < dst_elems.len() {
                    dst_elems[dst_idx] = src_elems[src_idx];
                }
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn order_index(
    order: DataOrder,
    c: u32,
    y: u32,
    x: u32,
    channels: u32,
    height: u32,
    width: u32,
    padding: u32,
) -> usize {
    match order {
        DataOrder::Channelwise => channelwise_index(c, y, x, height, width, padding),
        DataOrder::ShallowGpu => shallow_index(c, y, x, height, width, padding),
        DataOrder::DeepGpu => {
            // Deep order is indexed by unpadded (y, x); the padded border positions from the
            // channelwise/shallow iteration space fall outside 0..height/0..width and are
            // skipped by the bounds check in the caller.
            if y < padding || x < padding || y >= padding + height || x >= padding + width {
                usize::MAX
            } else {
                deep_index(c, y - padding, x - padding, channels, height, width, padding)
            }
        }
        DataOrder::Sequence => element_count(order, channels, width, height, padding),
    }
}

fn as_typed_slice<T>(bytes: &[u8]) -> &[T] {
    let len = bytes.len() / std::mem::size_of::<T>();
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const T, len) }
}

fn as_typed_mut_slice<T>(bytes: &mut [u8]) -> &mut [T] {
    let len = bytes.len() / std::mem::size_of::<T>();
    unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut T, len) }
}

fn strip_channelwise_padding(bytes: &[u8], shape: &BufferShape) -> Vec<u8> {
    let elem = shape.dtype().size();
    let padding = shape.padding() as usize;
    let width = shape.width() as usize;
    let height = shape.height() as usize;
    let padded_w = width + 2 * padding;
    let mut out = Vec::with_capacity(shape.channels() as usize * height * width * elem);
    for c in 0..shape.channels() as usize {
        for y in 0..height {
            let row_start = ((c * (height + 2 * padding) + (y + padding)) * padded_w + padding) * elem;
            out.extend_from_slice(&bytes[row_start..row_start + width * elem]);
        }
    }
    out
}

/// Wrap a raw byte vector (e.g. coming from a file load) as a buffer of `shape`, taking
/// ownership instead of copying.
pub fn buffer_from_raw(shape: BufferShape, bytes: Vec<u8>) -> Arc<CpuBuffer> {
    Arc::new(CpuBuffer {
        shape,
        data: Mutex::new(bytes),
        sequence: AtomicU64::new(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fyusenet_base::DType;

    #[test]
    fn fill_then_map_reads_back_value() {
        let shape = BufferShape::new(2, 2, 1, 0, DType::Float32, DataOrder::Channelwise);
        let buf = CpuBuffer::new(shape);
        buf.fill(3.5f32).unwrap();
        let mapped = buf.map::<f32>(false).unwrap();
        assert!(mapped.as_slice().iter().all(|&v| v == 3.5));
    }

    #[test]
    fn second_non_blocking_map_fails_while_first_is_live() {
        let shape = BufferShape::new(2, 2, 1, 0, DType::Float32, DataOrder::Channelwise);
        let buf = CpuBuffer::new(shape);
        let _first = buf.map::<f32>(false).unwrap();
        let second = buf.map::<f32>(false);
        assert!(second.is_err());
    }

    #[test]
    fn unmap_releases_the_lock_for_a_later_map() {
        let shape = BufferShape::new(2, 2, 1, 0, DType::Float32, DataOrder::Channelwise);
        let buf = CpuBuffer::new(shape);
        let first = buf.map::<f32>(false).unwrap();
        first.unmap();
        assert!(buf.map::<f32>(false).is_ok());
    }

    #[test]
    fn channelwise_to_shallow_to_channelwise_is_identity_at_zero_padding() {
        let shape = BufferShape::new(4, 4, 5, 0, DType::Float32, DataOrder::Channelwise);
        let buf = CpuBuffer::new(shape);
        {
            let mut mapped = buf.map::<f32>(true).unwrap();
            for (i, v) in mapped.as_mut_slice().iter_mut().enumerate() {
                *v = i as f32;
            }
        }
        let shallow = buf.to_gpu_shallow().unwrap();
        let back = shallow.to_channel_wise().unwrap();
        let orig = buf.map::<f32>(true).unwrap();
        let round = back.map::<f32>(true).unwrap();
        assert_eq!(orig.as_slice(), round.as_slice());
    }

    #[test]
    fn channelwise_to_deep_to_channelwise_is_identity_at_zero_padding() {
        let shape = BufferShape::new(4, 4, 6, 0, DType::Float32, DataOrder::Channelwise);
        let buf = CpuBuffer::new(shape);
        {
            let mut mapped = buf.map::<f32>(true).unwrap();
            for (i, v) in mapped.as_mut_slice().iter_mut().enumerate() {
                *v = i as f32;
            }
        }
        let deep = buf.to_gpu_deep().unwrap();
        let back = deep.to_channel_wise().unwrap();
        let orig = buf.map::<f32>(true).unwrap();
        let round = back.map::<f32>(true).unwrap();
        assert_eq!(orig.as_slice(), round.as_slice());
    }

    #[test]
    fn sequence_stamp_is_observable() {
        let shape = BufferShape::new(2, 2, 1, 0, DType::Float32, DataOrder::Channelwise);
        let buf = CpuBuffer::new(shape);
        buf.associate_to(42);
        assert_eq!(buf.sequence(), 42);
    }
}
