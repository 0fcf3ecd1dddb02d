//! GPU texture pooling and the buffer manager that sits between the compiled layer set and the
//! execution engine. The async upload/download layer contract itself lives in `fyusenet_base`
//! (see `fyusenet_base::AsyncLayer`) since `Layer::as_async_mut` needs to name it without this
//! crate depending back on `fyusenet-base` in the wrong direction.

pub mod context;
pub mod manager;
pub mod texture;

pub use context::{FenceHandle, GpuContext, TextureDescriptor, TextureHandle};
pub use fyusenet_base::{AsyncCallback, AsyncLayer, AsyncState, ConsumerRecord};
pub use manager::BufferManager;
pub use texture::GpuTextureSet;
