//! Parameter provider interface: the abstract byte-blob source layers load weights from.
//!
//! Replaces the original's manually-refcounted `DataWrapper`/`DataBlob` pair with `Arc`, and its
//! `DataBlobMapper` with a lexically-scoped closure — both per the design notes' guidance on
//! mapping manual reference counting onto the target language's shared-ownership primitive.

use std::sync::Arc;

/// Declared element type of a parameter blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ParamType {
    #[default]
    Default,
    Float32,
    Float16,
    Int8,
    Uint8,
}

/// A reference-counted, immutable byte blob handed out by a `ParameterProvider`.
///
/// Cloning is cheap (it clones the underlying `Arc`); the blob's bytes stay alive as long as
/// any clone does, which is the whole point of the reference-counted design in the original.
#[derive(Debug, Clone)]
pub struct DataBlob {
    bytes: Option<Arc<[u8]>>,
    param_type: ParamType,
}

impl DataBlob {
    pub fn new(bytes: Arc<[u8]>, param_type: ParamType) -> Self {
        Self {
            bytes: Some(bytes),
            param_type,
        }
    }

    pub fn empty() -> Self {
        Self {
            bytes: None,
            param_type: ParamType::Default,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_none()
    }

    pub fn param_type(&self) -> ParamType {
        self.param_type
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    /// Reinterpret the blob's bytes as `&[T]` and hand them to `func`, lexically scoping the
    /// borrow to the call. Replaces the original's `DataBlobMapper`, which achieved the same
    /// scoping via a temporary holding a ref-counted handle.
    pub fn map<T, R>(&self, func: impl FnOnce(Option<&[T]>) -> R) -> R
    where
        T: Copy,
    {
        let typed = self.bytes.as_ref().map(|bytes| {
            let ptr = bytes.as_ptr() as *const T;
            let len = bytes.len() / std::mem::size_of::<T>();
            // SAFETY: `bytes` is immutable, outlives this call, and len was computed from its
            // own byte length divided by `size_of::<T>()`, so the slice stays in bounds.
            unsafe { std::slice::from_raw_parts(ptr, len) }
        });
        func(typed)
    }
}

/// Abstract source of layer parameters (weights, biases, ...), agnostic of whether the
/// underlying storage is a file, memory, or a network call.
pub trait ParameterProvider: Send + Sync {
    fn get(&self, name: &str, layer_no: i32, sub_index: i32) -> DataBlob;

    fn data_type(&self, _name: &str, _layer_no: i32, _sub_index: i32) -> ParamType {
        ParamType::Default
    }

    fn has(&self, name: &str, layer_no: i32, sub_index: i32) -> bool {
        !self.get(name, layer_no, sub_index).is_empty()
    }
}
