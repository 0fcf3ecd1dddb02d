//! The compiled layer set: the central storage point for a network's layers, indexed both by
//! layer number (the execution order) and by name (best-effort, see `by_name`).
//!
//! The original stores layers in a `shared_ptr<vector<LayerBase*>>` sized to the highest layer
//! number, with a weak-pointer iterator that skips `nullptr` gaps. A `BTreeMap<i32, _>` gives
//! the same "sparse, ascending, gap-skipping" iteration for free without the resize/weak-pointer
//! dance, so that is what this uses; the externally observable behavior (ascending, gapless
//! iteration; unique non-negative keys) is unchanged.

use std::collections::{BTreeMap, HashMap};

use fyusenet_common::error::{FyuseNetError, Result};

use crate::layer::Layer;

/// Sparse, ordered collection of a network's layers.
///
/// `CompiledLayers` owns its layers; dropping it drops them. Callers are responsible for
/// calling [`CompiledLayers::cleanup`] before a `CompiledLayers` holding GPU layers is dropped,
/// exactly as the original requires for `LayerBase::cleanup` (see module docs on `Layer`).
#[derive(Default)]
pub struct CompiledLayers {
    layers: BTreeMap<i32, Box<dyn Layer>>,
    by_name: HashMap<String, i32>,
}

impl CompiledLayers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `layer` keyed by its own layer number. Fails if a layer is already registered at
    /// that number, or if the number is negative.
    pub fn insert(&mut self, layer: Box<dyn Layer>) -> Result<()> {
        let number = layer.number();
        if number < 0 {
            return Err(FyuseNetError::InvalidArgument(format!(
                "layer '{}' has an invalid (negative) layer number {number}",
                layer.name()
            )));
        }
        if self.layers.contains_key(&number) {
            return Err(FyuseNetError::InvalidArgument(format!(
                "a layer already exists at index {number}"
            )));
        }
        // Last-insertion-wins by design: the compiler is expected to insert layers in ascending
        // layer-number order, so "last inserted" and "highest-numbered" coincide. Name
        // uniqueness is not enforced (see by_name docs).
        self.by_name.insert(layer.name().to_string(), number);
        self.layers.insert(number, layer);
        Ok(())
    }

    pub fn get(&self, number: i32) -> Option<&dyn Layer> {
        self.layers.get(&number).map(|b| b.as_ref())
    }

    pub fn get_mut(&mut self, number: i32) -> Option<&mut (dyn Layer + 'static)> {
        self.layers.get_mut(&number).map(|b| b.as_mut())
    }

    /// Look up a layer by name.
    ///
    /// FyuseNet does not require unique layer names: the primary key is the layer number. If
    /// two layers share a name, this returns whichever was inserted last (which, given layers
    /// are compiled in ascending layer-number order, is the highest-numbered of the two).
    pub fn by_name(&self, name: &str) -> Option<&dyn Layer> {
        let number = *self.by_name.get(name)?;
        self.get(number)
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut (dyn Layer + 'static)> {
        let number = *self.by_name.get(name)?;
        self.get_mut(number)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn min_number(&self) -> Option<i32> {
        self.layers.keys().next().copied()
    }

    pub fn max_number(&self) -> Option<i32> {
        self.layers.keys().next_back().copied()
    }

    /// Iterate layers in strictly ascending layer-number order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (i32, &dyn Layer)> {
        self.layers.iter().map(|(&n, l)| (n, l.as_ref()))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (i32, &mut (dyn Layer + 'static))> {
        self.layers.iter_mut().map(|(&n, l)| (n, l.as_mut()))
    }

    /// Iterate layers with number `>= start`, ascending. Used by the execution engine to resume
    /// a parked run from its last position without re-walking already-executed layers.
    pub fn from(&self, start: i32) -> impl DoubleEndedIterator<Item = (i32, &dyn Layer)> {
        self.layers.range(start..).map(|(&n, l)| (n, l.as_ref()))
    }

    pub fn from_mut(&mut self, start: i32) -> impl Iterator<Item = (i32, &mut (dyn Layer + 'static))> {
        self.layers.range_mut(start..).map(|(&n, l)| (n, l.as_mut()))
    }

    /// Run every layer's `cleanup`, freeing any GPU resources it holds. The GPU context used
    /// to create these layers must be current on the calling thread.
    pub fn cleanup(&mut self) {
        for (_, layer) in self.layers.iter_mut() {
            layer.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{ComputeDevice, LayerBuilder, LayerCommon, LayerKind};
    use crate::spec::BufferSpec;
    use crate::state::StateToken;

    struct StubLayer {
        common: LayerCommon,
    }

    impl StubLayer {
        fn new(name: &str, number: i32) -> Self {
            let builder = LayerBuilder::new(name, number, ComputeDevice::Cpu, LayerKind::CpuLayer);
            Self {
                common: LayerCommon::new(&builder),
            }
        }
    }

    impl Layer for StubLayer {
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
            Ok(())
        }
    }

    #[test]
    fn insert_rejects_duplicate_number() {
        let mut layers = CompiledLayers::new();
        layers.insert(Box::new(StubLayer::new("a", 0))).unwrap();
        let err = layers.insert(Box::new(StubLayer::new("b", 0))).unwrap_err();
        assert!(matches!(err, FyuseNetError::InvalidArgument(_)));
    }

    #[test]
    fn iteration_is_ascending_and_skips_gaps() {
        let mut layers = CompiledLayers::new();
        layers.insert(Box::new(StubLayer::new("a", 5))).unwrap();
        layers.insert(Box::new(StubLayer::new("b", 1))).unwrap();
        layers.insert(Box::new(StubLayer::new("c", 3))).unwrap();
        let numbers: Vec<i32> = layers.iter().map(|(n, _)| n).collect();
        assert_eq!(numbers, vec![1, 3, 5]);
    }

    #[test]
    fn name_lookup_resolves_to_highest_numbered_on_collision() {
        let mut layers = CompiledLayers::new();
        layers.insert(Box::new(StubLayer::new("dup", 1))).unwrap();
        layers.insert(Box::new(StubLayer::new("dup", 7))).unwrap();
        assert_eq!(layers.by_name("dup").unwrap().number(), 7);
    }
}
