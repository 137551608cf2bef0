//! Memory blocks and the device memory manager.
//!
//! A compiled graph keeps its tensors in two blocks: an immutable block for
//! weights and constants, populated once and frozen, and a mutable block for
//! activations sized by the memory plan. Operations never see raw offsets;
//! they ask the `MemoryManager` to resolve their declared identifiers.

use crate::device::{Device, DeviceAllocation, DeviceSlice, DeviceSliceMut};
use crate::operation::OperationBase;
use crate::types::TensorId;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Default placement alignment, matching accelerator allocation granularity.
pub const DEFAULT_ALIGNMENT: usize = 256;

/// Byte range of one tensor inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorSlot {
    pub offset: usize,
    pub size: usize,
}

/// Memory-layout plan for one block: total size and identifier→slot table.
#[derive(Debug, Clone, Default)]
pub struct MemoryModel {
    size: usize,
    slots: HashMap<TensorId, TensorSlot>,
}

impl MemoryModel {
    /// Create a model from an externally computed layout.
    ///
    /// Every slot must lie within `size`.
    pub fn new(size: usize, slots: HashMap<TensorId, TensorSlot>) -> Result<Self> {
        for (id, slot) in &slots {
            if slot.offset.checked_add(slot.size).is_none_or(|end| end > size) {
                return Err(Error::MemoryResolution {
                    id: *id,
                    reason: format!(
                        "slot {}+{} lies outside a block of {size} bytes",
                        slot.offset, slot.size
                    ),
                });
            }
        }
        Ok(Self { size, slots })
    }

    /// Total block size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn slot(&self, id: TensorId) -> Option<TensorSlot> {
        self.slots.get(&id).copied()
    }

    pub fn contains(&self, id: TensorId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.slots.keys().copied()
    }
}

/// Sequential placement of tensors into a `MemoryModel`.
#[derive(Debug, Clone)]
pub struct MemoryModelBuilder {
    alignment: usize,
    end: usize,
    slots: HashMap<TensorId, TensorSlot>,
}

impl MemoryModelBuilder {
    pub fn new() -> Self {
        Self::with_alignment(DEFAULT_ALIGNMENT)
    }

    /// `alignment` must be a power of two.
    pub fn with_alignment(alignment: usize) -> Self {
        debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");
        Self {
            alignment,
            end: 0,
            slots: HashMap::new(),
        }
    }

    /// Place a tensor of `size` bytes after everything placed so far.
    pub fn add(&mut self, id: TensorId, size: usize) -> Result<TensorSlot> {
        if self.slots.contains_key(&id) {
            return Err(Error::MemoryResolution {
                id,
                reason: "tensor is placed twice in the same memory model".to_string(),
            });
        }
        let offset = align_up(self.end, self.alignment);
        let slot = TensorSlot { offset, size };
        self.end = offset + size;
        self.slots.insert(id, slot);
        Ok(slot)
    }

    pub fn build(self) -> MemoryModel {
        MemoryModel {
            size: align_up(self.end, self.alignment),
            slots: self.slots,
        }
    }
}

impl Default for MemoryModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Round `n` up to a multiple of `align` (a power of two).
pub fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Which region of device memory a block represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Immutable,
    Mutable,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKind::Immutable => f.write_str("immutable"),
            BlockKind::Mutable => f.write_str("mutable"),
        }
    }
}

/// One device allocation holding many tensors at fixed offsets.
#[derive(Debug)]
pub struct MemoryBlock {
    kind: BlockKind,
    model: MemoryModel,
    allocation: Arc<DeviceAllocation>,
}

impl MemoryBlock {
    /// Allocate a block sized by `model`.
    pub fn new(device: &Device, kind: BlockKind, model: MemoryModel) -> Result<Self> {
        let allocation = device.allocate(model.size(), &format!("{kind} tensors"))?;
        Ok(Self {
            kind,
            model,
            allocation,
        })
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub fn model(&self) -> &MemoryModel {
        &self.model
    }

    pub fn size(&self) -> usize {
        self.model.size()
    }

    pub fn contains(&self, id: TensorId) -> bool {
        self.model.contains(id)
    }

    /// Read-only view of tensor `id`, or `None` if the block does not hold it.
    pub fn tensor(&self, id: TensorId) -> Result<Option<DeviceSlice>> {
        self.model
            .slot(id)
            .map(|slot| self.allocation.slice(slot.offset, slot.size))
            .transpose()
    }

    /// Writable view of tensor `id`. Fails once the block is frozen.
    pub fn tensor_mut(&self, id: TensorId) -> Result<Option<DeviceSliceMut>> {
        self.model
            .slot(id)
            .map(|slot| self.allocation.slice_mut(slot.offset, slot.size))
            .transpose()
    }

    /// Copy host data into tensor `id`.
    pub fn load(&self, id: TensorId, data: &[u8]) -> Result<()> {
        let slice = self.tensor_mut(id)?.ok_or_else(|| Error::MemoryResolution {
            id,
            reason: format!("tensor is not placed in the {} block", self.kind),
        })?;
        if data.len() != slice.len() {
            return Err(Error::Device(format!(
                "tensor {id} holds {} bytes but {} were provided",
                slice.len(),
                data.len()
            )));
        }
        slice.write_bytes(data)
    }

    /// Make the block read-only.
    pub fn freeze(&self) {
        self.allocation.freeze();
    }

    pub fn is_frozen(&self) -> bool {
        self.allocation.is_frozen()
    }
}

/// Builds and freezes the immutable block from constant tensors.
#[derive(Debug, Default)]
pub struct ImmutableBlockBuilder {
    layout: MemoryModelBuilder,
    contents: Vec<(TensorId, Vec<u8>)>,
}

impl ImmutableBlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alignment(alignment: usize) -> Self {
        Self {
            layout: MemoryModelBuilder::with_alignment(alignment),
            contents: Vec::new(),
        }
    }

    pub fn add(&mut self, id: TensorId, data: Vec<u8>) -> Result<&mut Self> {
        self.layout.add(id, data.len())?;
        self.contents.push((id, data));
        Ok(self)
    }

    /// Allocate, populate and freeze the block.
    pub fn build(self, device: &Device) -> Result<Arc<MemoryBlock>> {
        let block = MemoryBlock::new(device, BlockKind::Immutable, self.layout.build())?;
        for (id, data) in &self.contents {
            block.load(*id, data)?;
        }
        block.freeze();
        tracing::debug!(
            tensors = self.contents.len(),
            bytes = block.size(),
            "immutable block populated"
        );
        Ok(Arc::new(block))
    }
}

/// Resolves tensor identifiers to device memory for one execution context.
///
/// The immutable block is shared with every other context of the same
/// compiled graph; the mutable block belongs to this manager alone. The
/// manager hands out addresses only. Ordering writes to the mutable block is
/// the execution sequencer's job.
#[derive(Debug)]
pub struct MemoryManager {
    immutable: Arc<MemoryBlock>,
    mutable: MemoryBlock,
}

impl MemoryManager {
    /// Create a manager around a shared immutable block and a freshly
    /// allocated mutable block laid out by `mutable_model`.
    ///
    /// Fails if any identifier is planned in both blocks.
    pub fn new(
        device: &Device,
        immutable: Arc<MemoryBlock>,
        mutable_model: MemoryModel,
    ) -> Result<Self> {
        if let Some(id) = mutable_model.ids().find(|&id| immutable.contains(id)) {
            return Err(Error::MemoryResolution {
                id,
                reason: "tensor is planned in both the immutable and mutable blocks".to_string(),
            });
        }
        if !immutable.is_frozen() {
            immutable.freeze();
        }
        let mutable = MemoryBlock::new(device, BlockKind::Mutable, mutable_model)?;
        Ok(Self { immutable, mutable })
    }

    pub fn immutable_block(&self) -> &Arc<MemoryBlock> {
        &self.immutable
    }

    pub fn mutable_block(&self) -> &MemoryBlock {
        &self.mutable
    }

    /// Which block holds `id`.
    pub fn locate(&self, id: TensorId) -> Result<BlockKind> {
        if self.immutable.contains(id) {
            Ok(BlockKind::Immutable)
        } else if self.mutable.contains(id) {
            Ok(BlockKind::Mutable)
        } else {
            Err(not_found(id))
        }
    }

    /// Resolve one input: immutable block first, then the mutable block.
    pub fn input_tensor(&self, id: TensorId) -> Result<DeviceSlice> {
        if let Some(slice) = self.immutable.tensor(id)? {
            return Ok(slice);
        }
        self.mutable.tensor(id)?.ok_or_else(|| not_found(id))
    }

    /// Resolve one output. Outputs only ever live in the mutable block.
    pub fn output_tensor(&self, id: TensorId) -> Result<DeviceSliceMut> {
        if let Some(slice) = self.mutable.tensor_mut(id)? {
            return Ok(slice);
        }
        if self.immutable.contains(id) {
            return Err(Error::MemoryResolution {
                id,
                reason: "outputs cannot be written into the immutable block".to_string(),
            });
        }
        Err(not_found(id))
    }

    /// Read-only views of an operation's inputs, in declaration order.
    pub fn input_tensors(&self, op: &OperationBase) -> Result<Vec<DeviceSlice>> {
        op.input_ids()
            .iter()
            .map(|&id| self.input_tensor(id))
            .collect()
    }

    /// Writable views of an operation's outputs, in declaration order.
    pub fn output_tensors(&self, op: &OperationBase) -> Result<Vec<DeviceSliceMut>> {
        op.output_ids()
            .iter()
            .map(|&id| self.output_tensor(id))
            .collect()
    }

    /// Check that every identifier of `op` resolves, without touching memory.
    pub fn validate(&self, op: &OperationBase) -> Result<()> {
        for &id in op.input_ids() {
            self.locate(id)?;
        }
        for &id in op.output_ids() {
            if self.locate(id)? == BlockKind::Immutable {
                return Err(Error::MemoryResolution {
                    id,
                    reason: format!(
                        "'{}' declares an output in the immutable block",
                        op.node_name()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Copy host data into a mutable tensor (graph inputs).
    pub fn write_tensor(&self, id: TensorId, data: &[u8]) -> Result<()> {
        let dst = self.output_tensor(id)?;
        if data.len() != dst.len() {
            return Err(Error::Device(format!(
                "tensor {id} holds {} bytes but {} were provided",
                dst.len(),
                data.len()
            )));
        }
        dst.write_bytes(data)
    }

    /// Copy a tensor back to the host.
    pub fn read_tensor(&self, id: TensorId) -> Result<Vec<u8>> {
        self.input_tensor(id)?.read_bytes()
    }
}

fn not_found(id: TensorId) -> Error {
    Error::MemoryResolution {
        id,
        reason: "tensor is in neither the immutable nor the mutable block".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        bytemuck::cast_slice(values).to_vec()
    }

    fn op(inputs: &[u32], outputs: &[u32]) -> OperationBase {
        OperationBase::from_parts(
            "node",
            "Test",
            "TestImpl",
            inputs.iter().map(|&i| TensorId(i)).collect(),
            outputs.iter().map(|&i| TensorId(i)).collect(),
        )
    }

    fn manager(device: &Device) -> MemoryManager {
        let mut constants = ImmutableBlockBuilder::new();
        constants.add(TensorId(0), f32_bytes(&[1.0, 2.0])).unwrap();

        let mut layout = MemoryModelBuilder::new();
        layout.add(TensorId(1), 8).unwrap();
        layout.add(TensorId(2), 8).unwrap();

        MemoryManager::new(device, constants.build(device).unwrap(), layout.build()).unwrap()
    }

    #[test]
    fn test_builder_aligns_slots() {
        let mut builder = MemoryModelBuilder::with_alignment(256);
        let a = builder.add(TensorId(0), 10).unwrap();
        let b = builder.add(TensorId(1), 300).unwrap();
        assert_eq!(a, TensorSlot { offset: 0, size: 10 });
        assert_eq!(b, TensorSlot { offset: 256, size: 300 });

        let model = builder.build();
        assert_eq!(model.size(), 768);
        assert_eq!(model.len(), 2);
    }

    #[test]
    fn test_builder_rejects_duplicates() {
        let mut builder = MemoryModelBuilder::new();
        builder.add(TensorId(3), 4).unwrap();
        assert!(matches!(
            builder.add(TensorId(3), 4),
            Err(Error::MemoryResolution { id: TensorId(3), .. })
        ));
    }

    #[test]
    fn test_model_rejects_out_of_range_slot() {
        let mut slots = HashMap::new();
        slots.insert(TensorId(0), TensorSlot { offset: 8, size: 16 });
        assert!(MemoryModel::new(16, slots).is_err());
    }

    #[test]
    fn test_inputs_probe_immutable_then_mutable() {
        let device = Device::default();
        let memory = manager(&device);

        let inputs = memory.input_tensors(&op(&[0, 1], &[2])).unwrap();
        assert_eq!(inputs[0].read::<f32>().unwrap(), vec![1.0, 2.0]);
        assert_eq!(inputs[1].len(), 8);
        assert_eq!(memory.locate(TensorId(0)).unwrap(), BlockKind::Immutable);
        assert_eq!(memory.locate(TensorId(1)).unwrap(), BlockKind::Mutable);
    }

    #[test]
    fn test_missing_input_is_resolution_error() {
        let device = Device::default();
        let memory = manager(&device);

        let err = memory.input_tensors(&op(&[0, 42], &[2])).unwrap_err();
        match err {
            Error::MemoryResolution { id, .. } => assert_eq!(id, TensorId(42)),
            other => panic!("expected memory resolution error, got {other:?}"),
        }
    }

    #[test]
    fn test_outputs_never_resolve_to_immutable_block() {
        let device = Device::default();
        let memory = manager(&device);

        assert!(matches!(
            memory.output_tensors(&op(&[1], &[0])),
            Err(Error::MemoryResolution { id: TensorId(0), .. })
        ));
        assert!(memory.validate(&op(&[1], &[0])).is_err());
        assert!(memory.validate(&op(&[0, 1], &[2])).is_ok());
    }

    #[test]
    fn test_immutable_block_is_frozen() {
        let device = Device::default();
        let memory = manager(&device);

        assert!(memory.immutable_block().is_frozen());
        assert!(memory.immutable_block().load(TensorId(0), &[0u8; 8]).is_err());
        assert!(memory.immutable_block().tensor_mut(TensorId(0)).is_err());
    }

    #[test]
    fn test_overlapping_plans_rejected() {
        let device = Device::default();
        let mut constants = ImmutableBlockBuilder::new();
        constants.add(TensorId(0), vec![0u8; 4]).unwrap();
        let immutable = constants.build(&device).unwrap();

        let mut layout = MemoryModelBuilder::new();
        layout.add(TensorId(0), 4).unwrap();

        let err = MemoryManager::new(&device, immutable, layout.build()).unwrap_err();
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn test_host_transfers() {
        let device = Device::default();
        let memory = manager(&device);

        memory.write_tensor(TensorId(1), &f32_bytes(&[5.0, 6.0])).unwrap();
        let back: Vec<f32> = bytemuck::pod_collect_to_vec(&memory.read_tensor(TensorId(1)).unwrap());
        assert_eq!(back, vec![5.0, 6.0]);

        assert!(memory.write_tensor(TensorId(1), &[0u8; 4]).is_err());
        assert!(memory.write_tensor(TensorId(0), &[0u8; 8]).is_err());
    }
}
