/*
 * Descriptor set allocation
 *
 * Sets are allocated from fixed capacity pools that are never freed
 * set by set. Each allocation tags its pool with the command buffer it
 * was made for, and a pool is reset as a whole once every command
 * buffer that tagged it has moved past its fence.
 */

use crate::backend::Backend;
use crate::cmdbuf::CmdBuffer;
use crate::{lock, DescriptorPoolStrategy, Result, TempestError};
use ash::vk;
use tp_utils::log;

use std::collections::HashMap;
use std::ops::{Index, IndexMut};
use std::sync::{Arc, Mutex};

/// The kinds of resource a descriptor can reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
    UniformBuffer,
    StorageBuffer,
    UniformBufferDynamic,
    StorageBufferDynamic,
    InputAttachment,
}

impl DescriptorKind {
    pub const COUNT: usize = 11;

    pub const ALL: [DescriptorKind; DescriptorKind::COUNT] = [
        DescriptorKind::Sampler,
        DescriptorKind::CombinedImageSampler,
        DescriptorKind::SampledImage,
        DescriptorKind::StorageImage,
        DescriptorKind::UniformTexelBuffer,
        DescriptorKind::StorageTexelBuffer,
        DescriptorKind::UniformBuffer,
        DescriptorKind::StorageBuffer,
        DescriptorKind::UniformBufferDynamic,
        DescriptorKind::StorageBufferDynamic,
        DescriptorKind::InputAttachment,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn vk_type(&self) -> vk::DescriptorType {
        match self {
            DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
            DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorKind::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            DescriptorKind::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorKind::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            DescriptorKind::StorageBufferDynamic => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
            DescriptorKind::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
        }
    }
}

/// One counter per descriptor kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DescriptorCounts([u32; DescriptorKind::COUNT]);

impl DescriptorCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same count for every kind
    pub fn splat(count: u32) -> Self {
        Self([count; DescriptorKind::COUNT])
    }

    /// Builder style helper for writing shapes out by hand
    pub fn with(mut self, kind: DescriptorKind, count: u32) -> Self {
        self[kind] = count;
        self
    }

    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }

    pub fn scaled(&self, factor: u32) -> Self {
        let mut ret = *self;
        for c in ret.0.iter_mut() {
            *c *= factor;
        }
        ret
    }

    /// Every counter of `other` fits in ours
    pub fn contains(&self, other: &DescriptorCounts) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a >= b)
    }

    fn add(&mut self, other: &DescriptorCounts) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a += *b;
        }
    }

    /// (kind, count) for every non-zero counter
    pub fn iter(&self) -> impl Iterator<Item = (DescriptorKind, u32)> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, c)| **c > 0)
            .map(|(i, c)| (DescriptorKind::ALL[i], *c))
    }
}

impl Index<DescriptorKind> for DescriptorCounts {
    type Output = u32;

    fn index(&self, kind: DescriptorKind) -> &u32 {
        &self.0[kind.index()]
    }
}

impl IndexMut<DescriptorKind> for DescriptorCounts {
    fn index_mut(&mut self, kind: DescriptorKind) -> &mut u32 {
        &mut self.0[kind.index()]
    }
}

/// The descriptor counts of every set a pipeline binds
///
/// Pools are keyed and sized by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayoutShape {
    ls_sets: Vec<DescriptorCounts>,
}

impl LayoutShape {
    pub fn new(sets: Vec<DescriptorCounts>) -> Self {
        Self { ls_sets: sets }
    }

    pub fn sets(&self) -> &[DescriptorCounts] {
        self.ls_sets.as_slice()
    }

    pub fn num_sets(&self) -> u32 {
        self.ls_sets.len() as u32
    }

    /// Histogram of descriptor kinds across all sets
    pub fn totals(&self) -> DescriptorCounts {
        let mut ret = DescriptorCounts::new();
        for set in self.ls_sets.iter() {
            ret.add(set);
        }
        ret
    }
}

/// Descriptor set layouts compiled from a LayoutShape
pub struct DescriptorSetsLayout {
    dl_backend: Arc<dyn Backend>,
    dl_shape: LayoutShape,
    dl_layouts: Vec<vk::DescriptorSetLayout>,
}

impl DescriptorSetsLayout {
    /// Check `shape` against the device limits and create its layouts
    pub fn new(
        backend: Arc<dyn Backend>,
        limits: &vk::PhysicalDeviceLimits,
        shape: LayoutShape,
    ) -> Result<Self> {
        Self::check_limits(limits, &shape)?;

        let mut ret = Self {
            dl_backend: backend,
            dl_shape: shape,
            dl_layouts: Vec::new(),
        };

        for set in ret.dl_shape.ls_sets.iter() {
            let bindings: Vec<vk::DescriptorSetLayoutBinding> = set
                .iter()
                .enumerate()
                .map(|(i, (kind, count))| {
                    vk::DescriptorSetLayoutBinding::builder()
                        .binding(i as u32)
                        .descriptor_type(kind.vk_type())
                        .descriptor_count(count)
                        .stage_flags(vk::ShaderStageFlags::ALL)
                        .build()
                })
                .collect();

            // Anything already created is destroyed by our Drop
            let layout = ret
                .dl_backend
                .create_descriptor_set_layout(bindings.as_slice())?;
            ret.dl_layouts.push(layout);
        }

        Ok(ret)
    }

    fn check_limits(limits: &vk::PhysicalDeviceLimits, shape: &LayoutShape) -> Result<()> {
        use DescriptorKind as K;
        let t = shape.totals();

        let checks = [
            (
                "samplers",
                t[K::Sampler] + t[K::CombinedImageSampler],
                limits.max_descriptor_set_samplers,
            ),
            (
                "uniform buffers",
                t[K::UniformBuffer] + t[K::UniformBufferDynamic],
                limits.max_descriptor_set_uniform_buffers,
            ),
            (
                "dynamic uniform buffers",
                t[K::UniformBufferDynamic],
                limits.max_descriptor_set_uniform_buffers_dynamic,
            ),
            (
                "storage buffers",
                t[K::StorageBuffer] + t[K::StorageBufferDynamic],
                limits.max_descriptor_set_storage_buffers,
            ),
            (
                "dynamic storage buffers",
                t[K::StorageBufferDynamic],
                limits.max_descriptor_set_storage_buffers_dynamic,
            ),
            (
                "sampled images",
                t[K::CombinedImageSampler] + t[K::SampledImage] + t[K::UniformTexelBuffer],
                limits.max_descriptor_set_sampled_images,
            ),
            (
                "storage images",
                t[K::StorageImage] + t[K::StorageTexelBuffer],
                limits.max_descriptor_set_storage_images,
            ),
            (
                "input attachments",
                t[K::InputAttachment],
                limits.max_descriptor_set_input_attachments,
            ),
        ];

        for (name, used, max) in checks.iter() {
            if used > max {
                log::error!(
                    "Descriptor layout uses {} {}, device supports {}",
                    used,
                    name,
                    max
                );
                return Err(TempestError::DESCRIPTOR_LIMITS_EXCEEDED);
            }
        }
        Ok(())
    }

    pub fn shape(&self) -> &LayoutShape {
        &self.dl_shape
    }

    pub fn handles(&self) -> &[vk::DescriptorSetLayout] {
        self.dl_layouts.as_slice()
    }
}

impl Drop for DescriptorSetsLayout {
    fn drop(&mut self) {
        for layout in self.dl_layouts.drain(..) {
            self.dl_backend.destroy_descriptor_set_layout(layout);
        }
    }
}

/// A fixed capacity driver descriptor pool
///
/// Sets are never freed individually. The whole pool is reset once
/// every command buffer that allocated from it has retired that work.
pub struct DescriptorPool {
    dp_backend: Arc<dyn Backend>,
    dp_pool: vk::DescriptorPool,
    dp_max_sets: u32,
    dp_num_allocated_sets: u32,
    dp_capacity: DescriptorCounts,
    dp_used: DescriptorCounts,
    /// (command buffer, its counter at the latest allocation)
    dp_tags: Vec<(Arc<CmdBuffer>, u64)>,
}

impl DescriptorPool {
    pub fn new(
        backend: Arc<dyn Backend>,
        max_sets: u32,
        capacity: DescriptorCounts,
    ) -> Result<Self> {
        let sizes: Vec<vk::DescriptorPoolSize> = capacity
            .iter()
            .map(|(kind, count)| {
                vk::DescriptorPoolSize::builder()
                    .ty(kind.vk_type())
                    .descriptor_count(count)
                    .build()
            })
            .collect();

        let pool = backend
            .create_descriptor_pool(max_sets, sizes.as_slice())
            .map_err(|e| {
                log::error!("Could not create a descriptor pool: {:?}", e);
                e
            })?;

        Ok(Self {
            dp_backend: backend,
            dp_pool: pool,
            dp_max_sets: max_sets,
            dp_num_allocated_sets: 0,
            dp_capacity: capacity,
            dp_used: DescriptorCounts::new(),
            dp_tags: Vec::new(),
        })
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.dp_pool
    }

    pub fn max_sets(&self) -> u32 {
        self.dp_max_sets
    }

    pub fn num_allocated_sets(&self) -> u32 {
        self.dp_num_allocated_sets
    }

    pub fn is_empty(&self) -> bool {
        self.dp_num_allocated_sets == 0
    }

    /// Pure capacity check for one allocation of `shape`
    pub fn can_allocate(&self, shape: &LayoutShape) -> bool {
        if self.dp_num_allocated_sets + shape.num_sets() > self.dp_max_sets {
            return false;
        }
        let mut needed = self.dp_used;
        needed.add(&shape.totals());
        self.dp_capacity.contains(&needed)
    }

    /// Allocate one set per layout in `layout`, tagged with `cmd`
    pub fn allocate(
        &mut self,
        layout: &DescriptorSetsLayout,
        cmd: &Arc<CmdBuffer>,
    ) -> Result<Vec<vk::DescriptorSet>> {
        if !self.can_allocate(layout.shape()) {
            return Err(TempestError::DESCRIPTOR_POOL_EXHAUSTED);
        }

        let sets = self
            .dp_backend
            .allocate_descriptor_sets(self.dp_pool, layout.handles())?;

        self.dp_num_allocated_sets += layout.shape().num_sets();
        self.dp_used.add(&layout.shape().totals());

        let counter = cmd.fence_signaled_counter();
        match self.dp_tags.iter_mut().find(|(c, _)| Arc::ptr_eq(c, cmd)) {
            Some(tag) => tag.1 = tag.1.max(counter),
            None => self.dp_tags.push((cmd.clone(), counter)),
        }

        Ok(sets)
    }

    /// Every command buffer that allocated from us has moved on
    pub fn is_reclaimable(&self) -> bool {
        self.dp_tags
            .iter()
            .all(|(cmd, counter)| cmd.has_advanced_past(*counter))
    }

    /// Return all sets to the pool
    ///
    /// The caller is responsible for checking `is_reclaimable`.
    pub fn reset(&mut self) -> Result<()> {
        self.dp_backend.reset_descriptor_pool(self.dp_pool)?;
        self.dp_num_allocated_sets = 0;
        self.dp_used = DescriptorCounts::new();
        self.dp_tags.clear();
        Ok(())
    }

    /// Reset the pool if nothing in flight references it
    ///
    /// Returns true if the pool was reset.
    pub fn try_reset(&mut self) -> Result<bool> {
        if self.is_empty() || !self.is_reclaimable() {
            return Ok(false);
        }
        self.reset()?;
        Ok(true)
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        self.dp_backend.destroy_descriptor_pool(self.dp_pool);
    }
}

/// A chain of pools that all have the same dimensions
pub struct DescriptorPoolSet {
    ps_backend: Arc<dyn Backend>,
    /// None when the chain serves every shape
    ps_shape: Option<LayoutShape>,
    ps_max_sets: u32,
    ps_capacity: DescriptorCounts,
    ps_pools: Vec<DescriptorPool>,
}

impl DescriptorPoolSet {
    /// A chain sized for `allocations_per_pool` allocations of `shape`
    pub fn for_shape(
        backend: Arc<dyn Backend>,
        shape: &LayoutShape,
        allocations_per_pool: u32,
    ) -> Self {
        Self {
            ps_backend: backend,
            ps_shape: Some(shape.clone()),
            ps_max_sets: allocations_per_pool * shape.num_sets(),
            ps_capacity: shape.totals().scaled(allocations_per_pool),
            ps_pools: Vec::new(),
        }
    }

    /// A chain of big pools shared by every shape
    pub fn monolithic(backend: Arc<dyn Backend>, max_sets: u32, descriptors_per_kind: u32) -> Self {
        Self {
            ps_backend: backend,
            ps_shape: None,
            ps_max_sets: max_sets,
            ps_capacity: DescriptorCounts::splat(descriptors_per_kind),
            ps_pools: Vec::new(),
        }
    }

    pub fn shape(&self) -> Option<&LayoutShape> {
        self.ps_shape.as_ref()
    }

    pub fn pools(&self) -> &[DescriptorPool] {
        self.ps_pools.as_slice()
    }

    pub fn num_pools(&self) -> usize {
        self.ps_pools.len()
    }

    /// Allocate from the first pool with room, chaining a new pool if
    /// they are all full
    pub fn allocate(
        &mut self,
        layout: &DescriptorSetsLayout,
        cmd: &Arc<CmdBuffer>,
    ) -> Result<Vec<vk::DescriptorSet>> {
        if let Some(pool) = self
            .ps_pools
            .iter_mut()
            .find(|p| p.can_allocate(layout.shape()))
        {
            return pool.allocate(layout, cmd);
        }

        let mut pool =
            DescriptorPool::new(self.ps_backend.clone(), self.ps_max_sets, self.ps_capacity)?;
        if !pool.can_allocate(layout.shape()) {
            log::error!(
                "Layout with {} sets does not fit in an empty descriptor pool",
                layout.shape().num_sets()
            );
            return Err(TempestError::DESCRIPTOR_POOL_EXHAUSTED);
        }
        let sets = pool.allocate(layout, cmd)?;
        self.ps_pools.push(pool);
        log::debug!(
            "Chained descriptor pool #{} ({} sets each)",
            self.ps_pools.len(),
            self.ps_max_sets
        );

        Ok(sets)
    }

    /// Reset up to `budget` reclaimable pools, consuming the budget
    ///
    /// Returns how many pools were reset.
    pub fn release_reclaimable(&mut self, budget: &mut usize) -> Result<usize> {
        let mut count = 0;
        for pool in self.ps_pools.iter_mut() {
            if *budget == 0 {
                break;
            }
            if pool.try_reset()? {
                *budget -= 1;
                count += 1;
            }
        }
        Ok(count)
    }

    fn report(&self) -> DescriptorPoolReport {
        DescriptorPoolReport {
            num_sets_in_shape: self.ps_shape.as_ref().map(|s| s.num_sets()),
            num_pools: self.ps_pools.len(),
            allocated_sets: self.ps_pools.iter().map(|p| p.num_allocated_sets()).sum(),
            max_sets: self.ps_pools.iter().map(|p| p.max_sets()).sum(),
            in_flight_pools: self
                .ps_pools
                .iter()
                .filter(|p| !p.is_empty() && !p.is_reclaimable())
                .count(),
        }
    }
}

/// Utilization of one pool chain
#[derive(Debug, Clone, Default)]
pub struct DescriptorPoolReport {
    /// None for the monolithic chain
    pub num_sets_in_shape: Option<u32>,
    pub num_pools: usize,
    pub allocated_sets: u32,
    pub max_sets: u32,
    /// Pools holding sets that the GPU may still read
    pub in_flight_pools: usize,
}

enum PoolSets {
    PerLayout(HashMap<LayoutShape, DescriptorPoolSet>),
    Monolithic(DescriptorPoolSet),
}

/// The device wide descriptor set allocator
///
/// Shared by every recording context, so everything goes through one
/// lock.
pub struct DescriptorSetAllocator {
    da_backend: Arc<dyn Backend>,
    da_strategy: DescriptorPoolStrategy,
    da_reclaim_batch_size: usize,
    da_sets: Mutex<PoolSets>,
}

impl DescriptorSetAllocator {
    pub fn new(
        backend: Arc<dyn Backend>,
        strategy: DescriptorPoolStrategy,
        reclaim_batch_size: usize,
    ) -> Self {
        let sets = match strategy {
            DescriptorPoolStrategy::PerLayout { .. } => PoolSets::PerLayout(HashMap::new()),
            DescriptorPoolStrategy::Monolithic {
                max_sets,
                descriptors_per_kind,
            } => PoolSets::Monolithic(DescriptorPoolSet::monolithic(
                backend.clone(),
                max_sets,
                descriptors_per_kind,
            )),
        };

        Self {
            da_backend: backend,
            da_strategy: strategy,
            da_reclaim_batch_size: reclaim_batch_size,
            da_sets: Mutex::new(sets),
        }
    }

    pub fn strategy(&self) -> DescriptorPoolStrategy {
        self.da_strategy
    }

    /// Compile `shape` into layouts we can allocate against
    pub fn create_layout(&self, shape: LayoutShape) -> Result<Arc<DescriptorSetsLayout>> {
        let limits = self.da_backend.properties().limits;
        Ok(Arc::new(DescriptorSetsLayout::new(
            self.da_backend.clone(),
            &limits,
            shape,
        )?))
    }

    /// Allocate one set per layout for use in `cmd`
    pub fn allocate_descriptor_sets(
        &self,
        cmd: &Arc<CmdBuffer>,
        layout: &DescriptorSetsLayout,
    ) -> Result<Vec<vk::DescriptorSet>> {
        let mut sets = lock(&self.da_sets);
        match &mut *sets {
            PoolSets::PerLayout(map) => {
                let allocations_per_pool = match self.da_strategy {
                    DescriptorPoolStrategy::PerLayout {
                        allocations_per_pool,
                    } => allocations_per_pool,
                    _ => return Err(TempestError::INVALID),
                };
                let backend = &self.da_backend;
                map.entry(layout.shape().clone())
                    .or_insert_with(|| {
                        DescriptorPoolSet::for_shape(
                            backend.clone(),
                            layout.shape(),
                            allocations_per_pool,
                        )
                    })
                    .allocate(layout, cmd)
            }
            PoolSets::Monolithic(set) => set.allocate(layout, cmd),
        }
    }

    /// Reset pools whose command buffers have all moved on
    ///
    /// At most `reclaim_batch_size` pools are reset per call. Returns
    /// how many were.
    pub fn release_reclaimable_pools(&self) -> Result<usize> {
        let mut budget = self.da_reclaim_batch_size;
        let mut sets = lock(&self.da_sets);

        match &mut *sets {
            PoolSets::PerLayout(map) => {
                let mut count = 0;
                for set in map.values_mut() {
                    if budget == 0 {
                        break;
                    }
                    count += set.release_reclaimable(&mut budget)?;
                }
                Ok(count)
            }
            PoolSets::Monolithic(set) => set.release_reclaimable(&mut budget),
        }
    }

    /// Number of pools in the chain serving `shape`
    pub fn num_pools_for(&self, shape: &LayoutShape) -> usize {
        match &*lock(&self.da_sets) {
            PoolSets::PerLayout(map) => map.get(shape).map(|s| s.num_pools()).unwrap_or(0),
            PoolSets::Monolithic(set) => set.num_pools(),
        }
    }

    pub fn dump_memory(&self) -> Vec<DescriptorPoolReport> {
        match &*lock(&self.da_sets) {
            PoolSets::PerLayout(map) => map.values().map(|s| s.report()).collect(),
            PoolSets::Monolithic(set) => vec![set.report()],
        }
    }
}
