//! Descriptor set management.
//!
//! - [`DescriptorAllocator`] hands out sets from fixed-capacity pools and
//!   rotates to a fresh pool when the current one runs out.
//! - [`DescriptorLayoutCache`] deduplicates layouts by their canonical
//!   binding signature.
//! - [`DescriptorBuilder`] collects bindings, resolves the layout through the
//!   cache, allocates the set and writes every binding in one update.

use std::collections::HashMap;

use ash::vk;
use parking_lot::Mutex;

use crate::config::DEFAULT_DESCRIPTOR_SIZE_FACTORS;
use crate::device::SharedDevice;
use crate::error::{GpuError, Result};
use crate::sync::Fence;

/// Descriptor count of one type, as a multiple of a pool's set capacity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolSizeFactor {
    pub descriptor_type: vk::DescriptorType,
    pub coeff: f32,
}

impl PoolSizeFactor {
    pub const fn new(descriptor_type: vk::DescriptorType, coeff: f32) -> Self {
        Self {
            descriptor_type,
            coeff,
        }
    }

    /// Pool size entry for a pool holding `capacity` sets.
    pub fn pool_size(&self, capacity: u32) -> vk::DescriptorPoolSize {
        vk::DescriptorPoolSize {
            ty: self.descriptor_type,
            descriptor_count: (self.coeff * capacity as f32) as u32,
        }
    }
}

/// Allocates descriptor sets from a growing set of pools.
///
/// Pools are never freed individually: [`Self::reset_pools`] returns every
/// used pool to the free list at once.
pub struct DescriptorAllocator {
    device: SharedDevice,
    pool_size: u32,
    size_factors: Vec<PoolSizeFactor>,
    current: Option<vk::DescriptorPool>,
    used: Vec<vk::DescriptorPool>,
    free: Vec<vk::DescriptorPool>,
}

impl DescriptorAllocator {
    /// Allocator with pools of 1000 sets and the default type factors.
    pub fn new(device: SharedDevice) -> Self {
        Self::with_pool_config(device, 1000, DEFAULT_DESCRIPTOR_SIZE_FACTORS.to_vec())
    }

    pub fn with_pool_config(
        device: SharedDevice,
        pool_size: u32,
        size_factors: Vec<PoolSizeFactor>,
    ) -> Self {
        Self {
            device,
            pool_size,
            size_factors,
            current: None,
            used: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Pools currently handed out, including the active one.
    pub fn used_pool_count(&self) -> usize {
        self.used.len()
    }

    /// Reset pools waiting to be reused.
    pub fn free_pool_count(&self) -> usize {
        self.free.len()
    }

    /// Allocate a set of `layout`.
    ///
    /// Pool exhaustion and fragmentation rotate to another pool and retry
    /// once. Any other failure, or a second failure, yields a null set.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> vk::DescriptorSet {
        match self.try_allocate(layout) {
            Ok(set) => set,
            Err(e) => {
                tracing::error!("Descriptor set allocation failed: {e}");
                vk::DescriptorSet::null()
            }
        }
    }

    /// Like [`Self::allocate`], but reports why no set was produced.
    pub fn try_allocate(&mut self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let pool = match self.current {
            Some(pool) => pool,
            None => self.rotate()?,
        };

        // SAFETY: the pool is owned by this allocator and the layout is alive.
        match unsafe { self.device.allocate_descriptor_set(pool, layout) } {
            Ok(set) => return Ok(set),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {}
            Err(e) => return Err(GpuError::from(e)),
        }

        let pool = self.rotate()?;
        tracing::debug!("Descriptor pool exhausted, rotated to {:?}", pool);

        // SAFETY: as above.
        match unsafe { self.device.allocate_descriptor_set(pool, layout) } {
            Ok(set) => Ok(set),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                Err(GpuError::DescriptorPoolExhausted)
            }
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Make a free or new pool current and mark it used.
    fn rotate(&mut self) -> Result<vk::DescriptorPool> {
        let pool = self.grab_pool()?;
        self.used.push(pool);
        self.current = Some(pool);
        Ok(pool)
    }

    fn grab_pool(&mut self) -> Result<vk::DescriptorPool> {
        match self.free.pop() {
            Some(pool) => Ok(pool),
            None => self.create_pool(),
        }
    }

    fn create_pool(&self) -> Result<vk::DescriptorPool> {
        let sizes: Vec<vk::DescriptorPoolSize> = self
            .size_factors
            .iter()
            .map(|f| f.pool_size(self.pool_size))
            .filter(|s| s.descriptor_count > 0)
            .collect();

        // SAFETY: valid pool sizes for this device.
        let pool = unsafe { self.device.create_descriptor_pool(self.pool_size, &sizes)? };
        tracing::debug!(
            "Created descriptor pool {:?} ({} sets)",
            pool,
            self.pool_size
        );
        Ok(pool)
    }

    /// Reset every used pool and move it to the free list.
    ///
    /// Every pool is attempted and moved even when a reset fails; the first
    /// error is returned afterwards.
    ///
    /// # Safety
    /// No set allocated since the previous reset may be referenced by
    /// pending device work.
    pub unsafe fn reset_pools(&mut self) -> Result<()> {
        let mut first_error = None;
        for &pool in &self.used {
            if let Err(e) = self.device.reset_descriptor_pool(pool) {
                tracing::error!("Failed to reset descriptor pool {:?}: {e}", pool);
                first_error.get_or_insert(e);
            }
        }
        self.free.append(&mut self.used);
        self.current = None;
        first_error.map_or(Ok(()), Err)
    }

    /// Reset the pools after checking that the work of every fence in
    /// `fences` has completed.
    ///
    /// Callers pass the fences of all frames that may reference sets from
    /// these pools.
    pub fn reset_pools_after(&mut self, fences: &[&Fence]) -> Result<()> {
        for fence in fences {
            if !fence.is_signaled()? {
                return Err(GpuError::InvalidState(
                    "Descriptor pools reset while device work is pending".to_string(),
                ));
            }
        }
        // SAFETY: all listed work has completed.
        unsafe { self.reset_pools() }
    }
}

impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        for pool in self.free.drain(..).chain(self.used.drain(..)) {
            // SAFETY: owned pool.
            unsafe { self.device.destroy_descriptor_pool(pool) };
        }
    }
}

/// One binding of a layout signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BindingKey {
    binding: u32,
    descriptor_type: vk::DescriptorType,
    count: u32,
    stage_flags: vk::ShaderStageFlags,
}

/// Layout bindings sorted by binding index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayoutSignature {
    bindings: Vec<BindingKey>,
}

impl LayoutSignature {
    pub fn new(bindings: &[vk::DescriptorSetLayoutBinding<'_>]) -> Self {
        let mut keys: Vec<BindingKey> = bindings
            .iter()
            .map(|b| BindingKey {
                binding: b.binding,
                descriptor_type: b.descriptor_type,
                count: b.descriptor_count,
                stage_flags: b.stage_flags,
            })
            .collect();
        if !keys.windows(2).all(|w| w[0].binding < w[1].binding) {
            keys.sort_by_key(|k| k.binding);
        }
        Self { bindings: keys }
    }

    fn native_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        self.bindings
            .iter()
            .map(|k| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(k.binding)
                    .descriptor_type(k.descriptor_type)
                    .descriptor_count(k.count)
                    .stage_flags(k.stage_flags)
            })
            .collect()
    }
}

/// Shares one native layout between structurally equal binding lists.
pub struct DescriptorLayoutCache {
    device: SharedDevice,
    layouts: Mutex<HashMap<LayoutSignature, vk::DescriptorSetLayout>>,
}

impl DescriptorLayoutCache {
    pub fn new(device: SharedDevice) -> Self {
        Self {
            device,
            layouts: Mutex::new(HashMap::new()),
        }
    }

    /// Layout for `bindings`, created on first request. Binding order does
    /// not matter.
    pub fn create_descriptor_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> Result<vk::DescriptorSetLayout> {
        let signature = LayoutSignature::new(bindings);
        let mut layouts = self.layouts.lock();
        if let Some(&layout) = layouts.get(&signature) {
            return Ok(layout);
        }

        // SAFETY: bindings without immutable samplers.
        let layout = unsafe {
            self.device
                .create_descriptor_set_layout(&signature.native_bindings())?
        };
        tracing::debug!(
            "Cached descriptor set layout {:?} ({} bindings)",
            layout,
            signature.bindings.len()
        );
        layouts.insert(signature, layout);
        Ok(layout)
    }

    /// Number of distinct layouts.
    pub fn len(&self) -> usize {
        self.layouts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for DescriptorLayoutCache {
    fn drop(&mut self) {
        for (_, layout) in self.layouts.get_mut().drain() {
            // SAFETY: owned layout.
            unsafe { self.device.destroy_descriptor_set_layout(layout) };
        }
    }
}

/// Layout and set produced by a [`DescriptorBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorAllocation {
    pub layout: vk::DescriptorSetLayout,
    pub set: vk::DescriptorSet,
}

enum PendingInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

struct PendingWrite {
    binding: u32,
    descriptor_type: vk::DescriptorType,
    info: PendingInfo,
}

/// Builds a descriptor set and its layout from a list of bindings.
///
/// ```ignore
/// let allocation = DescriptorBuilder::begin(&cache, &mut allocator)
///     .bind_buffer(0, uniforms.descriptor_info(), vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX)
///     .bind_image(1, texture.descriptor_info(sampler, layout), vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT)
///     .build()?;
/// ```
pub struct DescriptorBuilder<'a> {
    cache: &'a DescriptorLayoutCache,
    allocator: &'a mut DescriptorAllocator,
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
    writes: Vec<PendingWrite>,
}

impl<'a> DescriptorBuilder<'a> {
    pub fn begin(cache: &'a DescriptorLayoutCache, allocator: &'a mut DescriptorAllocator) -> Self {
        Self {
            cache,
            allocator,
            bindings: Vec::new(),
            writes: Vec::new(),
        }
    }

    fn push_binding(
        &mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
        info: PendingInfo,
    ) {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(stage_flags),
        );
        self.writes.push(PendingWrite {
            binding,
            descriptor_type,
            info,
        });
    }

    /// Bind a buffer descriptor.
    pub fn bind_buffer(
        mut self,
        binding: u32,
        info: vk::DescriptorBufferInfo,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.push_binding(binding, descriptor_type, stage_flags, PendingInfo::Buffer(info));
        self
    }

    /// Bind an image descriptor.
    pub fn bind_image(
        mut self,
        binding: u32,
        info: vk::DescriptorImageInfo,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.push_binding(binding, descriptor_type, stage_flags, PendingInfo::Image(info));
        self
    }

    /// Resolve the layout, allocate the set and write all bindings.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn build(self) -> Result<DescriptorAllocation> {
        let Self {
            cache,
            allocator,
            bindings,
            writes: pending,
        } = self;
        let layout = cache.create_descriptor_layout(&bindings)?;
        let set = allocator.try_allocate(layout)?;

        let writes: Vec<vk::WriteDescriptorSet<'_>> = pending
            .iter()
            .map(|w| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(w.binding)
                    .descriptor_type(w.descriptor_type);
                match &w.info {
                    PendingInfo::Buffer(info) => write.buffer_info(std::slice::from_ref(info)),
                    PendingInfo::Image(info) => write.image_info(std::slice::from_ref(info)),
                }
            })
            .collect();

        // SAFETY: the infos outlive the call and reference live resources.
        unsafe { allocator.device.update_descriptor_sets(&writes) };

        Ok(DescriptorAllocation { layout, set })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;
    use std::sync::Arc;

    fn binding(
        index: u32,
        ty: vk::DescriptorType,
        stages: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(index)
            .descriptor_type(ty)
            .descriptor_count(1)
            .stage_flags(stages)
    }

    #[test]
    fn pool_size_scales_with_capacity() {
        let factor = PoolSizeFactor::new(vk::DescriptorType::SAMPLER, 0.5);
        assert_eq!(factor.pool_size(1000).descriptor_count, 500);
        assert_eq!(factor.pool_size(1000).ty, vk::DescriptorType::SAMPLER);
    }

    #[test]
    fn permuted_bindings_share_a_layout() {
        let device = Arc::new(HeadlessDevice::new());
        let cache = DescriptorLayoutCache::new(device.clone());

        let a = [
            binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX),
            binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT),
            binding(2, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::COMPUTE),
        ];
        let b = [a[2], a[0], a[1]];

        let first = cache.create_descriptor_layout(&a).unwrap();
        let second = cache.create_descriptor_layout(&b).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
        assert_eq!(device.stats().descriptor_layouts_created, 1);
    }

    #[test]
    fn differing_stage_flags_get_distinct_layouts() {
        let device = Arc::new(HeadlessDevice::new());
        let cache = DescriptorLayoutCache::new(device);

        let vertex = cache
            .create_descriptor_layout(&[binding(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )])
            .unwrap();
        let fragment = cache
            .create_descriptor_layout(&[binding(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::FRAGMENT,
            )])
            .unwrap();
        assert_ne!(vertex, fragment);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn exhausted_pool_rotates_transparently() {
        let device = Arc::new(HeadlessDevice::new());
        let cache = DescriptorLayoutCache::new(device.clone());
        let mut allocator = DescriptorAllocator::new(device.clone());

        let layout = cache
            .create_descriptor_layout(&[binding(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            )])
            .unwrap();

        for _ in 0..1200 {
            assert_ne!(allocator.allocate(layout), vk::DescriptorSet::null());
        }
        assert_eq!(allocator.used_pool_count(), 2);
        assert_eq!(device.stats().descriptor_sets_allocated, 1200);
    }

    #[test]
    fn unexpected_failure_returns_null_set() {
        let device = Arc::new(HeadlessDevice::new());
        let cache = DescriptorLayoutCache::new(device.clone());
        let mut allocator = DescriptorAllocator::new(device.clone());
        let layout = cache
            .create_descriptor_layout(&[binding(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )])
            .unwrap();

        device.fail_next_descriptor_allocation(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert_eq!(allocator.allocate(layout), vk::DescriptorSet::null());
        // No rotation for non-pool errors.
        assert_eq!(allocator.used_pool_count(), 1);

        assert_ne!(allocator.allocate(layout), vk::DescriptorSet::null());
    }

    #[test]
    fn reset_recycles_used_pools() {
        let device = Arc::new(HeadlessDevice::new());
        let cache = DescriptorLayoutCache::new(device.clone());
        let mut allocator =
            DescriptorAllocator::with_pool_config(device.clone(), 4, DEFAULT_DESCRIPTOR_SIZE_FACTORS.to_vec());
        let layout = cache
            .create_descriptor_layout(&[binding(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )])
            .unwrap();

        for _ in 0..10 {
            allocator.allocate(layout);
        }
        assert_eq!(allocator.used_pool_count(), 3);

        let fence = Fence::new(device.clone(), true).unwrap();
        allocator.reset_pools_after(&[&fence]).unwrap();
        assert_eq!(allocator.used_pool_count(), 0);
        assert_eq!(allocator.free_pool_count(), 3);

        for _ in 0..10 {
            allocator.allocate(layout);
        }
        assert_eq!(device.stats().descriptor_pools_created, 3);
    }

    #[test]
    fn failed_pool_reset_still_moves_every_pool() {
        let device = Arc::new(HeadlessDevice::new());
        let cache = DescriptorLayoutCache::new(device.clone());
        let mut allocator =
            DescriptorAllocator::with_pool_config(device.clone(), 4, DEFAULT_DESCRIPTOR_SIZE_FACTORS.to_vec());
        let layout = cache
            .create_descriptor_layout(&[binding(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )])
            .unwrap();

        for _ in 0..10 {
            allocator.allocate(layout);
        }
        assert_eq!(allocator.used_pool_count(), 3);

        device.fail_next_pool_reset(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        let fence = Fence::new(device.clone(), true).unwrap();
        let err = allocator.reset_pools_after(&[&fence]).unwrap_err();
        assert!(matches!(
            err,
            GpuError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        ));
        assert_eq!(allocator.used_pool_count(), 0);
        assert_eq!(allocator.free_pool_count(), 3);
        assert_eq!(device.stats().descriptor_pool_resets, 2);

        assert_ne!(allocator.allocate(layout), vk::DescriptorSet::null());
    }

    #[test]
    fn reset_refuses_pending_work() {
        let device = Arc::new(HeadlessDevice::new());
        let mut allocator = DescriptorAllocator::new(device.clone());
        let fence = Fence::new(device.clone(), false).unwrap();

        let err = allocator.reset_pools_after(&[&fence]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
    }

    #[test]
    fn independent_builders_resolve_the_same_layout() {
        let device = Arc::new(HeadlessDevice::new());
        let cache = DescriptorLayoutCache::new(device.clone());
        let mut allocator = DescriptorAllocator::new(device.clone());
        let allocator_mem = crate::memory::DeviceMemoryAllocator::new(device.clone(), "test");
        let uniforms = allocator_mem.allocate_uniform_buffer(64).unwrap();

        let first = DescriptorBuilder::begin(&cache, &mut allocator)
            .bind_buffer(
                0,
                uniforms.descriptor_info(),
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )
            .build()
            .unwrap();
        let second = DescriptorBuilder::begin(&cache, &mut allocator)
            .bind_buffer(
                0,
                uniforms.descriptor_info(),
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )
            .build()
            .unwrap();

        assert_eq!(first.layout, second.layout);
        assert_ne!(first.set, second.set);
    }

    #[test]
    fn build_writes_every_binding_in_one_update() {
        let device = Arc::new(HeadlessDevice::new());
        let cache = DescriptorLayoutCache::new(device.clone());
        let mut allocator = DescriptorAllocator::new(device.clone());
        let memory = crate::memory::DeviceMemoryAllocator::new(device.clone(), "test");
        let uniforms = memory.allocate_uniform_buffer(64).unwrap();
        let meta = crate::image::ImageMeta::two_dim(4, 4, vk::Format::R8G8B8A8_SRGB, 1);
        let texture = crate::image::ImageResource::create_empty_two_dim(&memory, &meta).unwrap();

        let allocation = DescriptorBuilder::begin(&cache, &mut allocator)
            .bind_image(
                1,
                texture.descriptor_info(
                    vk::Sampler::null(),
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                ),
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .bind_buffer(
                0,
                uniforms.descriptor_info(),
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )
            .build()
            .unwrap();

        let writes = device.descriptor_writes();
        assert_eq!(device.stats().descriptor_update_calls, 1);
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|w| w.set == allocation.set));
        assert_eq!(writes[0].image_view, Some(texture.view().handle()));
        assert_eq!(writes[1].buffer, Some(uniforms.handle()));
        assert_eq!(writes[1].count, 1);
    }
}
