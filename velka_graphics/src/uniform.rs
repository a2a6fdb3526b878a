use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use parking_lot::Mutex;

use crate::{
    buffer::Buffer,
    engine::{DestructObject, EngineShared, TsCell, DESCRIPTOR_POOL_SIZE},
    image::Image,
    types::{SamplerInfo, UniformBinding, UniformType, UpdateMode, UNIFORM_TYPE_COUNT},
};

/// Call-site input that fills one binding.
#[derive(Clone)]
pub struct UniformAttachment {
    pub binding: u32,
    pub uniform_type: UniformType,
    pub resource: UniformResource,
}

#[derive(Clone)]
pub enum UniformResource {
    Buffer(Arc<Buffer>),
    Image(Arc<Image>),
}

impl UniformAttachment {
    pub fn buffer(binding: u32, uniform_type: UniformType, buffer: Arc<Buffer>) -> Self {
        debug_assert!(uniform_type.is_buffer_like());
        Self {
            binding,
            uniform_type,
            resource: UniformResource::Buffer(buffer),
        }
    }

    pub fn image(binding: u32, uniform_type: UniformType, image: Arc<Image>) -> Self {
        debug_assert!(uniform_type.is_image_like());
        Self {
            binding,
            uniform_type,
            resource: UniformResource::Image(image),
        }
    }
}

struct RetiredSet {
    ts: f64,
    descriptor_sets: Vec<vk::DescriptorSet>,
}

struct FactoryState {
    pools: Vec<vk::DescriptorPool>,
    ds_available: u32,
    retired: Vec<RetiredSet>,
}

/// Builds uniform sets for one descriptor-set layout.
///
/// Descriptor pools grow on demand in quanta of [`DESCRIPTOR_POOL_SIZE`]
/// sets; retired sets are recycled once their last-used frame has expired.
pub struct UniformSetFactory {
    pub(crate) engine: Arc<EngineShared>,
    pub(crate) update: UpdateMode,
    pub(crate) bindings: Vec<UniformBinding>,
    pub(crate) layout: vk::DescriptorSetLayout,
    type_count: [u32; UNIFORM_TYPE_COUNT],
    state: Mutex<FactoryState>,
}

impl UniformSetFactory {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        update: UpdateMode,
        bindings: &[UniformBinding],
    ) -> Result<Arc<UniformSetFactory>> {
        debug_assert!(!bindings.is_empty());

        let layout_bindings = bindings
            .iter()
            .map(|ub| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(ub.binding)
                    .descriptor_type(ub.uniform_type.to_vulkan_descriptor_type())
                    .descriptor_count(1)
                    .stage_flags(ub.stage.to_vulkan_shader_stage_flags())
            })
            .collect::<Vec<_>>();

        let layout_info =
            vk::DescriptorSetLayoutCreateInfo::default().bindings(&layout_bindings);
        let layout = unsafe {
            engine
                .device()
                .create_descriptor_set_layout(&layout_info, None)
                .context("vkCreateDescriptorSetLayout failed")?
        };

        let mut type_count = [0u32; UNIFORM_TYPE_COUNT];
        for ub in bindings {
            type_count[ub.uniform_type.index()] += 1;
        }

        Ok(Arc::new(UniformSetFactory {
            engine,
            update,
            bindings: bindings.to_vec(),
            layout,
            type_count,
            state: Mutex::new(FactoryState {
                pools: Vec::new(),
                ds_available: 0,
                retired: Vec::new(),
            }),
        }))
    }

    pub fn update_mode(&self) -> UpdateMode {
        self.update
    }

    pub(crate) fn binding(&self, index: u32) -> Option<&UniformBinding> {
        self.bindings.iter().find(|ub| ub.binding == index)
    }

    /// Put a set's descriptors back on the free list, still reachable for
    /// factory-level teardown.
    pub(crate) fn retire(&self, ts: f64, descriptor_sets: Vec<vk::DescriptorSet>) {
        self.state.lock().retired.push(RetiredSet {
            ts,
            descriptor_sets,
        });
    }

    /// Acquire `ds_count` descriptor sets: recycle a retired set whose
    /// last-used frame has expired, else allocate from the pool list,
    /// growing it when exhausted.
    fn acquire_sets(&self, expired_ts: f64) -> Result<Vec<vk::DescriptorSet>> {
        let mut state = self.state.lock();

        if let Some(index) = state
            .retired
            .iter()
            .position(|retired| expired_ts >= retired.ts)
        {
            return Ok(state.retired.swap_remove(index).descriptor_sets);
        }

        let ds_count = self.set_replication();

        if state.pools.is_empty() || ds_count > state.ds_available {
            self.grow_pool(&mut state)?;
        }

        let pool = *state.pools.last().unwrap();
        let layouts = vec![self.layout; ds_count as usize];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let descriptor_sets = unsafe {
            self.engine
                .device()
                .allocate_descriptor_sets(&allocate_info)
                .context("vkAllocateDescriptorSets failed")?
        };

        state.ds_available -= ds_count;
        Ok(descriptor_sets)
    }

    fn grow_pool(&self, state: &mut FactoryState) -> Result<()> {
        // size the pool so DESCRIPTOR_POOL_SIZE sets of this layout fit
        let mut max_sets = DESCRIPTOR_POOL_SIZE;
        let mut pool_sizes = Vec::new();
        for uniform_type in [
            UniformType::Buffer,
            UniformType::Storage,
            UniformType::Image,
            UniformType::BufferRef,
            UniformType::StorageRef,
            UniformType::ImageRef,
        ] {
            let count = self.type_count[uniform_type.index()];
            if count == 0 {
                continue;
            }
            let descriptor_count = count * DESCRIPTOR_POOL_SIZE;
            max_sets = max_sets.max(descriptor_count);
            pool_sizes.push(
                vk::DescriptorPoolSize::default()
                    .ty(uniform_type.to_vulkan_descriptor_type())
                    .descriptor_count(descriptor_count),
            );
        }

        if pool_sizes.is_empty() {
            return Err(anyhow::anyhow!("factory has no bindings"));
        }

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);
        let pool = unsafe {
            self.engine
                .device()
                .create_descriptor_pool(&pool_info, None)
                .context("vkCreateDescriptorPool failed")?
        };

        state.pools.push(pool);
        state.ds_available = DESCRIPTOR_POOL_SIZE;
        Ok(())
    }

    /// Descriptor replication: one set per swapchain image for Asynchronous
    /// factories, one otherwise.
    pub(crate) fn set_replication(&self) -> u32 {
        if self.update == UpdateMode::Asynchronous {
            self.engine.image_count()
        } else {
            1
        }
    }
}

impl Drop for UniformSetFactory {
    fn drop(&mut self) {
        let pools = std::mem::take(&mut self.state.lock().pools);
        self.engine.delete_object(DestructObject::UniformSetFactory {
            layout: self.layout,
            pools,
        });
    }
}

/// A bound set of uniform attachments over factory-allocated descriptors.
///
/// Asynchronous factories replicate the descriptors once per swapchain image
/// so a ref update in frame `i` cannot disturb the descriptor the GPU reads
/// in frame `i - 1`.
pub struct UniformSet {
    pub(crate) engine: Arc<EngineShared>,
    pub(crate) set: u32,
    pub(crate) factory: Arc<UniformSetFactory>,
    /// One slot per factory binding; ref slots fill in on update.
    attachments: Mutex<Vec<Option<UniformAttachment>>>,
    descriptor_sets: Vec<vk::DescriptorSet>,
    pub(crate) ts: TsCell,
}

impl UniformSet {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        set: u32,
        attachments: Vec<UniformAttachment>,
        factory: &Arc<UniformSetFactory>,
    ) -> Result<Arc<UniformSet>> {
        #[cfg(debug_assertions)]
        for ua in &attachments {
            if let (UniformResource::Buffer(buffer), false) =
                (&ua.resource, ua.uniform_type.is_ref())
            {
                debug_assert!(
                    buffer.update == factory.update || buffer.update == UpdateMode::Static,
                    "buffer update mode does not match factory"
                );
            }
        }

        let descriptor_sets = factory.acquire_sets(engine.expired_ts())?;

        let mut slots: Vec<Option<UniformAttachment>> =
            vec![None; factory.bindings.len()];

        let us = Arc::new(UniformSet {
            engine,
            set,
            factory: factory.clone(),
            attachments: Mutex::new(Vec::new()),
            descriptor_sets,
            ts: TsCell::new(),
        });

        // eager bindings are written for every replica now; ref bindings
        // wait for their per-frame update
        for ua in attachments {
            let slot = us
                .factory
                .bindings
                .iter()
                .position(|ub| ub.binding == ua.binding)
                .ok_or_else(|| anyhow::anyhow!("invalid binding {}", ua.binding))?;
            debug_assert_eq!(us.factory.bindings[slot].uniform_type, ua.uniform_type);

            match (&ua.resource, ua.uniform_type.is_ref()) {
                (UniformResource::Buffer(buffer), false) => {
                    us.write_buffer_descriptors(buffer, ua.binding, ua.uniform_type, None);
                }
                (UniformResource::Image(image), false) => {
                    let sampler_info = us
                        .factory
                        .binding(ua.binding)
                        .and_then(|ub| ub.sampler)
                        .ok_or_else(|| {
                            anyhow::anyhow!("binding {} has no sampler", ua.binding)
                        })?;
                    us.write_image_descriptors(image, ua.binding, &sampler_info, None);
                }
                _ => {}
            }

            slots[slot] = Some(ua);
        }

        *us.attachments.lock() = slots;

        Ok(us)
    }

    pub fn set_index(&self) -> u32 {
        self.set
    }

    pub fn factory(&self) -> &Arc<UniformSetFactory> {
        &self.factory
    }

    /// Descriptor set the given frame binds.
    pub(crate) fn descriptor_set(&self, frame: u32) -> vk::DescriptorSet {
        let index = if self.factory.update == UpdateMode::Asynchronous {
            frame as usize
        } else {
            0
        };
        self.descriptor_sets[index.min(self.descriptor_sets.len() - 1)]
    }

    /// Write a buffer descriptor. With `frame == None` every replica is
    /// written (set construction); otherwise only the given frame's slot.
    fn write_buffer_descriptors(
        &self,
        buffer: &Arc<Buffer>,
        binding: u32,
        uniform_type: UniformType,
        frame: Option<u32>,
    ) {
        let replicas: Vec<u32> = match frame {
            Some(frame) => vec![if self.factory.update == UpdateMode::Asynchronous {
                frame
            } else {
                0
            }],
            None => (0..self.descriptor_sets.len() as u32).collect(),
        };

        for replica in replicas {
            let buffer_index = if buffer.update == UpdateMode::Asynchronous {
                replica
            } else {
                0
            };
            let buffer_info = vk::DescriptorBufferInfo::default()
                .buffer(buffer.handle(buffer_index))
                .offset(0)
                .range(buffer.size() as vk::DeviceSize);

            let write = vk::WriteDescriptorSet::default()
                .dst_set(self.descriptor_sets[replica as usize])
                .dst_binding(binding)
                .dst_array_element(0)
                .descriptor_type(uniform_type.to_vulkan_descriptor_type())
                .buffer_info(std::slice::from_ref(&buffer_info));

            unsafe {
                self.engine
                    .device()
                    .update_descriptor_sets(std::slice::from_ref(&write), &[]);
            }
        }
    }

    fn write_image_descriptors(
        &self,
        image: &Arc<Image>,
        binding: u32,
        sampler_info: &SamplerInfo,
        frame: Option<u32>,
    ) {
        let sampler = match self.engine.sampler(sampler_info) {
            Ok(sampler) => sampler,
            Err(err) => {
                log::warn!("sampler lookup failed: {err}");
                return;
            }
        };

        let replicas: Vec<u32> = match frame {
            Some(frame) => vec![if self.factory.update == UpdateMode::Asynchronous {
                frame
            } else {
                0
            }],
            None => (0..self.descriptor_sets.len() as u32).collect(),
        };

        for replica in replicas {
            let image_info = vk::DescriptorImageInfo::default()
                .sampler(sampler)
                .image_view(image.view)
                .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

            let write = vk::WriteDescriptorSet::default()
                .dst_set(self.descriptor_sets[replica as usize])
                .dst_binding(binding)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(std::slice::from_ref(&image_info));

            unsafe {
                self.engine
                    .device()
                    .update_descriptor_sets(std::slice::from_ref(&write), &[]);
            }
        }
    }

    /// Re-bind `*Ref` attachments for the current frame. Only the current
    /// frame's descriptor slot is written; the other replicas keep the
    /// descriptors their in-flight frames are reading.
    pub(crate) fn update_refs(&self, frame: u32, ua_array: &[UniformAttachment]) {
        let mut slots = self.attachments.lock();

        for ua in ua_array {
            let slot = match self
                .factory
                .bindings
                .iter()
                .position(|ub| ub.binding == ua.binding)
            {
                Some(slot) => slot,
                None => {
                    log::warn!("invalid binding {}", ua.binding);
                    continue;
                }
            };
            debug_assert!(ua.uniform_type.is_ref());
            debug_assert_eq!(self.factory.bindings[slot].uniform_type, ua.uniform_type);

            match &ua.resource {
                UniformResource::Buffer(buffer) => {
                    self.write_buffer_descriptors(
                        buffer,
                        ua.binding,
                        ua.uniform_type,
                        Some(frame),
                    );
                }
                UniformResource::Image(image) => {
                    let sampler_info = self
                        .factory
                        .binding(ua.binding)
                        .and_then(|ub| ub.sampler);
                    match sampler_info {
                        Some(sampler_info) => {
                            self.write_image_descriptors(
                                image,
                                ua.binding,
                                &sampler_info,
                                Some(frame),
                            );
                        }
                        None => log::warn!("binding {} has no sampler", ua.binding),
                    }
                }
            }

            slots[slot] = Some(ua.clone());
        }
    }

    /// Stamp the set and every attached resource as used at `ts`.
    pub(crate) fn touch(&self, ts: f64) {
        if ts == 0.0 {
            return;
        }

        self.ts.set(ts);
        for ua in self.attachments.lock().iter().flatten() {
            match &ua.resource {
                UniformResource::Buffer(buffer) => buffer.ts.set(ts),
                UniformResource::Image(image) => image.ts.set(ts),
            }
        }
    }
}

impl Drop for UniformSet {
    fn drop(&mut self) {
        let descriptor_sets = std::mem::take(&mut self.descriptor_sets);
        self.engine.delete_object(DestructObject::UniformSet {
            ts: self.ts.get(),
            factory: self.factory.clone(),
            descriptor_sets,
        });
    }
}
