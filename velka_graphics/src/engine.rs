use std::{
    collections::HashMap,
    ffi::{c_void, CStr, CString},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use anyhow::{Context, Result};
use ash::{ext::debug_utils, khr, vk};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::{
    buffer::Buffer,
    command::CommandBufferSet,
    compute::Compute,
    download::ImageDownloader,
    image::Image,
    memory::{Memory, MemoryInfo, MemoryManager},
    pipeline::{ComputePipeline, GraphicsPipeline, PipelineLayout},
    renderer::Renderer,
    transfer::TransferManager,
    types::{
        BufferUsage, ComputePipelineInfo, GraphicsPipelineInfo, ImageCaps, ImageFormat, QueueId,
        SamplerInfo, Stage, UniformBinding, UpdateMode, IMAGE_FORMAT_COUNT,
    },
    uniform::{UniformAttachment, UniformSet, UniformSetFactory},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    fn to_vulkan_version(self) -> u32 {
        vk::make_api_version(0, self.major, self.minor, self.patch)
    }
}

const ENGINE_VERSION: Version = Version {
    major: 1,
    minor: 1,
    patch: 0,
};

/// Raw handles of the window the default renderer presents to.
#[derive(Clone, Copy)]
pub struct WindowHandles {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

/// `(name) -> bytes` lookup for SPIR-V shader modules. The engine validates
/// that returned blobs are non-empty and 4-byte divisible.
pub trait ShaderBundle: Send + Sync {
    fn load(&self, name: &str) -> Result<Vec<u8>>;
}

pub struct EngineInfo {
    pub app_name: String,
    pub app_version: Version,
    /// Directory for persisted state (the pipeline cache).
    pub internal_path: PathBuf,
    /// `None` runs headless: no surface, no default renderer.
    pub window: Option<WindowHandles>,
    pub shaders: Box<dyn ShaderBundle>,
    /// Enables the validation layer and a debug-utils messenger that routes
    /// to `log`.
    pub debug: bool,
    pub disable_msaa: bool,
}

/// Wall-clock-style timestamp cell readable and writable from any thread.
/// Zero means "never used by the GPU".
pub(crate) struct TsCell(AtomicU64);

impl TsCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(0.0f64.to_bits()))
    }

    pub(crate) fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn set(&self, ts: f64) {
        self.0.store(ts.to_bits(), Ordering::Relaxed);
    }
}

struct SyncState {
    shutdown: bool,
    ts_expired: f64,
}

/// Shutdown flag and expired-timestamp publication. The condvar is broadcast
/// whenever either advances; the destruction worker and resource destructors
/// wait on it.
pub(crate) struct RendererSync {
    state: Mutex<SyncState>,
    cond: Condvar,
}

/// Tagged destruction object. Dropping a wrapper moves its GAPI handles into
/// one of these and enqueues it; the worker dispatches on the tag and runs
/// the matching destructor after the last-used timestamp has expired.
pub(crate) enum DestructObject {
    Buffer {
        ts: f64,
        buffers: Vec<vk::Buffer>,
        memories: Vec<Memory>,
    },
    Image {
        ts: f64,
        handle: vk::Image,
        view: vk::ImageView,
        memory: Option<Memory>,
        semaphore: Option<vk::Semaphore>,
    },
    UniformSet {
        ts: f64,
        factory: Arc<UniformSetFactory>,
        descriptor_sets: Vec<vk::DescriptorSet>,
    },
    UniformSetFactory {
        layout: vk::DescriptorSetLayout,
        pools: Vec<vk::DescriptorPool>,
    },
    PipelineLayout {
        handle: vk::PipelineLayout,
    },
    GraphicsPipeline {
        ts: f64,
        handle: vk::Pipeline,
    },
    ComputePipeline {
        ts: f64,
        handle: vk::Pipeline,
    },
    Compute {
        fence: vk::Fence,
        commands: CommandBufferSet,
    },
    Renderer(RendererParts),
}

/// Non-default renderer teardown payloads. Image wrappers ride along as
/// `Arc`s; dropping them here re-enqueues their own destruction.
pub(crate) enum RendererParts {
    Image {
        fence: vk::Fence,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        commands: CommandBufferSet,
        depth_image: Arc<Image>,
        src_image: Arc<Image>,
    },
    Stream {
        ts: f64,
        render_pass: vk::RenderPass,
        framebuffers: Vec<vk::Framebuffer>,
        views: Vec<vk::ImageView>,
        commands: CommandBufferSet,
        depth_image: Arc<Image>,
        images: Vec<Arc<Image>>,
    },
    Secondary {
        ts: f64,
        commands: CommandBufferSet,
    },
}

impl DestructObject {
    /// Destroy the carried handles. With `wait` the destructor blocks until
    /// the default renderer expires the object's last-used timestamp; without
    /// it, a queue-wait-idle stands in when the object was ever used.
    pub(crate) fn destruct(self, engine: &EngineShared, wait: bool) {
        let sync = |ts: f64| {
            if wait {
                engine.renderer_wait_for_timestamp(ts);
            } else if ts != 0.0 {
                engine.queue_wait_idle(QueueId::Foreground);
            }
        };

        let device = engine.device();
        match self {
            Self::Buffer {
                ts,
                buffers,
                memories,
            } => {
                sync(ts);
                for (buffer, memory) in buffers.into_iter().zip(memories) {
                    engine.mm.free(engine, memory);
                    unsafe { device.destroy_buffer(buffer, None) };
                }
            }
            Self::Image {
                ts,
                handle,
                view,
                memory,
                semaphore,
            } => {
                sync(ts);
                unsafe {
                    device.destroy_image_view(view, None);
                    if let Some(semaphore) = semaphore {
                        device.destroy_semaphore(semaphore, None);
                    }
                }
                if let Some(memory) = memory {
                    engine.mm.free(engine, memory);
                }
                unsafe { device.destroy_image(handle, None) };
            }
            Self::UniformSet {
                ts,
                factory,
                descriptor_sets,
            } => {
                sync(ts);
                // the set stays reachable from the factory for reuse and for
                // factory-level teardown
                factory.retire(ts, descriptor_sets);
            }
            Self::UniformSetFactory { layout, pools } => unsafe {
                for pool in pools {
                    device.destroy_descriptor_pool(pool, None);
                }
                device.destroy_descriptor_set_layout(layout, None);
            },
            Self::PipelineLayout { handle } => unsafe {
                device.destroy_pipeline_layout(handle, None);
            },
            Self::GraphicsPipeline { ts, handle } | Self::ComputePipeline { ts, handle } => {
                sync(ts);
                unsafe { device.destroy_pipeline(handle, None) };
            }
            Self::Compute { fence, commands } => {
                unsafe { device.destroy_fence(fence, None) };
                commands.destroy(device);
            }
            Self::Renderer(parts) => match parts {
                RendererParts::Image {
                    fence,
                    render_pass,
                    framebuffer,
                    commands,
                    depth_image,
                    src_image,
                } => {
                    commands.destroy(device);
                    unsafe {
                        device.destroy_framebuffer(framebuffer, None);
                        device.destroy_render_pass(render_pass, None);
                        device.destroy_fence(fence, None);
                    }
                    drop(depth_image);
                    drop(src_image);
                }
                RendererParts::Stream {
                    ts,
                    render_pass,
                    framebuffers,
                    views,
                    commands,
                    depth_image,
                    images,
                } => {
                    sync(ts);
                    commands.destroy(device);
                    unsafe {
                        for framebuffer in framebuffers {
                            device.destroy_framebuffer(framebuffer, None);
                        }
                        for view in views {
                            device.destroy_image_view(view, None);
                        }
                        device.destroy_render_pass(render_pass, None);
                    }
                    drop(depth_image);
                    drop(images);
                }
                RendererParts::Secondary { ts, commands } => {
                    sync(ts);
                    commands.destroy(device);
                }
            },
        }
    }
}

/// Shared device context. Everything a resource wrapper or renderer needs:
/// instance, device, queues, caches, sub-allocator, transfer managers, and
/// the renderer sync state. Held by `Arc` from every wrapper.
pub struct EngineShared {
    version: Version,
    app_name: String,
    app_version: Version,
    internal_path: PathBuf,

    entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,

    surface_loader: Option<khr::surface::Instance>,
    surface: Mutex<vk::SurfaceKHR>,

    physical_device: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device: ash::Device,
    swapchain_loader: Option<khr::swapchain::Device>,
    queue_family_index: u32,
    queues: [vk::Queue; 2],

    max_anisotropy: f32,
    msaa_sample_count: u32,
    image_caps: [ImageCaps; IMAGE_FORMAT_COUNT],

    pipeline_cache: vk::PipelineCache,
    shaders: Box<dyn ShaderBundle>,
    shader_modules: Mutex<HashMap<String, vk::ShaderModule>>,
    samplers: Mutex<HashMap<SamplerInfo, vk::Sampler>>,

    pub(crate) mm: MemoryManager,
    pub(crate) xfer: TransferManager,
    pub(crate) downloader: ImageDownloader,

    pub(crate) sync: RendererSync,
    destruct_tx: Mutex<Option<Sender<DestructObject>>>,

    /// Swapchain image count, published by the default renderer. One when
    /// headless.
    image_count: AtomicU32,

    epoch: std::time::Instant,
}

/// Process-wide root. Owns the shared context, the default renderer, and the
/// destruction worker; created once and destroyed once.
pub struct Engine {
    shared: Arc<EngineShared>,
    default_renderer: Option<Arc<Renderer>>,
    worker: Option<JoinHandle<()>>,
    window: Option<WindowHandles>,
}

unsafe extern "system" fn debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let severity = match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => "[Verbose]",
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => "[Warning]",
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => "[Error]",
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => "[Info]",
        _ => "[Unknown]",
    };
    let types = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        _ => "[Unknown]",
    };
    let message = CStr::from_ptr((*p_callback_data).p_message);
    log::debug!("[VK Debug]{}{}{:?}", severity, types, message);

    vk::FALSE
}

fn create_instance(
    entry: &ash::Entry,
    info: &EngineInfo,
) -> Result<(
    ash::Instance,
    Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
)> {
    let app_name = CString::new(info.app_name.as_str())?;
    let engine_name = CString::new("velka")?;
    let app_info = vk::ApplicationInfo::default()
        .application_name(app_name.as_c_str())
        .application_version(info.app_version.to_vulkan_version())
        .engine_name(engine_name.as_c_str())
        .engine_version(ENGINE_VERSION.to_vulkan_version())
        .api_version(vk::API_VERSION_1_0);

    let mut extension_names = Vec::new();
    if let Some(window) = &info.window {
        extension_names
            .extend(ash_window::enumerate_required_extensions(window.display)?.iter().copied());
    }
    if info.debug {
        extension_names.push(debug_utils::NAME.as_ptr());
    }

    let layer_strings = if info.debug {
        vec![CString::new("VK_LAYER_KHRONOS_validation")?]
    } else {
        Vec::new()
    };
    let layer_names: Vec<*const std::ffi::c_char> =
        layer_strings.iter().map(|s| s.as_ptr()).collect();

    let instance_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names);

    let instance = unsafe {
        entry
            .create_instance(&instance_info, None)
            .context("vkCreateInstance failed")?
    };

    let debug_messenger = if info.debug {
        let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_utils_callback));
        let loader = debug_utils::Instance::new(entry, &instance);
        let messenger =
            unsafe { loader.create_debug_utils_messenger(&messenger_info, None)? };
        Some((loader, messenger))
    } else {
        None
    };

    Ok((instance, debug_messenger))
}

fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let physical_devices = unsafe {
        instance
            .enumerate_physical_devices()
            .context("vkEnumeratePhysicalDevices failed")?
    };

    // select the first physical device
    let physical_device = *physical_devices
        .first()
        .ok_or_else(|| anyhow::anyhow!("no physical devices"))?;

    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
    log::info!("physical device: {:?}", name);

    // warn if vertex formats are unsupported
    use crate::types::VertexFormat;
    for format in [
        VertexFormat::Float,
        VertexFormat::Int,
        VertexFormat::Short,
        VertexFormat::UInt,
        VertexFormat::UShort,
    ] {
        for components in 1..=4 {
            let vk_format = format.to_vulkan_format(components);
            let props =
                unsafe { instance.get_physical_device_format_properties(physical_device, vk_format) };
            if !props
                .buffer_features
                .contains(vk::FormatFeatureFlags::VERTEX_BUFFER)
            {
                log::warn!("unsupported vertex format {:?}", vk_format);
            }
        }
    }

    Ok(physical_device)
}

fn select_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface: Option<(&khr::surface::Instance, vk::SurfaceKHR)>,
) -> Result<(u32, u32)> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    for (index, family) in families.iter().enumerate() {
        let graphics_compute = family
            .queue_flags
            .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
        if !graphics_compute {
            continue;
        }

        if let Some((loader, surface)) = surface {
            let supported = unsafe {
                loader.get_physical_device_surface_support(physical_device, index as u32, surface)
            };
            match supported {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    log::warn!("vkGetPhysicalDeviceSurfaceSupportKHR failed: {err}");
                    continue;
                }
            }
        }

        let queue_count = if family.queue_count > 1 { 2 } else { 1 };
        return Ok((index as u32, queue_count));
    }

    Err(anyhow::anyhow!("no graphics+compute queue family"))
}

fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    queue_count: u32,
    with_swapchain: bool,
    sampler_anisotropy: bool,
) -> Result<ash::Device> {
    let queue_priorities = [1.0f32, 0.5f32];
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family_index)
        .queue_priorities(&queue_priorities[..queue_count as usize]);

    let mut extension_names = Vec::new();
    if with_swapchain {
        extension_names.push(khr::swapchain::NAME.as_ptr());
    }

    let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(sampler_anisotropy);

    let device_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_info))
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = unsafe {
        instance
            .create_device(physical_device, &device_info, None)
            .context("vkCreateDevice failed")?
    };

    Ok(device)
}

fn probe_image_caps(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> [ImageCaps; IMAGE_FORMAT_COUNT] {
    let mut caps_array = [ImageCaps::default(); IMAGE_FORMAT_COUNT];
    for format in ImageFormat::ALL {
        let props = unsafe {
            instance
                .get_physical_device_format_properties(physical_device, format.to_vulkan_format())
        };
        let flags = props.optimal_tiling_features;
        let caps = &mut caps_array[format.index()];

        caps.texture = flags.contains(
            vk::FormatFeatureFlags::SAMPLED_IMAGE | vk::FormatFeatureFlags::TRANSFER_DST,
        );
        caps.mipmap = flags.contains(
            vk::FormatFeatureFlags::SAMPLED_IMAGE
                | vk::FormatFeatureFlags::BLIT_SRC
                | vk::FormatFeatureFlags::BLIT_DST
                | vk::FormatFeatureFlags::TRANSFER_SRC
                | vk::FormatFeatureFlags::TRANSFER_DST,
        );
        caps.filter_linear =
            flags.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR);
        caps.target = flags.contains(vk::FormatFeatureFlags::COLOR_ATTACHMENT);
        caps.target_blend = caps.target
            && flags.contains(vk::FormatFeatureFlags::COLOR_ATTACHMENT_BLEND);
    }
    caps_array
}

fn pipeline_cache_path(internal_path: &Path) -> PathBuf {
    internal_path.join("pipeline.cache")
}

/// Read the persisted pipeline cache, if any. Unreadable or empty files are
/// ignored; the driver validates the header itself.
fn import_pipeline_cache(internal_path: &Path) -> Option<Vec<u8>> {
    let path = pipeline_cache_path(internal_path);
    match std::fs::read(&path) {
        Ok(data) if !data.is_empty() => Some(data),
        Ok(_) => None,
        Err(_) => None,
    }
}

fn create_pipeline_cache(device: &ash::Device, internal_path: &Path) -> Result<vk::PipelineCache> {
    let data = import_pipeline_cache(internal_path).unwrap_or_default();

    let cache_info = vk::PipelineCacheCreateInfo::default().initial_data(&data);
    let created = unsafe { device.create_pipeline_cache(&cache_info, None) };
    match created {
        Ok(cache) => Ok(cache),
        Err(err) => {
            // a corrupt cache is discarded and rebuilt from scratch
            log::warn!("pipeline cache import failed: {err}");
            let empty = vk::PipelineCacheCreateInfo::default();
            Ok(unsafe { device.create_pipeline_cache(&empty, None)? })
        }
    }
}

fn export_pipeline_cache(
    device: &ash::Device,
    pipeline_cache: vk::PipelineCache,
    internal_path: &Path,
) {
    let data = match unsafe { device.get_pipeline_cache_data(pipeline_cache) } {
        Ok(data) if !data.is_empty() => data,
        Ok(_) => return,
        Err(err) => {
            log::warn!("vkGetPipelineCacheData failed: {err}");
            return;
        }
    };

    let path = pipeline_cache_path(internal_path);
    if let Err(err) = std::fs::write(&path, &data) {
        log::warn!("pipeline cache export failed: {err}");
    }
}

impl EngineShared {
    pub(crate) fn device(&self) -> &ash::Device {
        &self.device
    }

    pub(crate) fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub(crate) fn surface_loader(&self) -> Option<&khr::surface::Instance> {
        self.surface_loader.as_ref()
    }

    pub(crate) fn surface(&self) -> vk::SurfaceKHR {
        *self.surface.lock()
    }

    pub(crate) fn swapchain_loader(&self) -> Option<&khr::swapchain::Device> {
        self.swapchain_loader.as_ref()
    }

    pub(crate) fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub(crate) fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    pub(crate) fn msaa_sample_count(&self) -> u32 {
        self.msaa_sample_count
    }

    pub fn max_anisotropy(&self) -> f32 {
        self.max_anisotropy
    }

    pub fn image_caps(&self, format: ImageFormat) -> ImageCaps {
        self.image_caps[format.index()]
    }

    /// Seconds since engine creation. Used as the frame timestamp domain.
    pub(crate) fn timestamp(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub(crate) fn image_count(&self) -> u32 {
        self.image_count.load(Ordering::Relaxed)
    }

    pub(crate) fn set_image_count(&self, count: u32) {
        self.image_count.store(count, Ordering::Relaxed);
    }

    pub(crate) fn memory_type_index(
        &self,
        mut type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        for i in 0..self.memory_properties.memory_type_count {
            if type_bits & 1 == 1 {
                let property_flags = self.memory_properties.memory_types[i as usize].property_flags;
                if property_flags.contains(flags) {
                    return Some(i);
                }
            }
            type_bits >>= 1;
        }
        None
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.sync.state.lock().shutdown
    }

    /// Submit one command buffer. Refused after shutdown; queue access is
    /// serialized with the shutdown flag.
    pub(crate) fn queue_submit(
        &self,
        queue: QueueId,
        cb: vk::CommandBuffer,
        wait_semaphores: &[vk::Semaphore],
        wait_stages: &[vk::PipelineStageFlags],
        signal_semaphore: Option<vk::Semaphore>,
        fence: vk::Fence,
    ) -> bool {
        let signal = signal_semaphore
            .map(|s| vec![s])
            .unwrap_or_default();
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(wait_stages)
            .command_buffers(std::slice::from_ref(&cb))
            .signal_semaphores(&signal);

        let state = self.sync.state.lock();
        if state.shutdown {
            return false;
        }

        let result = unsafe {
            self.device.queue_submit(
                self.queues[queue.index()],
                std::slice::from_ref(&submit_info),
                fence,
            )
        };
        drop(state);

        if let Err(err) = result {
            log::error!("vkQueueSubmit failed: {err}");
            return false;
        }
        true
    }

    pub(crate) fn queue_wait_idle(&self, queue: QueueId) {
        let state = self.sync.state.lock();
        if !state.shutdown {
            unsafe {
                let _ = self.device.queue_wait_idle(self.queues[queue.index()]);
            }
        }
    }

    pub(crate) fn present(
        &self,
        present_info: &vk::PresentInfoKHR,
    ) -> std::result::Result<bool, vk::Result> {
        let loader = self.swapchain_loader.as_ref().expect("headless present");
        unsafe { loader.queue_present(self.queues[QueueId::Foreground.index()], present_info) }
    }

    pub(crate) fn expired_ts(&self) -> f64 {
        self.sync.state.lock().ts_expired
    }

    /// Advance the expired timestamp and wake anyone waiting on it.
    pub(crate) fn expire_timestamp(&self, ts: f64) {
        let mut state = self.sync.state.lock();
        if ts > state.ts_expired {
            state.ts_expired = ts;
            self.sync.cond.notify_all();
        }
    }

    /// Block until the default renderer expires `ts`. During shutdown the
    /// wait degenerates to one queue-wait-idle.
    pub(crate) fn renderer_wait_for_timestamp(&self, ts: f64) {
        if ts == 0.0 {
            return;
        }

        let mut state = self.sync.state.lock();
        while state.ts_expired < ts {
            if state.shutdown {
                drop(state);
                unsafe {
                    let _ = self
                        .device
                        .queue_wait_idle(self.queues[QueueId::Foreground.index()]);
                }
                return;
            }
            self.sync.cond.wait(&mut state);
        }
    }

    /// Enqueue a destruction object. When the worker is gone the object is
    /// destructed inline, without waiting on the timestamp.
    pub(crate) fn delete_object(&self, object: DestructObject) {
        let tx = self.destruct_tx.lock().clone();
        match tx {
            Some(tx) => {
                if let Err(err) = tx.send(object) {
                    err.into_inner().destruct(self, false);
                }
            }
            None => object.destruct(self, false),
        }
    }

    /// Shader-module cache, keyed by bundle name.
    pub(crate) fn shader_module(&self, name: &str) -> Result<vk::ShaderModule> {
        let mut modules = self.shader_modules.lock();
        if let Some(module) = modules.get(name) {
            return Ok(*module);
        }

        let bytes = self
            .shaders
            .load(name)
            .with_context(|| format!("shader {name:?} not found"))?;
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return Err(anyhow::anyhow!(
                "invalid shader {name:?}, size={}",
                bytes.len()
            ));
        }

        let mut cursor = std::io::Cursor::new(bytes);
        let code = ash::util::read_spv(&mut cursor)?;
        let module_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe {
            self.device
                .create_shader_module(&module_info, None)
                .context("vkCreateShaderModule failed")?
        };

        modules.insert(name.to_owned(), module);
        Ok(module)
    }

    /// Sampler cache, keyed by content equality on `SamplerInfo`.
    pub(crate) fn sampler(&self, info: &SamplerInfo) -> Result<vk::Sampler> {
        let mut samplers = self.samplers.lock();
        if let Some(sampler) = samplers.get(info) {
            return Ok(*sampler);
        }

        // maxLod only clamps the per-texture computed lod; leaving it
        // unclamped lets every mip level be sampled
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(info.mag_filter.to_vulkan_filter())
            .min_filter(info.min_filter.to_vulkan_filter())
            .mipmap_mode(info.mipmap_mode.to_vulkan_mipmap_mode())
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .mip_lod_bias(0.0)
            .anisotropy_enable(info.anisotropy)
            .max_anisotropy(info.max_anisotropy.into_inner())
            .compare_enable(false)
            .compare_op(vk::CompareOp::NEVER)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE)
            .unnormalized_coordinates(false);

        let sampler = unsafe {
            self.device
                .create_sampler(&sampler_info, None)
                .context("vkCreateSampler failed")?
        };

        samplers.insert(*info, sampler);
        Ok(sampler)
    }

    /// Generate the mip chain of `image` by iterated blits. The base level
    /// must be in TRANSFER_SRC layout on entry; every level ends in
    /// TRANSFER_SRC.
    pub(crate) fn mipmap_image(&self, image: &Image, cb: vk::CommandBuffer) {
        use crate::barrier::image_memory_barrier;

        image_memory_barrier(
            &self.device,
            cb,
            image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            0,
            1,
        );
        image_memory_barrier(
            &self.device,
            cb,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            1,
            image.mip_levels - 1,
        );

        let filter = if self.image_caps(image.format).filter_linear {
            vk::Filter::LINEAR
        } else {
            vk::Filter::NEAREST
        };

        let extent = |value: u32, level: u32| ((value >> level).max(1)) as i32;

        for level in 1..image.mip_levels {
            let blit = vk::ImageBlit::default()
                .src_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(level - 1)
                        .base_array_layer(0)
                        .layer_count(1),
                )
                .src_offsets([
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: extent(image.width, level - 1),
                        y: extent(image.height, level - 1),
                        z: extent(image.depth, level - 1),
                    },
                ])
                .dst_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(level)
                        .base_array_layer(0)
                        .layer_count(1),
                )
                .dst_offsets([
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: extent(image.width, level),
                        y: extent(image.height, level),
                        z: extent(image.depth, level),
                    },
                ]);

            unsafe {
                self.device.cmd_blit_image(
                    cb,
                    image.handle,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image.handle,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    std::slice::from_ref(&blit),
                    filter,
                );
            }

            image_memory_barrier(
                &self.device,
                cb,
                image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                level,
                1,
            );
        }
    }
}

impl Drop for EngineShared {
    fn drop(&mut self) {
        unsafe {
            for (_, sampler) in self.samplers.lock().drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, module) in self.shader_modules.lock().drain() {
                self.device.destroy_shader_module(module, None);
            }

            export_pipeline_cache(&self.device, self.pipeline_cache, &self.internal_path);
            self.device.destroy_pipeline_cache(self.pipeline_cache, None);

            let this: &EngineShared = self;
            this.xfer.destroy(this);
            this.downloader.destroy(this);

            self.mm.destroy(&self.device);

            self.device.destroy_device(None);

            let surface = *self.surface.lock();
            if let (Some(loader), false) = (&self.surface_loader, surface == vk::SurfaceKHR::null())
            {
                loader.destroy_surface(surface, None);
            }

            if let Some((loader, messenger)) = &self.debug_messenger {
                loader.destroy_debug_utils_messenger(*messenger, None);
            }

            self.instance.destroy_instance(None);
        }
        log::trace!("engine dropped");
    }
}

impl Engine {
    pub fn new(info: EngineInfo) -> Result<Engine> {
        let entry = unsafe { ash::Entry::load().context("failed to load Vulkan")? };

        let (instance, debug_messenger) = create_instance(&entry, &info)?;

        let (surface_loader, surface) = match &info.window {
            Some(window) => {
                let loader = khr::surface::Instance::new(&entry, &instance);
                let surface = unsafe {
                    ash_window::create_surface(
                        &entry,
                        &instance,
                        window.display,
                        window.window,
                        None,
                    )
                    .context("surface creation failed")?
                };
                (Some(loader), surface)
            }
            None => (None, vk::SurfaceKHR::null()),
        };

        let physical_device = select_physical_device(&instance)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let features = unsafe { instance.get_physical_device_features(physical_device) };

        let max_anisotropy = if features.sampler_anisotropy == vk::TRUE {
            properties.limits.max_sampler_anisotropy
        } else {
            0.0
        };

        let msaa_sample_count = if info.disable_msaa {
            1
        } else {
            let counts = properties.limits.framebuffer_color_sample_counts
                & properties.limits.framebuffer_depth_sample_counts;
            if counts.contains(vk::SampleCountFlags::TYPE_4) {
                4
            } else {
                1
            }
        };

        let (queue_family_index, queue_count) = select_queue_family(
            &instance,
            physical_device,
            surface_loader.as_ref().map(|loader| (loader, surface)),
        )?;

        let device = create_device(
            &instance,
            physical_device,
            queue_family_index,
            queue_count,
            info.window.is_some(),
            max_anisotropy > 0.0,
        )?;

        let queue_foreground = unsafe { device.get_device_queue(queue_family_index, 0) };
        let queue_background = if queue_count > 1 {
            // multiple queues are desired for priority-based scheduling of
            // rendering tasks
            unsafe { device.get_device_queue(queue_family_index, 1) }
        } else {
            log::warn!("device only supports a single queue");
            queue_foreground
        };

        let swapchain_loader = info
            .window
            .as_ref()
            .map(|_| khr::swapchain::Device::new(&instance, &device));

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let pipeline_cache = create_pipeline_cache(&device, &info.internal_path)?;

        let image_caps = probe_image_caps(&instance, physical_device);

        let shared = Arc::new(EngineShared {
            version: ENGINE_VERSION,
            app_name: info.app_name,
            app_version: info.app_version,
            internal_path: info.internal_path,
            entry,
            instance,
            debug_messenger,
            surface_loader,
            surface: Mutex::new(surface),
            physical_device,
            memory_properties,
            device,
            swapchain_loader,
            queue_family_index,
            queues: [queue_foreground, queue_background],
            max_anisotropy,
            msaa_sample_count,
            image_caps,
            pipeline_cache,
            shaders: info.shaders,
            shader_modules: Mutex::new(HashMap::new()),
            samplers: Mutex::new(HashMap::new()),
            mm: MemoryManager::new(),
            xfer: TransferManager::new(),
            downloader: ImageDownloader::new(),
            sync: RendererSync {
                state: Mutex::new(SyncState {
                    shutdown: false,
                    ts_expired: 0.0,
                }),
                cond: Condvar::new(),
            },
            destruct_tx: Mutex::new(None),
            image_count: AtomicU32::new(1),
            epoch: std::time::Instant::now(),
        });

        let default_renderer = if info.window.is_some() {
            Some(Renderer::new_default(shared.clone())?)
        } else {
            None
        };

        let (tx, rx): (Sender<DestructObject>, Receiver<DestructObject>) =
            crossbeam_channel::unbounded();
        *shared.destruct_tx.lock() = Some(tx);

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("velka-destruct".into())
            .spawn(move || {
                while let Ok(object) = rx.recv() {
                    object.destruct(&worker_shared, true);
                }
            })
            .context("failed to spawn destruction worker")?;

        Ok(Engine {
            shared,
            default_renderer,
            worker: Some(worker),
            window: info.window,
        })
    }

    pub fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    /// Library version triple.
    pub fn version(&self) -> Version {
        self.shared.version
    }

    /// Application name and version given at creation.
    pub fn app_info(&self) -> (&str, Version) {
        (&self.shared.app_name, self.shared.app_version)
    }

    pub fn image_caps(&self, format: ImageFormat) -> ImageCaps {
        self.shared.image_caps(format)
    }

    pub fn max_anisotropy(&self) -> f32 {
        self.shared.max_anisotropy()
    }

    pub fn memory_info(&self) -> MemoryInfo {
        self.shared.mm.memory_info()
    }

    pub fn default_renderer(&self) -> Option<&Arc<Renderer>> {
        self.default_renderer.as_ref()
    }

    /// Swapchain image count; one when headless.
    pub fn image_count(&self) -> u32 {
        self.shared.image_count()
    }

    /// Cooperative shutdown: wait for the device to go idle, raise the
    /// shutdown flag, and refuse further submits and transfers.
    pub fn shutdown(&self) {
        let mut state = self.shared.sync.state.lock();
        if !state.shutdown {
            unsafe {
                let _ = self.shared.device.device_wait_idle();
            }
            state.shutdown = true;
            self.shared.sync.cond.notify_all();
            drop(state);

            self.shared.mm.shutdown();
            self.shared.xfer.shutdown();
            self.shared.downloader.shutdown();
        }
    }

    /// Wait for the device to go idle and expire every in-flight frame.
    pub fn device_wait_idle(&self) {
        match &self.default_renderer {
            Some(renderer) => renderer.device_wait_idle(),
            None => unsafe {
                let _ = self.shared.device.device_wait_idle();
            },
        }
    }

    /// Rebuild the surface and every swapchain-dependent resource. Used when
    /// the platform reports a lost surface.
    pub fn recreate(&self) -> Result<()> {
        let (renderer, window) = match (&self.default_renderer, &self.window) {
            (Some(renderer), Some(window)) => (renderer, window),
            _ => return Ok(()),
        };

        unsafe {
            let _ = self.shared.device.device_wait_idle();
        }

        renderer.destroy_swapchain_state();

        let loader = self
            .shared
            .surface_loader
            .as_ref()
            .expect("recreate without surface");
        unsafe {
            loader.destroy_surface(self.shared.surface(), None);
        }

        let surface = unsafe {
            ash_window::create_surface(
                &self.shared.entry,
                &self.shared.instance,
                window.display,
                window.window,
                None,
            )
            .context("surface creation failed")?
        };
        *self.shared.surface.lock() = surface;

        renderer.rebuild_swapchain_state()
    }

    pub fn new_buffer(
        &self,
        update: UpdateMode,
        usage: BufferUsage,
        size: usize,
        seed: Option<&[u8]>,
    ) -> Result<Arc<Buffer>> {
        Buffer::new(self.shared.clone(), update, usage, size, seed)
    }

    pub fn new_image(
        &self,
        width: u32,
        height: u32,
        depth: u32,
        format: ImageFormat,
        mipmap: bool,
        stage: Stage,
        pixels: Option<&[u8]>,
    ) -> Result<Arc<Image>> {
        Image::new(
            self.shared.clone(),
            width,
            height,
            depth,
            format,
            mipmap,
            stage,
            pixels,
        )
    }

    pub fn new_uniform_set_factory(
        &self,
        update: UpdateMode,
        bindings: &[UniformBinding],
    ) -> Result<Arc<UniformSetFactory>> {
        UniformSetFactory::new(self.shared.clone(), update, bindings)
    }

    pub fn new_uniform_set(
        &self,
        set: u32,
        attachments: Vec<UniformAttachment>,
        factory: &Arc<UniformSetFactory>,
    ) -> Result<Arc<UniformSet>> {
        UniformSet::new(self.shared.clone(), set, attachments, factory)
    }

    pub fn new_pipeline_layout(
        &self,
        factories: &[Arc<UniformSetFactory>],
    ) -> Result<Arc<PipelineLayout>> {
        PipelineLayout::new(self.shared.clone(), factories)
    }

    pub fn new_graphics_pipeline(
        &self,
        info: GraphicsPipelineInfo,
    ) -> Result<Arc<GraphicsPipeline>> {
        GraphicsPipeline::new(self.shared.clone(), info)
    }

    pub fn new_compute_pipeline(&self, info: ComputePipelineInfo) -> Result<Arc<ComputePipeline>> {
        ComputePipeline::new(self.shared.clone(), info)
    }

    pub fn new_image_renderer(
        &self,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> Result<Arc<Renderer>> {
        Renderer::new_image(self.shared.clone(), width, height, format)
    }

    pub fn new_image_stream_renderer(
        &self,
        consumer: &Arc<Renderer>,
        width: u32,
        height: u32,
        format: ImageFormat,
        mipmap: bool,
        stage: Stage,
    ) -> Result<Arc<Renderer>> {
        Renderer::new_image_stream(consumer.clone(), width, height, format, mipmap, stage)
    }

    pub fn new_secondary_renderer(&self, executor: &Arc<Renderer>) -> Result<Arc<Renderer>> {
        Renderer::new_secondary(executor.clone())
    }

    pub fn new_compute(&self) -> Result<Arc<Compute>> {
        Compute::new(self.shared.clone())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();

        // disconnecting the channel drains and stops the worker; objects in
        // the queue may depend on the default renderer, which outlives them
        *self.shared.destruct_tx.lock() = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        if let Some(renderer) = self.default_renderer.take() {
            renderer.destroy_default();
        }
    }
}

/// Vulkan's required floor for `maxBoundDescriptorSets`.
pub(crate) const MAX_BOUND_USF: usize = 4;

/// Descriptor pools grow in quanta of this many sets.
pub(crate) const DESCRIPTOR_POOL_SIZE: u32 = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_cell_round_trips() {
        let cell = TsCell::new();
        assert_eq!(cell.get(), 0.0);
        cell.set(1234.5);
        assert_eq!(cell.get(), 1234.5);
    }

    #[test]
    fn version_packs() {
        let v = Version::new(1, 2, 3);
        assert_eq!(v.to_vulkan_version(), vk::make_api_version(0, 1, 2, 3));
    }

    #[test]
    fn pipeline_cache_import_ignores_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(import_pipeline_cache(dir.path()).is_none());

        std::fs::write(pipeline_cache_path(dir.path()), b"").unwrap();
        assert!(import_pipeline_cache(dir.path()).is_none());

        std::fs::write(pipeline_cache_path(dir.path()), b"cache-bytes").unwrap();
        assert_eq!(
            import_pipeline_cache(dir.path()).as_deref(),
            Some(&b"cache-bytes"[..])
        );
    }
}
