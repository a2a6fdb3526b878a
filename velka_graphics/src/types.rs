use std::sync::Arc;

use ash::vk;
use ordered_float::OrderedFloat;

use crate::{pipeline::PipelineLayout, renderer::Renderer};

/// How a resource's contents may change after creation.
///
/// `Static` resources are uploaded once. `Synchronous` resources may be
/// re-uploaded from off-screen or compute contexts, which wait for the GPU
/// before returning. `Asynchronous` resources are re-uploaded per swapchain
/// frame from the default renderer and are replicated once per swapchain
/// image so a CPU write cannot race an in-flight GPU read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateMode {
    Static,
    Synchronous,
    Asynchronous,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    Uniform,
    Vertex,
    Index,
    Storage,
}

impl BufferUsage {
    pub(crate) fn to_vulkan_usage(self) -> vk::BufferUsageFlags {
        match self {
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            Self::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            Self::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            // storage buffers live in device memory and are filled or read
            // back through the transfer manager
            Self::Storage => {
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST
            }
        }
    }
}

/// Texel formats understood by the image wrapper.
///
/// The F16 formats are paired with an F32 sibling because host code supplies
/// F32 pixels; uploads convert on the GPU by blitting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Rgba8888,
    Rgba4444,
    RgbaF32,
    RgbaF16,
    Rgb888,
    Rgb565,
    RgbF32,
    RgbF16,
    Rg88,
    RgF32,
    RgF16,
    R8,
    RF32,
    RF16,
    Depth1x,
    Depth4x,
}

pub const IMAGE_FORMAT_COUNT: usize = 16;

impl ImageFormat {
    pub const ALL: [ImageFormat; IMAGE_FORMAT_COUNT] = [
        Self::Rgba8888,
        Self::Rgba4444,
        Self::RgbaF32,
        Self::RgbaF16,
        Self::Rgb888,
        Self::Rgb565,
        Self::RgbF32,
        Self::RgbF16,
        Self::Rg88,
        Self::RgF32,
        Self::RgF16,
        Self::R8,
        Self::RF32,
        Self::RF16,
        Self::Depth1x,
        Self::Depth4x,
    ];

    pub(crate) fn index(self) -> usize {
        Self::ALL.iter().position(|f| *f == self).unwrap()
    }

    pub(crate) fn to_vulkan_format(self) -> vk::Format {
        match self {
            Self::Rgba8888 => vk::Format::R8G8B8A8_UNORM,
            Self::Rgba4444 => vk::Format::R4G4B4A4_UNORM_PACK16,
            Self::RgbaF32 => vk::Format::R32G32B32A32_SFLOAT,
            Self::RgbaF16 => vk::Format::R16G16B16A16_SFLOAT,
            Self::Rgb888 => vk::Format::R8G8B8_UNORM,
            Self::Rgb565 => vk::Format::R5G6B5_UNORM_PACK16,
            Self::RgbF32 => vk::Format::R32G32B32_SFLOAT,
            Self::RgbF16 => vk::Format::R16G16B16_SFLOAT,
            Self::Rg88 => vk::Format::R8G8_UNORM,
            Self::RgF32 => vk::Format::R32G32_SFLOAT,
            Self::RgF16 => vk::Format::R16G16_SFLOAT,
            Self::R8 => vk::Format::R8_UNORM,
            Self::RF32 => vk::Format::R32_SFLOAT,
            Self::RF16 => vk::Format::R16_SFLOAT,
            Self::Depth1x | Self::Depth4x => vk::Format::D24_UNORM_S8_UINT,
        }
    }

    /// Bytes per texel as the host provides them. F16 formats take F32 input
    /// so they report the F32 size.
    pub fn bytes_per_texel(self) -> usize {
        match self {
            Self::Rgba8888 => 4,
            Self::Rgba4444 => 2,
            Self::RgbaF32 => 16,
            Self::RgbaF16 => 16,
            Self::Rgb888 => 3,
            Self::Rgb565 => 2,
            Self::RgbF32 => 12,
            Self::RgbF16 => 12,
            Self::Rg88 => 2,
            Self::RgF32 => 8,
            Self::RgF16 => 8,
            Self::R8 => 1,
            Self::RF32 => 4,
            Self::RF16 => 4,
            Self::Depth1x | Self::Depth4x => 4,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Self::Depth1x | Self::Depth4x)
    }

    pub(crate) fn is_f16(self) -> bool {
        matches!(self, Self::RgbaF16 | Self::RgbF16 | Self::RgF16 | Self::RF16)
    }

    /// The F32 sibling used as the upload intermediate for F16 formats.
    pub(crate) fn f32_variant(self) -> ImageFormat {
        match self {
            Self::RgbaF16 => Self::RgbaF32,
            Self::RgbF16 => Self::RgbF32,
            Self::RgF16 => Self::RgF32,
            Self::RF16 => Self::RF32,
            other => other,
        }
    }
}

/// Pipeline stage where a resource is consumed. Determines shader stage
/// flags for descriptor bindings and the stage bits used in barriers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Depth,
    Vertex,
    Fragment,
    VertexFragment,
    Compute,
}

impl Stage {
    pub(crate) fn to_vulkan_shader_stage_flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Depth => vk::ShaderStageFlags::empty(),
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
            Self::VertexFragment => {
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
            }
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    pub(crate) fn to_vulkan_pipeline_stage_flags(self) -> vk::PipelineStageFlags {
        match self {
            Self::Depth => vk::PipelineStageFlags::empty(),
            Self::Vertex => vk::PipelineStageFlags::VERTEX_SHADER,
            Self::Fragment => vk::PipelineStageFlags::FRAGMENT_SHADER,
            Self::VertexFragment => {
                vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER
            }
            Self::Compute => vk::PipelineStageFlags::COMPUTE_SHADER,
        }
    }
}

/// Descriptor binding classes. The `*Ref` variants use the same descriptor
/// type as their plain counterpart but are (re)written per frame through
/// `update_uniform_set_refs` instead of once at set construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UniformType {
    Buffer,
    Storage,
    Image,
    BufferRef,
    StorageRef,
    ImageRef,
}

pub const UNIFORM_TYPE_COUNT: usize = 6;

impl UniformType {
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Buffer => 0,
            Self::Storage => 1,
            Self::Image => 2,
            Self::BufferRef => 3,
            Self::StorageRef => 4,
            Self::ImageRef => 5,
        }
    }

    pub(crate) fn to_vulkan_descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::Buffer | Self::BufferRef => vk::DescriptorType::UNIFORM_BUFFER,
            Self::Storage | Self::StorageRef => vk::DescriptorType::STORAGE_BUFFER,
            Self::Image | Self::ImageRef => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        }
    }

    pub(crate) fn is_ref(self) -> bool {
        matches!(self, Self::BufferRef | Self::StorageRef | Self::ImageRef)
    }

    pub(crate) fn is_buffer_like(self) -> bool {
        matches!(
            self,
            Self::Buffer | Self::Storage | Self::BufferRef | Self::StorageRef
        )
    }

    pub(crate) fn is_image_like(self) -> bool {
        matches!(self, Self::Image | Self::ImageRef)
    }
}

/// Producer/consumer dependency class for compute dispatches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hazard {
    None,
    ReadAfterWrite,
    WriteAfterRead,
    Any,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueId {
    Foreground,
    Background,
}

impl QueueId {
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Foreground => 0,
            Self::Background => 1,
        }
    }
}

/// `Draw` records draw commands inline; `Execute` records only
/// `execute` calls replaying secondary command buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RendererMode {
    Draw,
    Execute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RendererType {
    Default,
    Image,
    ImageStream,
    Secondary,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendMode {
    Disabled,
    Transparency,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Primitive {
    TriangleList,
    TriangleStrip,
    TriangleFan,
}

impl Primitive {
    pub(crate) fn to_vulkan_topology(self) -> vk::PrimitiveTopology {
        match self {
            Self::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            Self::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            Self::TriangleFan => vk::PrimitiveTopology::TRIANGLE_FAN,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    UShort,
    UInt,
}

impl IndexType {
    pub(crate) fn to_vulkan_index_type(self) -> vk::IndexType {
        match self {
            Self::UShort => vk::IndexType::UINT16,
            Self::UInt => vk::IndexType::UINT32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexFormat {
    Float,
    Int,
    Short,
    UInt,
    UShort,
}

impl VertexFormat {
    /// Vulkan format for `components` elements of this scalar type.
    /// `components` must be in `1..=4`.
    pub(crate) fn to_vulkan_format(self, components: u32) -> vk::Format {
        use vk::Format;
        let map: [Format; 4] = match self {
            Self::Float => [
                Format::R32_SFLOAT,
                Format::R32G32_SFLOAT,
                Format::R32G32B32_SFLOAT,
                Format::R32G32B32A32_SFLOAT,
            ],
            Self::Int => [
                Format::R32_SINT,
                Format::R32G32_SINT,
                Format::R32G32B32_SINT,
                Format::R32G32B32A32_SINT,
            ],
            Self::Short => [
                Format::R16_SINT,
                Format::R16G16_SINT,
                Format::R16G16B16_SINT,
                Format::R16G16B16A16_SINT,
            ],
            Self::UInt => [
                Format::R32_UINT,
                Format::R32G32_UINT,
                Format::R32G32B32_UINT,
                Format::R32G32B32A32_UINT,
            ],
            Self::UShort => [
                Format::R16_UINT,
                Format::R16G16_UINT,
                Format::R16G16B16_UINT,
                Format::R16G16B16A16_UINT,
            ],
        };
        map[(components - 1) as usize]
    }

    /// Byte size of one attribute with `components` elements.
    pub(crate) fn attribute_size(self, components: u32) -> u32 {
        let scalar = match self {
            Self::Float | Self::Int | Self::UInt => 4,
            Self::Short | Self::UShort => 2,
        };
        scalar * components
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SamplerFilter {
    Nearest,
    Linear,
}

impl SamplerFilter {
    pub(crate) fn to_vulkan_filter(self) -> vk::Filter {
        match self {
            Self::Nearest => vk::Filter::NEAREST,
            Self::Linear => vk::Filter::LINEAR,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SamplerMipmapMode {
    Nearest,
    Linear,
}

impl SamplerMipmapMode {
    pub(crate) fn to_vulkan_mipmap_mode(self) -> vk::SamplerMipmapMode {
        match self {
            Self::Nearest => vk::SamplerMipmapMode::NEAREST,
            Self::Linear => vk::SamplerMipmapMode::LINEAR,
        }
    }
}

/// Value key for the engine's sampler cache. Two bindings requesting equal
/// `SamplerInfo` share one `VkSampler`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerInfo {
    pub min_filter: SamplerFilter,
    pub mag_filter: SamplerFilter,
    pub mipmap_mode: SamplerMipmapMode,
    pub anisotropy: bool,
    pub max_anisotropy: OrderedFloat<f32>,
}

impl SamplerInfo {
    pub fn new(
        min_filter: SamplerFilter,
        mag_filter: SamplerFilter,
        mipmap_mode: SamplerMipmapMode,
    ) -> Self {
        Self {
            min_filter,
            mag_filter,
            mipmap_mode,
            anisotropy: false,
            max_anisotropy: OrderedFloat(1.0),
        }
    }

    pub fn with_anisotropy(mut self, max_anisotropy: f32) -> Self {
        self.anisotropy = true;
        self.max_anisotropy = OrderedFloat(max_anisotropy);
        self
    }
}

/// Factory-side description of one descriptor binding.
#[derive(Clone, Debug)]
pub struct UniformBinding {
    pub binding: u32,
    pub uniform_type: UniformType,
    pub stage: Stage,
    /// Required for `Image`/`ImageRef` bindings.
    pub sampler: Option<SamplerInfo>,
}

/// Per-format capability bits probed from the physical device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImageCaps {
    pub texture: bool,
    pub mipmap: bool,
    pub filter_linear: bool,
    pub target: bool,
    pub target_blend: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct VertexBufferInfo {
    pub location: u32,
    pub components: u32,
    pub format: VertexFormat,
}

pub struct GraphicsPipelineInfo {
    /// Renderer whose render pass and sample count the pipeline targets.
    pub renderer: Arc<Renderer>,
    pub pipeline_layout: Arc<PipelineLayout>,
    /// Shader-bundle names of the vertex and fragment modules.
    pub vs: String,
    pub fs: String,
    pub vertex_buffers: Vec<VertexBufferInfo>,
    pub primitive: Primitive,
    pub primitive_restart: bool,
    pub cull_back: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub blend_mode: BlendMode,
}

pub struct ComputePipelineInfo {
    pub pipeline_layout: Arc<PipelineLayout>,
    /// Shader-bundle name of the compute module.
    pub cs: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_format_map_is_total() {
        for format in ImageFormat::ALL {
            assert_ne!(format.to_vulkan_format(), vk::Format::UNDEFINED);
            assert!(format.bytes_per_texel() > 0);
        }
        assert_eq!(ImageFormat::ALL.len(), IMAGE_FORMAT_COUNT);
    }

    #[test]
    fn image_format_indices_are_stable() {
        for (i, format) in ImageFormat::ALL.iter().enumerate() {
            assert_eq!(format.index(), i);
        }
    }

    #[test]
    fn f16_formats_pair_with_f32_siblings() {
        assert_eq!(ImageFormat::RgbaF16.f32_variant(), ImageFormat::RgbaF32);
        assert_eq!(ImageFormat::RgbF16.f32_variant(), ImageFormat::RgbF32);
        assert_eq!(ImageFormat::RgF16.f32_variant(), ImageFormat::RgF32);
        assert_eq!(ImageFormat::RF16.f32_variant(), ImageFormat::RF32);
        // non-F16 formats are their own variant
        assert_eq!(ImageFormat::Rgba8888.f32_variant(), ImageFormat::Rgba8888);
        for format in ImageFormat::ALL {
            if format.is_f16() {
                // the intermediate accepts the same host bytes
                assert_eq!(
                    format.bytes_per_texel(),
                    format.f32_variant().bytes_per_texel()
                );
            }
        }
    }

    #[test]
    fn depth_formats() {
        assert!(ImageFormat::Depth1x.is_depth());
        assert!(ImageFormat::Depth4x.is_depth());
        assert!(!ImageFormat::Rgba8888.is_depth());
    }

    #[test]
    fn ref_types_share_descriptor_types() {
        assert_eq!(
            UniformType::Buffer.to_vulkan_descriptor_type(),
            UniformType::BufferRef.to_vulkan_descriptor_type()
        );
        assert_eq!(
            UniformType::Storage.to_vulkan_descriptor_type(),
            UniformType::StorageRef.to_vulkan_descriptor_type()
        );
        assert_eq!(
            UniformType::Image.to_vulkan_descriptor_type(),
            UniformType::ImageRef.to_vulkan_descriptor_type()
        );
        assert!(UniformType::BufferRef.is_ref());
        assert!(!UniformType::Buffer.is_ref());
    }

    #[test]
    fn vertex_format_sizes() {
        assert_eq!(VertexFormat::Float.attribute_size(3), 12);
        assert_eq!(VertexFormat::Short.attribute_size(2), 4);
        assert_eq!(VertexFormat::UInt.attribute_size(1), 4);
        assert_eq!(
            VertexFormat::Float.to_vulkan_format(4),
            vk::Format::R32G32B32A32_SFLOAT
        );
        assert_eq!(
            VertexFormat::UShort.to_vulkan_format(2),
            vk::Format::R16G16_UINT
        );
    }

    #[test]
    fn sampler_info_value_equality() {
        let a = SamplerInfo::new(
            SamplerFilter::Linear,
            SamplerFilter::Linear,
            SamplerMipmapMode::Linear,
        );
        let b = SamplerInfo::new(
            SamplerFilter::Linear,
            SamplerFilter::Linear,
            SamplerMipmapMode::Linear,
        );
        assert_eq!(a, b);
        let c = b.with_anisotropy(16.0);
        assert_ne!(a, c);
        assert_eq!(c, c.clone());
    }
}
