//! A thin, safe-by-convention layer over Vulkan.
//!
//! The [`Engine`] owns the instance, device, queues, caches and the deferred
//! destruction worker. Renderers are created against the engine and record
//! between `begin` and `end`; resources are `Arc` handles whose destruction
//! is deferred until the GPU has retired the last frame that used them.

pub mod barrier;
pub mod buffer;
pub mod command;
pub mod compute;
pub mod download;
pub mod engine;
pub mod image;
pub mod memory;
pub mod pipeline;
pub mod renderer;
pub mod transfer;
pub mod types;
pub mod uniform;

pub use buffer::Buffer;
pub use compute::Compute;
pub use engine::{Engine, EngineInfo, ShaderBundle, Version, WindowHandles};
pub use image::Image;
pub use pipeline::{ComputePipeline, GraphicsPipeline, PipelineLayout};
pub use renderer::Renderer;
pub use types::{
    BlendMode, BufferUsage, ComputePipelineInfo, GraphicsPipelineInfo, Hazard, ImageCaps,
    ImageFormat, IndexType, Primitive, QueueId, RendererMode, RendererType, SamplerInfo, Stage,
    UniformBinding, UniformType, UpdateMode, VertexBufferInfo, VertexFormat,
};
pub use uniform::{UniformAttachment, UniformResource, UniformSet, UniformSetFactory};

/// External dependencies exposed outside of current crate.
pub use ash::{self, vk};
pub use raw_window_handle;
