//! Vulkan resource lifecycle and command submission core.
//!
//! This crate provides:
//! - Buffer and image allocation via gpu-allocator
//! - Recycled command pools and one-time command submission
//! - Descriptor pool rotation, a layout cache and a set builder
//! - Fences, semaphores and a frames-in-flight ring
//! - Deferred destruction of resources still referenced by the device
//!
//! Every object talks to the device through [`RawDevice`]. [`VulkanDevice`]
//! drives a real `ash::Device`; with the `headless` feature,
//! [`HeadlessDevice`](headless::HeadlessDevice) simulates one on the CPU.

pub mod barrier;
pub mod buffer;
pub mod command;
pub mod config;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod frame;
#[cfg(any(test, feature = "headless"))]
pub mod headless;
pub mod image;
pub mod memory;
pub mod sync;
pub mod vulkan;

pub use barrier::LayoutTransition;
pub use buffer::Buffer;
pub use command::{CommandBuffer, CommandBufferId, CommandPool, ResetStrategy};
pub use config::GpuConfig;
#[cfg(any(test, feature = "headless"))]
pub use context::headless_context;
pub use context::{GpuContext, GpuContextBuilder};
pub use deferred::{DeferredDeletionQueue, DeferredResource};
pub use descriptors::{
    DescriptorAllocation, DescriptorAllocator, DescriptorBuilder, DescriptorLayoutCache,
    PoolSizeFactor,
};
pub use device::{RawDevice, SharedDevice, SubmitBatch};
pub use error::{ErrorSeverity, GpuError, Result};
#[cfg(any(test, feature = "headless"))]
pub use frame::HeadlessTarget;
pub use frame::{FrameBindings, FrameResource, FrameRing, FrameSetup, FrameStats, FrameToken, PresentTarget};
pub use image::{Image, ImageMeta, ImageResource, ImageView, ImageViewDesc};
pub use memory::{Allocation, BufferDesc, DeviceMemoryAllocator, MemoryUsage};
pub use sync::{Fence, FenceStatus, Semaphore};
pub use vulkan::VulkanDevice;
