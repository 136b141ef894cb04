//! Kestrel soak test.
//!
//! Runs the frame ring on the headless device for a number of frames while
//! injecting stale swapchains, resizes and resource retirement, then reports
//! the device counters.
//!
//! Usage: `kestrel-soak [frames]`, or set `KESTREL_SOAK_FRAMES`.

use anyhow::Context;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use kestrel_gpu::{
    headless_context, DescriptorBuilder, FrameBindings, FrameRing, FrameSetup, GpuConfig,
    HeadlessTarget,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_FRAMES: u64 = 600;
const SWAPCHAIN_IMAGES: u32 = 3;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FrameUniforms {
    time: f32,
    frame: u32,
    _pad: [u32; 2],
}

fn frame_count() -> anyhow::Result<u64> {
    let arg = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("KESTREL_SOAK_FRAMES").ok());
    match arg {
        Some(value) => value
            .parse()
            .with_context(|| format!("Invalid frame count: {value}")),
        None => Ok(DEFAULT_FRAMES),
    }
}

fn init_frame(setup: FrameSetup<'_>) -> kestrel_gpu::Result<FrameBindings> {
    let uniforms = setup
        .memory
        .allocate_uniform_buffer(std::mem::size_of::<FrameUniforms>() as vk::DeviceSize)?;
    let set = DescriptorBuilder::begin(setup.layout_cache, setup.descriptors)
        .bind_buffer(
            0,
            uniforms.descriptor_info(),
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        )
        .build()?;
    Ok(FrameBindings {
        uniform_buffers: vec![uniforms],
        descriptor_sets: vec![set],
    })
}

fn run(frames: u64) -> anyhow::Result<()> {
    let (device, ctx) = headless_context(GpuConfig::new("kestrel-soak"))?;
    let mut ring = FrameRing::new(&ctx, init_frame)?;
    let mut target = HeadlessTarget::new(device.clone(), SWAPCHAIN_IMAGES);

    info!(
        "Running {} frames with {} frames in flight",
        frames,
        ring.frames_in_flight()
    );

    for i in 0..frames {
        if i % 97 == 96 {
            device.expire_swapchain_on_acquire(1);
        }
        if i % 131 == 130 {
            target.request_resize();
        }

        let token = ring.begin_frame(&mut target)?;

        let uniforms = &ring.frame(&token).uniform_buffers[0];
        uniforms.update_pod(
            &FrameUniforms {
                time: i as f32 / 60.0,
                frame: i as u32,
                _pad: [0; 2],
            },
            0,
        )?;
        let info = uniforms.descriptor_info();
        DescriptorBuilder::begin(
            ctx.layout_cache(),
            &mut ring.frame_mut(&token).transient_descriptors,
        )
        .bind_buffer(
            0,
            info,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::FRAGMENT,
        )
        .build()?;

        ring.submit(&token)?;
        ring.present(&token, &mut target)?;

        if i % 50 == 0 {
            ring.retire(ctx.memory().allocate_vertex_buffer(4096)?);
        }
        ring.advance();
    }

    ring.shutdown()?;

    let frame_stats = ring.stats();
    let device_stats = device.stats();
    info!(
        "Submitted {} frames, presented {}, rebuilt target {} times",
        frame_stats.frames_submitted, frame_stats.frames_presented, frame_stats.target_rebuilds
    );
    info!(
        "Descriptor pools: {} created, {} resets; command buffers allocated: {}",
        device_stats.descriptor_pools_created,
        device_stats.descriptor_pool_resets,
        device_stats.command_buffers_allocated
    );
    info!(
        "Live resources: {} buffers, {} images",
        device_stats.buffers_alive, device_stats.images_alive
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Kestrel soak test starting...");
    let frames = frame_count()?;

    if let Err(e) = run(frames) {
        error!("Soak test failed: {e:#}");
        return Err(e);
    }
    info!("Soak test finished");
    Ok(())
}
