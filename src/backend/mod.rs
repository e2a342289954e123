// Backend module - Vulkan abstraction layer
//
// Design: thin wrapper around ash with safety and ergonomics
// Performance: zero-cost abstractions, explicit control

pub mod barrier;
pub mod device;
pub mod frame;
pub mod immediate;
pub mod mesh;
pub mod pipeline;
pub mod resources;
pub mod shader;
pub mod swapchain;

pub use device::RenderDevice;
pub use frame::{FrameRing, FRAMES_IN_FLIGHT};
pub use immediate::ImmediateExecutor;
pub use swapchain::Swapchain;
