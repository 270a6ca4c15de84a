// GPU memory allocator
//
// gpu-allocator needs `&mut` access, so it lives behind a mutex. All access
// happens from the single driving thread; the lock is never contended.
// The allocator is taken out before the logical device is destroyed.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Where a resource's memory comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AllocationKind {
    /// Sub-allocated from the allocator's shared memory blocks
    #[default]
    Shared,
    /// A driver allocation of its own, bound to exactly one resource
    Dedicated,
}

impl AllocationKind {
    pub(crate) fn buffer_scheme(self, buffer: vk::Buffer) -> AllocationScheme {
        match self {
            Self::Shared => AllocationScheme::GpuAllocatorManaged,
            Self::Dedicated => AllocationScheme::DedicatedBuffer(buffer),
        }
    }

    pub(crate) fn image_scheme(self, image: vk::Image) -> AllocationScheme {
        match self {
            Self::Shared => AllocationScheme::GpuAllocatorManaged,
            Self::Dedicated => AllocationScheme::DedicatedImage(image),
        }
    }
}

pub struct GpuAllocator {
    inner: Mutex<Option<Allocator>>,
    live: AtomicUsize,
}

impl GpuAllocator {
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create GPU memory allocator")?;

        Ok(Self {
            inner: Mutex::new(Some(allocator)),
            live: AtomicUsize::new(0),
        })
    }

    pub fn allocate(&self, desc: &AllocationCreateDesc<'_>) -> Result<Allocation> {
        let mut guard = self.inner.lock();
        let allocator = guard
            .as_mut()
            .context("GPU memory allocator already shut down")?;
        let allocation = allocator
            .allocate(desc)
            .with_context(|| format!("Failed to allocate GPU memory for {}", desc.name))?;
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(allocation)
    }

    pub fn free(&self, allocation: Allocation) -> Result<()> {
        let mut guard = self.inner.lock();
        let allocator = guard
            .as_mut()
            .context("GPU memory allocator already shut down")?;
        allocator
            .free(allocation)
            .context("Failed to free GPU memory")?;
        self.live.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of allocations handed out and not yet freed
    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Drop the allocator and its memory blocks. Must run before the device
    /// is destroyed.
    pub(crate) fn shutdown(&self) {
        let leaked = self.live_allocations();
        if leaked > 0 {
            log::warn!("Shutting down allocator with {} live allocations", leaked);
        }
        self.inner.lock().take();
    }
}
