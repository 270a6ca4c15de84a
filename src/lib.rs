// Paced renderer core
//
// Device selection, swapchain, owning GPU handles, pipeline building,
// multi-buffered frame pacing and synchronous uploads on top of ash.

pub mod backend;
pub mod config;
