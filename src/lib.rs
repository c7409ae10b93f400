// Use mimalloc only on x86_64 to avoid cross-compilation issues
#[cfg(target_arch = "x86_64")]
use mimalloc::MiMalloc;

#[cfg(target_arch = "x86_64")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod config;
pub mod core;
pub mod display;
pub mod shutdown;
pub mod utils;
