//! Real-hardware backends for the `hw` traits.

#[cfg(target_arch = "x86")]
pub mod x86;
