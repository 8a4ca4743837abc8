//! Native backends for the pipeline traits.

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub mod apple;
