#![cfg_attr(not(feature = "std"), no_std)]

pub mod time;
pub mod types;

#[cfg(feature = "std")]
pub mod buffer;
#[cfg(feature = "std")]
pub mod engine;
#[cfg(feature = "std")]
pub mod error;
#[cfg(feature = "std")]
pub mod filter;
#[cfg(feature = "std")]
pub mod pacer;
#[cfg(feature = "std")]
pub mod platform;
#[cfg(feature = "std")]
pub mod player;
#[cfg(feature = "std")]
pub mod pool;
#[cfg(feature = "std")]
pub mod sink;
#[cfg(feature = "std")]
pub mod source;
#[cfg(feature = "std")]
pub mod vsync;

// Re-exports
pub use time::*;
pub use types::*;

#[cfg(feature = "std")]
pub use buffer::*;
#[cfg(feature = "std")]
pub use engine::*;
#[cfg(feature = "std")]
pub use error::*;
#[cfg(feature = "std")]
pub use filter::cpu::CpuContext;
#[cfg(feature = "std")]
pub use filter::{FilterDescriptor, FilterKind, FilterOutput, FilterStage, GpuContext};
#[cfg(feature = "std")]
pub use pacer::*;
#[cfg(feature = "std")]
pub use player::*;
#[cfg(feature = "std")]
pub use pool::*;
#[cfg(feature = "std")]
pub use sink::*;
#[cfg(feature = "std")]
pub use source::*;
#[cfg(feature = "std")]
pub use vsync::*;
