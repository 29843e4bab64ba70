//! Target MCU descriptions.

pub mod memory_map;
pub mod stm32g0;

pub use memory_map::{EraseRange, FlashGeometry, PageDescriptor};
