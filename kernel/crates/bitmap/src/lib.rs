#![no_std]

extern crate alloc;

mod alloc_bitmap;
pub mod traits;

pub use alloc_bitmap::AllocBitmap;
