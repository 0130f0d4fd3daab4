//!
//! Prism is the output composition core of a display server.
//!
//! It owns the math and bookkeeping a compositor runs once per frame:
//! clipping transformed surfaces against damage rectangles, building the
//! color pipeline from input profile to blend space to output device,
//! choosing shaders and blend state per paint node, and accumulating
//! damage across the swapchain's rotating buffers.
//!
//! Prism does not speak any wire protocol and does not own a GPU API.
//! Buffers arrive already attached, damage arrives already resolved,
//! and all GPU work goes through the [`backend::GpuDevice`] trait.
//!

// #![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod backend;

mod clip;
mod color;
mod engine;
mod event;
mod fence;
mod geometry;
mod output;
mod paint;
mod region;
mod shader;
mod surface;

pub use self::{
    clip::*, color::*, engine::*, event::*, fence::*, geometry::*, output::*, paint::*, region::*,
    shader::*, surface::*,
};

pub use self::backend::{FrameError, GpuDevice, OutputCaps, SinkId};

use std::error::Error;

/// Texture and output sizes are defined to `u32` which is standard for
/// graphics API of today.
pub type ImageSize = u32;

/// Two dimensional extent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent2d {
    /// Width of the extent.
    pub width: ImageSize,

    /// Height of the extent.
    pub height: ImageSize,
}

impl Extent2d {
    pub const ZERO: Self = Extent2d {
        width: 0,
        height: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Error that may occur when a tiny allocation fails.
///
/// The curve and transform tables this crate allocates are small;
/// failing to allocate one indicates the process is beyond saving.
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
#[error("Out of memory")]
pub struct OutOfMemory;

#[allow(dead_code)]
fn assert_error<T: Error + Send + Sync + 'static>() {}
