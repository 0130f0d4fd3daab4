//! The seam between the composition core and a GPU.
//!
//! Real backends (GBM/EGL, pbuffer, whatever) implement [`GpuDevice`];
//! [`HeadlessDevice`] is the software implementation the test suite
//! runs against.

mod headless;

pub use headless::*;

use {
    crate::{
        fence::{FenceError, SyncFd},
        geometry::PixelRect,
        Extent2d,
    },
    arrayvec::ArrayVec,
    glam::Mat4,
};

/// Decodes one IEEE 754 binary16 value, the CPU side of FP16 uploads.
pub(crate) fn f16_to_f32(bits: u16) -> f32 {
    let sign = if bits & 0x8000 != 0 { -1.0f32 } else { 1.0 };
    let exp = ((bits >> 10) & 0x1f) as i32;
    let mant = (bits & 0x3ff) as f32;

    match exp {
        0 => sign * mant * (2.0f32).powi(-24),
        31 => {
            if mant == 0.0 {
                sign * f32::INFINITY
            } else {
                f32::NAN
            }
        }
        _ => sign * (1.0 + mant / 1024.0) * (2.0f32).powi(exp - 15),
    }
}

/// Encodes to binary16, round toward zero on the mantissa.
pub(crate) fn f16_from_f32(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32 - 127;
    let mant = bits & 0x7f_ffff;

    if value.is_nan() {
        return sign | 0x7e00;
    }
    if exp > 15 {
        return sign | 0x7c00;
    }
    if exp < -24 {
        return sign;
    }
    if exp < -14 {
        // Subnormal half.
        let shift = -14 - exp;
        let m = (mant | 0x80_0000) >> (13 + shift);
        return sign | m as u16;
    }

    sign | (((exp + 15) as u16) << 10) | ((mant >> 13) as u16)
}

/// GPU texture handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

/// Framebuffer-object handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FramebufferId(pub u32);

/// Linked shader-program handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u32);

/// Frame sink handle: one scanout-capable target the backend owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SinkId(pub u32);

/// Resolved uniform location within a program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UniformLocation(pub i32);

/// Texel formats the core allocates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8,
    Bgra8,
    Rgb10A2,
    RgbaF16,
    R8,
    Rg8,
}

impl TextureFormat {
    /// Bytes per texel in the CPU upload layout.
    pub fn bytes_per_texel(&self) -> usize {
        match self {
            TextureFormat::Rgba8 | TextureFormat::Bgra8 | TextureFormat::Rgb10A2 => 4,
            TextureFormat::RgbaF16 => 8,
            TextureFormat::R8 => 1,
            TextureFormat::Rg8 => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureInfo {
    pub format: TextureFormat,
    pub extent: Extent2d,
}

/// Sub-rectangle upload into an existing texture.
///
/// `data` is the client buffer; `stride_pixels` is its row length and
/// the skip fields select the source rectangle, GL unpack-state style.
#[derive(Debug)]
pub struct SubUpload<'a> {
    pub rect: PixelRect,
    pub stride_pixels: u32,
    pub skip_rows: u32,
    pub skip_pixels: u32,
    pub data: &'a [u8],
}

/// One plane of a dmabuf import.
#[derive(Clone, Copy, Debug)]
pub struct DmabufPlane {
    pub fd: i64,
    pub offset: u32,
    pub stride: u32,
    pub modifier: u64,
}

bitflags::bitflags! {
    /// What a frame sink can do.
    pub struct OutputCaps: u32 {
        /// The sink reports buffer age on acquire.
        const BUFFER_AGE =      0x01;

        /// The swap routine accepts a damage rectangle list.
        const PARTIAL_UPDATE =  0x02;

        /// Native fence export works on this device.
        const NATIVE_FENCES =   0x04;

        /// The sink path to the display is protected.
        const PROTECTED =       0x08;

        /// The sink already applies the blend→output transform.
        const BLEND_TO_OUTPUT = 0x10;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

/// Blend state of a draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendMode {
    /// Source replaces destination, alpha included.
    Replace,

    /// `ONE, ONE_MINUS_SRC_ALPHA`: premultiplied source over dst.
    PremultipliedAlpha,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawMode {
    TriangleFan,
    Lines,
}

/// Interleaved vertex layout shared by every draw the core issues.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub texcoord: [f32; 2],
}

/// Where a draw lands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderTarget {
    /// The backend-provided target buffer of a sink.
    Sink(SinkId),

    /// An off-screen framebuffer, e.g. the shadow target.
    Framebuffer(FramebufferId),
}

/// Uniform values for one draw.
#[derive(Clone, Debug)]
pub struct UniformValues {
    pub projection: Mat4,
    pub alpha: f32,
    pub unicolor: [f32; 4],

    /// Per-channel pre-curve, flattened into a 2D LUT texture.
    pub pre_curve_lut: Option<TextureId>,

    /// 3D mapping LUT flattened into a 2D texture, with its per-axis
    /// grid size.
    pub mapping_lut: Option<(TextureId, u32)>,

    /// Per-channel post-curve LUT texture.
    pub post_curve_lut: Option<TextureId>,
}

impl UniformValues {
    pub fn new(projection: Mat4) -> Self {
        UniformValues {
            projection,
            alpha: 1.0,
            unicolor: [0.0; 4],
            pre_curve_lut: None,
            mapping_lut: None,
            post_curve_lut: None,
        }
    }
}

/// One draw call.
#[derive(Debug)]
pub struct DrawCall<'a> {
    pub program: ProgramId,
    pub mode: DrawMode,
    pub vertices: &'a [Vertex],
    pub viewport: PixelRect,
    pub scissor: Option<PixelRect>,
    pub blend: BlendMode,
    pub textures: ArrayVec<(TextureId, Filter), 3>,
    pub uniforms: UniformValues,
}

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum CreateTextureError {
    #[error("Out of GPU memory")]
    OutOfMemory,

    #[error("Format/size combination {info:?} is unsupported")]
    Unsupported { info: TextureInfo },
}

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum CreateFramebufferError {
    #[error("Out of GPU memory")]
    OutOfMemory,

    #[error("Framebuffer is incomplete")]
    Incomplete,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProgramError {
    #[error("Out of GPU memory")]
    OutOfMemory,

    #[error("Shader compilation failed: {log}")]
    Compile { log: String },

    #[error("Program link failed: {log}")]
    Link { log: String },
}

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ImportDmabufError {
    #[error("Format or modifier is not importable")]
    Unsupported,

    #[error("Plane layout is invalid")]
    BadPlanes,
}

/// Per-frame GPU failures; the frame is skipped, the engine carries on.
#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Out of GPU memory")]
    OutOfMemory,

    #[error("Frame sink was lost")]
    SinkLost,
}

/// The GPU primitives the composition core needs, nothing more.
///
/// All calls are synchronous from the caller's point of view; GPU
/// completion is observed through fences.
pub trait GpuDevice {
    fn create_texture(&mut self, info: TextureInfo) -> Result<TextureId, CreateTextureError>;
    fn destroy_texture(&mut self, texture: TextureId);
    fn upload_texture(&mut self, texture: TextureId, upload: SubUpload<'_>);

    fn create_framebuffer(
        &mut self,
        color: TextureId,
    ) -> Result<FramebufferId, CreateFramebufferError>;
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId);

    fn create_program(&mut self, vertex: &str, fragment: &str) -> Result<ProgramId, ProgramError>;
    fn destroy_program(&mut self, program: ProgramId);
    fn uniform_location(&mut self, program: ProgramId, name: &str) -> Option<UniformLocation>;

    fn draw(&mut self, target: RenderTarget, call: &DrawCall<'_>) -> Result<(), FrameError>;

    /// Tightly packed RGBA8 readback of `rect`, top row first.
    fn read_pixels(&mut self, target: RenderTarget, rect: PixelRect) -> Vec<u8>;

    fn import_dmabuf(
        &mut self,
        extent: Extent2d,
        planes: &[DmabufPlane],
    ) -> Result<TextureId, ImportDmabufError>;

    fn sink_extent(&self, sink: SinkId) -> Extent2d;
    fn sink_caps(&self, sink: SinkId) -> OutputCaps;

    /// Age of the buffer the next frame will draw into; 0 is unknown.
    fn sink_buffer_age(&mut self, sink: SinkId) -> u32;

    /// Presents the sink's target buffer. `damage` is the optional
    /// partial-update hint in target-buffer coordinates.
    fn swap(&mut self, sink: SinkId, damage: Option<&[PixelRect]>) -> Result<(), FrameError>;

    /// Fence signalling when all work submitted so far completes.
    fn create_fence(&mut self) -> Result<SyncFd, FenceError>;
    fn dup_fence(&mut self, fence: &SyncFd) -> Result<SyncFd, FenceError>;

    /// Enqueues a GPU-side wait; does not block the CPU.
    fn wait_fence_gpu(&mut self, fence: &SyncFd);

    fn fence_signalled(&self, fence: &SyncFd) -> bool;

    /// GPU clock value at signal time, once signalled.
    fn fence_timestamp(&self, fence: &SyncFd) -> Option<u64>;
}
