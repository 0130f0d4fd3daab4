use {
    crate::{
        backend::{
            CreateTextureError, DmabufPlane, GpuDevice, ImportDmabufError, SubUpload,
            TextureFormat, TextureId, TextureInfo,
        },
        fence::SyncFd,
        geometry::PixelRect,
        region::Region,
        shader::ShaderVariant,
        Extent2d,
    },
    arrayvec::ArrayVec,
    std::sync::Arc,
};

/// Pixel formats accepted for CPU (wl_shm style) buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShmFormat {
    /// 32-bit ARGB, byte order BGRA in memory.
    Argb8888,
    /// Like ARGB but the alpha byte is ignored.
    Xrgb8888,
    /// 10-bit channels, 2 ignored alpha bits.
    Xbgr2101010,
    /// Half-float RGBA.
    Abgr16161616F,
    /// Two planes: full-res Y, half-res interleaved UV.
    Nv12,
    /// Two planes: full-res Y, horizontally-halved interleaved UV.
    Nv16,
    /// Three planes: Y and quarter-res U, V.
    Yuv420,
    /// Packed YUYV pairs.
    Yuyv,
    /// Packed XYUV, one plane.
    Xyuv8888,
}

/// One texture plane of an SHM format.
#[derive(Clone, Copy, Debug)]
pub struct ShmPlane {
    pub format: TextureFormat,
    /// Horizontal and vertical subsampling divisors.
    pub div_w: u32,
    pub div_h: u32,
}

const fn plane(format: TextureFormat, div_w: u32, div_h: u32) -> ShmPlane {
    ShmPlane {
        format,
        div_w,
        div_h,
    }
}

/// How an SHM format is realized on the GPU.
#[derive(Clone, Copy, Debug)]
pub struct ShmFormatInfo {
    pub variant: ShaderVariant,
    /// The format carries no meaningful alpha.
    pub opaque: bool,
    pub planes: &'static [ShmPlane],
}

impl ShmFormat {
    pub fn info(&self) -> ShmFormatInfo {
        match self {
            ShmFormat::Argb8888 => ShmFormatInfo {
                variant: ShaderVariant::Rgba,
                opaque: false,
                planes: &const { [plane(TextureFormat::Bgra8, 1, 1)] },
            },
            ShmFormat::Xrgb8888 => ShmFormatInfo {
                variant: ShaderVariant::Rgbx,
                opaque: true,
                planes: &const { [plane(TextureFormat::Bgra8, 1, 1)] },
            },
            ShmFormat::Xbgr2101010 => ShmFormatInfo {
                variant: ShaderVariant::Rgbx,
                opaque: true,
                planes: &const { [plane(TextureFormat::Rgb10A2, 1, 1)] },
            },
            ShmFormat::Abgr16161616F => ShmFormatInfo {
                variant: ShaderVariant::Rgba,
                opaque: false,
                planes: &const { [plane(TextureFormat::RgbaF16, 1, 1)] },
            },
            ShmFormat::Nv12 => ShmFormatInfo {
                variant: ShaderVariant::Y_UV,
                opaque: true,
                planes: &const {
                    [
                        plane(TextureFormat::R8, 1, 1),
                        plane(TextureFormat::Rg8, 2, 2),
                    ]
                },
            },
            ShmFormat::Nv16 => ShmFormatInfo {
                variant: ShaderVariant::Y_UV,
                opaque: true,
                planes: &const {
                    [
                        plane(TextureFormat::R8, 1, 1),
                        plane(TextureFormat::Rg8, 2, 1),
                    ]
                },
            },
            ShmFormat::Yuv420 => ShmFormatInfo {
                variant: ShaderVariant::Y_U_V,
                opaque: true,
                planes: &const {
                    [
                        plane(TextureFormat::R8, 1, 1),
                        plane(TextureFormat::R8, 2, 2),
                        plane(TextureFormat::R8, 2, 2),
                    ]
                },
            },
            ShmFormat::Yuyv => ShmFormatInfo {
                variant: ShaderVariant::Y_XUXV,
                opaque: true,
                planes: &const {
                    [
                        plane(TextureFormat::Rg8, 1, 1),
                        plane(TextureFormat::Rgba8, 2, 1),
                    ]
                },
            },
            ShmFormat::Xyuv8888 => ShmFormatInfo {
                variant: ShaderVariant::Xyuv,
                opaque: true,
                planes: &const { [plane(TextureFormat::Bgra8, 1, 1)] },
            },
        }
    }
}

/// An attached buffer as handed over by the protocol layer.
#[derive(Clone, Debug)]
pub enum BufferSpec {
    /// Single-color buffer; premultiplied RGBA.
    Solid { color: [f32; 4], extent: Extent2d },

    /// CPU memory. `data` holds all planes back to back, chroma planes
    /// with subsampled strides.
    Shm {
        format: ShmFormat,
        extent: Extent2d,
        stride_pixels: u32,
        data: Arc<[u8]>,
    },

    /// GPU-importable buffer.
    Dmabuf {
        extent: Extent2d,
        planes: Vec<DmabufPlane>,
        opaque: bool,
    },
}

/// Classification of the attached buffer, with its GPU residency.
#[derive(Debug, Default)]
enum BufferState {
    #[default]
    Null,
    Solid {
        color: [f32; 4],
    },
    Shm {
        format: ShmFormat,
        stride_pixels: u32,
        data: Arc<[u8]>,
    },
    Dmabuf,
}

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum AttachError {
    #[error(transparent)]
    CreateTexture(#[from] CreateTextureError),

    #[error(transparent)]
    Import(#[from] ImportDmabufError),
}

#[allow(dead_code)]
fn check_attach_error() {
    crate::assert_error::<AttachError>();
}

/// Per-surface GPU state: textures, variant, pending damage.
///
/// Uploads are damage driven; only rectangles dirtied since the last
/// flush are re-uploaded, unless a format or size change forced a full
/// upload.
#[derive(Debug, Default)]
pub struct SurfaceState {
    buffer: BufferState,
    textures: ArrayVec<TextureId, 3>,
    texture_shape: Option<(ShmFormat, Extent2d)>,
    variant: ShaderVariant,
    extent: Extent2d,
    premultiplied: bool,
    format_opaque: bool,

    /// Client-declared opaque region, surface coordinates.
    pub opaque_region: Region,

    pending_damage: Region,
    needs_full_upload: bool,

    /// Content must not reach unprotected or recorded outputs.
    pub protected: bool,

    /// Scanned out directly; the GPU never sees the content.
    pub direct_display: bool,

    /// Client uses explicit synchronization.
    pub explicit_sync: bool,
    pub acquire_fence: Option<SyncFd>,
    pub release_fence: Option<SyncFd>,

    /// Attached color profile; the stock sRGB profile applies when
    /// absent.
    pub profile: Option<Arc<crate::color::ColorProfile>>,
    pub render_intent: crate::color::RenderIntent,
}

impl SurfaceState {
    pub fn new() -> Self {
        SurfaceState::default()
    }

    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    pub fn variant(&self) -> ShaderVariant {
        self.variant
    }

    pub fn premultiplied(&self) -> bool {
        self.premultiplied
    }

    /// The format itself guarantees opacity (no alpha channel).
    pub fn format_opaque(&self) -> bool {
        self.format_opaque
    }

    pub fn textures(&self) -> &[TextureId] {
        &self.textures
    }

    pub fn solid_color(&self) -> Option<[f32; 4]> {
        match self.buffer {
            BufferState::Solid { color } => Some(color),
            _ => None,
        }
    }

    pub fn has_content(&self) -> bool {
        !matches!(self.buffer, BufferState::Null)
    }

    /// Classifies and attaches `spec`, allocating or importing GPU
    /// textures as needed.
    pub fn attach(
        &mut self,
        device: &mut dyn GpuDevice,
        spec: BufferSpec,
    ) -> Result<(), AttachError> {
        match spec {
            BufferSpec::Solid { color, extent } => {
                self.drop_textures(device);
                self.buffer = BufferState::Solid { color };
                self.variant = ShaderVariant::Solid;
                self.extent = extent;
                self.premultiplied = true;
                self.format_opaque = color[3] >= 1.0;
            }
            BufferSpec::Shm {
                format,
                extent,
                stride_pixels,
                data,
            } => {
                let info = format.info();

                if self.texture_shape != Some((format, extent)) {
                    self.drop_textures(device);
                    for plane in info.planes {
                        let texture = device.create_texture(TextureInfo {
                            format: plane.format,
                            extent: Extent2d {
                                width: extent.width / plane.div_w,
                                height: extent.height / plane.div_h,
                            },
                        })?;
                        self.textures.push(texture);
                    }
                    self.texture_shape = Some((format, extent));
                    self.needs_full_upload = true;
                }

                self.buffer = BufferState::Shm {
                    format,
                    stride_pixels,
                    data,
                };
                self.variant = info.variant;
                self.extent = extent;
                self.premultiplied = true;
                self.format_opaque = info.opaque;
            }
            BufferSpec::Dmabuf {
                extent,
                planes,
                opaque,
            } => {
                self.drop_textures(device);
                let texture = device.import_dmabuf(extent, &planes)?;
                self.textures.push(texture);
                self.buffer = BufferState::Dmabuf;
                self.variant = ShaderVariant::External;
                self.extent = extent;
                self.premultiplied = true;
                self.format_opaque = opaque;
            }
        }

        Ok(())
    }

    /// Records damage in buffer coordinates.
    pub fn damage(&mut self, region: &Region) {
        self.pending_damage.union(region);
        self.pending_damage
            .intersect_rect(&PixelRect::from_extent(self.extent));
    }

    /// Uploads dirty rectangles to the GPU textures.
    pub fn flush_damage(&mut self, device: &mut dyn GpuDevice) {
        let BufferState::Shm {
            format,
            stride_pixels,
            ref data,
        } = self.buffer
        else {
            self.pending_damage.clear();
            self.needs_full_upload = false;
            return;
        };

        if self.needs_full_upload {
            self.pending_damage = Region::from_rect(PixelRect::from_extent(self.extent));
            self.needs_full_upload = false;
        }

        if self.pending_damage.is_empty() {
            return;
        }

        let info = format.info();
        let mut plane_offset = 0usize;

        for (plane, texture) in info.planes.iter().zip(&self.textures) {
            let plane_stride = stride_pixels / plane.div_w;
            let plane_height = self.extent.height / plane.div_h;
            let bpt = plane.format.bytes_per_texel();

            for rect in self.pending_damage.rects() {
                let rect = PixelRect {
                    x1: rect.x1 / plane.div_w as i32,
                    y1: rect.y1 / plane.div_h as i32,
                    x2: (rect.x2 + plane.div_w as i32 - 1) / plane.div_w as i32,
                    y2: (rect.y2 + plane.div_h as i32 - 1) / plane.div_h as i32,
                };

                device.upload_texture(
                    *texture,
                    SubUpload {
                        rect,
                        stride_pixels: plane_stride,
                        skip_rows: rect.y1 as u32,
                        skip_pixels: rect.x1 as u32,
                        data: &data[plane_offset..],
                    },
                );
            }

            plane_offset += plane_stride as usize * plane_height as usize * bpt;
        }

        self.pending_damage.clear();
    }

    /// Releases GPU residency; the attached buffer stays classified.
    pub fn drop_textures(&mut self, device: &mut dyn GpuDevice) {
        for texture in self.textures.drain(..) {
            device.destroy_texture(texture);
        }
        self.texture_shape = None;
    }

    /// Full teardown on surface destruction.
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        self.drop_textures(device);
        self.buffer = BufferState::Null;
        self.acquire_fence = None;
        self.release_fence = None;
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::backend::HeadlessDevice};

    fn rgba_buffer(extent: Extent2d, rgba: [u8; 4]) -> Arc<[u8]> {
        let mut data = Vec::with_capacity(extent.area() as usize * 4);
        for _ in 0..extent.area() {
            // BGRA in memory.
            data.extend_from_slice(&[rgba[2], rgba[1], rgba[0], rgba[3]]);
        }
        data.into()
    }

    #[test]
    fn format_table_is_consistent() {
        let formats = [
            ShmFormat::Argb8888,
            ShmFormat::Xrgb8888,
            ShmFormat::Xbgr2101010,
            ShmFormat::Abgr16161616F,
            ShmFormat::Nv12,
            ShmFormat::Nv16,
            ShmFormat::Yuv420,
            ShmFormat::Yuyv,
            ShmFormat::Xyuv8888,
        ];

        for format in formats {
            let info = format.info();
            assert_eq!(
                info.planes.len(),
                info.variant.planes(),
                "{format:?} plane count does not match its variant"
            );
            assert!(!info.planes.is_empty());
        }

        assert!(!ShmFormat::Argb8888.info().opaque);
        assert!(ShmFormat::Xrgb8888.info().opaque);
    }

    #[test]
    fn attach_solid_needs_no_texture() {
        let mut device = HeadlessDevice::new();
        let mut surface = SurfaceState::new();

        surface
            .attach(
                &mut device,
                BufferSpec::Solid {
                    color: [0.5, 0.0, 0.0, 1.0],
                    extent: Extent2d {
                        width: 16,
                        height: 16,
                    },
                },
            )
            .unwrap();

        assert_eq!(surface.variant(), ShaderVariant::Solid);
        assert!(surface.textures().is_empty());
        assert_eq!(surface.solid_color(), Some([0.5, 0.0, 0.0, 1.0]));
        assert!(surface.format_opaque());
    }

    #[test]
    fn shm_attach_uploads_on_damage_only() {
        let mut device = HeadlessDevice::new();
        let mut surface = SurfaceState::new();
        let extent = Extent2d {
            width: 4,
            height: 4,
        };

        surface
            .attach(
                &mut device,
                BufferSpec::Shm {
                    format: ShmFormat::Argb8888,
                    extent,
                    stride_pixels: 4,
                    data: rgba_buffer(extent, [10, 20, 30, 255]),
                },
            )
            .unwrap();
        assert_eq!(surface.variant(), ShaderVariant::Rgba);
        assert_eq!(surface.textures().len(), 1);

        // First flush is a full upload.
        surface.flush_damage(&mut device);
        let fb = device.create_framebuffer(surface.textures()[0]).unwrap();
        let pixels = device.read_pixels(
            crate::backend::RenderTarget::Framebuffer(fb),
            PixelRect::new(0, 0, 4, 4),
        );
        assert_eq!(&pixels[..4], &[10, 20, 30, 255]);

        // New content, damage only one pixel: the rest keeps old data.
        surface
            .attach(
                &mut device,
                BufferSpec::Shm {
                    format: ShmFormat::Argb8888,
                    extent,
                    stride_pixels: 4,
                    data: rgba_buffer(extent, [200, 0, 0, 255]),
                },
            )
            .unwrap();
        surface.damage(&Region::from_rect(PixelRect::new(0, 0, 1, 1)));
        surface.flush_damage(&mut device);

        let fbo = device.create_framebuffer(surface.textures()[0]).unwrap();
        let pixels =
            device.read_pixels(crate::backend::RenderTarget::Framebuffer(fbo), PixelRect::new(0, 0, 2, 1));
        assert_eq!(&pixels[..4], &[200, 0, 0, 255]);
        assert_eq!(&pixels[4..8], &[10, 20, 30, 255]);
    }

    #[test]
    fn format_change_forces_full_reupload() {
        let mut device = HeadlessDevice::new();
        let mut surface = SurfaceState::new();
        let extent = Extent2d {
            width: 2,
            height: 2,
        };

        surface
            .attach(
                &mut device,
                BufferSpec::Shm {
                    format: ShmFormat::Argb8888,
                    extent,
                    stride_pixels: 2,
                    data: rgba_buffer(extent, [1, 2, 3, 255]),
                },
            )
            .unwrap();
        surface.flush_damage(&mut device);

        surface
            .attach(
                &mut device,
                BufferSpec::Shm {
                    format: ShmFormat::Xrgb8888,
                    extent,
                    stride_pixels: 2,
                    data: rgba_buffer(extent, [7, 8, 9, 0]),
                },
            )
            .unwrap();

        assert_eq!(surface.variant(), ShaderVariant::Rgbx);

        // No explicit damage, but the format change uploads everything.
        surface.flush_damage(&mut device);
        let fbo = device.create_framebuffer(surface.textures()[0]).unwrap();
        let pixels =
            device.read_pixels(crate::backend::RenderTarget::Framebuffer(fbo), PixelRect::new(0, 0, 1, 1));
        assert_eq!(&pixels[..4], &[7, 8, 9, 0]);
    }

    #[test]
    fn nv12_splits_into_two_planes() {
        let mut device = HeadlessDevice::new();
        let mut surface = SurfaceState::new();
        let extent = Extent2d {
            width: 4,
            height: 4,
        };

        // Y plane 4x4, UV plane 2x2 interleaved.
        let mut data = vec![0u8; 4 * 4 + 2 * 2 * 2];
        data[0] = 120;
        data[16] = 90; // first U

        surface
            .attach(
                &mut device,
                BufferSpec::Shm {
                    format: ShmFormat::Nv12,
                    extent,
                    stride_pixels: 4,
                    data: data.into(),
                },
            )
            .unwrap();
        surface.flush_damage(&mut device);

        assert_eq!(surface.variant(), ShaderVariant::Y_UV);
        assert_eq!(surface.textures().len(), 2);

        let y_fbo = device.create_framebuffer(surface.textures()[0]).unwrap();
        let y = device.read_pixels(
            crate::backend::RenderTarget::Framebuffer(y_fbo),
            PixelRect::new(0, 0, 1, 1),
        );
        assert_eq!(y[0], 120);

        let uv_fbo = device.create_framebuffer(surface.textures()[1]).unwrap();
        let uv = device.read_pixels(
            crate::backend::RenderTarget::Framebuffer(uv_fbo),
            PixelRect::new(0, 0, 1, 1),
        );
        assert_eq!(uv[0], 90);
    }
}
