use {
    crate::{
        backend::{
            BlendMode, CreateTextureError, DrawCall, DrawMode, Filter, FrameError, GpuDevice,
            ProgramId, RenderTarget, SubUpload, TextureFormat, TextureId, TextureInfo,
            UniformValues, Vertex,
        },
        clip::{clip_quad, Quad},
        color::ColorTransform,
        event::{ClientError, Effect, SurfaceKey},
        fence::SyncFd,
        geometry::{PixelRect, Rect},
        region::Region,
        shader::{ColorCurveKind, ColorMappingKind, ProgramCache, ShaderKey, ShaderVariant},
        surface::SurfaceState,
        Extent2d,
    },
    arrayvec::ArrayVec,
    glam::{Mat3, Mat4, Vec2},
    smallvec::SmallVec,
    std::{sync::Arc, time::Duration},
};

/// Placement of a surface on an output.
#[derive(Clone, Debug)]
pub struct ViewState {
    /// Surface coordinates → output coordinates.
    pub transform: Mat3,

    pub alpha: f32,

    /// Region scissored away, output coordinates.
    pub clip: Region,
}

impl ViewState {
    pub fn at(x: f32, y: f32) -> Self {
        ViewState {
            transform: Mat3::from_translation(Vec2::new(x, y)),
            alpha: 1.0,
            clip: Region::new(),
        }
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    /// Pure translation, no scale or rotation.
    pub fn is_translation_only(&self) -> bool {
        self.transform.x_axis == glam::Vec3::X && self.transform.y_axis == glam::Vec3::Y
    }

    /// Translation by whole pixels; the identity filter case.
    pub fn is_integer_translation(&self) -> bool {
        self.is_translation_only()
            && self.transform.z_axis.x.fract() == 0.0
            && self.transform.z_axis.y.fract() == 0.0
    }

    /// Axis-aligned under the transform: the clipper fast path.
    pub fn is_axis_aligned(&self) -> bool {
        self.transform.x_axis.y == 0.0
            && self.transform.y_axis.x == 0.0
            && self.transform.x_axis.x > 0.0
            && self.transform.y_axis.y > 0.0
    }

    /// Transformed surface rectangle as a clip-ready quad.
    pub fn quad(&self, extent: Extent2d) -> Quad {
        let (w, h) = (extent.width as f32, extent.height as f32);
        let corners = [
            Vec2::new(0.0, 0.0),
            Vec2::new(w, 0.0),
            Vec2::new(w, h),
            Vec2::new(0.0, h),
        ];
        Quad::new(
            corners.map(|c| self.transform.transform_point2(c)),
            self.is_axis_aligned(),
        )
    }

    /// Bounding box on the output, pixel aligned outward.
    pub fn bounding_box(&self, extent: Extent2d) -> PixelRect {
        let bbox = self.quad(extent).bbox;
        PixelRect {
            x1: bbox.x1.floor() as i32,
            y1: bbox.y1.floor() as i32,
            x2: bbox.x2.ceil() as i32,
            y2: bbox.y2.ceil() as i32,
        }
    }
}

/// Validated per-(surface, output) color state of a paint node.
///
/// Recomputed lazily at the first repaint after the output outcome or
/// the surface profile changes.
#[derive(Debug, Default)]
pub(crate) enum NodeColor {
    /// Needs recomputation before the node can draw.
    #[default]
    Stale,

    /// Electrical passthrough, no color pipeline.
    Unmanaged,

    Managed(GpuColorTransform),

    /// Transform construction failed; the node is skipped.
    Invalid,
}

/// Paint node: one (surface, view, output) with cached color state.
#[derive(Debug)]
pub struct PaintNode {
    pub surface: SurfaceKey,
    pub view: ViewState,

    /// Back-to-front stacking order.
    pub z: i32,

    pub(crate) color: NodeColor,
    pub(crate) used_in_frame: bool,
}

impl PaintNode {
    pub fn new(surface: SurfaceKey, view: ViewState, z: i32) -> Self {
        PaintNode {
            surface,
            view,
            z,
            color: NodeColor::Stale,
            used_in_frame: false,
        }
    }

    pub(crate) fn invalidate_color(&mut self, device: &mut dyn GpuDevice) {
        if let NodeColor::Managed(gpu) = std::mem::replace(&mut self.color, NodeColor::Stale) {
            gpu.release(device);
        }
    }
}

/// A color transform with its LUTs resident on the GPU.
#[derive(Debug)]
pub(crate) struct GpuColorTransform {
    pub transform: Arc<ColorTransform>,
    pre_lut: Option<TextureId>,
    mapping_lut: Option<(TextureId, u32)>,
    post_lut: Option<TextureId>,
}

/// Samples per channel of a curve LUT texture.
const CURVE_LUT_LEN: usize = 1024;

fn upload_curve_lut(
    device: &mut dyn GpuDevice,
    curves: &[crate::color::ToneCurve; 3],
) -> Result<TextureId, CreateTextureError> {
    let texture = device.create_texture(TextureInfo {
        format: TextureFormat::RgbaF16,
        extent: Extent2d {
            width: CURVE_LUT_LEN as u32,
            height: 3,
        },
    })?;

    let mut data = Vec::with_capacity(CURVE_LUT_LEN * 3 * 8);
    for curve in curves {
        for value in curve.sample_table(CURVE_LUT_LEN).iter() {
            data.extend_from_slice(&crate::backend::f16_from_f32(*value).to_le_bytes());
            data.extend_from_slice(&[0u8; 6]);
        }
    }

    device.upload_texture(
        texture,
        SubUpload {
            rect: PixelRect::new(0, 0, CURVE_LUT_LEN as i32, 3),
            stride_pixels: CURVE_LUT_LEN as u32,
            skip_rows: 0,
            skip_pixels: 0,
            data: &data,
        },
    );
    Ok(texture)
}

impl GpuColorTransform {
    /// Uploads the transform's tables as LUT textures.
    pub fn upload(
        device: &mut dyn GpuDevice,
        transform: Arc<ColorTransform>,
    ) -> Result<Self, CreateTextureError> {
        let pre_lut = match transform.pre_curves() {
            Some(curves) => Some(upload_curve_lut(device, curves)?),
            None => None,
        };
        let post_lut = match transform.post_curves() {
            Some(curves) => Some(upload_curve_lut(device, curves)?),
            None => None,
        };

        let mapping_lut = match transform.lut() {
            Some(lut) => {
                let n = lut.len();
                let texture = device.create_texture(TextureInfo {
                    format: TextureFormat::RgbaF16,
                    extent: Extent2d {
                        width: n,
                        height: n * n,
                    },
                })?;

                let mut data = Vec::with_capacity(lut.samples().len() / 3 * 8);
                for rgb in lut.samples().chunks_exact(3) {
                    for c in rgb {
                        data.extend_from_slice(&crate::backend::f16_from_f32(*c).to_le_bytes());
                    }
                    data.extend_from_slice(&[0u8; 2]);
                }

                device.upload_texture(
                    texture,
                    SubUpload {
                        rect: PixelRect::new(0, 0, n as i32, (n * n) as i32),
                        stride_pixels: n,
                        skip_rows: 0,
                        skip_pixels: 0,
                        data: &data,
                    },
                );
                Some((texture, n))
            }
            None => None,
        };

        Ok(GpuColorTransform {
            transform,
            pre_lut,
            mapping_lut,
            post_lut,
        })
    }

    pub fn release(self, device: &mut dyn GpuDevice) {
        if let Some(texture) = self.pre_lut {
            device.destroy_texture(texture);
        }
        if let Some((texture, _)) = self.mapping_lut {
            device.destroy_texture(texture);
        }
        if let Some(texture) = self.post_lut {
            device.destroy_texture(texture);
        }
    }

    /// Folds the color pipeline stages into a shader key.
    pub fn key_bits(&self, key: ShaderKey) -> ShaderKey {
        key.with_pre_curve(if self.pre_lut.is_some() {
            ColorCurveKind::Lut3x1d
        } else {
            ColorCurveKind::None
        })
        .with_mapping(if self.mapping_lut.is_some() {
            ColorMappingKind::Lut3d
        } else {
            ColorMappingKind::Identity
        })
        .with_post_curve(if self.post_lut.is_some() {
            ColorCurveKind::Lut3x1d
        } else {
            ColorCurveKind::None
        })
    }

    pub fn bind(&self, uniforms: &mut UniformValues) {
        uniforms.pre_curve_lut = self.pre_lut;
        uniforms.mapping_lut = self.mapping_lut;
        uniforms.post_curve_lut = self.post_lut;
    }
}

/// Fan-debug overlay state; colors cycle per drawn fan.
#[derive(Clone, Copy, Debug, Default)]
pub struct FanDebug {
    pub enabled: bool,
    next_color: usize,
}

const FAN_DEBUG_COLORS: [[f32; 4]; 6] = [
    [1.0, 0.0, 0.0, 1.0],
    [0.0, 1.0, 0.0, 1.0],
    [0.0, 0.0, 1.0, 1.0],
    [1.0, 1.0, 0.0, 1.0],
    [1.0, 0.0, 1.0, 1.0],
    [0.0, 1.0, 1.0, 1.0],
];

impl FanDebug {
    fn next(&mut self) -> [f32; 4] {
        let color = FAN_DEBUG_COLORS[self.next_color % FAN_DEBUG_COLORS.len()];
        self.next_color += 1;
        color
    }
}

/// Everything a paint-node draw needs from the output and engine.
pub(crate) struct DrawContext<'a> {
    pub device: &'a mut dyn GpuDevice,
    pub programs: &'a mut ProgramCache,
    pub now: Duration,

    pub target: RenderTarget,
    pub viewport: PixelRect,
    pub projection: Mat4,

    /// Accumulated damage for this frame, output coordinates.
    pub damage: &'a Region,

    /// Output scale mismatch or zoom forces linear filtering.
    pub force_linear: bool,

    pub green_tint: bool,

    /// Output-level censor condition: protection below the content's
    /// requirement, or a recording plane disabled because of it.
    pub censor_protected: bool,

    pub fan_debug: &'a mut FanDebug,
}

/// Dark red replacement for censored content.
const CENSOR_COLOR: [f32; 4] = [0.30, 0.0, 0.0, 1.0];

/// Draws one paint node into the current target.
///
/// Returns `true` if any geometry was emitted.
pub(crate) fn draw_paint_node(
    ctx: &mut DrawContext<'_>,
    node: &mut PaintNode,
    surface: &mut SurfaceState,
    effects: &mut SmallVec<[Effect; 4]>,
) -> Result<bool, FrameError> {
    if !surface.has_content() {
        return Ok(false);
    }

    // A node whose color transform failed draws nothing, unless it is
    // direct-display content which is censored anyway.
    if matches!(node.color, NodeColor::Invalid) && !surface.direct_display {
        return Ok(false);
    }

    let extent = surface.extent();
    let bbox = node.view.bounding_box(extent);

    let mut repaint = ctx.damage.clone();
    repaint.intersect_rect(&bbox);
    repaint.subtract(&node.view.clip);
    if repaint.is_empty() {
        return Ok(false);
    }

    // Explicit sync: the GPU waits, the loop thread does not.
    if let Some(fence) = &surface.acquire_fence {
        ctx.device.wait_fence_gpu(fence);
    }

    let filter = if !node.view.is_integer_translation() || ctx.force_linear {
        Filter::Linear
    } else {
        Filter::Nearest
    };

    let censored =
        surface.direct_display || (surface.protected && ctx.censor_protected);

    let mut uniforms = UniformValues::new(ctx.projection);
    uniforms.alpha = node.view.alpha;

    let key = if censored {
        uniforms.unicolor = CENSOR_COLOR;
        ShaderKey::new(ShaderVariant::Solid)
    } else {
        let base = match surface.variant() {
            ShaderVariant::Solid => {
                uniforms.unicolor = surface.solid_color().unwrap_or([0.0; 4]);
                ShaderKey::new(ShaderVariant::Solid)
            }
            variant => ShaderKey::new(variant),
        }
        .with_premultiplied(surface.premultiplied())
        .with_green_tint(ctx.green_tint);

        match &node.color {
            NodeColor::Managed(gpu) => {
                gpu.bind(&mut uniforms);
                gpu.key_bits(base)
            }
            _ => base,
        }
    };

    let lookup = ctx.programs.use_program(ctx.device, key, ctx.now);
    if lookup.is_fallback {
        effects.push(Effect::ProtocolError {
            surface: node.surface,
            error: ClientError::ShaderUnavailable,
        });
    }

    // Opaque sub-region in output coordinates. A translated view keeps
    // the client's opaque rectangles; anything fancier only counts
    // when the whole surface is opaque.
    let mut opaque = Region::new();
    if node.view.alpha >= 1.0 && !censored {
        let fully_opaque = surface.format_opaque()
            || surface
                .opaque_region
                .rects()
                .iter()
                .any(|r| r.contains(&PixelRect::from_extent(extent)));

        if node.view.is_translation_only() {
            let tx = node.view.transform.z_axis.x.round() as i32;
            let ty = node.view.transform.z_axis.y.round() as i32;
            if fully_opaque {
                opaque.add_rect(bbox);
            } else {
                opaque = surface.opaque_region.translated(tx, ty);
            }
        } else if fully_opaque {
            // Conservative: only the interior is truly opaque, but the
            // fan covers exactly the clipped quad, so Replace is safe.
            opaque.add_rect(bbox);
        }
    }

    let opaque_repaint = repaint.intersection(&opaque);
    let mut blend_repaint = repaint.clone();
    blend_repaint.subtract(&opaque);

    let quad = node.view.quad(extent);
    let inverse = node.view.transform.inverse();
    let mut drew = false;

    for (region, blend) in [
        (&opaque_repaint, BlendMode::Replace),
        (&blend_repaint, BlendMode::PremultipliedAlpha),
    ] {
        if region.is_empty() {
            continue;
        }

        for rect in region.rects() {
            let polygon = clip_quad(&quad, &Rect::from(*rect));
            if polygon.len() < 3 {
                continue;
            }

            let mut vertices: ArrayVec<Vertex, 8> = ArrayVec::new();
            for p in &polygon {
                let local = inverse.transform_point2(*p);
                vertices.push(Vertex {
                    position: [p.x, p.y],
                    texcoord: [
                        local.x / extent.width as f32,
                        local.y / extent.height as f32,
                    ],
                });
            }

            let mut textures = ArrayVec::new();
            if !censored {
                for plane in surface.textures().iter().take(key.variant().planes()) {
                    textures.push((*plane, filter));
                }
            }

            ctx.device.draw(
                ctx.target,
                &DrawCall {
                    program: lookup.id,
                    mode: DrawMode::TriangleFan,
                    vertices: &vertices,
                    viewport: ctx.viewport,
                    scissor: None,
                    blend,
                    textures,
                    uniforms: uniforms.clone(),
                },
            )?;
            drew = true;

            if ctx.fan_debug.enabled {
                draw_fan_debug(ctx, &vertices)?;
            }
        }
    }

    if drew {
        node.used_in_frame = true;
    }
    Ok(drew)
}

/// Draws the outline of a fan in the next debug color.
fn draw_fan_debug(ctx: &mut DrawContext<'_>, fan: &[Vertex]) -> Result<(), FrameError> {
    let solid = ctx.programs.solid();
    let mut uniforms = UniformValues::new(ctx.projection);
    uniforms.unicolor = ctx.fan_debug.next();

    // Each edge as a line segment, closing back to the first vertex.
    let mut vertices: Vec<Vertex> = Vec::with_capacity(fan.len() * 2);
    for (i, v) in fan.iter().enumerate() {
        let next = &fan[(i + 1) % fan.len()];
        vertices.push(*v);
        vertices.push(*next);
    }

    ctx.device.draw(
        ctx.target,
        &DrawCall {
            program: solid.id,
            mode: DrawMode::Lines,
            vertices: &vertices,
            viewport: ctx.viewport,
            scissor: None,
            blend: BlendMode::PremultipliedAlpha,
            textures: ArrayVec::new(),
            uniforms,
        },
    )
}

/// Draws a full-target textured quad, used by the shadow blit and the
/// borders.
pub(crate) fn draw_textured_rect(
    device: &mut dyn GpuDevice,
    program: ProgramId,
    target: RenderTarget,
    viewport: PixelRect,
    projection: Mat4,
    texture: TextureId,
    rect: PixelRect,
    tex_rect: [Vec2; 2],
    uniforms: UniformValues,
) -> Result<(), FrameError> {
    let [t0, t1] = tex_rect;
    let vertices = [
        Vertex {
            position: [rect.x1 as f32, rect.y1 as f32],
            texcoord: [t0.x, t0.y],
        },
        Vertex {
            position: [rect.x2 as f32, rect.y1 as f32],
            texcoord: [t1.x, t0.y],
        },
        Vertex {
            position: [rect.x2 as f32, rect.y2 as f32],
            texcoord: [t1.x, t1.y],
        },
        Vertex {
            position: [rect.x1 as f32, rect.y2 as f32],
            texcoord: [t0.x, t1.y],
        },
    ];

    let mut uniforms = uniforms;
    uniforms.projection = projection;

    let mut textures = ArrayVec::new();
    textures.push((texture, Filter::Nearest));

    device.draw(
        target,
        &DrawCall {
            program,
            mode: DrawMode::TriangleFan,
            vertices: &vertices,
            viewport,
            scissor: None,
            blend: BlendMode::Replace,
            textures,
            uniforms,
        },
    )
}

/// Release-slot update: dup the frame fence into the surface and emit
/// a second dup for the protocol layer.
pub(crate) fn issue_release_fence(
    device: &mut dyn GpuDevice,
    surface_key: SurfaceKey,
    surface: &mut SurfaceState,
    frame_fence: &SyncFd,
    effects: &mut SmallVec<[Effect; 4]>,
) {
    match (device.dup_fence(frame_fence), device.dup_fence(frame_fence)) {
        (Ok(slot), Ok(out)) => {
            surface.release_fence = Some(slot);
            effects.push(Effect::ReleaseFence {
                surface: surface_key,
                fence: out,
            });
        }
        _ => {
            tracing::warn!(?surface_key, "failed to dup release fence");
            effects.push(Effect::ProtocolError {
                surface: surface_key,
                error: ClientError::SyncFenceFailed,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_classification() {
        let translated = ViewState::at(10.0, 20.0);
        assert!(translated.is_translation_only());
        assert!(translated.is_integer_translation());
        assert!(translated.is_axis_aligned());

        let fractional = ViewState::at(10.5, 20.0);
        assert!(fractional.is_translation_only());
        assert!(!fractional.is_integer_translation());

        let rotated = ViewState {
            transform: Mat3::from_angle(0.3),
            alpha: 1.0,
            clip: Region::new(),
        };
        assert!(!rotated.is_translation_only());
        assert!(!rotated.is_axis_aligned());

        let scaled = ViewState {
            transform: Mat3::from_scale(Vec2::new(2.0, 2.0)),
            alpha: 1.0,
            clip: Region::new(),
        };
        assert!(!scaled.is_translation_only());
        assert!(scaled.is_axis_aligned());
    }

    #[test]
    fn bounding_box_covers_rotated_surface() {
        let view = ViewState {
            transform: Mat3::from_angle(std::f32::consts::FRAC_PI_4),
            alpha: 1.0,
            clip: Region::new(),
        };
        let bbox = view.bounding_box(Extent2d {
            width: 10,
            height: 10,
        });

        // A 10x10 square rotated 45° spans about ±7.07 in x.
        assert!(bbox.x1 <= -7 && bbox.x2 >= 7);
        assert!(bbox.y1 <= 0 && bbox.y2 >= 14);
    }

    #[test]
    fn fan_debug_colors_cycle() {
        let mut debug = FanDebug {
            enabled: true,
            next_color: 0,
        };
        let first = debug.next();
        for _ in 0..FAN_DEBUG_COLORS.len() - 1 {
            assert_ne!(debug.next(), first);
        }
        assert_eq!(debug.next(), first);
    }
}
