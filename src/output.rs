use {
    crate::{
        backend::{
            FramebufferId, FrameError, GpuDevice, OutputCaps, RenderTarget, SinkId, TextureFormat,
            TextureId, TextureInfo, UniformValues,
        },
        color::{ColorManager, ColorProfile, EotfMode, OutputColorOutcome, TransformCategory},
        event::{Effect, OutputKey, SurfaceKey},
        fence::{TimelinePoint, TimelineTag},
        geometry::PixelRect,
        paint::{
            draw_paint_node, draw_textured_rect, issue_release_fence, DrawContext, FanDebug,
            GpuColorTransform, NodeColor, PaintNode,
        },
        region::Region,
        shader::{ProgramCache, ShaderKey, ShaderVariant},
        surface::SurfaceState,
        Extent2d,
    },
    arrayvec::ArrayVec,
    glam::{Mat4, Vec2, Vec3},
    slab::Slab,
    smallvec::SmallVec,
    std::{sync::Arc, time::Duration},
};

/// Frames of damage history kept for buffer-age accumulation.
///
/// Ages beyond this force a full repaint.
pub const BUFFER_DAMAGE_COUNT: usize = 2;

/// Decoration texture on one edge of the output.
///
/// BGRA; the allocation may be wider than the drawn strip.
#[derive(Clone, Copy, Debug)]
pub struct Border {
    pub texture: TextureId,
    /// Thickness of the strip, pixels.
    pub thickness: u32,
}

/// Edge index into the border array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BorderSide {
    Top = 0,
    Left = 1,
    Right = 2,
    Bottom = 3,
}

#[derive(Debug)]
struct Shadow {
    texture: TextureId,
    fbo: FramebufferId,
    /// Blend→output leg applied while blitting to the target.
    blit: GpuColorTransform,
}

#[derive(Debug)]
struct FrameDamage {
    damage: Region,
    border_serial: u64,
}

/// Per-output repaint state.
#[derive(Debug)]
pub struct OutputState {
    pub(crate) sink: SinkId,
    caps: OutputCaps,

    /// Content area size, excluding borders.
    extent: Extent2d,

    /// Linear filtering forced by output zoom.
    pub zoom_active: bool,

    /// Censor protected content on this output: its protection level
    /// is below what content demands, or a recording plane had to be
    /// disabled.
    pub censor_protected: bool,

    pub(crate) nodes: Vec<PaintNode>,

    profile: Option<Arc<ColorProfile>>,
    eotf: EotfMode,
    outcome: OutputColorOutcome,
    /// sRGB→output leg resident on the GPU, used for borders.
    srgb_gpu: Option<GpuColorTransform>,

    shadow: Option<Shadow>,

    borders: [Option<Border>; 4],
    border_serial: u64,

    damage_history: ArrayVec<FrameDamage, BUFFER_DAMAGE_COUNT>,
    frame_counter: u64,

    /// The next frame must recompose everything, e.g. because the
    /// color outcome changed or the shadow target is fresh.
    full_repaint_pending: bool,

    pub(crate) timeline: Vec<TimelinePoint>,
}

/// Borrows the engine lends to a repaint.
pub(crate) struct RepaintResources<'a> {
    pub device: &'a mut dyn GpuDevice,
    pub programs: &'a mut ProgramCache,
    pub color: &'a ColorManager,
    pub surfaces: &'a mut Slab<SurfaceState>,
    pub now: Duration,
    pub fan_debug: &'a mut FanDebug,
    pub green_tint: bool,
}

impl OutputState {
    pub(crate) fn new(device: &dyn GpuDevice, sink: SinkId) -> Self {
        OutputState {
            sink,
            caps: device.sink_caps(sink),
            extent: device.sink_extent(sink),
            zoom_active: false,
            censor_protected: false,
            nodes: Vec::new(),
            profile: None,
            eotf: EotfMode::Sdr,
            outcome: OutputColorOutcome::unmanaged(),
            srgb_gpu: None,
            shadow: None,
            borders: [None; 4],
            border_serial: 0,
            damage_history: ArrayVec::new(),
            frame_counter: 0,
            full_repaint_pending: true,
            timeline: Vec::new(),
        }
    }

    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    pub fn profile(&self) -> Option<&Arc<ColorProfile>> {
        self.profile.as_ref()
    }

    pub(crate) fn set_profile(&mut self, profile: Option<Arc<ColorProfile>>) {
        self.profile = profile;
    }

    pub(crate) fn set_eotf(&mut self, mode: EotfMode) {
        self.eotf = mode;
    }

    /// Installs or removes a border, shrinking the content area.
    pub(crate) fn set_border(
        &mut self,
        device: &dyn GpuDevice,
        side: BorderSide,
        border: Option<Border>,
    ) {
        self.borders[side as usize] = border;
        self.border_serial += 1;

        let target = device.sink_extent(self.sink);
        let (left, top, right, bottom) = self.border_thickness();
        self.extent = Extent2d {
            width: target.width.saturating_sub(left + right),
            height: target.height.saturating_sub(top + bottom),
        };
    }

    fn border_thickness(&self) -> (u32, u32, u32, u32) {
        let t = |side: usize| self.borders[side].map_or(0, |b| b.thickness);
        (
            t(BorderSide::Left as usize),
            t(BorderSide::Top as usize),
            t(BorderSide::Right as usize),
            t(BorderSide::Bottom as usize),
        )
    }

    fn border_rect(&self, side: BorderSide, target: Extent2d) -> PixelRect {
        let (left, top, right, bottom) = self.border_thickness();
        let (tw, th) = (target.width as i32, target.height as i32);
        let content_h = self.extent.height as i32;

        match side {
            BorderSide::Top => PixelRect::new(0, 0, tw, top as i32),
            BorderSide::Bottom => PixelRect::new(0, th - bottom as i32, tw, th),
            BorderSide::Left => {
                PixelRect::new(0, top as i32, left as i32, top as i32 + content_h)
            }
            BorderSide::Right => PixelRect::new(
                tw - right as i32,
                top as i32,
                tw,
                top as i32 + content_h,
            ),
        }
    }

    fn content_rect(&self) -> PixelRect {
        PixelRect::from_extent(self.extent)
    }

    fn ortho(extent: Extent2d) -> Mat4 {
        // Output coordinates are y-down; NDC -1 is the top row.
        Mat4::orthographic_rh_gl(
            0.0,
            extent.width as f32,
            0.0,
            extent.height as f32,
            -1.0,
            1.0,
        )
    }

    /// Rebuilds the color outcome after a profile or EOTF change.
    ///
    /// Construction failure falls back to electrical passthrough
    /// rather than poisoning any cache.
    fn rebuild_outcome(&mut self, device: &mut dyn GpuDevice, color: &ColorManager) {
        if let Some(gpu) = self.srgb_gpu.take() {
            gpu.release(device);
        }
        self.drop_shadow(device);

        self.outcome = match &self.profile {
            None => OutputColorOutcome::unmanaged(),
            Some(profile) => match OutputColorOutcome::build(color, profile, self.eotf) {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(%err, "output color outcome failed, falling back");
                    OutputColorOutcome::fallback(profile, self.eotf)
                }
            },
        };

        if let Some(from_srgb) = &self.outcome.from_srgb {
            match GpuColorTransform::upload(device, from_srgb.clone()) {
                Ok(gpu) => self.srgb_gpu = Some(gpu),
                Err(err) => tracing::error!(%err, "sRGB→output LUT upload failed"),
            }
        }

        for node in &mut self.nodes {
            node.invalidate_color(device);
        }
        self.full_repaint_pending = true;
    }

    /// Resolves stale per-node color transforms.
    ///
    /// All nodes of one surface on this output share the transform;
    /// it is computed once per repaint at most.
    fn resolve_node_colors(&mut self, res: &mut RepaintResources<'_>) {
        let output_profile = match &self.profile {
            Some(profile) => profile.clone(),
            None => {
                for node in &mut self.nodes {
                    if matches!(node.color, NodeColor::Stale) {
                        node.color = NodeColor::Unmanaged;
                    }
                }
                return;
            }
        };

        // Blending in linear space routes content to the blend space;
        // otherwise nodes go straight to device space.
        let category = if self.outcome.needs_blend_space()
            && !self.caps.contains(OutputCaps::BLEND_TO_OUTPUT)
        {
            TransformCategory::InputToBlend
        } else {
            TransformCategory::InputToOutput
        };

        for node in &mut self.nodes {
            if !matches!(node.color, NodeColor::Stale) {
                continue;
            }

            let Some(surface) = res.surfaces.get(node.surface.0) else {
                continue;
            };
            let input = surface
                .profile
                .clone()
                .unwrap_or_else(|| res.color.stock_srgb());

            node.color = match res.color.transform(
                category,
                surface.render_intent,
                &input,
                &output_profile,
            ) {
                Ok(transform) => match GpuColorTransform::upload(res.device, transform) {
                    Ok(gpu) => NodeColor::Managed(gpu),
                    Err(err) => {
                        tracing::error!(%err, "surface color LUT upload failed");
                        NodeColor::Invalid
                    }
                },
                Err(err) => {
                    tracing::warn!(
                        %err,
                        surface = ?node.surface,
                        "surface color transform failed"
                    );
                    NodeColor::Invalid
                }
            };
        }
    }

    fn ensure_shadow(&mut self, device: &mut dyn GpuDevice) -> Result<(), FrameError> {
        if self.shadow.is_some() {
            return Ok(());
        }

        let Some(from_blend) = self.outcome.from_blend.clone() else {
            return Ok(());
        };

        let texture = device
            .create_texture(TextureInfo {
                format: TextureFormat::RgbaF16,
                extent: self.extent,
            })
            .map_err(|_| FrameError::OutOfMemory)?;

        let fbo = match device.create_framebuffer(texture) {
            Ok(fbo) => fbo,
            Err(err) => {
                tracing::error!(%err, "shadow framebuffer incomplete");
                device.destroy_texture(texture);
                return Err(FrameError::OutOfMemory);
            }
        };

        let blit = match GpuColorTransform::upload(device, from_blend) {
            Ok(blit) => blit,
            Err(err) => {
                tracing::error!(%err, "blend→output LUT upload failed");
                device.destroy_framebuffer(fbo);
                device.destroy_texture(texture);
                return Err(FrameError::OutOfMemory);
            }
        };

        self.shadow = Some(Shadow { texture, fbo, blit });
        Ok(())
    }

    fn drop_shadow(&mut self, device: &mut dyn GpuDevice) {
        if let Some(shadow) = self.shadow.take() {
            device.destroy_framebuffer(shadow.fbo);
            device.destroy_texture(shadow.texture);
            shadow.blit.release(device);
        }
    }

    /// Draws one frame and presents it.
    pub(crate) fn repaint(
        &mut self,
        key: OutputKey,
        res: &mut RepaintResources<'_>,
        frame_damage: &Region,
        effects: &mut SmallVec<[Effect; 4]>,
    ) -> Result<(), FrameError> {
        if self.outcome.stale(self.profile.as_ref(), self.eotf) {
            self.rebuild_outcome(res.device, res.color);
        }
        self.resolve_node_colors(res);

        let full = Region::from_rect(self.content_rect());

        // This frame's own damage, as recorded for future buffer ages.
        let mut frame_dmg = frame_damage.clone();
        frame_dmg.intersect_rect(&self.content_rect());
        if res.fan_debug.enabled {
            // Fan debug scribbles over everything; partial updates are
            // off the table for this frame.
            frame_dmg = full.clone();
        }
        if self.full_repaint_pending {
            frame_dmg = full.clone();
            self.full_repaint_pending = false;
        }

        let age = res.device.sink_buffer_age(self.sink) as usize;
        let target_dmg = accumulate_damage(
            &self.damage_history,
            &frame_dmg,
            age,
            self.border_serial,
            &full,
        );

        if self.damage_history.is_full() {
            self.damage_history.pop();
        }
        self.damage_history.insert(
            0,
            FrameDamage {
                damage: frame_dmg.clone(),
                border_serial: self.border_serial,
            },
        );

        if self.caps.contains(OutputCaps::NATIVE_FENCES) {
            if let Ok(fence) = res.device.create_fence() {
                self.timeline.push(TimelinePoint {
                    tag: TimelineTag::BeginFrame,
                    frame: self.frame_counter,
                    fence,
                });
            }
        }

        let use_shadow =
            self.outcome.needs_blend_space() && !self.caps.contains(OutputCaps::BLEND_TO_OUTPUT);
        if use_shadow {
            self.ensure_shadow(res.device)?;
        } else {
            self.drop_shadow(res.device);
        }

        let (left, top, ..) = self.border_thickness();
        let target_extent = res.device.sink_extent(self.sink);
        let sink_projection = Self::ortho(target_extent)
            * Mat4::from_translation(Vec3::new(left as f32, top as f32, 0.0));

        let (target, viewport, projection, compose_dmg) = match &self.shadow {
            Some(shadow) => (
                RenderTarget::Framebuffer(shadow.fbo),
                self.content_rect(),
                Self::ortho(self.extent),
                // The shadow keeps the full composition; only fresh
                // damage needs recomposing into it.
                frame_dmg.clone(),
            ),
            None => (
                RenderTarget::Sink(self.sink),
                PixelRect::from_extent(target_extent),
                sink_projection,
                target_dmg.clone(),
            ),
        };

        self.nodes.sort_by_key(|node| node.z);

        let mut nodes = std::mem::take(&mut self.nodes);
        let draw_result = (|| -> Result<(), FrameError> {
            let mut ctx = DrawContext {
                device: &mut *res.device,
                programs: &mut *res.programs,
                now: res.now,
                target,
                viewport,
                projection,
                damage: &compose_dmg,
                force_linear: self.zoom_active,
                green_tint: res.green_tint,
                censor_protected: self.censor_protected,
                fan_debug: &mut *res.fan_debug,
            };

            for node in &mut nodes {
                node.used_in_frame = false;

                let Some(surface) = res.surfaces.get_mut(node.surface.0) else {
                    continue;
                };

                surface.flush_damage(ctx.device);
                draw_paint_node(&mut ctx, node, surface, effects)?;
            }
            Ok(())
        })();
        // Restore before propagating so teardown still sees the nodes.
        self.nodes = nodes;
        draw_result?;

        let mut used: SmallVec<[SurfaceKey; 8]> = SmallVec::new();
        for node in &self.nodes {
            if node.used_in_frame && !used.contains(&node.surface) {
                used.push(node.surface);
            }
        }

        if let Some(shadow) = &self.shadow {
            self.blit_shadow(res, shadow, &target_dmg, target_extent, sink_projection)?;
        }

        let border_rects = self.draw_borders(res, target_extent)?;

        if self.caps.contains(OutputCaps::PARTIAL_UPDATE) && !res.fan_debug.enabled {
            // Translate to target-buffer coordinates: offset past the
            // borders, then flip for the GL-style bottom-left origin.
            let mut rects: Vec<PixelRect> = target_dmg
                .rects()
                .iter()
                .map(|r| {
                    r.translate(left as i32, top as i32)
                        .flip_y(target_extent.height as i32)
                })
                .collect();
            rects.extend(
                border_rects
                    .iter()
                    .map(|r| r.flip_y(target_extent.height as i32)),
            );
            res.device.swap(self.sink, Some(&rects))?;
        } else {
            res.device.swap(self.sink, None)?;
        }

        if self.caps.contains(OutputCaps::NATIVE_FENCES) {
            if let Ok(fence) = res.device.create_fence() {
                for surface_key in &used {
                    let Some(surface) = res.surfaces.get_mut(surface_key.0) else {
                        continue;
                    };
                    if surface.explicit_sync {
                        issue_release_fence(res.device, *surface_key, surface, &fence, effects);
                    }
                }
                self.timeline.push(TimelinePoint {
                    tag: TimelineTag::EndFrame,
                    frame: self.frame_counter,
                    fence,
                });
            }
        }

        effects.push(Effect::SubmittedDamage {
            output: key,
            damage: target_dmg,
        });

        self.frame_counter += 1;
        res.programs.sweep(res.device, res.now);
        Ok(())
    }

    /// Applies the blend→output transform while copying damaged
    /// rectangles from the shadow to the sink target.
    fn blit_shadow(
        &self,
        res: &mut RepaintResources<'_>,
        shadow: &Shadow,
        target_dmg: &Region,
        target_extent: Extent2d,
        sink_projection: Mat4,
    ) -> Result<(), FrameError> {
        let key = shadow
            .blit
            .key_bits(ShaderKey::new(ShaderVariant::Rgba).with_premultiplied(true));
        let lookup = res.programs.use_program(res.device, key, res.now);

        let mut uniforms = UniformValues::new(sink_projection);
        shadow.blit.bind(&mut uniforms);

        let (w, h) = (self.extent.width as f32, self.extent.height as f32);
        for rect in target_dmg.rects() {
            let t0 = Vec2::new(rect.x1 as f32 / w, rect.y1 as f32 / h);
            let t1 = Vec2::new(rect.x2 as f32 / w, rect.y2 as f32 / h);

            draw_textured_rect(
                res.device,
                lookup.id,
                RenderTarget::Sink(self.sink),
                PixelRect::from_extent(target_extent),
                sink_projection,
                shadow.texture,
                *rect,
                [t0, t1],
                uniforms.clone(),
            )?;
        }
        Ok(())
    }

    /// Draws the decoration strips; returns their target-space rects.
    fn draw_borders(
        &self,
        res: &mut RepaintResources<'_>,
        target_extent: Extent2d,
    ) -> Result<Vec<PixelRect>, FrameError> {
        let mut drawn = Vec::new();
        if self.borders.iter().all(Option::is_none) {
            return Ok(drawn);
        }

        let base = ShaderKey::new(ShaderVariant::Rgba).with_premultiplied(true);
        let key = match &self.srgb_gpu {
            Some(gpu) => gpu.key_bits(base),
            None => base,
        };
        let lookup = res.programs.use_program(res.device, key, res.now);

        let projection = Self::ortho(target_extent);
        let mut uniforms = UniformValues::new(projection);
        if let Some(gpu) = &self.srgb_gpu {
            gpu.bind(&mut uniforms);
        }

        for side in [
            BorderSide::Top,
            BorderSide::Left,
            BorderSide::Right,
            BorderSide::Bottom,
        ] {
            let Some(border) = self.borders[side as usize] else {
                continue;
            };

            let rect = self.border_rect(side, target_extent);
            if rect.is_empty() {
                continue;
            }

            draw_textured_rect(
                res.device,
                lookup.id,
                RenderTarget::Sink(self.sink),
                PixelRect::from_extent(target_extent),
                projection,
                border.texture,
                rect,
                [Vec2::ZERO, Vec2::ONE],
                uniforms.clone(),
            )?;
            drawn.push(rect);
        }
        Ok(drawn)
    }

    /// Tightly packed RGBA8 snapshot of the content area, top row
    /// first.
    pub(crate) fn capture(&self, device: &mut dyn GpuDevice) -> Vec<u8> {
        let (left, top, ..) = self.border_thickness();
        let rect = self.content_rect().translate(left as i32, top as i32);
        device.read_pixels(RenderTarget::Sink(self.sink), rect)
    }

    /// Emits timestamps for signalled timeline points.
    pub(crate) fn poll_timeline(
        &mut self,
        key: OutputKey,
        device: &dyn GpuDevice,
        effects: &mut SmallVec<[Effect; 4]>,
    ) {
        self.timeline.retain(|point| {
            match device.fence_timestamp(&point.fence) {
                Some(nanoseconds) => {
                    effects.push(Effect::GpuTimestamp {
                        output: key,
                        tag: point.tag,
                        frame: point.frame,
                        nanoseconds,
                    });
                    false
                }
                None => true,
            }
        });
    }

    /// Output teardown: pending timeline points die, GPU residency is
    /// released, the shader cache is untouched (the color manager owns
    /// it, not the output).
    pub(crate) fn destroy(&mut self, device: &mut dyn GpuDevice) {
        self.timeline.clear();
        self.drop_shadow(device);
        if let Some(gpu) = self.srgb_gpu.take() {
            gpu.release(device);
        }
        for node in &mut self.nodes {
            node.invalidate_color(device);
        }
        self.nodes.clear();
        for border in &mut self.borders {
            if let Some(border) = border.take() {
                device.destroy_texture(border.texture);
            }
        }
    }
}

/// Union of this frame's damage with the ages the target buffer
/// missed.
///
/// Unknown or too-old ages, and any border layout change inside the
/// consulted history, degrade to the full output.
fn accumulate_damage(
    history: &ArrayVec<FrameDamage, BUFFER_DAMAGE_COUNT>,
    frame_damage: &Region,
    age: usize,
    border_serial: u64,
    full: &Region,
) -> Region {
    if age == 0 || age - 1 > history.len() {
        return full.clone();
    }

    let mut damage = frame_damage.clone();
    for entry in history.iter().take(age - 1) {
        if entry.border_serial != border_serial {
            return full.clone();
        }
        damage.union(&entry.damage);
    }
    damage
}
