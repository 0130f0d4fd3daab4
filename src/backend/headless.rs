//! Software implementation of [`GpuDevice`] for tests and CI.
//!
//! Textures live in CPU memory as f32 RGBA; triangle fans are
//! rasterized with barycentric interpolation and premultiplied
//! blending, which is enough to observe composition results
//! pixel-exactly. Line draws and GPU-side fence waits are recorded but
//! not shaded. Programs are "compiled" by parsing the `DEF_*` header
//! the shader synthesizer emits.

use {
    super::{
        BlendMode, CreateFramebufferError, CreateTextureError, DmabufPlane, DrawCall, DrawMode,
        Filter, FramebufferId, GpuDevice, ImportDmabufError, OutputCaps, ProgramError, ProgramId,
        RenderTarget, SinkId, SubUpload, TextureFormat, TextureId, TextureInfo, UniformLocation,
    },
    super::{f16_from_f32, f16_to_f32, FrameError},
    crate::{
        fence::{FenceError, SyncFd},
        geometry::PixelRect,
        Extent2d,
    },
    glam::Vec2,
    slab::Slab,
};

#[derive(Debug)]
struct SoftTexture {
    info: TextureInfo,
    /// RGBA, row major, top row first.
    pixels: Vec<f32>,
}

impl SoftTexture {
    fn new(info: TextureInfo) -> Self {
        SoftTexture {
            pixels: vec![0.0; info.extent.area() as usize * 4],
            info,
        }
    }

    fn texel(&self, x: i32, y: i32) -> [f32; 4] {
        let w = self.info.extent.width as i32;
        let h = self.info.extent.height as i32;
        let x = x.clamp(0, w - 1);
        let y = y.clamp(0, h - 1);
        let base = ((y * w + x) * 4) as usize;
        [
            self.pixels[base],
            self.pixels[base + 1],
            self.pixels[base + 2],
            self.pixels[base + 3],
        ]
    }

    fn sample(&self, uv: Vec2, filter: Filter) -> [f32; 4] {
        let w = self.info.extent.width as f32;
        let h = self.info.extent.height as f32;

        match filter {
            Filter::Nearest => {
                let x = (uv.x * w).floor() as i32;
                let y = (uv.y * h).floor() as i32;
                self.texel(x, y)
            }
            Filter::Linear => {
                let fx = uv.x * w - 0.5;
                let fy = uv.y * h - 0.5;
                let x0 = fx.floor() as i32;
                let y0 = fy.floor() as i32;
                let tx = fx - x0 as f32;
                let ty = fy - y0 as f32;

                let mut out = [0.0f32; 4];
                for c in 0..4 {
                    let top = self.texel(x0, y0)[c] * (1.0 - tx) + self.texel(x0 + 1, y0)[c] * tx;
                    let bot = self.texel(x0, y0 + 1)[c] * (1.0 - tx)
                        + self.texel(x0 + 1, y0 + 1)[c] * tx;
                    out[c] = top * (1.0 - ty) + bot * ty;
                }
                out
            }
        }
    }
}

/// Parsed `DEF_*` header of a synthesized fragment shader.
#[derive(Clone, Copy, Debug, Default)]
struct ShaderDefs {
    variant: u32,
    green_tint: bool,
    premult: bool,
    pre_curve: bool,
    mapping: bool,
    post_curve: bool,
}

#[derive(Debug)]
struct SoftProgram {
    defs: ShaderDefs,
    uniforms: Vec<String>,
}

fn parse_defines(fragment: &str) -> ShaderDefs {
    let mut defs = ShaderDefs::default();
    for line in fragment.lines() {
        let Some(rest) = line.strip_prefix("#define DEF_") else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value: u32 = value.parse().unwrap_or(0);
        match name {
            "VARIANT" => defs.variant = value,
            "GREEN_TINT" => defs.green_tint = value != 0,
            "INPUT_IS_PREMULT" => defs.premult = value != 0,
            "COLOR_PRE_CURVE" => defs.pre_curve = value != 0,
            "COLOR_MAPPING" => defs.mapping = value != 0,
            "COLOR_POST_CURVE" => defs.post_curve = value != 0,
            _ => {}
        }
    }
    defs
}

fn parse_uniforms(sources: &[&str]) -> Vec<String> {
    let mut names = Vec::new();
    for source in sources {
        for line in source.lines() {
            let line = line.trim();
            let Some(rest) = line.strip_prefix("uniform ") else {
                continue;
            };
            let Some(name) = rest.split_whitespace().nth(1) else {
                continue;
            };
            let name = name.trim_end_matches(';').to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

#[derive(Debug)]
struct SoftSink {
    extent: Extent2d,
    caps: OutputCaps,
    /// Rotating buffer ring; each entry remembers the swap it was last
    /// drawn in (0 = never).
    buffers: Vec<(Vec<f32>, u64)>,
    target: usize,
    presented: Option<usize>,
    swap_count: u64,
    /// Damage lists passed to swap, for inspection by tests.
    swap_damage: Vec<Option<Vec<PixelRect>>>,
}

/// A draw call as the device saw it, for test inspection.
#[derive(Clone, Debug)]
pub struct DrawRecord {
    pub target: RenderTarget,
    pub program: ProgramId,
    pub mode: DrawMode,
    pub vertex_count: usize,
    pub blend: BlendMode,
    pub scissor: Option<PixelRect>,
}

/// Software GPU device.
#[derive(Debug, Default)]
pub struct HeadlessDevice {
    textures: Slab<SoftTexture>,
    framebuffers: Slab<TextureId>,
    programs: Slab<SoftProgram>,
    sinks: Slab<SoftSink>,

    /// Monotonic submission tick; fences are cut at the current value
    /// and signal when a swap retires it.
    submitted: i64,
    completed: i64,

    fail_program_builds: u32,
    draw_log: Vec<DrawRecord>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        HeadlessDevice::default()
    }

    /// Registers a sink with `buffer_count` rotating buffers.
    pub fn create_sink(
        &mut self,
        extent: Extent2d,
        buffer_count: usize,
        caps: OutputCaps,
    ) -> SinkId {
        assert!(buffer_count >= 1);

        let sink = SoftSink {
            extent,
            caps,
            buffers: (0..buffer_count)
                .map(|_| (vec![0.0; extent.area() as usize * 4], 0))
                .collect(),
            target: 0,
            presented: None,
            swap_count: 0,
            swap_damage: Vec::new(),
        };
        SinkId(self.sinks.insert(sink) as u32)
    }

    /// Makes the next `count` program builds fail, for fallback-path
    /// tests.
    pub fn fail_next_program_builds(&mut self, count: u32) {
        self.fail_program_builds = count;
    }

    pub fn draw_log(&self) -> &[DrawRecord] {
        &self.draw_log
    }

    pub fn clear_draw_log(&mut self) {
        self.draw_log.clear();
    }

    /// Damage lists submitted with each swap of `sink`, oldest first.
    pub fn swap_damage_log(&self, sink: SinkId) -> &[Option<Vec<PixelRect>>] {
        &self.sinks[sink.0 as usize].swap_damage
    }

    pub fn swap_count(&self, sink: SinkId) -> u64 {
        self.sinks[sink.0 as usize].swap_count
    }

    /// Moves the target's pixel store out of the device so shading can
    /// sample textures without aliasing it; pair with
    /// [`HeadlessDevice::restore_target`].
    fn take_target(&mut self, target: RenderTarget) -> (Vec<f32>, Extent2d) {
        match target {
            RenderTarget::Framebuffer(fbo) => {
                let texture = self.framebuffers[fbo.0 as usize];
                let texture = &mut self.textures[texture.0 as usize];
                (std::mem::take(&mut texture.pixels), texture.info.extent)
            }
            RenderTarget::Sink(sink) => {
                let sink = &mut self.sinks[sink.0 as usize];
                let target = sink.target;
                (std::mem::take(&mut sink.buffers[target].0), sink.extent)
            }
        }
    }

    fn restore_target(&mut self, target: RenderTarget, pixels: Vec<f32>) {
        match target {
            RenderTarget::Framebuffer(fbo) => {
                let texture = self.framebuffers[fbo.0 as usize];
                self.textures[texture.0 as usize].pixels = pixels;
            }
            RenderTarget::Sink(sink) => {
                let sink = &mut self.sinks[sink.0 as usize];
                let target = sink.target;
                sink.buffers[target].0 = pixels;
            }
        }
    }

    fn shade(
        program: &SoftProgram,
        call: &DrawCall<'_>,
        textures: &Slab<SoftTexture>,
        uv: Vec2,
    ) -> [f32; 4] {
        let defs = &program.defs;

        let mut color = match defs.variant {
            7 => call.uniforms.unicolor,
            1 => {
                let (id, filter) = call.textures[0];
                let t = textures[id.0 as usize].sample(uv, filter);
                [t[0], t[1], t[2], 1.0]
            }
            0 => [0.0, 0.0, 0.0, 1.0],
            // YUV variants sample luma only here; the GLSL text is what
            // a real device runs.
            3 | 4 | 5 => {
                let (id, filter) = call.textures[0];
                let y = textures[id.0 as usize].sample(uv, filter)[0];
                let y = 1.16438356 * (y - 0.0625);
                [y, y, y, 1.0]
            }
            _ => {
                let (id, filter) = call.textures[0];
                textures[id.0 as usize].sample(uv, filter)
            }
        };

        if !defs.premult {
            for c in 0..3 {
                color[c] *= color[3];
            }
        }

        if defs.pre_curve {
            if let Some(lut) = call.uniforms.pre_curve_lut {
                let lut = &textures[lut.0 as usize];
                for c in 0..3 {
                    color[c] = sample_lut_1d(lut, color[c], c);
                }
            }
        }

        if defs.mapping {
            if let Some((lut, len)) = call.uniforms.mapping_lut {
                let lut = &textures[lut.0 as usize];
                let mapped = sample_lut_3d(lut, len, [color[0], color[1], color[2]]);
                color[..3].copy_from_slice(&mapped);
            }
        }

        if defs.post_curve {
            if let Some(lut) = call.uniforms.post_curve_lut {
                let lut = &textures[lut.0 as usize];
                for c in 0..3 {
                    color[c] = sample_lut_1d(lut, color[c], c);
                }
            }
        }

        for c in color.iter_mut() {
            *c *= call.uniforms.alpha;
        }

        if defs.green_tint {
            let tint = [0.0, 0.3, 0.0, 0.2];
            for c in 0..4 {
                color[c] = tint[c] + color[c] * 0.8;
            }
        }

        color
    }
}

/// Linear lookup in channel row `c` of a 3-row LUT texture.
fn sample_lut_1d(lut: &SoftTexture, x: f32, c: usize) -> f32 {
    let w = lut.info.extent.width as f32;
    let fx = (x.clamp(0.0, 1.0) * w - 0.5).clamp(0.0, w - 1.0);
    let x0 = fx.floor() as i32;
    let t = fx - x0 as f32;
    let row = c as i32;
    lut.texel(x0, row)[0] * (1.0 - t) + lut.texel(x0 + 1, row)[0] * t
}

/// Trilinear lookup in a 3D LUT flattened to rows of a 2D texture.
fn sample_lut_3d(lut: &SoftTexture, len: u32, rgb: [f32; 3]) -> [f32; 3] {
    let n = len as f32;
    let pos = [
        rgb[0].clamp(0.0, 1.0) * (n - 1.0),
        rgb[1].clamp(0.0, 1.0) * (n - 1.0),
        rgb[2].clamp(0.0, 1.0) * (n - 1.0),
    ];
    let cell = [
        (pos[0].floor() as u32).min(len - 2),
        (pos[1].floor() as u32).min(len - 2),
        (pos[2].floor() as u32).min(len - 2),
    ];
    let frac = [
        pos[0] - cell[0] as f32,
        pos[1] - cell[1] as f32,
        pos[2] - cell[2] as f32,
    ];

    let fetch = |i: u32, j: u32, k: u32| -> [f32; 4] {
        lut.texel(i as i32, (j + k * len) as i32)
    };

    let mut out = [0.0f32; 3];
    for c in 0..3 {
        let mut acc = 0.0;
        for corner in 0..8u32 {
            let di = corner & 1;
            let dj = (corner >> 1) & 1;
            let dk = (corner >> 2) & 1;
            let w = (if di == 1 { frac[0] } else { 1.0 - frac[0] })
                * (if dj == 1 { frac[1] } else { 1.0 - frac[1] })
                * (if dk == 1 { frac[2] } else { 1.0 - frac[2] });
            acc += w * fetch(cell[0] + di, cell[1] + dj, cell[2] + dk)[c];
        }
        out[c] = acc;
    }
    out
}

fn decode_texel(format: TextureFormat, data: &[u8]) -> [f32; 4] {
    match format {
        TextureFormat::Rgba8 => [
            data[0] as f32 / 255.0,
            data[1] as f32 / 255.0,
            data[2] as f32 / 255.0,
            data[3] as f32 / 255.0,
        ],
        TextureFormat::Bgra8 => [
            data[2] as f32 / 255.0,
            data[1] as f32 / 255.0,
            data[0] as f32 / 255.0,
            data[3] as f32 / 255.0,
        ],
        TextureFormat::Rgb10A2 => {
            let v = u32::from_le_bytes(data[..4].try_into().unwrap());
            [
                (v & 0x3ff) as f32 / 1023.0,
                ((v >> 10) & 0x3ff) as f32 / 1023.0,
                ((v >> 20) & 0x3ff) as f32 / 1023.0,
                ((v >> 30) & 0x3) as f32 / 3.0,
            ]
        }
        TextureFormat::RgbaF16 => [
            f16_to_f32(u16::from_le_bytes([data[0], data[1]])),
            f16_to_f32(u16::from_le_bytes([data[2], data[3]])),
            f16_to_f32(u16::from_le_bytes([data[4], data[5]])),
            f16_to_f32(u16::from_le_bytes([data[6], data[7]])),
        ],
        TextureFormat::R8 => [data[0] as f32 / 255.0, 0.0, 0.0, 1.0],
        TextureFormat::Rg8 => [
            data[0] as f32 / 255.0,
            data[1] as f32 / 255.0,
            0.0,
            1.0,
        ],
    }
}

impl GpuDevice for HeadlessDevice {
    fn create_texture(&mut self, info: TextureInfo) -> Result<TextureId, CreateTextureError> {
        if info.extent.is_empty() {
            return Err(CreateTextureError::Unsupported { info });
        }
        Ok(TextureId(self.textures.insert(SoftTexture::new(info)) as u32))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(texture.0 as usize);
    }

    fn upload_texture(&mut self, texture: TextureId, upload: SubUpload<'_>) {
        self.submitted += 1;

        let texture = &mut self.textures[texture.0 as usize];
        let format = texture.info.format;
        let bpt = format.bytes_per_texel();
        let width = texture.info.extent.width as i32;

        for row in 0..upload.rect.height() {
            for col in 0..upload.rect.width() {
                let src_row = upload.skip_rows as usize + row as usize;
                let src_col = upload.skip_pixels as usize + col as usize;
                let src = (src_row * upload.stride_pixels as usize + src_col) * bpt;
                let rgba = decode_texel(format, &upload.data[src..src + bpt]);

                let dst_x = upload.rect.x1 + col;
                let dst_y = upload.rect.y1 + row;
                let dst = ((dst_y * width + dst_x) * 4) as usize;
                texture.pixels[dst..dst + 4].copy_from_slice(&rgba);
            }
        }
    }

    fn create_framebuffer(
        &mut self,
        color: TextureId,
    ) -> Result<FramebufferId, CreateFramebufferError> {
        if !self.textures.contains(color.0 as usize) {
            return Err(CreateFramebufferError::Incomplete);
        }
        Ok(FramebufferId(self.framebuffers.insert(color) as u32))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(framebuffer.0 as usize);
    }

    fn create_program(&mut self, vertex: &str, fragment: &str) -> Result<ProgramId, ProgramError> {
        if self.fail_program_builds > 0 {
            self.fail_program_builds -= 1;
            return Err(ProgramError::Compile {
                log: "simulated compile failure".to_string(),
            });
        }

        let program = SoftProgram {
            defs: parse_defines(fragment),
            uniforms: parse_uniforms(&[vertex, fragment]),
        };
        Ok(ProgramId(self.programs.insert(program) as u32))
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(program.0 as usize);
    }

    fn uniform_location(&mut self, program: ProgramId, name: &str) -> Option<UniformLocation> {
        self.programs[program.0 as usize]
            .uniforms
            .iter()
            .position(|n| n == name)
            .map(|i| UniformLocation(i as i32))
    }

    fn draw(&mut self, target: RenderTarget, call: &DrawCall<'_>) -> Result<(), FrameError> {
        self.submitted += 1;
        self.draw_log.push(DrawRecord {
            target,
            program: call.program,
            mode: call.mode,
            vertex_count: call.vertices.len(),
            blend: call.blend,
            scissor: call.scissor,
        });

        if call.mode == DrawMode::Lines || call.vertices.len() < 3 {
            return Ok(());
        }

        // Project vertices to pixel coordinates through the ortho
        // projection and the viewport, y-down throughout.
        let vp = call.viewport;
        let to_pixels = |v: &super::Vertex| -> (Vec2, Vec2) {
            let clip = call.uniforms.projection * glam::Vec4::new(v.position[0], v.position[1], 0.0, 1.0);
            let px = (clip.x + 1.0) * 0.5 * vp.width() as f32 + vp.x1 as f32;
            let py = (clip.y + 1.0) * 0.5 * vp.height() as f32 + vp.y1 as f32;
            (Vec2::new(px, py), Vec2::new(v.texcoord[0], v.texcoord[1]))
        };

        let projected: Vec<(Vec2, Vec2)> = call.vertices.iter().map(to_pixels).collect();

        let (mut pixels, extent) = self.take_target(target);

        let bounds = PixelRect::from_extent(extent);
        let clip = match call.scissor {
            Some(scissor) => match bounds.intersect(&scissor) {
                Some(clip) => clip,
                None => {
                    self.restore_target(target, pixels);
                    return Ok(());
                }
            },
            None => bounds,
        };

        let program = &self.programs[call.program.0 as usize];

        for tri in 1..projected.len() - 1 {
            let (a, ta) = projected[0];
            let (b, tb) = projected[tri];
            let (c, tc) = projected[tri + 1];

            let area = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
            if area.abs() < 1e-12 {
                continue;
            }

            let min_x = a.x.min(b.x).min(c.x).floor() as i32;
            let max_x = a.x.max(b.x).max(c.x).ceil() as i32;
            let min_y = a.y.min(b.y).min(c.y).floor() as i32;
            let max_y = a.y.max(b.y).max(c.y).ceil() as i32;

            let min_x = min_x.max(clip.x1);
            let max_x = max_x.min(clip.x2);
            let min_y = min_y.max(clip.y1);
            let max_y = max_y.min(clip.y2);

            for y in min_y..max_y {
                for x in min_x..max_x {
                    let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);

                    let wa = ((b.x - p.x) * (c.y - p.y) - (b.y - p.y) * (c.x - p.x)) / area;
                    let wb = ((c.x - p.x) * (a.y - p.y) - (c.y - p.y) * (a.x - p.x)) / area;
                    let wc = 1.0 - wa - wb;
                    if wa < 0.0 || wb < 0.0 || wc < 0.0 {
                        continue;
                    }

                    // A center exactly on the edge shared with the next
                    // fan triangle belongs to that triangle, otherwise
                    // translucent fans would blend the seam twice.
                    if wb == 0.0 && tri + 2 < projected.len() {
                        continue;
                    }

                    let uv = ta * wa + tb * wb + tc * wc;
                    let src = Self::shade(program, call, &self.textures, uv);

                    let dst = ((y * extent.width as i32 + x) * 4) as usize;
                    match call.blend {
                        BlendMode::Replace => {
                            pixels[dst..dst + 4].copy_from_slice(&src);
                        }
                        BlendMode::PremultipliedAlpha => {
                            let inv_a = 1.0 - src[3];
                            for ch in 0..4 {
                                pixels[dst + ch] = src[ch] + pixels[dst + ch] * inv_a;
                            }
                        }
                    }
                }
            }
        }

        self.restore_target(target, pixels);
        Ok(())
    }

    fn read_pixels(&mut self, target: RenderTarget, rect: PixelRect) -> Vec<u8> {
        let (pixels, extent) = match target {
            RenderTarget::Framebuffer(fbo) => {
                let texture = self.framebuffers[fbo.0 as usize];
                let texture = &self.textures[texture.0 as usize];
                (&texture.pixels, texture.info.extent)
            }
            RenderTarget::Sink(sink) => {
                let sink = &self.sinks[sink.0 as usize];
                let index = sink.presented.unwrap_or(sink.target);
                (&sink.buffers[index].0, sink.extent)
            }
        };

        let mut out = Vec::with_capacity((rect.width() * rect.height() * 4) as usize);
        for y in rect.y1..rect.y2 {
            for x in rect.x1..rect.x2 {
                let base = ((y * extent.width as i32 + x) * 4) as usize;
                for c in 0..4 {
                    out.push((pixels[base + c].clamp(0.0, 1.0) * 255.0).round() as u8);
                }
            }
        }
        out
    }

    fn import_dmabuf(
        &mut self,
        extent: Extent2d,
        planes: &[DmabufPlane],
    ) -> Result<TextureId, ImportDmabufError> {
        if planes.is_empty() || planes.len() > 3 {
            return Err(ImportDmabufError::BadPlanes);
        }

        // No real fds here; imports land as opaque black textures.
        self.create_texture(TextureInfo {
            format: TextureFormat::Rgba8,
            extent,
        })
        .map_err(|_| ImportDmabufError::Unsupported)
    }

    fn sink_extent(&self, sink: SinkId) -> Extent2d {
        self.sinks[sink.0 as usize].extent
    }

    fn sink_caps(&self, sink: SinkId) -> OutputCaps {
        self.sinks[sink.0 as usize].caps
    }

    fn sink_buffer_age(&mut self, sink: SinkId) -> u32 {
        let sink = &self.sinks[sink.0 as usize];
        if !sink.caps.contains(OutputCaps::BUFFER_AGE) {
            return 0;
        }

        let (_, last_drawn) = sink.buffers[sink.target];
        if last_drawn == 0 {
            0
        } else {
            (sink.swap_count - last_drawn + 1) as u32
        }
    }

    fn swap(&mut self, sink_id: SinkId, damage: Option<&[PixelRect]>) -> Result<(), FrameError> {
        self.submitted += 1;
        // Everything submitted before this swap retires with it.
        self.completed = self.submitted;

        let sink = &mut self.sinks[sink_id.0 as usize];
        sink.swap_count += 1;
        sink.buffers[sink.target].1 = sink.swap_count;
        sink.presented = Some(sink.target);
        sink.target = (sink.target + 1) % sink.buffers.len();
        sink.swap_damage.push(damage.map(|d| d.to_vec()));
        Ok(())
    }

    fn create_fence(&mut self) -> Result<SyncFd, FenceError> {
        Ok(SyncFd::from_raw(self.submitted))
    }

    fn dup_fence(&mut self, fence: &SyncFd) -> Result<SyncFd, FenceError> {
        Ok(SyncFd::from_raw(fence.as_raw()))
    }

    fn wait_fence_gpu(&mut self, _fence: &SyncFd) {
        // GPU-side waits order work on a real queue; the software
        // queue is already in submission order.
    }

    fn fence_signalled(&self, fence: &SyncFd) -> bool {
        fence.as_raw() <= self.completed
    }

    fn fence_timestamp(&self, fence: &SyncFd) -> Option<u64> {
        self.fence_signalled(fence)
            .then(|| fence.as_raw() as u64 * 1_000)
    }
}
