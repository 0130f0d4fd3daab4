use {
    crate::backend::{GpuDevice, ProgramError, ProgramId, UniformLocation},
    hashbrown::HashMap,
    std::time::Duration,
};

/// Texture sampling variant a shader is built for.
///
/// The discriminants are part of the [`ShaderKey`] bit layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum ShaderVariant {
    None = 0,
    /// Opaque RGB, alpha forced to one.
    Rgbx = 1,
    Rgba = 2,
    /// Three planes: Y, U, V (YUV420, YUV444).
    Y_U_V = 3,
    /// Two planes: Y plus interleaved UV (NV12, NV16).
    Y_UV = 4,
    /// Two planes: Y plus interleaved XUXV (YUYV).
    Y_XUXV = 5,
    /// Single packed XYUV plane.
    Xyuv = 6,
    /// No texture, a single color.
    Solid = 7,
    /// Externally imported (dmabuf) sampler.
    External = 8,
}

impl Default for ShaderVariant {
    fn default() -> Self {
        ShaderVariant::None
    }
}

impl ShaderVariant {
    fn from_bits(bits: u32) -> ShaderVariant {
        match bits {
            0 => ShaderVariant::None,
            1 => ShaderVariant::Rgbx,
            2 => ShaderVariant::Rgba,
            3 => ShaderVariant::Y_U_V,
            4 => ShaderVariant::Y_UV,
            5 => ShaderVariant::Y_XUXV,
            6 => ShaderVariant::Xyuv,
            7 => ShaderVariant::Solid,
            8 => ShaderVariant::External,
            _ => unreachable!("invalid shader variant bits {bits}"),
        }
    }

    /// Number of texture planes this variant samples.
    pub fn planes(&self) -> usize {
        match self {
            ShaderVariant::None | ShaderVariant::Solid => 0,
            ShaderVariant::Rgbx
            | ShaderVariant::Rgba
            | ShaderVariant::Xyuv
            | ShaderVariant::External => 1,
            ShaderVariant::Y_UV | ShaderVariant::Y_XUXV => 2,
            ShaderVariant::Y_U_V => 3,
        }
    }
}

/// How the color pre/post curve stage runs in the shader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColorCurveKind {
    None = 0,
    /// Three 1D LUTs in one 2D texture.
    Lut3x1d = 1,
}

/// How the color mapping stage runs in the shader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColorMappingKind {
    Identity = 0,
    Lut3d = 1,
}

/// Requirements a compiled program satisfies, packed into 32 bits.
///
/// Layout: bits 0–3 variant, bit 4 green-tint debug, bit 5 input is
/// premultiplied, bits 6–7 pre-curve kind, bit 8 3D-LUT mapping,
/// bits 9–10 post-curve kind. Bits 11–31 must stay zero: the cache
/// hashes and compares raw bits, so a stray bit is a distinct shader.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, bytemuck::Pod, bytemuck::Zeroable, Default)]
pub struct ShaderKey(u32);

const VARIANT_MASK: u32 = 0xf;
const GREEN_TINT: u32 = 1 << 4;
const INPUT_IS_PREMULT: u32 = 1 << 5;
const PRE_CURVE_SHIFT: u32 = 6;
const PRE_CURVE_MASK: u32 = 0x3 << PRE_CURVE_SHIFT;
const MAPPING_LUT3D: u32 = 1 << 8;
const POST_CURVE_SHIFT: u32 = 9;
const POST_CURVE_MASK: u32 = 0x3 << POST_CURVE_SHIFT;

impl ShaderKey {
    pub fn new(variant: ShaderVariant) -> Self {
        ShaderKey(variant as u32)
    }

    pub fn with_green_tint(self, on: bool) -> Self {
        ShaderKey(if on {
            self.0 | GREEN_TINT
        } else {
            self.0 & !GREEN_TINT
        })
    }

    pub fn with_premultiplied(self, on: bool) -> Self {
        ShaderKey(if on {
            self.0 | INPUT_IS_PREMULT
        } else {
            self.0 & !INPUT_IS_PREMULT
        })
    }

    pub fn with_pre_curve(self, kind: ColorCurveKind) -> Self {
        ShaderKey((self.0 & !PRE_CURVE_MASK) | ((kind as u32) << PRE_CURVE_SHIFT))
    }

    pub fn with_mapping(self, kind: ColorMappingKind) -> Self {
        ShaderKey(match kind {
            ColorMappingKind::Identity => self.0 & !MAPPING_LUT3D,
            ColorMappingKind::Lut3d => self.0 | MAPPING_LUT3D,
        })
    }

    pub fn with_post_curve(self, kind: ColorCurveKind) -> Self {
        ShaderKey((self.0 & !POST_CURVE_MASK) | ((kind as u32) << POST_CURVE_SHIFT))
    }

    pub fn variant(&self) -> ShaderVariant {
        ShaderVariant::from_bits(self.0 & VARIANT_MASK)
    }

    pub fn green_tint(&self) -> bool {
        self.0 & GREEN_TINT != 0
    }

    pub fn premultiplied(&self) -> bool {
        self.0 & INPUT_IS_PREMULT != 0
    }

    pub fn pre_curve(&self) -> ColorCurveKind {
        if self.0 & PRE_CURVE_MASK != 0 {
            ColorCurveKind::Lut3x1d
        } else {
            ColorCurveKind::None
        }
    }

    pub fn mapping(&self) -> ColorMappingKind {
        if self.0 & MAPPING_LUT3D != 0 {
            ColorMappingKind::Lut3d
        } else {
            ColorMappingKind::Identity
        }
    }

    pub fn post_curve(&self) -> ColorCurveKind {
        if self.0 & POST_CURVE_MASK != 0 {
            ColorCurveKind::Lut3x1d
        } else {
            ColorCurveKind::None
        }
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

// The cache hashes raw bytes; any padding would make equal keys hash
// differently.
const _: () = assert!(std::mem::size_of::<ShaderKey>() == 4);

/// Vertex stage shared by every program.
pub const VERTEX_SHADER: &str = "\
uniform mat4 proj;
attribute vec2 position;
attribute vec2 texcoord;
varying vec2 v_texcoord;

void main()
{
    gl_Position = proj * vec4(position, 0.0, 1.0);
    v_texcoord = texcoord;
}
";

const FRAGMENT_BODY: &str = "\
precision highp float;

varying vec2 v_texcoord;
uniform sampler2D tex;
uniform sampler2D tex1;
uniform sampler2D tex2;
uniform float alpha;
uniform vec4 unicolor;
uniform sampler2D color_pre_curve_lut_2d;
uniform sampler2D color_mapping_lut_2d;
uniform float color_mapping_lut_len;
uniform sampler2D color_post_curve_lut_2d;

vec4
sample_input_argb(vec2 coord)
{
#if DEF_VARIANT == 7 /* solid */
    return unicolor;
#elif DEF_VARIANT == 1 /* rgbx */
    return vec4(texture2D(tex, coord).rgb, 1.0);
#elif DEF_VARIANT == 3 /* y_u_v */
    float y = 1.16438356 * (texture2D(tex, coord).x - 0.0625);
    float u = texture2D(tex1, coord).x - 0.5;
    float v = texture2D(tex2, coord).x - 0.5;
    return vec4(y + 1.59602678 * v,
                y - 0.39176229 * u - 0.81296764 * v,
                y + 2.01723214 * u,
                1.0);
#elif DEF_VARIANT == 4 /* y_uv */
    float y = 1.16438356 * (texture2D(tex, coord).x - 0.0625);
    vec2 uv = texture2D(tex1, coord).rg - 0.5;
    return vec4(y + 1.59602678 * uv.y,
                y - 0.39176229 * uv.x - 0.81296764 * uv.y,
                y + 2.01723214 * uv.x,
                1.0);
#elif DEF_VARIANT == 5 /* y_xuxv */
    float y = 1.16438356 * (texture2D(tex, coord).x - 0.0625);
    vec2 uv = texture2D(tex1, coord).ga - 0.5;
    return vec4(y + 1.59602678 * uv.y,
                y - 0.39176229 * uv.x - 0.81296764 * uv.y,
                y + 2.01723214 * uv.x,
                1.0);
#elif DEF_VARIANT == 6 /* xyuv */
    vec4 t = texture2D(tex, coord);
    float y = 1.16438356 * (t.b - 0.0625);
    return vec4(y + 1.59602678 * (t.r - 0.5),
                y - 0.39176229 * (t.g - 0.5) - 0.81296764 * (t.r - 0.5),
                y + 2.01723214 * (t.g - 0.5),
                1.0);
#else /* rgba, external */
    return texture2D(tex, coord);
#endif
}

float
lut_1d(sampler2D lut, float x, float row)
{
    return texture2D(lut, vec2(x, row)).x;
}

vec3
color_pipeline(vec3 color)
{
#if DEF_COLOR_PRE_CURVE == 1
    color.r = lut_1d(color_pre_curve_lut_2d, color.r, 0.5 / 3.0);
    color.g = lut_1d(color_pre_curve_lut_2d, color.g, 1.5 / 3.0);
    color.b = lut_1d(color_pre_curve_lut_2d, color.b, 2.5 / 3.0);
#endif
#if DEF_COLOR_MAPPING == 1
    float n = color_mapping_lut_len;
    vec3 pos = clamp(color, 0.0, 1.0) * (n - 1.0);
    /* The 3D grid is flattened into rows of the 2D LUT texture. */
    float slice = floor(pos.b);
    float f = pos.b - slice;
    vec2 lo = vec2((pos.r + 0.5) / n, (pos.g + slice * n + 0.5) / (n * n));
    vec2 hi = vec2(lo.x, (pos.g + min(slice + 1.0, n - 1.0) * n + 0.5) / (n * n));
    color = mix(texture2D(color_mapping_lut_2d, lo).rgb,
                texture2D(color_mapping_lut_2d, hi).rgb, f);
#endif
#if DEF_COLOR_POST_CURVE == 1
    color.r = lut_1d(color_post_curve_lut_2d, color.r, 0.5 / 3.0);
    color.g = lut_1d(color_post_curve_lut_2d, color.g, 1.5 / 3.0);
    color.b = lut_1d(color_post_curve_lut_2d, color.b, 2.5 / 3.0);
#endif
    return color;
}

void main()
{
    vec4 color = sample_input_argb(v_texcoord);

#if DEF_INPUT_IS_PREMULT == 0
    color.rgb *= color.a;
#endif

    color.rgb = color_pipeline(color.rgb);

    color *= alpha;

#if DEF_GREEN_TINT == 1
    color = vec4(0.0, 0.3, 0.0, 0.2) + color * 0.8;
#endif

    gl_FragColor = color;
}
";

/// Synthesizes the fragment source for `key`.
pub fn fragment_source(key: ShaderKey) -> String {
    let mut src = String::with_capacity(FRAGMENT_BODY.len() + 256);

    src.push_str(&format!("#define DEF_VARIANT {}\n", key.variant() as u32));
    src.push_str(&format!(
        "#define DEF_GREEN_TINT {}\n",
        key.green_tint() as u32
    ));
    src.push_str(&format!(
        "#define DEF_INPUT_IS_PREMULT {}\n",
        key.premultiplied() as u32
    ));
    src.push_str(&format!(
        "#define DEF_COLOR_PRE_CURVE {}\n",
        key.pre_curve() as u32
    ));
    src.push_str(&format!(
        "#define DEF_COLOR_MAPPING {}\n",
        key.mapping() as u32
    ));
    src.push_str(&format!(
        "#define DEF_COLOR_POST_CURVE {}\n",
        key.post_curve() as u32
    ));
    src.push_str(FRAGMENT_BODY);
    src
}

/// Uniform locations looked up once at link time.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProgramUniforms {
    pub projection: Option<UniformLocation>,
    pub tex: [Option<UniformLocation>; 3],
    pub alpha: Option<UniformLocation>,
    pub unicolor: Option<UniformLocation>,
    pub pre_curve_lut: Option<UniformLocation>,
    pub mapping_lut: Option<UniformLocation>,
    pub mapping_lut_len: Option<UniformLocation>,
    pub post_curve_lut: Option<UniformLocation>,
}

impl ProgramUniforms {
    fn query(device: &mut dyn GpuDevice, program: ProgramId) -> Self {
        ProgramUniforms {
            projection: device.uniform_location(program, "proj"),
            tex: [
                device.uniform_location(program, "tex"),
                device.uniform_location(program, "tex1"),
                device.uniform_location(program, "tex2"),
            ],
            alpha: device.uniform_location(program, "alpha"),
            unicolor: device.uniform_location(program, "unicolor"),
            pre_curve_lut: device.uniform_location(program, "color_pre_curve_lut_2d"),
            mapping_lut: device.uniform_location(program, "color_mapping_lut_2d"),
            mapping_lut_len: device.uniform_location(program, "color_mapping_lut_len"),
            post_curve_lut: device.uniform_location(program, "color_post_curve_lut_2d"),
        }
    }
}

#[derive(Debug)]
struct CachedProgram {
    id: ProgramId,
    uniforms: ProgramUniforms,
    last_used: Duration,
}

/// Result of a cache lookup.
#[derive(Clone, Copy, Debug)]
pub struct ProgramLookup {
    pub id: ProgramId,
    pub uniforms: ProgramUniforms,

    /// The requested program was unavailable and the solid fallback
    /// was substituted; the offending client should be notified.
    pub is_fallback: bool,
}

/// Tunables of the eviction sweep.
#[derive(Clone, Copy, Debug)]
pub struct ProgramCacheConfig {
    /// This many most-recently-used programs survive unconditionally.
    pub keep_mru: usize,

    /// Programs beyond `keep_mru` are dropped once unused this long.
    pub max_idle: Duration,
}

impl Default for ProgramCacheConfig {
    fn default() -> Self {
        ProgramCacheConfig {
            keep_mru: 10,
            max_idle: Duration::from_secs(60),
        }
    }
}

/// Cache of compiled programs keyed by the raw [`ShaderKey`] bits.
///
/// Insertion compiles and links; lookup keeps an MRU order which the
/// per-frame sweep uses for eviction. The solid fallback program is
/// built at init and never evicted.
#[derive(Debug)]
pub struct ProgramCache {
    entries: HashMap<u32, CachedProgram>,
    mru: Vec<u32>,
    fallback: (ProgramId, ProgramUniforms),
    config: ProgramCacheConfig,
}

impl ProgramCache {
    pub fn new(
        device: &mut dyn GpuDevice,
        config: ProgramCacheConfig,
    ) -> Result<Self, ProgramError> {
        let key = ShaderKey::new(ShaderVariant::Solid);
        let id = device.create_program(VERTEX_SHADER, &fragment_source(key))?;
        let uniforms = ProgramUniforms::query(device, id);

        Ok(ProgramCache {
            entries: HashMap::new(),
            mru: Vec::new(),
            fallback: (id, uniforms),
            config,
        })
    }

    /// The distinguished solid-color program.
    pub fn solid(&self) -> ProgramLookup {
        ProgramLookup {
            id: self.fallback.0,
            uniforms: self.fallback.1,
            is_fallback: false,
        }
    }

    /// Fetches or builds the program for `key`.
    ///
    /// On compile or link failure the fallback is returned with
    /// `is_fallback` set and the failure is logged with its source.
    pub fn use_program(
        &mut self,
        device: &mut dyn GpuDevice,
        key: ShaderKey,
        now: Duration,
    ) -> ProgramLookup {
        let bits = key.bits();

        if let Some(entry) = self.entries.get_mut(&bits) {
            entry.last_used = now;
            self.mru.retain(|b| *b != bits);
            self.mru.insert(0, bits);
            return ProgramLookup {
                id: entry.id,
                uniforms: entry.uniforms,
                is_fallback: false,
            };
        }

        let fragment = fragment_source(key);
        match device.create_program(VERTEX_SHADER, &fragment) {
            Ok(id) => {
                let uniforms = ProgramUniforms::query(device, id);
                self.entries.insert(
                    bits,
                    CachedProgram {
                        id,
                        uniforms,
                        last_used: now,
                    },
                );
                self.mru.insert(0, bits);
                ProgramLookup {
                    id,
                    uniforms,
                    is_fallback: false,
                }
            }
            Err(err) => {
                tracing::error!(?key, %err, source = %fragment, "shader build failed");
                ProgramLookup {
                    id: self.fallback.0,
                    uniforms: self.fallback.1,
                    is_fallback: true,
                }
            }
        }
    }

    /// End-of-frame sweep: the `keep_mru` most recent programs stay,
    /// anything older is dropped after `max_idle` without use.
    pub fn sweep(&mut self, device: &mut dyn GpuDevice, now: Duration) {
        let keep = self.config.keep_mru;
        let max_idle = self.config.max_idle;

        let mut evicted: Vec<u32> = Vec::new();
        for bits in self.mru.iter().skip(keep) {
            let entry = &self.entries[bits];
            if now.saturating_sub(entry.last_used) > max_idle {
                evicted.push(*bits);
            }
        }

        for bits in evicted {
            let entry = self.entries.remove(&bits).unwrap();
            device.destroy_program(entry.id);
            self.mru.retain(|b| *b != bits);
            tracing::debug!(key = bits, "evicted idle shader program");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::backend::HeadlessDevice};

    #[test]
    fn key_is_four_bytes_and_compares_by_raw_bits() {
        assert_eq!(std::mem::size_of::<ShaderKey>(), 4);

        let a = ShaderKey::new(ShaderVariant::Rgba)
            .with_premultiplied(true)
            .with_pre_curve(ColorCurveKind::Lut3x1d);
        let b = ShaderKey::new(ShaderVariant::Rgba)
            .with_pre_curve(ColorCurveKind::Lut3x1d)
            .with_premultiplied(true);

        assert_eq!(a, b);
        assert_eq!(bytemuck::bytes_of(&a), bytemuck::bytes_of(&b));

        let c = a.with_green_tint(true);
        assert_ne!(a, c);
        assert_ne!(bytemuck::bytes_of(&a), bytemuck::bytes_of(&c));
    }

    #[test]
    fn key_fields_roundtrip() {
        let key = ShaderKey::new(ShaderVariant::Y_UV)
            .with_green_tint(true)
            .with_premultiplied(true)
            .with_pre_curve(ColorCurveKind::Lut3x1d)
            .with_mapping(ColorMappingKind::Lut3d)
            .with_post_curve(ColorCurveKind::Lut3x1d);

        assert_eq!(key.variant(), ShaderVariant::Y_UV);
        assert!(key.green_tint());
        assert!(key.premultiplied());
        assert_eq!(key.pre_curve(), ColorCurveKind::Lut3x1d);
        assert_eq!(key.mapping(), ColorMappingKind::Lut3d);
        assert_eq!(key.post_curve(), ColorCurveKind::Lut3x1d);

        // Reserved range stays clear.
        assert_eq!(key.bits() >> 11, 0);
    }

    #[test]
    fn fragment_source_reflects_key() {
        let key = ShaderKey::new(ShaderVariant::Solid).with_green_tint(true);
        let src = fragment_source(key);
        assert!(src.contains("#define DEF_VARIANT 7"));
        assert!(src.contains("#define DEF_GREEN_TINT 1"));
        assert!(src.contains("#define DEF_COLOR_MAPPING 0"));
    }

    #[test]
    fn cache_compiles_once_per_key() {
        let mut device = HeadlessDevice::new();
        let mut cache = ProgramCache::new(&mut device, ProgramCacheConfig::default()).unwrap();

        let key = ShaderKey::new(ShaderVariant::Rgba);
        let first = cache.use_program(&mut device, key, Duration::ZERO);
        let second = cache.use_program(&mut device, key, Duration::from_secs(1));

        assert_eq!(first.id, second.id);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_keeps_mru_and_drops_stale() {
        let mut device = HeadlessDevice::new();
        let mut cache = ProgramCache::new(&mut device, ProgramCacheConfig::default()).unwrap();

        // Twelve distinct keys used once each, in order.
        let keys: Vec<ShaderKey> = (0..12)
            .map(|i| {
                let variant = if i % 2 == 0 {
                    ShaderVariant::Rgba
                } else {
                    ShaderVariant::Rgbx
                };
                let mut key = ShaderKey::new(variant).with_premultiplied(i % 4 < 2);
                if i >= 4 {
                    key = key.with_pre_curve(ColorCurveKind::Lut3x1d);
                }
                if i >= 8 {
                    key = key.with_mapping(ColorMappingKind::Lut3d);
                }
                key
            })
            .collect();
        assert_eq!(
            keys.iter()
                .map(|k| k.bits())
                .collect::<std::collections::HashSet<_>>()
                .len(),
            12
        );

        for (i, key) in keys.iter().enumerate() {
            cache.use_program(&mut device, *key, Duration::from_secs(i as u64));
        }
        assert_eq!(cache.len(), 12);

        // Sweep right away: the two oldest are beyond keep_mru but not
        // yet idle long enough.
        cache.sweep(&mut device, Duration::from_secs(12));
        assert_eq!(cache.len(), 12);

        // Re-use the oldest much later, then sweep: it moves to the MRU
        // head, and the two stale entries past keep_mru get evicted.
        cache.use_program(&mut device, keys[0], Duration::from_secs(100));
        cache.sweep(&mut device, Duration::from_secs(100));

        assert_eq!(cache.len(), 10);
        let survivor = cache.use_program(&mut device, keys[0], Duration::from_secs(101));
        assert!(!survivor.is_fallback);
    }

    #[test]
    fn compile_failure_falls_back_to_solid() {
        let mut device = HeadlessDevice::new();
        let mut cache = ProgramCache::new(&mut device, ProgramCacheConfig::default()).unwrap();

        device.fail_next_program_builds(1);
        let lookup = cache.use_program(
            &mut device,
            ShaderKey::new(ShaderVariant::External),
            Duration::ZERO,
        );

        assert!(lookup.is_fallback);
        assert_eq!(lookup.id, cache.solid().id);
        assert_eq!(cache.len(), 0);

        // The next attempt compiles fine and is cached.
        let retry = cache.use_program(
            &mut device,
            ShaderKey::new(ShaderVariant::External),
            Duration::ZERO,
        );
        assert!(!retry.is_fallback);
        assert_eq!(cache.len(), 1);
    }
}
