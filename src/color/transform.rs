use {
    super::{ensure_unorm, ColorProfile, Mat3x3, ProfileId, SegmentShape, ToneCurve},
    parking_lot::Mutex,
    std::sync::{Arc, Weak},
};

/// Which leg of the color pipeline a transform covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransformCategory {
    /// Client content to the linear blending space of an output.
    InputToBlend,

    /// Client content straight to output device space.
    InputToOutput,

    /// Blending space to output device space.
    ///
    /// By construction this is per-channel curves only: undo the
    /// linearization, then apply the VCGT.
    BlendToOutput,
}

/// ICC rendering intent.
///
/// Currently a cache-key discriminator only; the matrix-shaper chain
/// this builder produces has no gamut mapping to vary by intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RenderIntent {
    Perceptual,
    RelativeColorimetric,
    Saturation,
    AbsoluteColorimetric,
}

impl Default for RenderIntent {
    fn default() -> Self {
        RenderIntent::Perceptual
    }
}

/// Search key of a transform in the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransformKey {
    pub category: TransformCategory,
    pub intent: RenderIntent,
    pub input: ProfileId,
    pub output: ProfileId,
}

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq)]
pub enum TransformError {
    #[error("Profile primaries are degenerate, no RGB↔XYZ mapping exists")]
    BadPrimaries,

    #[error("Roundtrip verification failed: two-norm error {max_err} over tolerance {tolerance}")]
    VerificationFailed { max_err: f32, tolerance: f32 },
}

/// N×N×N×3 lookup table over the unit cube.
#[derive(Clone, Debug)]
pub struct Lut3d {
    len: u32,
    samples: Box<[f32]>,
}

impl Lut3d {
    /// Grid points per axis.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    fn at(&self, i: u32, j: u32, k: u32) -> [f32; 3] {
        let n = self.len;
        let base = 3 * (i + n * j + n * n * k) as usize;
        [
            self.samples[base],
            self.samples[base + 1],
            self.samples[base + 2],
        ]
    }

    /// Trilinear interpolation; input is clamped to the unit cube.
    pub fn sample(&self, rgb: [f32; 3]) -> [f32; 3] {
        let n = self.len;
        let scale = (n - 1) as f32;

        let pos = [
            rgb[0].clamp(0.0, 1.0) * scale,
            rgb[1].clamp(0.0, 1.0) * scale,
            rgb[2].clamp(0.0, 1.0) * scale,
        ];

        let cell = [
            (pos[0].floor() as u32).min(n - 2),
            (pos[1].floor() as u32).min(n - 2),
            (pos[2].floor() as u32).min(n - 2),
        ];
        let frac = [
            pos[0] - cell[0] as f32,
            pos[1] - cell[1] as f32,
            pos[2] - cell[2] as f32,
        ];

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
                acc += w * self.at(cell[0] + di, cell[1] + dj, cell[2] + dk)[c];
            }
            out[c] = acc;
        }
        out
    }
}

/// Immutable color transform: optional per-channel pre-curves, optional
/// 3D LUT, optional per-channel post-curves.
#[derive(Debug)]
pub struct ColorTransform {
    key: TransformKey,
    pre: Option<[ToneCurve; 3]>,
    lut: Option<Lut3d>,
    post: Option<[ToneCurve; 3]>,
}

impl ColorTransform {
    pub fn key(&self) -> &TransformKey {
        &self.key
    }

    pub fn pre_curves(&self) -> Option<&[ToneCurve; 3]> {
        self.pre.as_ref()
    }

    pub fn lut(&self) -> Option<&Lut3d> {
        self.lut.as_ref()
    }

    pub fn post_curves(&self) -> Option<&[ToneCurve; 3]> {
        self.post.as_ref()
    }

    /// `true` when applying the transform changes nothing.
    pub fn is_identity(&self) -> bool {
        self.lut.is_none()
            && self
                .pre
                .as_ref()
                .map_or(true, |c| c.iter().all(ToneCurve::is_identity))
            && self
                .post
                .as_ref()
                .map_or(true, |c| c.iter().all(ToneCurve::is_identity))
    }

    /// Applies the realized pipeline to one RGB triple.
    pub fn apply(&self, mut rgb: [f32; 3]) -> [f32; 3] {
        if let Some(pre) = &self.pre {
            for c in 0..3 {
                rgb[c] = pre[c].sample(rgb[c]);
            }
        }

        if let Some(lut) = &self.lut {
            rgb = lut.sample([
                ensure_unorm(rgb[0]),
                ensure_unorm(rgb[1]),
                ensure_unorm(rgb[2]),
            ]);
        }

        if let Some(post) = &self.post {
            for c in 0..3 {
                rgb[c] = post[c].sample(rgb[c]);
            }
        }

        rgb
    }
}

/// The analytic chain a transform realizes, kept around for reference
/// evaluation during verification.
struct Chain {
    decode: Option<[ToneCurve; 3]>,
    matrix: Option<Mat3x3>,
    encode: Option<[ToneCurve; 3]>,
}

impl Chain {
    fn eval(&self, mut rgb: [f32; 3]) -> [f32; 3] {
        if let Some(decode) = &self.decode {
            for c in 0..3 {
                rgb[c] = decode[c].sample(rgb[c]);
            }
        }
        if let Some(matrix) = &self.matrix {
            rgb = matrix.apply(rgb);
        }
        if let Some(encode) = &self.encode {
            for c in 0..3 {
                rgb[c] = encode[c].sample(rgb[c]);
            }
        }
        rgb
    }
}

fn all_parametric(curves: &[ToneCurve; 3]) -> bool {
    curves.iter().all(|curve| {
        curve.segments().len() == 1
            && matches!(curve.segments()[0].shape, SegmentShape::Parametric { .. })
    })
}

/// Conversion matrix from input device RGB to output device RGB,
/// through XYZ.
fn device_matrix(
    input: &ColorProfile,
    output: &ColorProfile,
) -> Result<Mat3x3, TransformError> {
    let m_in =
        Mat3x3::from_primaries(input.primaries()).ok_or(TransformError::BadPrimaries)?;
    let m_out =
        Mat3x3::from_primaries(output.primaries()).ok_or(TransformError::BadPrimaries)?;
    let inv_out = m_out.invert().ok_or(TransformError::BadPrimaries)?;
    Ok(inv_out.concat(&m_in))
}

fn build_transform(
    key: TransformKey,
    lut_len: u32,
    input: &ColorProfile,
    output: &ColorProfile,
) -> Result<ColorTransform, TransformError> {
    if key.category == TransformCategory::BlendToOutput {
        // Blend space is the output device space linearized, so this
        // leg is exactly "inverse EOTF then VCGT" per channel.
        return Ok(ColorTransform {
            key,
            pre: Some(output.inv_eotf_vcgt().clone()),
            lut: None,
            post: None,
        });
    }

    let matrix = device_matrix(input, output)?;

    let encode = match key.category {
        TransformCategory::InputToBlend => None,
        TransformCategory::InputToOutput => Some(output.inv_eotf_vcgt().clone()),
        TransformCategory::BlendToOutput => unreachable!(),
    };

    // Linearization is emitted as per-channel pre-curves when it fits a
    // native curve; otherwise it is folded into the 3D LUT. Same deal
    // for the encode side as post-curves.
    let pre = all_parametric(input.eotf()).then(|| input.eotf().clone());
    let folded_decode = if pre.is_some() {
        None
    } else {
        Some(input.eotf().clone())
    };

    let post = match &encode {
        Some(curves) if all_parametric(curves) => Some(curves.clone()),
        _ => None,
    };
    let folded_encode = match (&encode, &post) {
        (Some(curves), None) => Some(curves.clone()),
        _ => None,
    };

    let folded = Chain {
        decode: folded_decode,
        matrix: Some(matrix),
        encode: folded_encode,
    };

    let n = lut_len;
    let mut samples = Vec::with_capacity(3 * (n * n * n) as usize);
    for k in 0..n {
        for j in 0..n {
            for i in 0..n {
                let rgb_in = [
                    i as f32 / (n - 1) as f32,
                    j as f32 / (n - 1) as f32,
                    k as f32 / (n - 1) as f32,
                ];
                let rgb_out = folded.eval(rgb_in);
                samples.push(ensure_unorm(rgb_out[0]));
                samples.push(ensure_unorm(rgb_out[1]));
                samples.push(ensure_unorm(rgb_out[2]));
            }
        }
    }

    let transform = ColorTransform {
        key,
        pre,
        lut: Some(Lut3d {
            len: n,
            samples: samples.into_boxed_slice(),
        }),
        post,
    };

    verify_transform(&transform, key, input, output, matrix)?;
    Ok(transform)
}

/// Channel values of the verification grid: dense near zero to catch
/// inverse-EOTF precision loss, every eighth code above.
fn verification_values() -> impl Iterator<Item = u8> + Clone {
    (0u8..=14).chain((16u8..=248).step_by(8))
}

fn verify_transform(
    transform: &ColorTransform,
    key: TransformKey,
    input: &ColorProfile,
    output: &ColorProfile,
    matrix: Mat3x3,
) -> Result<(), TransformError> {
    let reference = Chain {
        decode: Some(input.eotf().clone()),
        matrix: Some(matrix),
        encode: match key.category {
            TransformCategory::InputToBlend => None,
            TransformCategory::InputToOutput => Some(output.inv_eotf_vcgt().clone()),
            TransformCategory::BlendToOutput => unreachable!(),
        },
    };

    let tolerance = if key.input == key.output { 0.0005 } else { 0.0065 };

    let mut max_err = 0.0f32;
    for r in verification_values() {
        for g in verification_values() {
            for b in verification_values() {
                let rgb = [r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0];

                let got = transform.apply(rgb);
                let want = reference.eval(rgb);

                let mut norm2 = 0.0f32;
                for c in 0..3 {
                    let d = got[c] - ensure_unorm(want[c]);
                    norm2 += d * d;
                }
                max_err = max_err.max(norm2.sqrt());
            }
        }
    }

    if max_err > tolerance {
        tracing::error!(?key, max_err, tolerance, "transform failed verification");
        return Err(TransformError::VerificationFailed { max_err, tolerance });
    }

    tracing::debug!(?key, max_err, "transform verified");
    Ok(())
}

/// Registry of built transforms, shared by everything that composites.
///
/// Lookup is a linear scan; in practice fewer than ten transforms are
/// live at once. Entries die with their last referrer.
#[derive(Debug)]
pub struct TransformRegistry {
    entries: Mutex<Vec<(TransformKey, Weak<ColorTransform>)>>,
    lut_len: u32,
}

impl TransformRegistry {
    /// `lut_len` is the per-axis 3D LUT dimension, typically 17 or 33.
    pub fn new(lut_len: u32) -> Self {
        assert!(lut_len >= 2 && lut_len <= 127);

        TransformRegistry {
            entries: Mutex::new(Vec::new()),
            lut_len,
        }
    }

    pub fn get(
        &self,
        category: TransformCategory,
        intent: RenderIntent,
        input: &Arc<ColorProfile>,
        output: &Arc<ColorProfile>,
    ) -> Result<Arc<ColorTransform>, TransformError> {
        let key = TransformKey {
            category,
            intent,
            input: input.id(),
            output: output.id(),
        };

        let mut entries = self.entries.lock();
        entries.retain(|(_, weak)| weak.strong_count() > 0);

        if let Some((_, weak)) = entries.iter().find(|(existing, _)| *existing == key) {
            if let Some(transform) = weak.upgrade() {
                return Ok(transform);
            }
        }

        let transform = Arc::new(build_transform(key, self.lut_len, input, output)?);
        entries.push((key, Arc::downgrade(&transform)));
        Ok(transform)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|(_, weak)| weak.strong_count() > 0);
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::color::{
            profile::test_icc::{fake_icc_bytes, srgb_contents},
            stock_srgb, ColorPrimaries, ProfileContents, ProfileRegistry,
        },
    };

    fn registry() -> TransformRegistry {
        TransformRegistry::new(17)
    }

    fn bt2020_profile(reg: &ProfileRegistry) -> Arc<ColorProfile> {
        let contents = ProfileContents {
            description: "test BT.2020".to_string(),
            primaries: ColorPrimaries::BT2020,
            eotf: [
                ToneCurve::power(2.4),
                ToneCurve::power(2.4),
                ToneCurve::power(2.4),
            ],
            vcgt: None,
        };
        reg.load_icc(&fake_icc_bytes(0x20), contents).unwrap()
    }

    #[test]
    fn identity_profile_builds_identity_lut() {
        let srgb = stock_srgb();
        let transform = registry()
            .get(
                TransformCategory::InputToBlend,
                RenderIntent::Perceptual,
                &srgb,
                &srgb,
            )
            .unwrap();

        let lut = transform.lut().unwrap();
        let n = lut.len();
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    let got = lut.at(i, j, k);
                    let want = [
                        i as f32 / (n - 1) as f32,
                        j as f32 / (n - 1) as f32,
                        k as f32 / (n - 1) as f32,
                    ];
                    for c in 0..3 {
                        assert!(
                            (got[c] - want[c]).abs() < 1e-5,
                            "lut[{i},{j},{k}][{c}] = {} want {}",
                            got[c],
                            want[c]
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn srgb_to_srgb_output_transform_is_identity_within_one_code() {
        let srgb = stock_srgb();
        let transform = registry()
            .get(
                TransformCategory::InputToOutput,
                RenderIntent::Perceptual,
                &srgb,
                &srgb,
            )
            .unwrap();

        for r in [0u8, 64, 128, 192, 255] {
            for g in [0u8, 64, 128, 192, 255] {
                for b in [0u8, 64, 128, 192, 255] {
                    let rgb = [r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0];
                    let out = transform.apply(rgb);
                    for c in 0..3 {
                        assert!(
                            (out[c] - rgb[c]).abs() <= 1.0 / 255.0,
                            "{rgb:?} -> {out:?}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn srgb_red_through_bt2020_matrix_shaper() {
        let profiles = ProfileRegistry::new();
        let srgb = stock_srgb();
        let bt2020 = bt2020_profile(&profiles);

        let transform = registry()
            .get(
                TransformCategory::InputToOutput,
                RenderIntent::RelativeColorimetric,
                &srgb,
                &bt2020,
            )
            .unwrap();

        let out = transform.apply([1.0, 0.0, 0.0]);
        // Linear red maps through the primary matrix, then the 1/2.4
        // output encode.
        let want = [0.8234f32, 0.3284, 0.1803];
        for c in 0..3 {
            assert!(
                (out[c] - want[c]).abs() <= 5.0 / 255.0,
                "channel {c}: {} want {}",
                out[c],
                want[c]
            );
        }
    }

    #[test]
    fn blend_to_output_is_pre_curve_only() {
        let srgb = stock_srgb();
        let transform = registry()
            .get(
                TransformCategory::BlendToOutput,
                RenderIntent::Perceptual,
                &srgb,
                &srgb,
            )
            .unwrap();

        assert!(transform.pre_curves().is_some());
        assert!(transform.lut().is_none());
        assert!(transform.post_curves().is_none());
    }

    #[test]
    fn forward_and_blend_legs_roundtrip() {
        let srgb = stock_srgb();
        let registry = registry();

        let to_blend = registry
            .get(
                TransformCategory::InputToBlend,
                RenderIntent::Perceptual,
                &srgb,
                &srgb,
            )
            .unwrap();
        let to_output = registry
            .get(
                TransformCategory::BlendToOutput,
                RenderIntent::Perceptual,
                &srgb,
                &srgb,
            )
            .unwrap();

        let mut max_err = 0.0f32;
        for r in verification_values() {
            for g in [0u8, 32, 128, 255] {
                for b in [0u8, 64, 192] {
                    let rgb = [r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0];
                    let through = to_output.apply(to_blend.apply(rgb));

                    let mut norm2 = 0.0f32;
                    for c in 0..3 {
                        let d = through[c] - rgb[c];
                        norm2 += d * d;
                    }
                    max_err = max_err.max(norm2.sqrt());
                }
            }
        }

        assert!(max_err < 0.0005, "roundtrip error {max_err}");
    }

    #[test]
    fn transforms_are_cached_by_key_and_dropped_when_unused() {
        let srgb = stock_srgb();
        let registry = registry();

        let a = registry
            .get(
                TransformCategory::InputToBlend,
                RenderIntent::Perceptual,
                &srgb,
                &srgb,
            )
            .unwrap();
        let b = registry
            .get(
                TransformCategory::InputToBlend,
                RenderIntent::Perceptual,
                &srgb,
                &srgb,
            )
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        // A different intent is a different transform.
        let c = registry
            .get(
                TransformCategory::InputToBlend,
                RenderIntent::Saturation,
                &srgb,
                &srgb,
            )
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);

        drop((a, b, c));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn nan_survives_the_unorm_clamp_into_the_pipeline() {
        let srgb = stock_srgb();
        let transform = registry()
            .get(
                TransformCategory::BlendToOutput,
                RenderIntent::Perceptual,
                &srgb,
                &srgb,
            )
            .unwrap();

        let out = transform.apply([f32::NAN, 0.5, 0.5]);
        assert!(out[0].is_nan());
        assert!(!out[1].is_nan());
    }

    #[test]
    fn sampled_eotf_is_folded_into_the_lut() {
        let profiles = ProfileRegistry::new();
        let mut contents = srgb_contents("sampled");
        let table: Box<[f32]> = (0..1024)
            .map(|i| ToneCurve::srgb_eotf().sample(i as f32 / 1023.0))
            .collect();
        contents.eotf = [
            ToneCurve::from_samples(table.clone()).unwrap(),
            ToneCurve::from_samples(table.clone()).unwrap(),
            ToneCurve::from_samples(table).unwrap(),
        ];

        let sampled = profiles.load_icc(&fake_icc_bytes(0x31), contents).unwrap();
        let transform = TransformRegistry::new(33)
            .get(
                TransformCategory::InputToBlend,
                RenderIntent::Perceptual,
                &sampled,
                &stock_srgb(),
            )
            .unwrap();

        assert!(transform.pre_curves().is_none());
        assert!(transform.lut().is_some());
    }
}
