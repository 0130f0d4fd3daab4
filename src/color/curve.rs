use smallvec::SmallVec;

/// Tolerance used when comparing curve parameters and segment breaks.
pub const CURVE_EPSILON: f32 = 1e-5;

/// Parametric form identifiers, matching the ICC numbering.
///
/// A negative type denotes the analytic inverse of the positive form.
pub mod curve_type {
    /// `y = x^g`, 1 parameter.
    pub const POWER: i16 = 1;
    /// CIE 122-1966 gated power, 3 parameters.
    pub const CIE_122: i16 = 2;
    /// IEC 61966-3 gated power with offset, 4 parameters.
    pub const IEC_61966_3: i16 = 3;
    /// sRGB-style gated power with linear toe, 5 parameters.
    pub const SRGB: i16 = 4;
    /// Gated power with offsets on both branches, 7 parameters.
    pub const GATED_OFFSET: i16 = 5;
    /// Logarithmic segment form, 5 parameters.
    pub const LOG: i16 = 7;
    /// Exponential segment form, 5 parameters.
    pub const EXP: i16 = 8;
    /// S-shaped form, 1 parameter.
    pub const S_SHAPED: i16 = 108;
}

/// Number of meaningful parameters for a parametric type.
pub fn parametric_param_count(ty: i16) -> Option<usize> {
    match ty.abs() {
        1 => Some(1),
        2 => Some(3),
        3 => Some(4),
        4 => Some(5),
        5 => Some(7),
        7 => Some(5),
        8 => Some(5),
        108 => Some(1),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum CurveError {
    #[error("Unknown parametric curve type {0}")]
    UnknownType(i16),

    #[error("Curve type {ty} takes {expected} parameters, got {got}")]
    BadParamCount { ty: i16, expected: usize, got: usize },

    #[error("Curve has no segments")]
    Empty,

    #[error("Sampled segment needs at least two samples")]
    TooFewSamples,
}

/// Shape of one curve segment.
#[derive(Clone, Debug)]
pub enum SegmentShape {
    /// Uniformly spaced samples over the segment domain, interpolated
    /// linearly.
    Sampled(Box<[f32]>),

    /// Analytic form dispatched on `ty`; only the leading
    /// [`parametric_param_count`] entries of `params` are meaningful.
    Parametric { ty: i16, params: [f32; 7] },
}

/// One piece of a tone curve, valid on the half-open interval
/// `(x0, x1]`.
#[derive(Clone, Debug)]
pub struct CurveSegment {
    pub x0: f32,
    pub x1: f32,
    pub shape: SegmentShape,
}

/// One-dimensional tone curve.
///
/// Segments tile the real line with non-overlapping input intervals.
/// Most profiles in the wild carry a single segment spanning all reals.
#[derive(Clone, Debug)]
pub struct ToneCurve {
    segments: SmallVec<[CurveSegment; 1]>,
}

impl ToneCurve {
    /// Single parametric segment spanning all reals.
    pub fn parametric(ty: i16, params: &[f32]) -> Result<Self, CurveError> {
        let expected = parametric_param_count(ty).ok_or(CurveError::UnknownType(ty))?;
        if params.len() != expected {
            return Err(CurveError::BadParamCount {
                ty,
                expected,
                got: params.len(),
            });
        }

        let mut padded = [0.0f32; 7];
        padded[..params.len()].copy_from_slice(params);

        let mut segments = SmallVec::new_const();
        segments.push(CurveSegment {
            x0: f32::NEG_INFINITY,
            x1: f32::INFINITY,
            shape: SegmentShape::Parametric { ty, params: padded },
        });
        Ok(ToneCurve { segments })
    }

    pub fn power(exponent: f32) -> Self {
        ToneCurve::parametric(curve_type::POWER, &[exponent]).unwrap()
    }

    pub fn identity() -> Self {
        ToneCurve::power(1.0)
    }

    /// The IEC 61966-2.1 sRGB electrical→optical curve.
    pub fn srgb_eotf() -> Self {
        ToneCurve::parametric(
            curve_type::SRGB,
            &[2.4, 1.0 / 1.055, 0.055 / 1.055, 1.0 / 12.92, 0.04045],
        )
        .unwrap()
    }

    /// Inverse of [`ToneCurve::srgb_eotf`].
    pub fn srgb_inv_eotf() -> Self {
        ToneCurve::srgb_eotf().invert().unwrap()
    }

    /// Single sampled segment over `[0, 1]`.
    pub fn from_samples(samples: Box<[f32]>) -> Result<Self, CurveError> {
        if samples.len() < 2 {
            return Err(CurveError::TooFewSamples);
        }

        let mut segments = SmallVec::new_const();
        segments.push(CurveSegment {
            x0: 0.0,
            x1: 1.0,
            shape: SegmentShape::Sampled(samples),
        });
        Ok(ToneCurve { segments })
    }

    pub fn segments(&self) -> &[CurveSegment] {
        &self.segments
    }

    /// Evaluates the curve at `x`.
    pub fn sample(&self, x: f32) -> f32 {
        debug_assert!(!self.segments.is_empty());

        let segment = self
            .segments
            .iter()
            .find(|s| x <= s.x1)
            .unwrap_or_else(|| self.segments.last().unwrap());

        match &segment.shape {
            SegmentShape::Parametric { ty, params } => eval_parametric(*ty, params, x),
            SegmentShape::Sampled(table) => {
                let x0 = segment.x0.max(0.0);
                let x1 = segment.x1.min(1.0);
                let t = ((x - x0) / (x1 - x0)).clamp(0.0, 1.0);
                let pos = t * (table.len() - 1) as f32;
                let lo = pos.floor() as usize;
                let hi = (lo + 1).min(table.len() - 1);
                let frac = pos - lo as f32;
                table[lo] * (1.0 - frac) + table[hi] * frac
            }
        }
    }

    /// Samples the curve at `n` uniformly spaced points over `[0, 1]`.
    pub fn sample_table(&self, n: usize) -> Box<[f32]> {
        (0..n)
            .map(|i| self.sample(i as f32 / (n - 1) as f32))
            .collect()
    }

    /// Analytic inverse, flipping the sign bit of every parametric
    /// segment type.
    ///
    /// Sampled segments have no analytic inverse; returns `None`.
    pub fn invert(&self) -> Option<ToneCurve> {
        let mut segments = SmallVec::new_const();
        for s in &self.segments {
            match &s.shape {
                SegmentShape::Sampled(_) => return None,
                SegmentShape::Parametric { ty, params } => segments.push(CurveSegment {
                    x0: s.x0,
                    x1: s.x1,
                    shape: SegmentShape::Parametric {
                        ty: -ty,
                        params: *params,
                    },
                }),
            }
        }
        Some(ToneCurve { segments })
    }

    /// Exact-up-to-epsilon equality.
    pub fn equal(&self, other: &ToneCurve) -> bool {
        if self.segments.len() != other.segments.len() {
            return false;
        }

        self.segments
            .iter()
            .zip(&other.segments)
            .all(|(a, b)| segment_equal(a, b))
    }

    /// Whether `other` is the analytic inverse of `self`, judged by
    /// segment-type negation and parameter equality.
    pub fn is_inverse_of(&self, other: &ToneCurve) -> bool {
        if self.segments.len() != other.segments.len() {
            return false;
        }

        self.segments.iter().zip(&other.segments).all(|(a, b)| {
            match (&a.shape, &b.shape) {
                (
                    SegmentShape::Parametric { ty: ta, params: pa },
                    SegmentShape::Parametric { ty: tb, params: pb },
                ) => *ta == -*tb && params_equal(*ta, pa, pb),
                _ => false,
            }
        })
    }

    /// Exponent of a pure power law, accounting for the inverse sign.
    ///
    /// `None` unless the curve is a single power-law segment.
    pub fn powerlaw_exponent(&self) -> Option<f32> {
        if self.segments.len() != 1 {
            return None;
        }

        match &self.segments[0].shape {
            SegmentShape::Parametric { ty, params } if ty.abs() == curve_type::POWER => {
                if *ty > 0 {
                    Some(params[0])
                } else {
                    Some(1.0 / params[0])
                }
            }
            _ => None,
        }
    }

    /// `true` for a single-segment power law with exponent 1.
    pub fn is_identity(&self) -> bool {
        matches!(self.powerlaw_exponent(), Some(e) if (e - 1.0).abs() <= CURVE_EPSILON)
    }
}

/// Merges two power-law curves into `outer ∘ inner` by exponent
/// arithmetic.
///
/// This is how consecutive "undo linearization, redo linearization"
/// pairs collapse away. Anything that is not a pair of single-segment
/// power laws is an unknown composition and returns `None`; callers
/// fall back to table composition.
pub fn compose_powerlaw(outer: &ToneCurve, inner: &ToneCurve) -> Option<ToneCurve> {
    let a = outer.powerlaw_exponent()?;
    let b = inner.powerlaw_exponent()?;
    Some(ToneCurve::power(a * b))
}

fn segment_equal(a: &CurveSegment, b: &CurveSegment) -> bool {
    if !break_equal(a.x0, b.x0) || !break_equal(a.x1, b.x1) {
        return false;
    }

    match (&a.shape, &b.shape) {
        (
            SegmentShape::Parametric { ty: ta, params: pa },
            SegmentShape::Parametric { ty: tb, params: pb },
        ) => ta == tb && params_equal(*ta, pa, pb),
        (SegmentShape::Sampled(ta), SegmentShape::Sampled(tb)) => {
            ta.len() == tb.len()
                && ta
                    .iter()
                    .zip(tb.iter())
                    .all(|(x, y)| (x - y).abs() <= CURVE_EPSILON)
        }
        _ => false,
    }
}

/// Segment breaks compare equal when both are the same infinity or
/// within tolerance.
fn break_equal(a: f32, b: f32) -> bool {
    if a.is_infinite() || b.is_infinite() {
        return a == b;
    }
    (a - b).abs() <= CURVE_EPSILON
}

fn params_equal(ty: i16, a: &[f32; 7], b: &[f32; 7]) -> bool {
    let n = parametric_param_count(ty).unwrap_or(7);
    a[..n]
        .iter()
        .zip(&b[..n])
        .all(|(x, y)| (x - y).abs() <= CURVE_EPSILON)
}

/// Power with the base clamped at zero, the ICC convention for gated
/// forms.
fn spow(base: f32, exponent: f32) -> f32 {
    if base < 0.0 {
        0.0
    } else {
        base.powf(exponent)
    }
}

fn eval_parametric(ty: i16, p: &[f32; 7], x: f32) -> f32 {
    match ty {
        1 => spow(x, p[0]),
        -1 => spow(x, 1.0 / p[0]),

        // y = (ax + b)^g, gated at x = -b/a
        2 => {
            let [g, a, b, ..] = *p;
            if x >= -b / a {
                spow(a * x + b, g)
            } else {
                0.0
            }
        }
        -2 => {
            let [g, a, b, ..] = *p;
            if x > 0.0 {
                (spow(x, 1.0 / g) - b) / a
            } else {
                -b / a
            }
        }

        // y = (ax + b)^g + c, gated at x = -b/a
        3 => {
            let [g, a, b, c, ..] = *p;
            if x >= -b / a {
                spow(a * x + b, g) + c
            } else {
                c
            }
        }
        -3 => {
            let [g, a, b, c, ..] = *p;
            if x > c {
                (spow(x - c, 1.0 / g) - b) / a
            } else {
                -b / a
            }
        }

        // sRGB style: y = (ax + b)^g above the gate, linear toe below.
        4 => {
            let [g, a, b, c, d, ..] = *p;
            if x >= d {
                spow(a * x + b, g)
            } else {
                c * x
            }
        }
        -4 => {
            let [g, a, b, c, d, ..] = *p;
            let gate = spow(a * d + b, g);
            if x >= gate {
                (spow(x, 1.0 / g) - b) / a
            } else {
                x / c
            }
        }

        // y = (ax + b)^g + e above the gate, cx + f below.
        5 => {
            let [g, a, b, c, d, e, f] = *p;
            if x >= d {
                spow(a * x + b, g) + e
            } else {
                c * x + f
            }
        }
        -5 => {
            let [g, a, b, c, d, e, f] = *p;
            let gate = spow(a * d + b, g) + e;
            if x >= gate {
                (spow(x - e, 1.0 / g) - b) / a
            } else {
                (x - f) / c
            }
        }

        // y = a log10(b x^g + c) + d
        7 => {
            let [g, a, b, c, d, ..] = *p;
            a * (b * spow(x, g) + c).max(f32::MIN_POSITIVE).log10() + d
        }
        -7 => {
            let [g, a, b, c, d, ..] = *p;
            spow((10f32.powf((x - d) / a) - c) / b, 1.0 / g)
        }

        // y = a b^(cx + d) + e
        8 => {
            let [a, b, c, d, e, ..] = *p;
            a * b.powf(c * x + d) + e
        }
        -8 => {
            let [a, b, c, d, e, ..] = *p;
            let arg = (x - e) / a;
            if arg > 0.0 {
                (arg.ln() / b.ln() - d) / c
            } else {
                0.0
            }
        }

        // S-shaped: y = (1 - (1 - x)^(1/g))^(1/g)
        108 => {
            let g = p[0];
            spow(1.0 - spow(1.0 - x, 1.0 / g), 1.0 / g)
        }
        -108 => {
            let g = p[0];
            1.0 - spow(1.0 - spow(x, g), g)
        }

        _ => unreachable!("unknown parametric type {ty}"),
    }
}
