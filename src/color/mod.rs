mod curve;
mod outcome;
mod profile;
mod transform;

pub use self::{curve::*, outcome::*, profile::*, transform::*};

use std::sync::Arc;

/// CIE xy chromaticity coordinate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Chromaticity {
    pub x: f32,
    pub y: f32,
}

/// Chromaticities of the three primaries and the white point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorPrimaries {
    pub red: Chromaticity,
    pub green: Chromaticity,
    pub blue: Chromaticity,
    pub white: Chromaticity,
}

impl ColorPrimaries {
    /// Rec.709 / sRGB primaries with D65 white.
    pub const SRGB: Self = ColorPrimaries {
        red: Chromaticity { x: 0.64, y: 0.33 },
        green: Chromaticity { x: 0.30, y: 0.60 },
        blue: Chromaticity { x: 0.15, y: 0.06 },
        white: Chromaticity {
            x: 0.3127,
            y: 0.3290,
        },
    };

    /// BT.2020 primaries with D65 white.
    pub const BT2020: Self = ColorPrimaries {
        red: Chromaticity { x: 0.708, y: 0.292 },
        green: Chromaticity { x: 0.170, y: 0.797 },
        blue: Chromaticity { x: 0.131, y: 0.046 },
        white: Chromaticity {
            x: 0.3127,
            y: 0.3290,
        },
    };
}

/// Row-major 3x3 matrix in the CMS convention (`m[row][col]`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Mat3x3 {
    pub m: [[f32; 3]; 3],
}

impl Mat3x3 {
    pub const IDENTITY: Self = Mat3x3 {
        m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    };

    pub fn apply(&self, v: [f32; 3]) -> [f32; 3] {
        let m = &self.m;
        [
            m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
            m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
            m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
        ]
    }

    /// `self * other`, applying `other` first.
    pub fn concat(&self, other: &Mat3x3) -> Mat3x3 {
        let mut out = [[0.0f32; 3]; 3];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, cell) in row.iter_mut().enumerate() {
                *cell = (0..3).map(|k| self.m[r][k] * other.m[k][c]).sum();
            }
        }
        Mat3x3 { m: out }
    }

    /// Inverse via the adjugate, computed in f64.
    ///
    /// Returns `None` for singular matrices.
    pub fn invert(&self) -> Option<Mat3x3> {
        let m: [[f64; 3]; 3] = [
            [self.m[0][0] as f64, self.m[0][1] as f64, self.m[0][2] as f64],
            [self.m[1][0] as f64, self.m[1][1] as f64, self.m[1][2] as f64],
            [self.m[2][0] as f64, self.m[2][1] as f64, self.m[2][2] as f64],
        ];

        let cof = |r1: usize, c1: usize, r2: usize, c2: usize| {
            m[r1][c1] * m[r2][c2] - m[r1][c2] * m[r2][c1]
        };

        let det = m[0][0] * cof(1, 1, 2, 2) - m[0][1] * cof(1, 0, 2, 2) + m[0][2] * cof(1, 0, 2, 1);
        if det.abs() < 1e-12 {
            return None;
        }

        let inv_det = 1.0 / det;
        let adj = [
            [cof(1, 1, 2, 2), -cof(0, 1, 2, 2), cof(0, 1, 1, 2)],
            [-cof(1, 0, 2, 2), cof(0, 0, 2, 2), -cof(0, 0, 1, 2)],
            [cof(1, 0, 2, 1), -cof(0, 0, 2, 1), cof(0, 0, 1, 1)],
        ];

        let mut out = [[0.0f32; 3]; 3];
        for r in 0..3 {
            for c in 0..3 {
                out[r][c] = (adj[r][c] * inv_det) as f32;
            }
        }
        Some(Mat3x3 { m: out })
    }

    /// RGB→XYZ matrix for the given primaries, scaled so that RGB(1,1,1)
    /// maps to the white point.
    pub fn from_primaries(p: &ColorPrimaries) -> Option<Mat3x3> {
        let col = |c: Chromaticity| -> Option<[f64; 3]> {
            if c.y == 0.0 {
                return None;
            }
            let y = c.y as f64;
            Some([c.x as f64 / y, 1.0, (1.0 - c.x as f64 - y) / y])
        };

        let r = col(p.red)?;
        let g = col(p.green)?;
        let b = col(p.blue)?;
        let w = col(p.white)?;

        let unscaled = Mat3x3 {
            m: [
                [r[0] as f32, g[0] as f32, b[0] as f32],
                [r[1] as f32, g[1] as f32, b[1] as f32],
                [r[2] as f32, g[2] as f32, b[2] as f32],
            ],
        };

        let s = unscaled
            .invert()?
            .apply([w[0] as f32, w[1] as f32, w[2] as f32]);

        Some(Mat3x3 {
            m: [
                [unscaled.m[0][0] * s[0], unscaled.m[0][1] * s[1], unscaled.m[0][2] * s[2]],
                [unscaled.m[1][0] * s[0], unscaled.m[1][1] * s[1], unscaled.m[1][2] * s[2]],
                [unscaled.m[2][0] * s[0], unscaled.m[2][1] * s[1], unscaled.m[2][2] * s[2]],
            ],
        })
    }
}

/// Clamp to [0, 1].
///
/// Written with comparisons a NaN fails, so NaN passes through
/// untouched rather than being hidden behind 0 or 1.
pub fn ensure_unorm(v: f32) -> f32 {
    if v > 1.0 {
        1.0
    } else if v < 0.0 {
        0.0
    } else {
        v
    }
}

/// Transfer characteristic a display output runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EotfMode {
    /// Traditional gamma display.
    Sdr,

    /// SMPTE ST 2084 perceptual quantizer.
    St2084,

    /// Hybrid log-gamma.
    Hlg,
}

impl Default for EotfMode {
    fn default() -> Self {
        EotfMode::Sdr
    }
}

/// Owner of the profile and transform registries.
///
/// One instance lives in the engine; profiles and transforms are handed
/// out as `Arc`s and deduplicated through the registries.
#[derive(Debug)]
pub struct ColorManager {
    profiles: ProfileRegistry,
    transforms: TransformRegistry,
}

impl ColorManager {
    pub fn new(lut_len: u32) -> Self {
        ColorManager {
            profiles: ProfileRegistry::new(),
            transforms: TransformRegistry::new(lut_len),
        }
    }

    /// Registers an ICC profile, see [`ProfileRegistry::load_icc`].
    pub fn load_icc(
        &self,
        bytes: &[u8],
        contents: ProfileContents,
    ) -> Result<Arc<ColorProfile>, InvalidProfile> {
        self.profiles.load_icc(bytes, contents)
    }

    /// The built-in sRGB profile used when nothing is attached.
    pub fn stock_srgb(&self) -> Arc<ColorProfile> {
        stock_srgb()
    }

    /// Fetches or builds the transform for `(category, intent)` between
    /// two profiles.
    pub fn transform(
        &self,
        category: TransformCategory,
        intent: RenderIntent,
        input: &Arc<ColorProfile>,
        output: &Arc<ColorProfile>,
    ) -> Result<Arc<ColorTransform>, TransformError> {
        self.transforms.get(category, intent, input, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unorm_clamp_is_idempotent_and_keeps_nan() {
        for v in [-1.0, 0.0, 0.25, 1.0, 2.5] {
            let once = ensure_unorm(v);
            assert_eq!(ensure_unorm(once), once);
            assert!((0.0..=1.0).contains(&once));
        }

        assert!(ensure_unorm(f32::NAN).is_nan());
    }

    #[test]
    fn srgb_matrix_maps_white_to_white_point() {
        let m = Mat3x3::from_primaries(&ColorPrimaries::SRGB).unwrap();
        let white = m.apply([1.0, 1.0, 1.0]);
        // D65 XYZ with Y normalized to 1.
        assert!((white[0] - 0.9505).abs() < 1e-3);
        assert!((white[1] - 1.0).abs() < 1e-4);
        assert!((white[2] - 1.0891).abs() < 1e-3);
    }

    #[test]
    fn matrix_inverse_roundtrips() {
        let m = Mat3x3::from_primaries(&ColorPrimaries::BT2020).unwrap();
        let id = m.concat(&m.invert().unwrap());
        for r in 0..3 {
            for c in 0..3 {
                let expect = if r == c { 1.0 } else { 0.0 };
                assert!((id.m[r][c] - expect).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn srgb_to_bt2020_matrix_matches_reference() {
        let srgb = Mat3x3::from_primaries(&ColorPrimaries::SRGB).unwrap();
        let bt2020 = Mat3x3::from_primaries(&ColorPrimaries::BT2020).unwrap();
        let m = bt2020.invert().unwrap().concat(&srgb);

        // Reference coefficients for linear sRGB → linear BT.2020.
        let reference = [
            [0.627402, 0.329292, 0.043306],
            [0.069095, 0.919544, 0.011360],
            [0.016394, 0.088028, 0.895578],
        ];
        for r in 0..3 {
            for c in 0..3 {
                assert!(
                    (m.m[r][c] - reference[r][c]).abs() < 2e-3,
                    "m[{r}][{c}] = {} vs {}",
                    m.m[r][c],
                    reference[r][c]
                );
            }
        }
    }
}
