use {
    super::{compose_powerlaw, ColorPrimaries, ToneCurve},
    md5::{Digest, Md5},
    once_cell::sync::Lazy,
    parking_lot::Mutex,
    std::{
        fmt::{self, Debug},
        sync::{Arc, Weak},
    },
};

/// 16-byte MD5 identity of a color profile.
///
/// Computed from the canonical ICC byte stream. Two profiles with equal
/// identity are interchangeable within a process.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProfileId(pub [u8; 16]);

impl Debug for ProfileId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(fmt, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidProfile {
    #[error("Profile is {len} bytes, too short for an ICC header")]
    TooShort { len: usize },

    #[error("ICC major version {major} is not supported")]
    UnsupportedVersion { major: u8 },

    #[error("Device class {0:?} is not a display profile")]
    NotDisplayClass([u8; 4]),

    #[error("Color space {0:?} does not have three RGB channels")]
    NotThreeChannelRgb([u8; 4]),
}

/// Decoded payload of an ICC profile, produced by the external parser.
///
/// Prism validates the raw header and computes the identity; the tag
/// soup itself is somebody else's business.
#[derive(Clone, Debug)]
pub struct ProfileContents {
    pub description: String,
    pub primaries: ColorPrimaries,
    pub eotf: [ToneCurve; 3],
    pub vcgt: Option<[ToneCurve; 3]>,
}

/// Decoded ICC display profile.
#[derive(Debug)]
pub struct ColorProfile {
    id: ProfileId,
    description: String,
    primaries: ColorPrimaries,
    eotf: [ToneCurve; 3],
    inv_eotf_vcgt: [ToneCurve; 3],
    vcgt: Option<[ToneCurve; 3]>,
}

impl ColorProfile {
    fn from_contents(id: ProfileId, contents: ProfileContents) -> Self {
        let inv_eotf_vcgt = composite_inv_eotf_vcgt(&contents.eotf, contents.vcgt.as_ref());

        ColorProfile {
            id,
            description: contents.description,
            primaries: contents.primaries,
            eotf: contents.eotf,
            inv_eotf_vcgt,
            vcgt: contents.vcgt,
        }
    }

    pub fn id(&self) -> ProfileId {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn primaries(&self) -> &ColorPrimaries {
        &self.primaries
    }

    /// Forward electrical→optical curves, one per channel.
    pub fn eotf(&self) -> &[ToneCurve; 3] {
        &self.eotf
    }

    /// Composite "inverse EOTF then VCGT" curves.
    ///
    /// This is what the blend→output transform applies.
    pub fn inv_eotf_vcgt(&self) -> &[ToneCurve; 3] {
        &self.inv_eotf_vcgt
    }

    pub fn vcgt(&self) -> Option<&[ToneCurve; 3]> {
        self.vcgt.as_ref()
    }
}

/// Per-channel composition of the EOTF inverse with the video card
/// gamma table.
///
/// Analytic where the power-law merge applies, sampled at 1024 points
/// otherwise.
fn composite_inv_eotf_vcgt(
    eotf: &[ToneCurve; 3],
    vcgt: Option<&[ToneCurve; 3]>,
) -> [ToneCurve; 3] {
    let composite = |channel: usize| -> ToneCurve {
        let forward = &eotf[channel];
        let inverse = forward
            .invert()
            .unwrap_or_else(|| numeric_inverse(forward, 1024));

        let Some(vcgt) = vcgt else {
            return inverse;
        };
        let vcgt = &vcgt[channel];

        if let Some(merged) = compose_powerlaw(vcgt, &inverse) {
            return merged;
        }

        let table = (0..1024)
            .map(|i| vcgt.sample(inverse.sample(i as f32 / 1023.0)))
            .collect();
        ToneCurve::from_samples(table).unwrap()
    };

    [composite(0), composite(1), composite(2)]
}

/// Sampled inverse of a monotonically increasing curve on `[0, 1]`.
fn numeric_inverse(curve: &ToneCurve, n: usize) -> ToneCurve {
    let table = (0..n)
        .map(|i| {
            let y = i as f32 / (n - 1) as f32;

            let mut lo = 0.0f32;
            let mut hi = 1.0f32;
            for _ in 0..24 {
                let mid = 0.5 * (lo + hi);
                if curve.sample(mid) < y {
                    lo = mid;
                } else {
                    hi = mid;
                }
            }
            0.5 * (lo + hi)
        })
        .collect();
    ToneCurve::from_samples(table).unwrap()
}

const ICC_HEADER_LEN: usize = 132;

/// Validates the ICC header and computes the canonical MD5 identity.
fn icc_identity(bytes: &[u8]) -> Result<ProfileId, InvalidProfile> {
    if bytes.len() < ICC_HEADER_LEN {
        return Err(InvalidProfile::TooShort { len: bytes.len() });
    }

    let major = bytes[8];
    if major != 2 && major != 4 {
        return Err(InvalidProfile::UnsupportedVersion { major });
    }

    let class: [u8; 4] = bytes[12..16].try_into().unwrap();
    if &class != b"mntr" {
        return Err(InvalidProfile::NotDisplayClass(class));
    }

    let space: [u8; 4] = bytes[16..20].try_into().unwrap();
    if &space != b"RGB " {
        return Err(InvalidProfile::NotThreeChannelRgb(space));
    }

    // Canonical stream: profile flags, rendering intent and the
    // embedded ID are zeroed before hashing, per ICC profile ID rules.
    let mut canonical = bytes.to_vec();
    canonical[44..48].fill(0);
    canonical[64..68].fill(0);
    canonical[84..100].fill(0);

    let digest = Md5::digest(&canonical);
    Ok(ProfileId(digest.into()))
}

/// Registry deduplicating profiles by identity.
///
/// Loading the same ICC stream twice hands back a reference to the
/// first profile; entries are dropped when the last referrer goes.
#[derive(Debug, Default)]
pub struct ProfileRegistry {
    entries: Mutex<Vec<(ProfileId, Weak<ColorProfile>)>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        ProfileRegistry::default()
    }

    /// Validates `bytes` as an ICC display profile and registers it.
    ///
    /// On success, either a freshly constructed profile or a new
    /// reference to an already registered one with the same identity.
    pub fn load_icc(
        &self,
        bytes: &[u8],
        contents: ProfileContents,
    ) -> Result<Arc<ColorProfile>, InvalidProfile> {
        let id = icc_identity(bytes)?;

        let mut entries = self.entries.lock();
        entries.retain(|(_, weak)| weak.strong_count() > 0);

        if let Some((_, weak)) = entries.iter().find(|(existing, _)| *existing == id) {
            if let Some(profile) = weak.upgrade() {
                return Ok(profile);
            }
        }

        let profile = Arc::new(ColorProfile::from_contents(id, contents));
        tracing::debug!(id = ?id, description = %profile.description, "registered color profile");
        entries.push((id, Arc::downgrade(&profile)));
        Ok(profile)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|(_, weak)| weak.strong_count() > 0);
        entries.len()
    }
}

/// The built-in sRGB profile.
///
/// Used whenever a surface or output carries no attached profile. The
/// identity is the digest of a fixed descriptor so it never collides
/// with an ingested ICC stream.
pub fn stock_srgb() -> Arc<ColorProfile> {
    static STOCK: Lazy<Arc<ColorProfile>> = Lazy::new(|| {
        let digest = Md5::digest(b"prism stock sRGB v1");
        let contents = ProfileContents {
            description: "built-in sRGB".to_string(),
            primaries: ColorPrimaries::SRGB,
            eotf: [
                ToneCurve::srgb_eotf(),
                ToneCurve::srgb_eotf(),
                ToneCurve::srgb_eotf(),
            ],
            vcgt: None,
        };
        Arc::new(ColorProfile::from_contents(ProfileId(digest.into()), contents))
    });

    STOCK.clone()
}

#[cfg(test)]
pub(crate) mod test_icc {
    use super::*;

    /// Minimal byte stream passing the ICC header checks.
    ///
    /// `seed` lands in the reserved tail so distinct seeds get distinct
    /// identities.
    pub fn fake_icc_bytes(seed: u8) -> Vec<u8> {
        let mut bytes = vec![0u8; ICC_HEADER_LEN];
        bytes[8] = 4;
        bytes[12..16].copy_from_slice(b"mntr");
        bytes[16..20].copy_from_slice(b"RGB ");
        bytes[100] = seed;
        bytes
    }

    pub fn srgb_contents(description: &str) -> ProfileContents {
        ProfileContents {
            description: description.to_string(),
            primaries: ColorPrimaries::SRGB,
            eotf: [
                ToneCurve::srgb_eotf(),
                ToneCurve::srgb_eotf(),
                ToneCurve::srgb_eotf(),
            ],
            vcgt: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{test_icc::*, *};

    #[test]
    fn header_validation_rejects_bad_profiles() {
        assert_eq!(
            icc_identity(&[0u8; 16]).unwrap_err(),
            InvalidProfile::TooShort { len: 16 }
        );

        let mut bad_version = fake_icc_bytes(0);
        bad_version[8] = 3;
        assert_eq!(
            icc_identity(&bad_version).unwrap_err(),
            InvalidProfile::UnsupportedVersion { major: 3 }
        );

        let mut scanner = fake_icc_bytes(0);
        scanner[12..16].copy_from_slice(b"scnr");
        assert!(matches!(
            icc_identity(&scanner).unwrap_err(),
            InvalidProfile::NotDisplayClass(_)
        ));

        let mut cmyk = fake_icc_bytes(0);
        cmyk[16..20].copy_from_slice(b"CMYK");
        assert!(matches!(
            icc_identity(&cmyk).unwrap_err(),
            InvalidProfile::NotThreeChannelRgb(_)
        ));
    }

    #[test]
    fn identity_ignores_flags_intent_and_embedded_id() {
        let base = fake_icc_bytes(7);

        let mut mutated = base.clone();
        mutated[44] = 0xff;
        mutated[64] = 0x01;
        mutated[84..100].fill(0xaa);

        assert_eq!(icc_identity(&base), icc_identity(&mutated));

        let other = fake_icc_bytes(8);
        assert_ne!(icc_identity(&base), icc_identity(&other));
    }

    #[test]
    fn registry_deduplicates_by_identity() {
        let registry = ProfileRegistry::new();
        let bytes = fake_icc_bytes(1);

        let first = registry.load_icc(&bytes, srgb_contents("one")).unwrap();
        let second = registry.load_icc(&bytes, srgb_contents("two")).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.description(), "one");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_drops_entries_with_their_last_referrer() {
        let registry = ProfileRegistry::new();

        let profile = registry
            .load_icc(&fake_icc_bytes(2), srgb_contents("transient"))
            .unwrap();
        assert_eq!(registry.len(), 1);

        drop(profile);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn inv_eotf_vcgt_inverts_the_eotf() {
        let profile = stock_srgb();

        for i in 0..=32 {
            let x = i as f32 / 32.0;
            let optical = profile.eotf()[0].sample(x);
            let electrical = profile.inv_eotf_vcgt()[0].sample(optical);
            assert!((electrical - x).abs() < 1e-4, "x = {x} got {electrical}");
        }
    }

    #[test]
    fn vcgt_is_folded_into_the_composite() {
        let mut contents = srgb_contents("with vcgt");
        contents.eotf = [
            ToneCurve::power(2.2),
            ToneCurve::power(2.2),
            ToneCurve::power(2.2),
        ];
        contents.vcgt = Some([
            ToneCurve::power(1.1),
            ToneCurve::power(1.1),
            ToneCurve::power(1.1),
        ]);

        let registry = ProfileRegistry::new();
        let profile = registry.load_icc(&fake_icc_bytes(3), contents).unwrap();

        // vcgt(inv_eotf(x)) = (x^(1/2.2))^1.1
        let expect = ToneCurve::power(1.1 / 2.2);
        for i in 0..=16 {
            let x = i as f32 / 16.0;
            let got = profile.inv_eotf_vcgt()[0].sample(x);
            assert!((got - expect.sample(x)).abs() < 1e-5);
        }
    }
}
