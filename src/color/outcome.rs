use {
    super::{
        ColorManager, ColorProfile, ColorTransform, EotfMode, ProfileId, RenderIntent,
        TransformCategory, TransformError,
    },
    std::sync::Arc,
};

/// The transforms one output needs for a frame.
///
/// Rebuilt whenever the output's attached profile or EOTF mode
/// changes. An output without an attached profile composites in
/// electrical space and carries no transforms at all.
#[derive(Debug, Default)]
pub struct OutputColorOutcome {
    pub from_blend: Option<Arc<ColorTransform>>,
    pub from_srgb_to_blend: Option<Arc<ColorTransform>>,
    pub from_srgb: Option<Arc<ColorTransform>>,

    profile: Option<ProfileId>,
    eotf: EotfMode,
}

impl OutputColorOutcome {
    /// Outcome for an unmanaged output.
    pub fn unmanaged() -> Self {
        OutputColorOutcome::default()
    }

    /// Electrical passthrough recorded against `profile`.
    ///
    /// Used when transform construction fails: the output keeps
    /// compositing without color management, but the outcome does not
    /// read as stale every frame.
    pub fn fallback(profile: &Arc<ColorProfile>, eotf: EotfMode) -> Self {
        OutputColorOutcome {
            profile: Some(profile.id()),
            eotf,
            ..OutputColorOutcome::default()
        }
    }

    /// Builds the triple for an output with `profile` attached.
    pub fn build(
        cm: &ColorManager,
        profile: &Arc<ColorProfile>,
        eotf: EotfMode,
    ) -> Result<Self, TransformError> {
        let srgb = cm.stock_srgb();
        let intent = RenderIntent::Perceptual;

        Ok(OutputColorOutcome {
            from_blend: Some(cm.transform(
                TransformCategory::BlendToOutput,
                intent,
                profile,
                profile,
            )?),
            from_srgb_to_blend: Some(cm.transform(
                TransformCategory::InputToBlend,
                intent,
                &srgb,
                profile,
            )?),
            from_srgb: Some(cm.transform(
                TransformCategory::InputToOutput,
                intent,
                &srgb,
                profile,
            )?),
            profile: Some(profile.id()),
            eotf,
        })
    }

    /// `true` when the outcome no longer matches the output state.
    pub fn stale(&self, profile: Option<&Arc<ColorProfile>>, eotf: EotfMode) -> bool {
        self.profile != profile.map(|p| p.id()) || self.eotf != eotf
    }

    /// Whether compositing needs a linear intermediate target.
    pub fn needs_blend_space(&self) -> bool {
        self.from_blend
            .as_ref()
            .is_some_and(|t| !t.is_identity())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::color::{profile::test_icc::fake_icc_bytes, ProfileContents, ToneCurve},
        crate::ColorPrimaries,
    };

    #[test]
    fn unmanaged_outcome_has_no_transforms() {
        let outcome = OutputColorOutcome::unmanaged();
        assert!(outcome.from_blend.is_none());
        assert!(!outcome.needs_blend_space());
        assert!(!outcome.stale(None, EotfMode::Sdr));
        assert!(outcome.stale(None, EotfMode::Hlg));
    }

    #[test]
    fn managed_outcome_carries_all_three_legs() {
        let cm = ColorManager::new(17);
        let profile = cm.stock_srgb();

        let outcome = OutputColorOutcome::build(&cm, &profile, EotfMode::Sdr).unwrap();
        assert!(outcome.from_blend.is_some());
        assert!(outcome.from_srgb_to_blend.is_some());
        assert!(outcome.from_srgb.is_some());
        assert!(outcome.needs_blend_space());
        assert!(!outcome.stale(Some(&profile), EotfMode::Sdr));
        assert!(outcome.stale(Some(&profile), EotfMode::St2084));
    }

    #[test]
    fn profile_change_makes_outcome_stale() {
        let cm = ColorManager::new(17);
        let srgb = cm.stock_srgb();

        let contents = ProfileContents {
            description: "panel".to_string(),
            primaries: ColorPrimaries::SRGB,
            eotf: [
                ToneCurve::power(2.2),
                ToneCurve::power(2.2),
                ToneCurve::power(2.2),
            ],
            vcgt: None,
        };
        let panel = cm.load_icc(&fake_icc_bytes(0x42), contents).unwrap();

        let outcome = OutputColorOutcome::build(&cm, &srgb, EotfMode::Sdr).unwrap();
        assert!(outcome.stale(Some(&panel), EotfMode::Sdr));
        assert!(!outcome.stale(Some(&srgb), EotfMode::Sdr));
    }
}
