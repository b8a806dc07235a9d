/// Dynamic-range mode for a capture session, carried in the `HelperConfig`
/// record's `dynamic_range` field (spec §3). Unlike the teacher's tone-mapping
/// pipeline, the out-of-process path transmits the raw surface format and
/// does no `Auto`-tier tone-mapping: that decision belongs to the encoder,
/// not this capture core (spec §1 non-goal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapturePolicy {
    #[default]
    Sdr,
    Hdr,
}

impl CapturePolicy {
    /// Parses from a mode string ("sdr", "hdr").
    pub fn from_mode(mode: &str) -> Option<Self> {
        match mode {
            "sdr" => Some(Self::Sdr),
            "hdr" => Some(Self::Hdr),
            _ => None,
        }
    }

    pub fn is_hdr(self) -> bool {
        matches!(self, Self::Hdr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_mode_parses_known_strings() {
        assert_eq!(CapturePolicy::from_mode("sdr"), Some(CapturePolicy::Sdr));
        assert_eq!(CapturePolicy::from_mode("hdr"), Some(CapturePolicy::Hdr));
        assert_eq!(CapturePolicy::from_mode("auto"), None);
    }

    #[test]
    fn default_policy_is_sdr() {
        assert_eq!(CapturePolicy::default(), CapturePolicy::Sdr);
    }
}
