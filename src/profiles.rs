//! Scenario profiles: the prompts and thresholds each monitoring context
//! runs under, plus the moderation category → review-tier map.
//!
//! Prompts are deliberately explicit about the expected answer shape — the
//! concern keyword extractor in the pipeline depends on the model leading
//! with one of the level words.

use std::collections::HashMap;

use crate::store::types::{Scenario, StreamPrefs};

/// Prompts and thresholds for one monitoring scenario.
#[derive(Debug, Clone)]
pub struct ScenarioProfile {
    pub triage_prompt: &'static str,
    pub analysis_prompt: &'static str,
    /// Motion score below which a `none`-triage frame is dropped.
    pub motion_threshold: f32,
    /// Audio level below which a `none`-triage frame is dropped.
    pub audio_threshold: f32,
    /// High/critical triage below this confidence is re-verified in the cloud.
    pub verify_threshold: f32,
}

impl ScenarioProfile {
    /// Effective motion threshold after per-stream preference overrides.
    pub fn motion_threshold_with(&self, prefs: Option<&StreamPrefs>) -> f32 {
        prefs
            .and_then(|p| p.motion_sensitivity)
            .unwrap_or(self.motion_threshold)
    }

    /// Effective audio threshold after per-stream preference overrides.
    pub fn audio_threshold_with(&self, prefs: Option<&StreamPrefs>) -> f32 {
        prefs
            .and_then(|p| p.audio_sensitivity)
            .unwrap_or(self.audio_threshold)
    }
}

static PET: ScenarioProfile = ScenarioProfile {
    triage_prompt: "You are watching a pet camera frame. Reply with one concern level \
        (NONE, LOW, MEDIUM, HIGH or CRITICAL) followed by a short reason. \
        Destructive behavior, distress, or an escape attempt is HIGH.",
    analysis_prompt: "Analyze this pet camera frame in detail. State a concern level \
        (NONE, LOW, MEDIUM, HIGH or CRITICAL), describe what the animal is doing, list \
        any issues (distress, destruction, escape, injury), and recommend an action.",
    motion_threshold: 0.4,
    audio_threshold: 0.5,
    verify_threshold: 0.6,
};

static BABY: ScenarioProfile = ScenarioProfile {
    triage_prompt: "You are watching an infant monitor frame. Reply with one concern \
        level (NONE, LOW, MEDIUM, HIGH or CRITICAL) followed by a short reason. \
        Face-down sleeping, covered face, or climbing out is CRITICAL; crying is HIGH.",
    analysis_prompt: "Analyze this infant monitor frame in detail. State a concern level \
        (NONE, LOW, MEDIUM, HIGH or CRITICAL), describe the infant's position and state, \
        list any safety issues (airway, position, entrapment, crying), and recommend an \
        action for the caregiver.",
    motion_threshold: 0.25,
    audio_threshold: 0.3,
    verify_threshold: 0.7,
};

static ELDERLY: ScenarioProfile = ScenarioProfile {
    triage_prompt: "You are watching an elder-care camera frame. Reply with one concern \
        level (NONE, LOW, MEDIUM, HIGH or CRITICAL) followed by a short reason. \
        A person on the floor or a fall in progress is CRITICAL; prolonged immobility is HIGH.",
    analysis_prompt: "Analyze this elder-care camera frame in detail. State a concern \
        level (NONE, LOW, MEDIUM, HIGH or CRITICAL), describe the person's posture and \
        activity, list any issues (fall, distress, immobility, disorientation), and \
        recommend an action.",
    motion_threshold: 0.3,
    audio_threshold: 0.4,
    verify_threshold: 0.7,
};

/// Profile for a scenario. Total over [`Scenario`].
pub fn profile(scenario: Scenario) -> &'static ScenarioProfile {
    match scenario {
        Scenario::Pet => &PET,
        Scenario::Baby => &BABY,
        Scenario::Elderly => &ELDERLY,
    }
}

/// Moderation category → review tier.
///
/// Detected issues from the detailed analysis are matched against this map;
/// a hit produces a content flag at the mapped tier. Tier 4 is the
/// privileged escalation bucket.
#[derive(Debug, Clone)]
pub struct ModerationMap {
    tiers: HashMap<String, u8>,
}

impl ModerationMap {
    pub fn with_defaults() -> Self {
        let mut tiers = HashMap::new();
        for (category, tier) in [
            ("benign", 1u8),
            ("borderline", 2),
            ("suggestive", 2),
            ("sensitive", 3),
            ("graphic", 3),
            ("prohibited", 4),
            ("exploitation", 4),
        ] {
            tiers.insert(category.to_string(), tier);
        }
        Self { tiers }
    }

    /// Tier for a detected issue, if the issue is a moderation category.
    pub fn tier_of(&self, category: &str) -> Option<u8> {
        self.tiers.get(&category.to_ascii_lowercase()).copied()
    }

    /// Highest tier across a set of detected issues, with the matched
    /// categories. `None` when nothing matches.
    pub fn classify(&self, detected_issues: &[String]) -> Option<(u8, Vec<String>)> {
        let mut matched: Vec<String> = Vec::new();
        let mut tier = 0u8;
        for issue in detected_issues {
            if let Some(t) = self.tier_of(issue) {
                matched.push(issue.to_ascii_lowercase());
                tier = tier.max(t);
            }
        }
        if matched.is_empty() {
            None
        } else {
            Some((tier, matched))
        }
    }
}

/// Blur instruction for the review UI, by tier. The queue never mutates
/// frame bytes itself.
pub fn blur_level(tier: u8) -> u8 {
    match tier {
        0 | 1 => 0,
        2 => 1,
        3 => 2,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_scenario_has_a_profile() {
        for s in [Scenario::Pet, Scenario::Baby, Scenario::Elderly] {
            let p = profile(s);
            assert!(!p.triage_prompt.is_empty());
            assert!(!p.analysis_prompt.is_empty());
            assert!(p.verify_threshold > 0.0 && p.verify_threshold <= 1.0);
        }
    }

    #[test]
    fn baby_thresholds_are_most_sensitive() {
        assert!(profile(Scenario::Baby).motion_threshold < profile(Scenario::Pet).motion_threshold);
        assert!(profile(Scenario::Baby).audio_threshold < profile(Scenario::Pet).audio_threshold);
    }

    #[test]
    fn preference_overrides_win() {
        let prefs = StreamPrefs {
            motion_sensitivity: Some(0.9),
            ..Default::default()
        };
        let p = profile(Scenario::Pet);
        assert_eq!(p.motion_threshold_with(Some(&prefs)), 0.9);
        assert_eq!(p.audio_threshold_with(Some(&prefs)), p.audio_threshold);
        assert_eq!(p.motion_threshold_with(None), p.motion_threshold);
    }

    #[test]
    fn classify_picks_highest_tier_and_collects_matches() {
        let map = ModerationMap::with_defaults();
        let issues = vec![
            "Borderline".to_string(),
            "loud noise".to_string(),
            "prohibited".to_string(),
        ];
        let (tier, matched) = map.classify(&issues).unwrap();
        assert_eq!(tier, 4);
        assert_eq!(matched, vec!["borderline".to_string(), "prohibited".to_string()]);
    }

    #[test]
    fn classify_returns_none_without_matches() {
        let map = ModerationMap::with_defaults();
        assert!(map.classify(&["crying".to_string()]).is_none());
        assert!(map.classify(&[]).is_none());
    }

    #[test]
    fn blur_scales_with_tier() {
        assert_eq!(blur_level(1), 0);
        assert_eq!(blur_level(2), 1);
        assert_eq!(blur_level(3), 2);
        assert_eq!(blur_level(4), 3);
    }
}
