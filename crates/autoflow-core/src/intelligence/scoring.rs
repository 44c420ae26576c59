//! Heuristic response scoring: confidence, similarity, hallucination flags.
//!
//! The constants are tunable; nothing downstream depends on their exact values.

pub const BASELINE_CONFIDENCE: f64 = 0.8;
pub const SHORT_RESPONSE_CHARS: usize = 50;
pub const SHORT_RESPONSE_PENALTY: f64 = 0.1;
pub const HEDGING_PENALTY: f64 = 0.2;
pub const LONG_RESPONSE_CHARS: usize = 500;
pub const LONG_RESPONSE_BONUS: f64 = 0.1;

/// Hedging language lowering a response's confidence.
pub const HEDGING_MARKERS: [&str; 6] = [
    "i'm not sure",
    "i don't know",
    "maybe",
    "perhaps",
    "possibly",
    "unclear",
];

/// Phrases that flag a response as a likely hallucination.
pub const HALLUCINATION_MARKERS: [&str; 4] = [
    "i'm not sure",
    "i don't know",
    "i cannot verify",
    "this might be incorrect",
];

pub const HALLUCINATION_CONFIDENCE_FLOOR: f64 = 0.5;

/// Confidence estimate for a response text, clamped to `[0, 1]`.
pub fn estimate_confidence(text: &str) -> f64 {
    let len = text.chars().count();
    let lowered = text.to_lowercase();

    let mut confidence = BASELINE_CONFIDENCE;
    if len < SHORT_RESPONSE_CHARS {
        confidence -= SHORT_RESPONSE_PENALTY;
    }
    if HEDGING_MARKERS.iter().any(|m| lowered.contains(m)) {
        confidence -= HEDGING_PENALTY;
    }
    if len > LONG_RESPONSE_CHARS {
        confidence += LONG_RESPONSE_BONUS;
    }
    confidence.clamp(0.0, 1.0)
}

/// Character-level similarity ratio in `[0, 1]`: twice the matched characters
/// over the combined length.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    similar::TextDiff::from_chars(a, b).ratio() as f64
}

pub fn has_hallucination_markers(text: &str) -> bool {
    let lowered = text.to_lowercase();
    HALLUCINATION_MARKERS.iter().any(|m| lowered.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_short_and_hedging() {
        // short: 0.8 - 0.1
        assert!((estimate_confidence("ok") - 0.7).abs() < 1e-9);
        // short + hedge: 0.8 - 0.1 - 0.2
        assert!((estimate_confidence("Maybe.") - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_long_response() {
        let long = "a".repeat(600);
        assert!((estimate_confidence(&long) - 0.9).abs() < 1e-9);
        let medium = "b".repeat(100);
        assert!((estimate_confidence(&medium) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_similarity_bounds() {
        assert!((text_similarity("same text", "same text") - 1.0).abs() < 1e-6);
        assert!(text_similarity("abc", "xyz") < 0.01);
        assert!((text_similarity("", "") - 1.0).abs() < 1e-6);
        let partial = text_similarity("the cat sat", "the cat ran");
        assert!(partial > 0.5 && partial < 1.0);
    }

    #[test]
    fn test_hallucination_markers() {
        assert!(has_hallucination_markers("I cannot verify that claim"));
        assert!(!has_hallucination_markers("The answer is 4."));
    }
}
