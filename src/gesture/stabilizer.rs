/** Frames at or below this confidence are ignored entirely */
pub const ACCEPTANCE_THRESHOLD: f32 = 0.70;

/** Consecutive qualifying frames with the same label needed to confirm it */
pub const STABILITY_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedDetection {
    pub label: String,
    pub confidence: f32,
}

/// Turns noisy per-frame classifier output into a confirmed sign.
#[derive(Debug, Clone, Default)]
pub struct GestureStabilizer {
    last_label: Option<String>,
    streak: u32,
    confirmed: Option<ConfirmedDetection>,
}

impl GestureStabilizer {
    pub fn new() -> Self {
        GestureStabilizer::default()
    }

    /// Feeds one frame. Returns the detection when this frame confirms (or re-confirms) a label.
    pub fn observe(&mut self, label: &str, confidence: f32) -> Option<ConfirmedDetection> {
        // NaN fails this comparison too
        if !(confidence > ACCEPTANCE_THRESHOLD) {
            return None;
        }

        if self.last_label.as_deref() == Some(label) {
            self.streak = self.streak.saturating_add(1);
        } else {
            self.last_label = Some(label.to_string());
            self.streak = 1;
        }

        if self.streak < STABILITY_THRESHOLD {
            return None;
        }

        let detection = ConfirmedDetection { label: label.to_string(), confidence };
        self.confirmed = Some(detection.clone());
        Some(detection)
    }

    /// The last confirmed detection; survives differing frames until overwritten or reset.
    pub fn confirmed(&self) -> Option<&ConfirmedDetection> {
        self.confirmed.as_ref()
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn last_label(&self) -> Option<&str> {
        self.last_label.as_deref()
    }

    pub fn reset(&mut self) {
        *self = GestureStabilizer::default();
    }
}
