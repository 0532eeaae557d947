use std::sync::Arc;
use log::debug;

use crate::error::GestureError;
use crate::gesture::assets::GestureAssets;
use crate::gesture::stabilizer::{ConfirmedDetection, GestureStabilizer};

pub const MAX_HANDS: usize = 2;
pub const HAND_LANDMARKS: usize = 21;
/** x, y and z of every landmark of two hands */
pub const FEATURES: usize = MAX_HANDS * HAND_LANDMARKS * 3;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Flattens up to two hands into [`FEATURES`] values, zero padded.
pub fn flatten_hands(hands: &[Vec<Landmark>]) -> Vec<f32> {
    let mut features = Vec::with_capacity(FEATURES);

    for hand in hands.iter().take(MAX_HANDS) {
        for landmark in hand.iter().take(HAND_LANDMARKS) {
            features.extend([landmark.x, landmark.y, landmark.z]);
        }
    }

    features.resize(FEATURES, 0.0);
    features
}

/// The on-device model: one score per class label.
pub trait Classifier {
    fn infer(&mut self, features: &[f32]) -> Result<Vec<f32>, GestureError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

/// Index and value of the highest score, NaN scores skipped.
fn arg_max(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, score)| !score.is_nan())
        .fold(None, |best, (index, score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((index, score)),
        })
}

/// Camera frames to confirmed signs: flatten, normalize, classify, stabilize.
pub struct SignRecognizer<C: Classifier> {
    assets: Arc<GestureAssets>,
    classifier: C,
    stabilizer: GestureStabilizer,
}

impl<C: Classifier> SignRecognizer<C> {
    pub fn new(assets: Arc<GestureAssets>, classifier: C) -> Self {
        SignRecognizer {
            assets,
            classifier,
            stabilizer: GestureStabilizer::new(),
        }
    }

    /// The raw per-frame classification. Frames without hands are not classified.
    pub fn predict(&mut self, hands: &[Vec<Landmark>]) -> Result<Option<Prediction>, GestureError> {
        if hands.is_empty() {
            return Ok(None);
        }

        let features = self.assets.scaler.normalize(&flatten_hands(hands))?;
        let scores = self.classifier.infer(&features)?;

        Ok(arg_max(&scores).map(|(index, confidence)| Prediction {
            label: self.assets.labels.label(index).to_string(),
            confidence,
        }))
    }

    /// Classifies one frame and feeds the stabilizer.
    pub fn process(&mut self, hands: &[Vec<Landmark>]) -> Result<Option<ConfirmedDetection>, GestureError> {
        let Some(prediction) = self.predict(hands)? else {
            return Ok(None);
        };
        debug!("Frame classified as {} ({:.2})", prediction.label, prediction.confidence);

        Ok(self.stabilizer.observe(&prediction.label, prediction.confidence))
    }

    pub fn confirmed(&self) -> Option<&ConfirmedDetection> {
        self.stabilizer.confirmed()
    }

    /// Forgets all history, e.g. when the camera is switched off.
    pub fn reset(&mut self) {
        self.stabilizer.reset();
    }
}
