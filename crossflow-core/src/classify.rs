//! Traffic state classification
//!
//! ## Overview
//!
//! Maps a seven-feature description of the intersection to one of four
//! discrete traffic states plus a continuous congestion score. Two
//! interchangeable strategies satisfy the same contract:
//!
//! - **Trained model**: a nearest-centroid classifier over the scaled
//!   feature vector with distance-calibrated probabilities. Deliberately
//!   small; any supervised classifier fits behind the same interface.
//! - **Rule fallback**: fixed thresholds evaluated in severity order. Used
//!   whenever no model is loaded or the model artifact fails to load.
//!
//! The rule evaluation order is load-bearing: thresholds are tested
//! free → normal → congested and the first match wins, so reordering them
//! changes classifications. Tests pin this order.
//!
//! ## Failure behavior
//!
//! `classify` is total. Non-finite features or any internal failure yield
//! the unknown result (confidence 0, congestion 0.5, all-zero
//! probabilities) rather than an error.

use std::collections::BTreeMap;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::Direction;
use crate::errors::StoreError;
use crate::snapshot::{IntersectionSnapshot, TrafficState};

/// Fallback when a feature vector arrives without a usable average speed
pub const DEFAULT_AVERAGE_SPEED: f64 = 30.0;

/// Fallback when direction balance cannot be derived
pub const DEFAULT_DIRECTION_BALANCE: f64 = 0.5;

/// Confidence reported by the rule fallback
const RULE_CONFIDENCE: f64 = 0.8;

/// Per-feature scale used to normalize distances in the centroid model
const FEATURE_SCALE: [f64; 7] = [20.0, 50.0, 1.0, 1.0, 50.0, 20.0, 1.0];

/// Current classifier artifact version
const MODEL_ARTIFACT_VERSION: u32 = 1;

/// Threshold rows evaluated in severity order: (state, queue ≤, speed ≥, occupancy ≤)
const RULES: [(TrafficState, f64, f64, f64); 3] = [
    (TrafficState::Free, 3.0, 35.0, 0.1),
    (TrafficState::Normal, 8.0, 25.0, 0.25),
    (TrafficState::Congested, 15.0, 15.0, 0.5),
];

/// Feature vector consumed by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub queue_length: f64,
    pub average_speed: f64,
    pub occupancy_rate: f64,
    pub traffic_density: f64,
    pub flow_rate: f64,
    pub speed_variance: f64,
    pub direction_balance: f64,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            queue_length: 0.0,
            average_speed: DEFAULT_AVERAGE_SPEED,
            occupancy_rate: 0.0,
            traffic_density: 0.0,
            flow_rate: 0.0,
            speed_variance: 0.0,
            direction_balance: DEFAULT_DIRECTION_BALANCE,
        }
    }
}

impl Features {
    /// Derive features from a fused snapshot
    ///
    /// Per-lane metrics are averaged over lanes; a snapshot with no moving
    /// traffic substitutes the default average speed, mirroring the missing-
    /// field default applied to wire data.
    pub fn from_snapshot(snapshot: &IntersectionSnapshot) -> Self {
        let lane_count = snapshot.lanes.len().max(1) as f64;

        let queue_length =
            snapshot.lanes.values().map(|l| l.queue_length as f64).sum::<f64>() / lane_count;
        let occupancy_rate =
            snapshot.lanes.values().map(|l| l.occupancy_rate as f64).sum::<f64>() / lane_count;
        let traffic_density =
            snapshot.lanes.values().map(|l| l.traffic_density as f64).sum::<f64>() / lane_count;

        let average_speed = if snapshot.average_speed > 0.0 {
            snapshot.average_speed as f64
        } else {
            DEFAULT_AVERAGE_SPEED
        };

        let moving: Vec<f64> = snapshot
            .lanes
            .values()
            .map(|l| l.average_speed as f64)
            .filter(|&v| v > 0.0)
            .collect();
        let speed_variance = if moving.len() > 1 {
            let mean = moving.iter().sum::<f64>() / moving.len() as f64;
            moving.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / moving.len() as f64
        } else {
            0.0
        };

        let per_direction: Vec<f64> = Direction::ALL
            .iter()
            .map(|&d| {
                snapshot
                    .lanes_from(d)
                    .map(|l| l.queue_length as f64)
                    .sum::<f64>()
            })
            .collect();
        let max_dir = per_direction.iter().cloned().fold(0.0, f64::max);
        let min_dir = per_direction.iter().cloned().fold(f64::INFINITY, f64::min);
        let direction_balance = if max_dir > 0.0 {
            min_dir / max_dir
        } else {
            DEFAULT_DIRECTION_BALANCE
        };

        Self {
            queue_length,
            average_speed,
            occupancy_rate,
            traffic_density,
            flow_rate: snapshot.total_vehicles as f64,
            speed_variance,
            direction_balance,
        }
    }

    fn as_vector(&self) -> [f64; 7] {
        [
            self.queue_length,
            self.average_speed,
            self.occupancy_rate,
            self.traffic_density,
            self.flow_rate,
            self.speed_variance,
            self.direction_balance,
        ]
    }

    fn is_finite(&self) -> bool {
        self.as_vector().iter().all(|v| v.is_finite())
    }
}

/// Classifier output vocabulary: the four traffic states plus the
/// unknown-on-failure label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifiedState {
    Free,
    Normal,
    Congested,
    HeavyCongested,
    Unknown,
}

impl From<TrafficState> for ClassifiedState {
    fn from(state: TrafficState) -> Self {
        match state {
            TrafficState::Free => ClassifiedState::Free,
            TrafficState::Normal => ClassifiedState::Normal,
            TrafficState::Congested => ClassifiedState::Congested,
            TrafficState::HeavyCongested => ClassifiedState::HeavyCongested,
        }
    }
}

impl ClassifiedState {
    pub fn as_state(&self) -> Option<TrafficState> {
        match self {
            ClassifiedState::Free => Some(TrafficState::Free),
            ClassifiedState::Normal => Some(TrafficState::Normal),
            ClassifiedState::Congested => Some(TrafficState::Congested),
            ClassifiedState::HeavyCongested => Some(TrafficState::HeavyCongested),
            ClassifiedState::Unknown => None,
        }
    }
}

/// Classification outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub state: ClassifiedState,
    pub confidence: f64,
    pub congestion_level: f64,
    pub probabilities: BTreeMap<TrafficState, f64>,
}

impl ClassificationResult {
    /// Result returned on any internal classification failure
    pub fn unknown() -> Self {
        Self {
            state: ClassifiedState::Unknown,
            confidence: 0.0,
            congestion_level: 0.5,
            probabilities: TrafficState::ALL.iter().map(|&s| (s, 0.0)).collect(),
        }
    }
}

/// A labeled sample for refitting or evaluating the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSample {
    pub features: Features,
    pub true_state: TrafficState,
}

/// Nearest-centroid model over the scaled feature space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentroidModel {
    version: u32,
    trained_samples: usize,
    /// One centroid per state, indexed in severity order
    centroids: [[f64; 7]; 4],
}

impl CentroidModel {
    /// Seed centroids: midpoints of the feature bands each state occupies
    pub fn seed() -> Self {
        Self {
            version: MODEL_ARTIFACT_VERSION,
            trained_samples: 0,
            centroids: [
                [1.5, 47.5, 0.05, 0.05, 25.0, 10.0, 0.65],
                [5.0, 35.0, 0.15, 0.15, 25.0, 10.0, 0.65],
                [10.5, 17.5, 0.35, 0.35, 25.0, 10.0, 0.65],
                [18.5, 7.5, 0.6, 0.6, 25.0, 10.0, 0.65],
            ],
        }
    }

    /// Refit centroids as per-class means; classes with no samples keep
    /// their seed centroid
    pub fn fit(samples: &[TrainingSample]) -> Self {
        let mut model = Self::seed();
        for (idx, &state) in TrafficState::ALL.iter().enumerate() {
            let class: Vec<[f64; 7]> = samples
                .iter()
                .filter(|s| s.true_state == state)
                .map(|s| s.features.as_vector())
                .collect();
            if class.is_empty() {
                continue;
            }
            let mut mean = [0.0; 7];
            for vector in &class {
                for (m, v) in mean.iter_mut().zip(vector) {
                    *m += v;
                }
            }
            for m in &mut mean {
                *m /= class.len() as f64;
            }
            model.centroids[idx] = mean;
        }
        model.trained_samples = samples.len();
        model
    }

    pub fn trained_samples(&self) -> usize {
        self.trained_samples
    }

    /// Predict state and calibrated probabilities; `None` on numeric failure
    fn predict(&self, features: &Features) -> Option<(TrafficState, BTreeMap<TrafficState, f64>)> {
        let vector = features.as_vector();

        let mut weights = [0.0f64; 4];
        for (idx, centroid) in self.centroids.iter().enumerate() {
            let mut dist_sq = 0.0;
            for ((v, c), scale) in vector.iter().zip(centroid).zip(&FEATURE_SCALE) {
                let d = (v - c) / scale;
                dist_sq += d * d;
            }
            // Inverse-distance weighting; epsilon keeps an exact hit finite
            weights[idx] = 1.0 / (dist_sq.sqrt() + 1e-6);
        }

        let total: f64 = weights.iter().sum();
        if !total.is_finite() || total <= 0.0 {
            return None;
        }

        let mut best = 0;
        for idx in 1..weights.len() {
            if weights[idx] > weights[best] {
                best = idx;
            }
        }

        let probabilities = TrafficState::ALL
            .iter()
            .enumerate()
            .map(|(idx, &s)| (s, weights[idx] / total))
            .collect();
        Some((TrafficState::ALL[best], probabilities))
    }

    /// Persist as a versioned JSON artifact
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path)?;
        let model: Self = serde_json::from_str(&raw)?;
        if model.version != MODEL_ARTIFACT_VERSION {
            return Err(StoreError::Version {
                found: model.version,
                expected: MODEL_ARTIFACT_VERSION,
            });
        }
        Ok(model)
    }
}

/// Traffic state classifier: trained model when available, rules otherwise
pub struct TrafficClassifier {
    model: Option<CentroidModel>,
}

impl TrafficClassifier {
    /// Rule-fallback-only classifier
    pub fn new() -> Self {
        Self { model: None }
    }

    pub fn with_model(model: CentroidModel) -> Self {
        Self { model: Some(model) }
    }

    /// Load the model artifact, falling back to rules on any failure
    pub fn load_or_fallback(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("no classifier artifact at {}, using rule fallback", path.display());
            return Self::new();
        }
        match CentroidModel::load(path) {
            Ok(model) => {
                info!(
                    "loaded classifier artifact ({} training samples)",
                    model.trained_samples
                );
                Self::with_model(model)
            }
            Err(e) => {
                warn!(
                    "classifier artifact {} unusable ({e}), using rule fallback",
                    path.display()
                );
                Self::new()
            }
        }
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    /// Classify a feature vector; total, never fails
    pub fn classify(&self, features: &Features) -> ClassificationResult {
        if !features.is_finite() {
            return ClassificationResult::unknown();
        }
        match &self.model {
            Some(model) => match model.predict(features) {
                Some((state, probabilities)) => {
                    let confidence = probabilities[&state];
                    ClassificationResult {
                        state: state.into(),
                        confidence,
                        congestion_level: adjusted_congestion_level(state, features),
                        probabilities,
                    }
                }
                None => ClassificationResult::unknown(),
            },
            None => rule_classify(features),
        }
    }

    /// Refit the model from labeled samples
    ///
    /// The model is replaced wholesale, so results already returned by
    /// `classify` are unaffected and later calls see only the new fit.
    pub fn update(&mut self, samples: &[TrainingSample]) {
        if samples.is_empty() {
            warn!("classifier update called with no samples, keeping current model");
            return;
        }
        self.model = Some(CentroidModel::fit(samples));
        info!("classifier refitted from {} samples", samples.len());
    }

    /// Fraction of samples whose predicted state matches the label
    pub fn evaluate(&self, samples: &[TrainingSample]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let hits = samples
            .iter()
            .filter(|s| self.classify(&s.features).state == s.true_state.into())
            .count();
        hits as f64 / samples.len() as f64
    }

    pub fn save_model(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        if let Some(model) = &self.model {
            model.save(path)?;
        }
        Ok(())
    }
}

impl Default for TrafficClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Threshold classification in fixed severity order; first match wins
fn rule_classify(features: &Features) -> ClassificationResult {
    let state = RULES
        .iter()
        .find(|&&(_, queue_max, speed_min, occupancy_max)| {
            features.queue_length <= queue_max
                && features.average_speed >= speed_min
                && features.occupancy_rate <= occupancy_max
        })
        .map(|&(state, ..)| state)
        .unwrap_or(TrafficState::HeavyCongested);

    let probabilities = TrafficState::ALL
        .iter()
        .map(|&s| (s, if s == state { 1.0 } else { 0.0 }))
        .collect();

    ClassificationResult {
        state: state.into(),
        confidence: RULE_CONFIDENCE,
        congestion_level: state.base_congestion_level(),
        probabilities,
    }
}

/// Congestion level for model predictions: base level plus a metric
/// adjustment, clipped to [0, 1]
fn adjusted_congestion_level(state: TrafficState, features: &Features) -> f64 {
    let queue_factor = (features.queue_length / 20.0).min(1.0);
    let speed_factor = ((50.0 - features.average_speed) / 50.0).max(0.0);
    let adjusted =
        state.base_congestion_level() + 0.2 * (queue_factor + speed_factor) / 2.0;
    adjusted.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(queue: f64, speed: f64, occupancy: f64) -> Features {
        Features {
            queue_length: queue,
            average_speed: speed,
            occupancy_rate: occupancy,
            ..Features::default()
        }
    }

    #[test]
    fn rule_order_is_severity_first_match() {
        let classifier = TrafficClassifier::new();

        // queue passes every rule; the speed decides
        assert_eq!(
            classifier.classify(&features(2.0, 40.0, 0.05)).state,
            ClassifiedState::Free
        );
        assert_eq!(
            classifier.classify(&features(2.0, 30.0, 0.05)).state,
            ClassifiedState::Normal
        );
        assert_eq!(
            classifier.classify(&features(2.0, 20.0, 0.05)).state,
            ClassifiedState::Congested
        );
        assert_eq!(
            classifier.classify(&features(2.0, 5.0, 0.05)).state,
            ClassifiedState::HeavyCongested
        );
    }

    #[test]
    fn rule_boundaries_are_inclusive() {
        let classifier = TrafficClassifier::new();
        // Exactly at the free thresholds
        let result = classifier.classify(&features(3.0, 35.0, 0.1));
        assert_eq!(result.state, ClassifiedState::Free);
        assert_eq!(result.congestion_level, 0.0);
        assert_eq!(result.confidence, RULE_CONFIDENCE);
    }

    #[test]
    fn light_traffic_at_speed_classifies_free() {
        // Four lanes with 2, 2, 3, 1 vehicles all moving at or above 35 km/h:
        // mean queue 2, well inside the free thresholds
        let classifier = TrafficClassifier::new();
        let result = classifier.classify(&features(2.0, 36.0, 0.05));
        assert_eq!(result.state, ClassifiedState::Free);
        assert_eq!(result.congestion_level, 0.0);
    }

    #[test]
    fn saturated_intersection_classifies_heavy() {
        let classifier = TrafficClassifier::new();
        let result = classifier.classify(&features(40.0, 10.0, 0.7));
        assert_eq!(result.state, ClassifiedState::HeavyCongested);
        assert!(result.congestion_level >= 0.9);
    }

    #[test]
    fn probabilities_sum_to_one_on_both_paths() {
        let input = features(6.0, 28.0, 0.2);

        let rule_sum: f64 = TrafficClassifier::new()
            .classify(&input)
            .probabilities
            .values()
            .sum();
        assert!((rule_sum - 1.0).abs() < 1e-6);

        let model_sum: f64 = TrafficClassifier::with_model(CentroidModel::seed())
            .classify(&input)
            .probabilities
            .values()
            .sum();
        assert!((model_sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn congestion_level_monotone_for_worsening_inputs() {
        let classifier = TrafficClassifier::with_model(CentroidModel::seed());
        let worsening = [
            features(1.0, 50.0, 0.05),
            features(5.0, 35.0, 0.15),
            features(11.0, 18.0, 0.35),
            features(19.0, 7.0, 0.6),
        ];
        let levels: Vec<f64> = worsening
            .iter()
            .map(|f| classifier.classify(f).congestion_level)
            .collect();
        assert!(
            levels.windows(2).all(|w| w[0] < w[1]),
            "levels not increasing: {levels:?}"
        );
    }

    #[test]
    fn non_finite_features_yield_unknown() {
        let classifier = TrafficClassifier::new();
        let result = classifier.classify(&features(f64::NAN, 30.0, 0.1));
        assert_eq!(result.state, ClassifiedState::Unknown);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.congestion_level, 0.5);
        assert!(result.probabilities.values().all(|&p| p == 0.0));
    }

    #[test]
    fn update_replaces_model_wholesale() {
        let mut classifier = TrafficClassifier::new();
        assert!(!classifier.has_model());

        let samples: Vec<TrainingSample> = TrafficState::ALL
            .iter()
            .map(|&state| TrainingSample {
                features: match state {
                    TrafficState::Free => features(1.0, 50.0, 0.02),
                    TrafficState::Normal => features(5.0, 35.0, 0.15),
                    TrafficState::Congested => features(11.0, 18.0, 0.35),
                    TrafficState::HeavyCongested => features(20.0, 5.0, 0.65),
                },
                true_state: state,
            })
            .collect();

        classifier.update(&samples);
        assert!(classifier.has_model());
        // A refit on its own training set is self-consistent
        assert_eq!(classifier.evaluate(&samples), 1.0);
    }

    #[test]
    fn empty_update_keeps_fallback() {
        let mut classifier = TrafficClassifier::new();
        classifier.update(&[]);
        assert!(!classifier.has_model());
    }

    #[test]
    fn artifact_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classifier_test.json");

        let model = CentroidModel::fit(&[TrainingSample {
            features: features(2.0, 45.0, 0.05),
            true_state: TrafficState::Free,
        }]);
        model.save(&path).unwrap();

        let loaded = CentroidModel::load(&path).unwrap();
        assert_eq!(loaded, model);
        assert_eq!(loaded.trained_samples(), 1);
    }

    #[test]
    fn missing_artifact_falls_back_to_rules() {
        let dir = tempfile::tempdir().unwrap();
        let classifier = TrafficClassifier::load_or_fallback(dir.path().join("absent.json"));
        assert!(!classifier.has_model());
    }

    #[test]
    fn corrupt_artifact_falls_back_to_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classifier.json");
        std::fs::write(&path, "not json").unwrap();
        let classifier = TrafficClassifier::load_or_fallback(&path);
        assert!(!classifier.has_model());
    }
}
