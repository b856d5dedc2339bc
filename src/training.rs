use facegate_vision::augment::Augmentation;
use facegate_vision::{ClassifierKind, FaceTensor, IdentityClassifier};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::decision::best_class;
use crate::error::{GateError, GateResult};
use crate::model::{LabelMap, ModelArtifact};
use crate::storage::unix_now;

/// A preprocessed face with the identity it was enrolled under
#[derive(Debug, Clone)]
pub struct LabeledFace {
    pub identity_id: String,
    pub tensor: FaceTensor,
}

#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub test_ratio: f32,
    pub seed: u64,
    pub classifier: ClassifierKind,
    pub augmentation: Augmentation,
    pub confidence_threshold: f32,
    pub input_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f32,
    pub train_accuracy: f32,
    pub test_loss: Option<f32>,
    pub test_accuracy: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Final accuracy on the (unaugmented) training partition
    pub accuracy: f32,
    /// Final accuracy on the held-out partition; `None` when nothing was held out
    pub held_out_accuracy: Option<f32>,
    pub sample_count: usize,
    pub train_count: usize,
    pub test_count: usize,
    pub class_count: usize,
    pub epochs: Vec<EpochMetrics>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Stratified split of sample positions by class label.
///
/// Each class holds out `round(n * test_ratio)` samples, capped so at least
/// one stays in training. Classes are processed in ascending label order with
/// a single seeded RNG, so identical ordered input gives an identical split.
pub fn stratified_split(labels: &[usize], test_ratio: f32, seed: u64) -> Split {
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (pos, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(pos);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut split = Split {
        train: Vec::new(),
        test: Vec::new(),
    };
    for (_, mut positions) in by_class {
        positions.shuffle(&mut rng);
        let n = positions.len();
        let n_test = ((n as f32 * test_ratio).round() as usize).min(n.saturating_sub(1));
        split.test.extend_from_slice(&positions[..n_test]);
        split.train.extend_from_slice(&positions[n_test..]);
    }
    split.train.sort_unstable();
    split.test.sort_unstable();
    split
}

/// Mean cross-entropy and accuracy over a set of tensors
fn evaluate<C: IdentityClassifier>(
    classifier: &C,
    faces: &[(FaceTensor, usize)],
) -> GateResult<(f32, f32)> {
    if faces.is_empty() {
        return Ok((0.0, 0.0));
    }
    let mut loss = 0.0;
    let mut correct = 0usize;
    for (tensor, label) in faces {
        let probs = classifier.predict(tensor)?;
        loss += -(probs[*label].max(1e-12)).ln();
        if best_class(&probs).map(|(i, _)| i) == Some(*label) {
            correct += 1;
        }
    }
    let n = faces.len() as f32;
    Ok((loss / n, correct as f32 / n))
}

/// Fit a fresh classifier on `faces` and package it as an artifact.
///
/// Works entirely on the caller's copy of the data; nothing shared is touched.
pub fn train(
    faces: Vec<LabeledFace>,
    options: &TrainingOptions,
) -> GateResult<(ModelArtifact, TrainingReport)> {
    let labels = LabelMap::from_identities(faces.iter().map(|f| f.identity_id.clone()));
    if labels.len() < 2 {
        return Err(GateError::InsufficientData {
            identities: labels.len(),
        });
    }

    let mut dataset: Vec<(FaceTensor, usize)> = Vec::with_capacity(faces.len());
    for face in faces {
        let label = labels
            .index_of(&face.identity_id)
            .ok_or_else(|| anyhow::anyhow!("identity missing from freshly built label map"))?;
        dataset.push((face.tensor, label));
    }

    let class_of: Vec<usize> = dataset.iter().map(|(_, l)| *l).collect();
    let split = stratified_split(&class_of, options.test_ratio, options.seed);
    let train_set: Vec<(FaceTensor, usize)> =
        split.train.iter().map(|&i| dataset[i].clone()).collect();
    let test_set: Vec<(FaceTensor, usize)> =
        split.test.iter().map(|&i| dataset[i].clone()).collect();
    log::info!(
        "training {:?} classifier: {} classes, {} train / {} held-out samples",
        options.classifier,
        labels.len(),
        train_set.len(),
        test_set.len()
    );

    let reference: Vec<FaceTensor> = train_set.iter().map(|(t, _)| t.clone()).collect();
    let mut classifier = options.classifier.build(options.learning_rate);
    classifier.reset(labels.len(), &reference)?;

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut order: Vec<usize> = (0..train_set.len()).collect();
    let mut history = Vec::with_capacity(options.epochs);
    let batch_size = options.batch_size.max(1);

    for epoch in 1..=options.epochs {
        order.shuffle(&mut rng);
        for chunk in order.chunks(batch_size) {
            let batch: Vec<(FaceTensor, usize)> = chunk
                .iter()
                .map(|&i| {
                    let (tensor, label) = &train_set[i];
                    (options.augmentation.apply(tensor, &mut rng), *label)
                })
                .collect();
            classifier.train_batch(&batch)?;
        }

        let (train_loss, train_accuracy) = evaluate(&classifier, &train_set)?;
        let (test_loss, test_accuracy) = if test_set.is_empty() {
            (None, None)
        } else {
            let (l, a) = evaluate(&classifier, &test_set)?;
            (Some(l), Some(a))
        };
        log::debug!(
            "epoch {epoch}/{}: loss {train_loss:.4} acc {train_accuracy:.3} val_loss {test_loss:?} val_acc {test_accuracy:?}",
            options.epochs
        );
        history.push(EpochMetrics {
            epoch,
            train_loss,
            train_accuracy,
            test_loss,
            test_accuracy,
        });
    }

    let last = history.last();
    let accuracy = last.map(|m| m.train_accuracy).unwrap_or(0.0);
    let held_out_accuracy = last.and_then(|m| m.test_accuracy);
    log::info!(
        "training finished: accuracy {accuracy:.3}, held-out accuracy {}",
        held_out_accuracy
            .map(|a| format!("{a:.3}"))
            .unwrap_or_else(|| "n/a".to_string())
    );

    let report = TrainingReport {
        accuracy,
        held_out_accuracy,
        sample_count: dataset.len(),
        train_count: train_set.len(),
        test_count: test_set.len(),
        class_count: labels.len(),
        epochs: history,
    };
    let artifact = ModelArtifact {
        classifier,
        labels,
        input_size: options.input_size,
        confidence_threshold: options.confidence_threshold,
        trained_at: unix_now(),
        training_sample_count: train_set.len(),
        held_out_accuracy,
    };
    Ok((artifact, report))
}
