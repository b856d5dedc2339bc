//! Closed-set identity classifiers.
//!
//! Both models consume [`FaceTensor`]s, reduce them to pooled and standardized
//! features, and produce a probability distribution over exactly
//! `num_classes` identities. Training is driven from outside one mini-batch at
//! a time so the caller owns epochs, shuffling and augmentation.

use anyhow::{ensure, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::features::{pooled_features, stack_rows, Standardizer, FEATURE_GRID};
use crate::preprocess::FaceTensor;

pub trait IdentityClassifier {
    /// Discard learned state and prepare for `num_classes` outputs.
    ///
    /// `reference` is the unaugmented training partition, used to fit input
    /// normalization.
    fn reset(&mut self, num_classes: usize, reference: &[FaceTensor]) -> Result<()>;

    /// One optimisation step; returns the batch's mean cross-entropy
    fn train_batch(&mut self, batch: &[(FaceTensor, usize)]) -> Result<f32>;

    fn predict(&self, tensor: &FaceTensor) -> Result<Array1<f32>>;

    fn num_classes(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    Softmax,
    Centroid,
}

impl ClassifierKind {
    pub fn build(self, learning_rate: f32) -> Classifier {
        match self {
            ClassifierKind::Softmax => Classifier::Softmax(SoftmaxClassifier::new(learning_rate)),
            ClassifierKind::Centroid => Classifier::Centroid(CentroidClassifier::default()),
        }
    }
}

/// Serializable union of the supported models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Classifier {
    Softmax(SoftmaxClassifier),
    Centroid(CentroidClassifier),
}

impl Classifier {
    pub fn kind(&self) -> ClassifierKind {
        match self {
            Classifier::Softmax(_) => ClassifierKind::Softmax,
            Classifier::Centroid(_) => ClassifierKind::Centroid,
        }
    }

    fn inner(&self) -> &dyn IdentityClassifier {
        match self {
            Classifier::Softmax(c) => c,
            Classifier::Centroid(c) => c,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn IdentityClassifier {
        match self {
            Classifier::Softmax(c) => c,
            Classifier::Centroid(c) => c,
        }
    }
}

impl IdentityClassifier for Classifier {
    fn reset(&mut self, num_classes: usize, reference: &[FaceTensor]) -> Result<()> {
        self.inner_mut().reset(num_classes, reference)
    }

    fn train_batch(&mut self, batch: &[(FaceTensor, usize)]) -> Result<f32> {
        self.inner_mut().train_batch(batch)
    }

    fn predict(&self, tensor: &FaceTensor) -> Result<Array1<f32>> {
        self.inner().predict(tensor)
    }

    fn num_classes(&self) -> usize {
        self.inner().num_classes()
    }
}

/// Numerically stable softmax; output is non-negative and sums to 1
pub fn softmax(logits: &Array1<f32>) -> Array1<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp = logits.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    if sum > 0.0 && sum.is_finite() {
        exp / sum
    } else {
        Array1::from_elem(logits.len(), 1.0 / logits.len().max(1) as f32)
    }
}

fn cross_entropy(probs: &Array1<f32>, label: usize) -> f32 {
    -(probs[label].max(1e-12)).ln()
}

fn fit_standardizer(reference: &[FaceTensor]) -> Standardizer {
    let rows: Vec<Array1<f32>> = reference
        .iter()
        .map(|t| pooled_features(t, FEATURE_GRID))
        .collect();
    let dim = rows.first().map(|r| r.len()).unwrap_or(FEATURE_GRID * FEATURE_GRID * 3);
    Standardizer::fit(&stack_rows(&rows, dim))
}

fn check_labels(batch: &[(FaceTensor, usize)], num_classes: usize) -> Result<()> {
    ensure!(num_classes > 0, "classifier has not been reset");
    for (_, label) in batch {
        ensure!(*label < num_classes, "label {label} out of range for {num_classes} classes");
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
struct AdamState {
    m_w: Array2<f32>,
    v_w: Array2<f32>,
    m_b: Array1<f32>,
    v_b: Array1<f32>,
    step: i32,
}

/// Multinomial logistic regression over standardized pooled features
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftmaxClassifier {
    weights: Array2<f32>, // classes x features
    bias: Array1<f32>,
    standardizer: Standardizer,
    learning_rate: f32,
    #[serde(skip)]
    adam: Option<AdamState>,
}

impl SoftmaxClassifier {
    const BETA1: f32 = 0.9;
    const BETA2: f32 = 0.999;
    const EPSILON: f32 = 1e-8;

    pub fn new(learning_rate: f32) -> Self {
        Self {
            weights: Array2::zeros((0, 0)),
            bias: Array1::zeros(0),
            standardizer: Standardizer::fit(&Array2::zeros((0, 0))),
            learning_rate,
            adam: None,
        }
    }

    fn logits(&self, x: &Array1<f32>) -> Array1<f32> {
        self.weights.dot(x) + &self.bias
    }

    fn probabilities(&self, tensor: &FaceTensor) -> Array1<f32> {
        let x = self
            .standardizer
            .transform(&pooled_features(tensor, FEATURE_GRID));
        softmax(&self.logits(&x))
    }
}

impl IdentityClassifier for SoftmaxClassifier {
    fn reset(&mut self, num_classes: usize, reference: &[FaceTensor]) -> Result<()> {
        ensure!(num_classes > 0, "at least one class is required");
        self.standardizer = fit_standardizer(reference);
        let dim = self.standardizer.dim();
        self.weights = Array2::zeros((num_classes, dim));
        self.bias = Array1::zeros(num_classes);
        self.adam = Some(AdamState {
            m_w: Array2::zeros((num_classes, dim)),
            v_w: Array2::zeros((num_classes, dim)),
            m_b: Array1::zeros(num_classes),
            v_b: Array1::zeros(num_classes),
            step: 0,
        });
        Ok(())
    }

    fn train_batch(&mut self, batch: &[(FaceTensor, usize)]) -> Result<f32> {
        let classes = self.num_classes();
        check_labels(batch, classes)?;
        if batch.is_empty() {
            return Ok(0.0);
        }

        let rows: Vec<Array1<f32>> = batch
            .iter()
            .map(|(t, _)| self.standardizer.transform(&pooled_features(t, FEATURE_GRID)))
            .collect();
        let x = stack_rows(&rows, self.standardizer.dim());

        // gradient of mean cross-entropy w.r.t. logits is (p - onehot) / n
        let n = batch.len() as f32;
        let mut grad_logits = Array2::<f32>::zeros((batch.len(), classes));
        let mut loss = 0.0;
        for (i, (row, (_, label))) in x.outer_iter().zip(batch).enumerate() {
            let probs = softmax(&self.logits(&row.to_owned()));
            loss += cross_entropy(&probs, *label);
            let mut g = grad_logits.row_mut(i);
            g.assign(&probs);
            g[*label] -= 1.0;
        }
        grad_logits /= n;

        let grad_w = grad_logits.t().dot(&x);
        let grad_b = grad_logits.sum_axis(Axis(0));

        let lr = self.learning_rate;
        let adam = self.adam.get_or_insert_with(|| AdamState {
            m_w: Array2::zeros(grad_w.raw_dim()),
            v_w: Array2::zeros(grad_w.raw_dim()),
            m_b: Array1::zeros(grad_b.raw_dim()),
            v_b: Array1::zeros(grad_b.raw_dim()),
            step: 0,
        });
        adam.step += 1;
        let bc1 = 1.0 - Self::BETA1.powi(adam.step);
        let bc2 = 1.0 - Self::BETA2.powi(adam.step);

        adam.m_w = &adam.m_w * Self::BETA1 + &grad_w * (1.0 - Self::BETA1);
        adam.v_w = &adam.v_w * Self::BETA2 + &grad_w.mapv(|g| g * g) * (1.0 - Self::BETA2);
        adam.m_b = &adam.m_b * Self::BETA1 + &grad_b * (1.0 - Self::BETA1);
        adam.v_b = &adam.v_b * Self::BETA2 + &grad_b.mapv(|g| g * g) * (1.0 - Self::BETA2);

        ndarray::Zip::from(&mut self.weights)
            .and(&adam.m_w)
            .and(&adam.v_w)
            .for_each(|w, &m, &v| {
                *w -= lr * (m / bc1) / ((v / bc2).sqrt() + Self::EPSILON);
            });
        ndarray::Zip::from(&mut self.bias)
            .and(&adam.m_b)
            .and(&adam.v_b)
            .for_each(|b, &m, &v| {
                *b -= lr * (m / bc1) / ((v / bc2).sqrt() + Self::EPSILON);
            });

        Ok(loss / n)
    }

    fn predict(&self, tensor: &FaceTensor) -> Result<Array1<f32>> {
        ensure!(self.num_classes() > 0, "classifier has not been trained");
        Ok(self.probabilities(tensor))
    }

    fn num_classes(&self) -> usize {
        self.bias.len()
    }
}

/// Embedding-distance matcher: cosine similarity to per-class centroids
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentroidClassifier {
    sums: Array2<f32>, // classes x features
    counts: Array1<f32>,
    standardizer: Standardizer,
    temperature: f32,
}

impl Default for CentroidClassifier {
    fn default() -> Self {
        Self {
            sums: Array2::zeros((0, 0)),
            counts: Array1::zeros(0),
            standardizer: Standardizer::fit(&Array2::zeros((0, 0))),
            temperature: 20.0,
        }
    }
}

fn l2_normalize(v: Array1<f32>) -> Array1<f32> {
    let norm = v.dot(&v).sqrt();
    if norm > 0.0 {
        v / norm
    } else {
        v
    }
}

impl CentroidClassifier {
    fn embed(&self, tensor: &FaceTensor) -> Array1<f32> {
        l2_normalize(
            self.standardizer
                .transform(&pooled_features(tensor, FEATURE_GRID)),
        )
    }

    fn similarities(&self, embedding: &Array1<f32>) -> Array1<f32> {
        let mut sims = Array1::from_elem(self.num_classes(), -1.0f32);
        for (c, sum) in self.sums.outer_iter().enumerate() {
            if self.counts[c] > 0.0 {
                let centroid = l2_normalize(sum.to_owned());
                sims[c] = centroid.dot(embedding).clamp(-1.0, 1.0);
            }
        }
        sims
    }
}

impl IdentityClassifier for CentroidClassifier {
    fn reset(&mut self, num_classes: usize, reference: &[FaceTensor]) -> Result<()> {
        ensure!(num_classes > 0, "at least one class is required");
        self.standardizer = fit_standardizer(reference);
        self.sums = Array2::zeros((num_classes, self.standardizer.dim()));
        self.counts = Array1::zeros(num_classes);
        Ok(())
    }

    fn train_batch(&mut self, batch: &[(FaceTensor, usize)]) -> Result<f32> {
        check_labels(batch, self.num_classes())?;
        let embeddings: Vec<Array1<f32>> = batch.iter().map(|(t, _)| self.embed(t)).collect();
        for (emb, (_, label)) in embeddings.iter().zip(batch) {
            let mut row = self.sums.row_mut(*label);
            row += emb;
            self.counts[*label] += 1.0;
        }

        if batch.is_empty() {
            return Ok(0.0);
        }
        let loss: f32 = embeddings
            .iter()
            .zip(batch)
            .map(|(emb, (_, label))| {
                let probs = softmax(&(self.similarities(emb) * self.temperature));
                cross_entropy(&probs, *label)
            })
            .sum();
        Ok(loss / batch.len() as f32)
    }

    fn predict(&self, tensor: &FaceTensor) -> Result<Array1<f32>> {
        ensure!(self.num_classes() > 0, "classifier has not been trained");
        let sims = self.similarities(&self.embed(tensor));
        Ok(softmax(&(sims * self.temperature)))
    }

    fn num_classes(&self) -> usize {
        self.counts.len()
    }
}
