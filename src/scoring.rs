use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::models::{ClientRecord, ModelVariant, ScratchRecord};

/// Fixed vectorization order for the numeric part of a feature row. The
/// fitted artifacts (scaler means, classifier weights) are aligned to this
/// order, so it must never be reshuffled without refitting offline.
pub const NUMERIC_COLUMNS: [&str; 13] = [
    "age",
    "gender",
    "child_total",
    "dependants",
    "socstatus_work_fl",
    "socstatus_pens_fl",
    "fl_presence_fl",
    "own_auto",
    "credit",
    "term",
    "fst_payment",
    "work_time",
    "personal_income",
];

fn numeric_values(row: &ScratchRecord) -> [f64; 13] {
    [
        row.age as f64,
        row.gender as f64,
        row.child_total as f64,
        row.dependants as f64,
        row.socstatus_work_fl as f64,
        row.socstatus_pens_fl as f64,
        row.fl_presence_fl as f64,
        row.own_auto as f64,
        row.credit,
        row.term as f64,
        row.fst_payment,
        row.work_time as f64,
        row.personal_income,
    ]
}

fn categorical_value<'a>(row: &'a ScratchRecord, column: &str) -> Option<&'a str> {
    match column {
        "education" => Some(&row.education),
        "marital_status" => Some(&row.marital_status),
        "fact_address_province" => Some(&row.fact_address_province),
        "gen_industry" => Some(&row.gen_industry),
        "gen_title" => Some(&row.gen_title),
        "job_dir" => Some(&row.job_dir),
        "family_income" => Some(&row.family_income),
        _ => None,
    }
}

/// Vocabulary fitted at training time for one categorical column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderColumn {
    pub name: String,
    pub categories: Vec<String>,
}

/// Fitted categorical encoding. Output layout: the numeric columns in
/// [`NUMERIC_COLUMNS`] order, then one one-hot block per fitted column.
/// A category unseen at fitting time encodes as the all-zero bucket of its
/// block; columns are never dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneHotEncoder {
    pub columns: Vec<EncoderColumn>,
}

impl OneHotEncoder {
    pub fn output_len(&self) -> usize {
        NUMERIC_COLUMNS.len() + self.columns.iter().map(|c| c.categories.len()).sum::<usize>()
    }

    /// Width of the ordinal-coded vector consumed by the regular variant.
    pub fn ordinal_len(&self) -> usize {
        NUMERIC_COLUMNS.len() + self.columns.len()
    }

    pub fn encode(&self, row: &ScratchRecord) -> anyhow::Result<Vec<f64>> {
        let mut out = Vec::with_capacity(self.output_len());
        out.extend_from_slice(&numeric_values(row));
        for column in &self.columns {
            let value = categorical_value(row, &column.name).with_context(|| {
                format!("feature row has no categorical column {:?}", column.name)
            })?;
            let hit = column.categories.iter().position(|c| c == value);
            for idx in 0..column.categories.len() {
                out.push(if hit == Some(idx) { 1.0 } else { 0.0 });
            }
        }
        Ok(out)
    }

    /// Ordinal coding for the raw-feature variant: the fitted category index,
    /// or the explicit out-of-vocabulary code one past the last index.
    pub fn ordinal(&self, row: &ScratchRecord) -> anyhow::Result<Vec<f64>> {
        let mut out = Vec::with_capacity(self.ordinal_len());
        out.extend_from_slice(&numeric_values(row));
        for column in &self.columns {
            let value = categorical_value(row, &column.name).with_context(|| {
                format!("feature row has no categorical column {:?}", column.name)
            })?;
            let code = column
                .categories
                .iter()
                .position(|c| c == value)
                .unwrap_or(column.categories.len());
            out.push(code as f64);
        }
        Ok(out)
    }
}

/// Fitted standardization: (x - mean) / std, element-wise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl StandardScaler {
    pub fn transform(&self, values: &[f64]) -> anyhow::Result<Vec<f64>> {
        if values.len() != self.mean.len() {
            bail!(
                "scaler expects {} features, got {}",
                self.mean.len(),
                values.len()
            );
        }
        Ok(values
            .iter()
            .zip(self.mean.iter().zip(self.std.iter()))
            .map(|(x, (m, s))| {
                let s = if *s > f64::EPSILON { *s } else { 1.0 };
                (x - m) / s
            })
            .collect())
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

const FIT_EPOCHS: usize = 300;
const FIT_LEARNING_RATE: f64 = 0.1;
const FIT_L2: f64 = 0.001;

/// A fitted linear classifier plus the metadata the dashboard displays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    pub display_name: String,
    pub algorithm: String,
    pub hyperparams: String,
    pub best_thr: f64,
    pub weights: Vec<f64>,
    pub intercept: f64,
}

impl LogisticModel {
    pub fn predict_proba(&self, features: &[f64]) -> anyhow::Result<f64> {
        if features.len() != self.weights.len() {
            bail!(
                "model {:?} expects {} features, got {}",
                self.display_name,
                self.weights.len(),
                features.len()
            );
        }
        let logit: f64 = self
            .weights
            .iter()
            .zip(features.iter())
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.intercept;
        Ok(sigmoid(logit))
    }

    /// Full-batch gradient descent from zeroed weights, replacing the fitted
    /// parameters. Inputs are parallel slices, already vectorized.
    pub fn fit(&mut self, rows: &[Vec<f64>], labels: &[f64]) -> anyhow::Result<()> {
        if rows.is_empty() {
            bail!("cannot fit {:?} on an empty batch", self.display_name);
        }
        if rows.len() != labels.len() {
            bail!(
                "fit batch mismatch: {} rows vs {} labels",
                rows.len(),
                labels.len()
            );
        }
        let dim = self.weights.len();
        for row in rows {
            if row.len() != dim {
                bail!(
                    "fit row has {} features, model {:?} expects {}",
                    row.len(),
                    self.display_name,
                    dim
                );
            }
        }

        let n = rows.len() as f64;
        let mut weights = vec![0.0; dim];
        let mut intercept = 0.0;
        for _ in 0..FIT_EPOCHS {
            let mut grad = vec![0.0; dim];
            let mut grad_intercept = 0.0;
            for (row, y) in rows.iter().zip(labels.iter()) {
                let logit: f64 = weights
                    .iter()
                    .zip(row.iter())
                    .map(|(w, x)| w * x)
                    .sum::<f64>()
                    + intercept;
                let error = sigmoid(logit) - y;
                for (g, x) in grad.iter_mut().zip(row.iter()) {
                    *g += error * x;
                }
                grad_intercept += error;
            }
            for (w, g) in weights.iter_mut().zip(grad.iter()) {
                *w -= FIT_LEARNING_RATE * (g / n + FIT_L2 * *w);
            }
            intercept -= FIT_LEARNING_RATE * grad_intercept / n;
        }

        self.weights = weights;
        self.intercept = intercept;
        Ok(())
    }
}

/// Scoring verdict for one feature row.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Score {
    pub probability: f64,
    pub recommend_thr: bool,
    pub recommend_best_thr: bool,
}

/// Everything fitted offline, loaded once at startup and handed to the
/// components that need it. Refitting a classifier through the API is the
/// only mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBundle {
    pub encoder: OneHotEncoder,
    pub scaler: StandardScaler,
    pub regular: LogisticModel,
    pub tuned: LogisticModel,
}

impl ModelBundle {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model artifacts from {}", path.display()))?;
        let bundle: ModelBundle = serde_json::from_str(&raw)
            .with_context(|| format!("malformed model artifact file {}", path.display()))?;
        bundle.validate()?;
        Ok(bundle)
    }

    /// Cross-checks the fitted pieces against each other and against the
    /// feature schema, so a bad artifact fails at startup instead of on the
    /// first scoring request.
    pub fn validate(&self) -> anyhow::Result<()> {
        for column in &self.encoder.columns {
            if column.categories.is_empty() {
                bail!("encoder column {:?} has an empty vocabulary", column.name);
            }
            let probe = ScratchRecord::default_probe();
            if categorical_value(&probe, &column.name).is_none() {
                bail!(
                    "encoder column {:?} does not exist in the client schema",
                    column.name
                );
            }
        }
        let encoded = self.encoder.output_len();
        if self.scaler.mean.len() != encoded || self.scaler.std.len() != encoded {
            bail!(
                "scaler is fitted for {} features but the encoder produces {}",
                self.scaler.mean.len(),
                encoded
            );
        }
        if self.tuned.weights.len() != encoded {
            bail!(
                "tuned model has {} weights but the encoded row has {} features",
                self.tuned.weights.len(),
                encoded
            );
        }
        if self.regular.weights.len() != self.encoder.ordinal_len() {
            bail!(
                "regular model has {} weights but the raw row has {} features",
                self.regular.weights.len(),
                self.encoder.ordinal_len()
            );
        }
        Ok(())
    }

    pub fn model(&self, variant: ModelVariant) -> &LogisticModel {
        match variant {
            ModelVariant::Regular => &self.regular,
            ModelVariant::Tuned => &self.tuned,
        }
    }

    pub fn best_thr(&self, variant: ModelVariant) -> f64 {
        self.model(variant).best_thr
    }

    /// Applies the variant's fitted input transform. Regular consumes the raw
    /// row with ordinal category codes; tuned encodes then scales, in that
    /// fixed order. Nothing is refitted here.
    pub fn vectorize(&self, row: &ScratchRecord, variant: ModelVariant) -> anyhow::Result<Vec<f64>> {
        match variant {
            ModelVariant::Regular => self.encoder.ordinal(row),
            ModelVariant::Tuned => {
                let encoded = self.encoder.encode(row)?;
                self.scaler.transform(&encoded)
            }
        }
    }

    pub fn probability(&self, row: &ScratchRecord, variant: ModelVariant) -> anyhow::Result<f64> {
        let features = self.vectorize(row, variant)?;
        self.model(variant).predict_proba(&features)
    }

    /// The full pipeline: transform, score, compare against both cutoffs.
    /// Equality counts as a recommendation on either cutoff.
    pub fn score(
        &self,
        row: &ScratchRecord,
        variant: ModelVariant,
        threshold: f64,
    ) -> anyhow::Result<Score> {
        let probability = self.probability(row, variant)?;
        Ok(Score {
            probability,
            recommend_thr: probability >= threshold,
            recommend_best_thr: probability >= self.best_thr(variant),
        })
    }

    /// Refits the named classifier on a batch of labelled records. The
    /// encoder and scaler stay frozen; only the classifier weights move.
    pub fn fit(&mut self, variant: ModelVariant, batch: &[ClientRecord]) -> anyhow::Result<()> {
        let mut rows = Vec::with_capacity(batch.len());
        let mut labels = Vec::with_capacity(batch.len());
        for record in batch {
            rows.push(self.vectorize(&record.features(), variant)?);
            labels.push(f64::from(record.target));
        }
        match variant {
            ModelVariant::Regular => self.regular.fit(&rows, &labels),
            ModelVariant::Tuned => self.tuned.fit(&rows, &labels),
        }
    }
}

impl ScratchRecord {
    /// Schema probe used only for artifact validation.
    fn default_probe() -> ScratchRecord {
        ScratchRecord {
            id: 0,
            age: 0,
            gender: 0,
            education: String::new(),
            marital_status: String::new(),
            child_total: 0,
            dependants: 0,
            socstatus_work_fl: 0,
            socstatus_pens_fl: 0,
            fact_address_province: String::new(),
            fl_presence_fl: 0,
            own_auto: 0,
            credit: 0.0,
            term: 0,
            fst_payment: 0.0,
            gen_industry: String::new(),
            gen_title: String::new(),
            job_dir: String::new(),
            work_time: 0,
            family_income: String::new(),
            personal_income: 0.0,
        }
    }
}
