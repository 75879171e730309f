use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the reference dataset, label included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: i64,
    pub age: i32,
    pub gender: i32,
    pub education: String,
    pub marital_status: String,
    pub child_total: i32,
    pub dependants: i32,
    pub socstatus_work_fl: i32,
    pub socstatus_pens_fl: i32,
    pub fact_address_province: String,
    pub fl_presence_fl: i32,
    pub own_auto: i32,
    pub credit: f64,
    pub term: i32,
    pub fst_payment: f64,
    pub gen_industry: String,
    pub gen_title: String,
    pub job_dir: String,
    pub work_time: i32,
    pub family_income: String,
    pub personal_income: f64,
    pub agreement_rk: i64,
    pub target: i16,
}

/// Feature row without label or agreement number. This is the shape the
/// dashboard pushes into the scratch buffer and the scoring pipeline consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScratchRecord {
    pub id: i64,
    pub age: i32,
    pub gender: i32,
    pub education: String,
    pub marital_status: String,
    pub child_total: i32,
    pub dependants: i32,
    pub socstatus_work_fl: i32,
    pub socstatus_pens_fl: i32,
    pub fact_address_province: String,
    pub fl_presence_fl: i32,
    pub own_auto: i32,
    pub credit: f64,
    pub term: i32,
    pub fst_payment: f64,
    pub gen_industry: String,
    pub gen_title: String,
    pub job_dir: String,
    pub work_time: i32,
    pub family_income: String,
    pub personal_income: f64,
}

impl ClientRecord {
    pub fn features(&self) -> ScratchRecord {
        ScratchRecord {
            id: self.id,
            age: self.age,
            gender: self.gender,
            education: self.education.clone(),
            marital_status: self.marital_status.clone(),
            child_total: self.child_total,
            dependants: self.dependants,
            socstatus_work_fl: self.socstatus_work_fl,
            socstatus_pens_fl: self.socstatus_pens_fl,
            fact_address_province: self.fact_address_province.clone(),
            fl_presence_fl: self.fl_presence_fl,
            own_auto: self.own_auto,
            credit: self.credit,
            term: self.term,
            fst_payment: self.fst_payment,
            gen_industry: self.gen_industry.clone(),
            gen_title: self.gen_title.clone(),
            job_dir: self.job_dir.clone(),
            work_time: self.work_time,
            family_income: self.family_income.clone(),
            personal_income: self.personal_income,
        }
    }
}

/// True label plus the probabilities both variants assigned at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRecord {
    pub id: i64,
    pub target: i16,
    pub prediction_regular: f64,
    pub prediction_tuned: f64,
}

/// The two pre-trained classifiers. A closed set: anything else coming in
/// over the wire is rejected before it reaches the scoring pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    Regular,
    Tuned,
}

impl ModelVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelVariant::Regular => "regular",
            ModelVariant::Tuned => "tuned",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownModelError(pub String);

impl fmt::Display for UnknownModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown model name: {:?} (expected \"regular\" or \"tuned\")",
            self.0
        )
    }
}

impl std::error::Error for UnknownModelError {}

impl FromStr for ModelVariant {
    type Err = UnknownModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(ModelVariant::Regular),
            "tuned" => Ok(ModelVariant::Tuned),
            other => Err(UnknownModelError(other.to_string())),
        }
    }
}

/// Operator selection row: which variant to score with and at what cutoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionState {
    pub model_variant: ModelVariant,
    pub threshold: f64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_round_trips_through_str() {
        assert_eq!("regular".parse::<ModelVariant>().unwrap(), ModelVariant::Regular);
        assert_eq!("tuned".parse::<ModelVariant>().unwrap(), ModelVariant::Tuned);
        assert_eq!(ModelVariant::Tuned.as_str(), "tuned");
    }

    #[test]
    fn unknown_variant_is_an_error() {
        let err = "catboost".parse::<ModelVariant>().unwrap_err();
        assert_eq!(err, UnknownModelError("catboost".to_string()));
    }

    #[test]
    fn variant_serializes_lowercase() {
        let json = serde_json::to_string(&ModelVariant::Regular).unwrap();
        assert_eq!(json, "\"regular\"");
        let back: ModelVariant = serde_json::from_str("\"tuned\"").unwrap();
        assert_eq!(back, ModelVariant::Tuned);
    }
}
