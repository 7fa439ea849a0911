//! Result records handed to collaborators.
//!
//! In-memory results keep full precision and typed errors; the serialized records round scores
//! to four decimals and flatten errors to `{kind, message}`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ForensicError;
use crate::scoring::{ForensicSignals, TamperScore};

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn iso_utc(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Reference to a generated overlay. `key`/`url` are set only once the store accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizationArtifact {
    pub target_class: usize,
    /// Size of the PNG overlay.
    pub bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug)]
pub struct ScoredPage {
    pub score: TamperScore,
    pub signals: ForensicSignals,
    pub phash: String,
    pub localization: Option<LocalizationArtifact>,
    /// Localization was attempted and failed; the score stands.
    pub localization_error: Option<ForensicError>,
    pub storage_error: Option<ForensicError>,
}

#[derive(Debug)]
pub enum PageOutcome {
    Scored(Box<ScoredPage>),
    Failed(ForensicError),
}

/// One page's result. Appended once to its document, never changed afterwards.
#[derive(Debug)]
pub struct PageResult {
    pub page: u32,
    pub outcome: PageOutcome,
    pub timestamp: DateTime<Utc>,
}

impl PageResult {
    pub fn scored(&self) -> Option<&ScoredPage> {
        match &self.outcome {
            PageOutcome::Scored(s) => Some(s.as_ref()),
            PageOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ForensicError> {
        match &self.outcome {
            PageOutcome::Failed(e) => Some(e),
            PageOutcome::Scored(_) => None,
        }
    }

    pub fn to_record(&self) -> PageRecord {
        let timestamp = iso_utc(&self.timestamp);
        match &self.outcome {
            PageOutcome::Failed(e) => PageRecord {
                page: self.page,
                ensemble_score: None,
                tampering_level: None,
                details: None,
                page_phash: None,
                timestamp,
                localization: None,
                localization_error: None,
                storage_error: None,
                error: Some(ErrorRecord::from(e)),
            },
            PageOutcome::Scored(s) => PageRecord {
                page: self.page,
                ensemble_score: Some(round4(s.score.score)),
                tampering_level: Some(s.score.tier.as_str().to_string()),
                details: Some(DetailsRecord::from(&s.signals)),
                page_phash: Some(s.phash.clone()),
                timestamp,
                localization: s.localization.clone(),
                localization_error: s.localization_error.as_ref().map(ErrorRecord::from),
                storage_error: s.storage_error.as_ref().map(ErrorRecord::from),
                error: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
}

impl From<&ForensicError> for ErrorRecord {
    fn from(e: &ForensicError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailsRecord {
    pub model_prob_orig: f64,
    pub model_prob_ela: f64,
    pub ela_mean: f64,
    pub ela_std: f64,
    pub noise_mean: f64,
    pub noise_std: f64,
    pub ela_score: f64,
}

impl From<&ForensicSignals> for DetailsRecord {
    fn from(s: &ForensicSignals) -> Self {
        Self {
            model_prob_orig: round4(s.model_prob_orig),
            model_prob_ela: round4(s.model_prob_ela),
            ela_mean: round4(s.ela_mean),
            ela_std: round4(s.ela_std),
            noise_mean: round4(s.noise_mean),
            noise_std: round4(s.noise_std),
            ela_score: round4(s.ela_score),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ensemble_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tampering_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<DetailsRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_phash: Option<String>,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub localization: Option<LocalizationArtifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub localization_error: Option<ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_error: Option<ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

#[derive(Debug)]
pub enum DocumentStatus {
    Analyzed,
    /// The file opened but no page could be rasterized or scored.
    NoReadablePages,
    /// The file itself was rejected before any page existed.
    Failed(ForensicError),
}

/// Results for one source file, pages in page order.
#[derive(Debug)]
pub struct DocumentReport {
    pub file_name: String,
    pub source_sha256: Option<String>,
    pub status: DocumentStatus,
    pub pages: Vec<PageResult>,
}

impl DocumentReport {
    pub fn flagged_pages(&self) -> impl Iterator<Item = &PageResult> {
        self.pages.iter().filter(|p| {
            p.scored()
                .map_or(false, |s| s.score.tier != crate::scoring::Tier::Low)
        })
    }

    pub fn to_record(&self) -> DocumentRecord {
        let (status, error) = match &self.status {
            DocumentStatus::Analyzed => ("analyzed", None),
            DocumentStatus::NoReadablePages => ("no_readable_pages", None),
            DocumentStatus::Failed(e) => ("failed", Some(ErrorRecord::from(e))),
        };
        DocumentRecord {
            file_name: self.file_name.clone(),
            source_sha256: self.source_sha256.clone(),
            status: status.to_string(),
            error,
            pages: self.pages.iter().map(PageResult::to_record).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_sha256: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    pub pages: Vec<PageRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    SingleFile,
    Folder,
}

/// Top-level response for one analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisEnvelope {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_type: Option<AnalysisType>,
    pub path: String,
    pub document_id: Option<String>,
    pub tamper_threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub results: Vec<DocumentRecord>,
}

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_NO_DOCUMENTS: &str = "no documents found";
pub const STATUS_ERROR: &str = "error";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::{score, Tier};
    use chrono::TimeZone;

    fn signals() -> ForensicSignals {
        ForensicSignals {
            model_prob_orig: 0.912345678,
            model_prob_ela: 0.5,
            ela_mean: 0.012345,
            ela_std: 0.1,
            noise_mean: 0.2,
            noise_std: 0.1,
            ela_score: 0.0,
        }
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 6, 30, 0).unwrap()
    }

    #[test]
    fn scored_record_rounds_and_labels() {
        let s = signals();
        let result = PageResult {
            page: 1,
            outcome: PageOutcome::Scored(Box::new(ScoredPage {
                score: score(&s),
                signals: s,
                phash: "AAAA".into(),
                localization: Some(LocalizationArtifact {
                    target_class: 3,
                    bytes: 1024,
                    key: Some("LID1/gradcam/x_page1_gradcam.png".into()),
                    url: Some("file:///tmp/x".into()),
                }),
                localization_error: None,
                storage_error: None,
            })),
            timestamp: at(),
        };
        let record = result.to_record();
        assert_eq!(record.details.as_ref().unwrap().model_prob_orig, 0.9123);
        assert_eq!(record.details.as_ref().unwrap().ela_mean, 0.0123);
        assert_eq!(record.tampering_level.as_deref(), Some("High"));
        assert_eq!(record.timestamp, "2026-10-18T06:30:00.000000Z");

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["localization"]["key"], "LID1/gradcam/x_page1_gradcam.png");
        let ensemble = json["ensemble_score"].as_f64().unwrap();
        assert_eq!(ensemble, (ensemble * 10_000.0).round() / 10_000.0);
    }

    #[test]
    fn failed_record_carries_only_error() {
        let result = PageResult {
            page: 2,
            outcome: PageOutcome::Failed(ForensicError::DecodeError("bad stream".into())),
            timestamp: at(),
        };
        let json = serde_json::to_value(result.to_record()).unwrap();
        assert_eq!(json["page"], 2);
        assert_eq!(json["error"]["kind"], "DecodeError");
        assert!(json.get("ensemble_score").is_none());
        assert!(json.get("tampering_level").is_none());
    }

    #[test]
    fn document_status_strings() {
        let report = DocumentReport {
            file_name: "a.pdf".into(),
            source_sha256: None,
            status: DocumentStatus::Failed(ForensicError::UnsupportedFormat("a.doc".into())),
            pages: vec![],
        };
        let record = report.to_record();
        assert_eq!(record.status, "failed");
        assert_eq!(record.error.unwrap().kind, "UnsupportedFormat");
        assert_eq!(report.flagged_pages().count(), 0);
    }

    #[test]
    fn analysis_type_is_snake_case() {
        assert_eq!(
            serde_json::to_string(&AnalysisType::SingleFile).unwrap(),
            "\"single_file\""
        );
        assert_eq!(Tier::Low.as_str(), "Low");
    }
}
