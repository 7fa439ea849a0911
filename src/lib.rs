//! Page-level tamper scoring for scanned documents.
//!
//! Each page is scored from an error-level residual, a noise residual and two classifier
//! confidence probes; pages at or above the localization trigger also get a Grad-CAM overlay.

pub mod classifier;
pub mod config;
pub mod ela;
pub mod error;
pub mod fingerprint;
pub mod gradcam;
pub mod imaging;
pub mod noise;
pub mod pipeline;
pub mod probe;
pub mod raster;
pub mod report;
pub mod resnet;
pub mod scoring;
pub mod storage;

pub use classifier::{Classifier, TapId};
pub use config::{Config, Device, StoreSpec};
pub use error::{ForensicError, Result};
pub use pipeline::{analyze_batch, analyze_path, DocumentAnalyzer};
pub use raster::{Page, SourceKind};
pub use report::{AnalysisEnvelope, DocumentReport, PageResult};
pub use resnet::{ResNet, ResNetConfig};
pub use scoring::{ForensicSignals, TamperScore, Tier};
pub use storage::{ArtifactStore, DirectoryStore, SledStore};
