//! Page and document aggregation.
//!
//! A document is rasterized once, then its pages are scored strictly in page order. Every page
//! gets exactly one result: a score (with an optional localization artifact) or the error that
//! stopped it. Documents in a batch run on blocking worker threads and draw classifiers from a
//! small pool of replicas; a replica is locked only around inference and Grad-CAM, so tap state
//! never interleaves while the image work runs unlocked.

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::classifier::Classifier;
use crate::config::Config;
use crate::ela::{compute_ela, ela_score};
use crate::error::{ForensicError, Result};
use crate::fingerprint::{page_phash, source_sha256};
use crate::gradcam;
use crate::noise::compute_noise_residual;
use crate::probe::probe;
use crate::raster::{rasterize_bytes, Page, PageSlot, SourceKind};
use crate::report::{
    AnalysisEnvelope, AnalysisType, DocumentReport, DocumentStatus,
    LocalizationArtifact, PageOutcome, PageResult, ScoredPage, STATUS_ERROR, STATUS_NO_DOCUMENTS,
    STATUS_SUCCESS,
};
use crate::scoring::{score, should_localize, ForensicSignals};
use crate::storage::{artifact_key, ArtifactStore};

const SUPPORTED_EXTENSIONS: [&str; 4] = ["pdf", "jpg", "jpeg", "png"];

pub struct DocumentAnalyzer<C: Classifier> {
    classifiers: Vec<Mutex<C>>,
    next: AtomicUsize,
    config: Config,
    store: Option<Arc<dyn ArtifactStore>>,
}

impl<C: Classifier> DocumentAnalyzer<C> {
    pub fn new(classifier: C, config: Config) -> Self {
        Self {
            classifiers: vec![Mutex::new(classifier)],
            next: AtomicUsize::new(0),
            config,
            store: None,
        }
    }

    /// Add classifier instances sharing the load, typically `fork()`s of the first.
    pub fn with_replicas(mut self, replicas: impl IntoIterator<Item = C>) -> Self {
        self.classifiers.extend(replicas.into_iter().map(Mutex::new));
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn replicas(&self) -> usize {
        self.classifiers.len()
    }

    /// Taps still attached across the pool; zero between pages.
    pub fn active_taps(&self) -> usize {
        self.classifiers
            .iter()
            .map(|c| c.lock().unwrap_or_else(PoisonError::into_inner).active_taps())
            .sum()
    }

    /// First free replica, starting from a rotating offset; waits on that offset if all are busy.
    ///
    /// A replica poisoned by a panicking worker is taken back: its tap guard has already released
    /// on unwind and the weights are read-only.
    fn lock_classifier(&self) -> MutexGuard<'_, C> {
        let n = self.classifiers.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % n;
        for i in 0..n {
            let slot = &self.classifiers[(start + i) % n];
            match slot.try_lock() {
                Ok(guard) => return guard,
                Err(TryLockError::WouldBlock) => continue,
                Err(TryLockError::Poisoned(poisoned)) => return recover(slot, poisoned.into_inner()),
            }
        }
        let slot = &self.classifiers[start];
        match slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => recover(slot, poisoned.into_inner()),
        }
    }

    /// ELA, noise and classifier signals for one page.
    pub fn compute_signals(&self, page: &Page) -> Result<ForensicSignals> {
        let img = page.image();
        let ela = compute_ela(img, self.config.quality)?;
        let noise = compute_noise_residual(img);
        let confidences = {
            let classifier = self.lock_classifier();
            probe(&*classifier, img, &ela.image)?
        };
        Ok(ForensicSignals {
            model_prob_orig: confidences.original,
            model_prob_ela: confidences.ela,
            ela_mean: ela.mean,
            ela_std: ela.std,
            noise_mean: noise.mean,
            noise_std: noise.std,
            ela_score: ela_score(&ela),
        })
    }

    /// Score one page and, when warranted, attach its localization artifact.
    pub fn score_page(&self, file_name: &str, page: &Page) -> PageResult {
        let outcome = match self.score_page_inner(file_name, page) {
            Ok(scored) => PageOutcome::Scored(Box::new(scored)),
            Err(e) => {
                warn!(file = file_name, page = page.index(), error = %e, "page scoring failed");
                PageOutcome::Failed(e)
            }
        };
        PageResult {
            page: page.index(),
            outcome,
            timestamp: Utc::now(),
        }
    }

    fn score_page_inner(&self, file_name: &str, page: &Page) -> Result<ScoredPage> {
        // 1. Signals and the ensemble score.
        let signals = self.compute_signals(page)?;
        let tamper = score(&signals);
        info!(
            file = file_name,
            page = page.index(),
            score = tamper.score,
            tier = %tamper.tier,
            "page scored"
        );

        let mut scored = ScoredPage {
            score: tamper,
            signals,
            phash: page_phash(page.image()),
            localization: None,
            localization_error: None,
            storage_error: None,
        };
        if !should_localize(tamper.score, self.config.tamper_threshold) {
            return Ok(scored);
        }

        // 2. Grad-CAM under a replica lock; PNG encoding happens after the guard is gone.
        let map = {
            let mut classifier = self.lock_classifier();
            gradcam::generate(&mut *classifier, page.image(), None)
        };
        let overlay = map.and_then(|map| Ok((map.target_class, map.to_png()?)));

        // 3. Persist the overlay when there is somewhere to put it.
        match overlay {
            Ok((target_class, png)) => {
                let mut artifact = LocalizationArtifact {
                    target_class,
                    bytes: png.len(),
                    key: None,
                    url: None,
                };
                match (&self.config.document_id, &self.store) {
                    (Some(document_id), Some(store)) => {
                        let key = artifact_key(document_id, file_name, page.index());
                        match store.upload(&png, &key) {
                            Ok(url) => {
                                artifact.key = Some(key);
                                artifact.url = Some(url);
                            }
                            Err(e) => {
                                error!(key = %key, error = %e, "localization upload failed");
                                scored.storage_error = Some(e);
                            }
                        }
                    }
                    _ => warn!(
                        page = page.index(),
                        "no document id or artifact store configured, overlay not persisted"
                    ),
                }
                scored.localization = Some(artifact);
            }
            Err(e) => {
                warn!(page = page.index(), error = %e, "localization failed");
                scored.localization_error = Some(e);
            }
        }
        Ok(scored)
    }

    /// Score rasterized pages in page order; failed pages keep their slot.
    pub fn analyze_pages(&self, file_name: &str, slots: Vec<PageSlot>) -> Vec<PageResult> {
        slots
            .into_iter()
            .map(|slot| match slot {
                Ok(page) => self.score_page(file_name, &page),
                Err(failure) => PageResult {
                    page: failure.index,
                    outcome: PageOutcome::Failed(failure.error),
                    timestamp: Utc::now(),
                },
            })
            .collect()
    }

    pub fn analyze_bytes(&self, file_name: &str, kind: SourceKind, bytes: &[u8]) -> DocumentReport {
        let source_sha256 = Some(source_sha256(bytes));
        let slots = match rasterize_bytes(kind, bytes, self.config.dpi) {
            Ok(slots) => slots,
            Err(e) => {
                warn!(file = file_name, error = %e, "document could not be rasterized");
                return DocumentReport {
                    file_name: file_name.to_string(),
                    source_sha256,
                    status: DocumentStatus::Failed(e),
                    pages: Vec::new(),
                };
            }
        };
        info!(file = file_name, pages = slots.len(), "document rasterized");

        let pages = self.analyze_pages(file_name, slots);
        let status = if pages.iter().any(|p| p.scored().is_some()) {
            DocumentStatus::Analyzed
        } else {
            warn!(file = file_name, "no readable pages");
            DocumentStatus::NoReadablePages
        };
        let report = DocumentReport {
            file_name: file_name.to_string(),
            source_sha256,
            status,
            pages,
        };
        info!(
            file = file_name,
            flagged = report.flagged_pages().count(),
            "document analyzed"
        );
        report
    }

    pub fn analyze_document(&self, path: &Path) -> DocumentReport {
        let file_name = display_name(path);
        let failed = |e: ForensicError| DocumentReport {
            file_name: file_name.clone(),
            source_sha256: None,
            status: DocumentStatus::Failed(e),
            pages: Vec::new(),
        };
        let kind = match SourceKind::from_path(path) {
            Ok(kind) => kind,
            Err(e) => return failed(e),
        };
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                return failed(ForensicError::DecodeError(format!(
                    "{}: {}",
                    path.display(),
                    e
                )))
            }
        };
        self.analyze_bytes(&file_name, kind, &bytes)
    }
}

fn recover<'a, C>(slot: &Mutex<C>, guard: MutexGuard<'a, C>) -> MutexGuard<'a, C> {
    warn!("classifier replica recovered after a worker panic");
    slot.clear_poison();
    guard
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Supported documents directly inside `dir`, ordered by file name.
pub fn list_documents(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    files.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));
    Ok(files)
}

/// Analyze documents concurrently, at most `config.workers` at a time. Reports come back in
/// the order of `paths`.
pub async fn analyze_batch<C>(analyzer: Arc<DocumentAnalyzer<C>>, paths: Vec<PathBuf>) -> Vec<DocumentReport>
where
    C: Classifier + 'static,
{
    let permits = Arc::new(Semaphore::new(analyzer.config.workers.max(1)));
    let mut handles = Vec::with_capacity(paths.len());
    for path in paths {
        let analyzer = Arc::clone(&analyzer);
        let permits = Arc::clone(&permits);
        let name = display_name(&path);
        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await;
            tokio::task::spawn_blocking(move || analyzer.analyze_document(&path)).await
        });
        handles.push((name, handle));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for (name, handle) in handles {
        let report = match handle.await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) | Err(e) => {
                error!(file = %name, error = %e, "analysis worker failed");
                DocumentReport {
                    file_name: name,
                    source_sha256: None,
                    status: DocumentStatus::Failed(ForensicError::WorkerFailed(e.to_string())),
                    pages: Vec::new(),
                }
            }
        };
        reports.push(report);
    }
    reports
}

/// Analyze a file or every supported file in a folder and wrap the results for callers.
pub async fn analyze_path<C>(analyzer: Arc<DocumentAnalyzer<C>>, path: &Path) -> AnalysisEnvelope
where
    C: Classifier + 'static,
{
    let mut envelope = AnalysisEnvelope {
        status: STATUS_SUCCESS.to_string(),
        message: None,
        analysis_type: None,
        path: path.display().to_string(),
        document_id: analyzer.config.document_id.clone(),
        tamper_threshold: analyzer.config.tamper_threshold,
        file_name: None,
        results: Vec::new(),
    };

    if !path.exists() {
        envelope.status = STATUS_ERROR.to_string();
        envelope.message = Some(format!("File not found - {}", path.display()));
        return envelope;
    }

    if path.is_dir() {
        envelope.analysis_type = Some(AnalysisType::Folder);
        let files = match list_documents(path) {
            Ok(files) => files,
            Err(e) => {
                envelope.status = STATUS_ERROR.to_string();
                envelope.message = Some(e.to_string());
                return envelope;
            }
        };
        if files.is_empty() {
            envelope.status = STATUS_NO_DOCUMENTS.to_string();
            return envelope;
        }
        info!(folder = %path.display(), documents = files.len(), "analyzing folder");
        let reports = analyze_batch(analyzer, files).await;
        envelope.results = reports.iter().map(DocumentReport::to_record).collect();
    } else {
        envelope.analysis_type = Some(AnalysisType::SingleFile);
        envelope.file_name = Some(display_name(path));
        let owned = path.to_path_buf();
        let reports = analyze_batch(analyzer, vec![owned]).await;
        envelope.results = reports.iter().map(DocumentReport::to_record).collect();
    }
    envelope
}
