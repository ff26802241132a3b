use anyhow::Context;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::{IntakeError, MIB};
use crate::image_transform::{ImageCompressor, ImageOptions, ImageTransform};
use crate::input::{FileKind, InputFile};
use crate::pdf_transform::{PdfRewriter, PdfTransform};
use crate::state::{DownloadLink, IntakeState, SettlePolicy};

/// PDFs above this size are refused before they are read.
pub const PDF_SIZE_LIMIT: u64 = 30 * MIB;

pub type TransformResult = Result<DownloadLink, IntakeError>;

#[derive(Clone, Debug, PartialEq)]
pub struct HandlerConfig {
    pub image: ImageOptions,
    /// `None` accepts PDFs of any size.
    pub pdf_size_limit: Option<u64>,
    /// Run the PDF load/copy/save sequence on a worker thread.
    pub pdf_in_background: bool,
    pub settle: SettlePolicy,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        HandlerConfig {
            image: ImageOptions::default(),
            pdf_size_limit: Some(PDF_SIZE_LIMIT),
            pdf_in_background: true,
            settle: SettlePolicy::default(),
        }
    }
}

/// Routes a submitted file to the matching transform and records the outcome.
pub struct FileIntakeHandler {
    config: HandlerConfig,
    image: Arc<dyn ImageTransform>,
    pdf: Arc<dyn PdfTransform>,
    links: AtomicU64,
}

impl FileIntakeHandler {
    pub fn new(config: HandlerConfig) -> Self {
        Self::with_transforms(
            config,
            Arc::new(ImageCompressor),
            Arc::new(PdfRewriter::default()),
        )
    }

    pub fn with_transforms(
        config: HandlerConfig,
        image: Arc<dyn ImageTransform>,
        pdf: Arc<dyn PdfTransform>,
    ) -> Self {
        FileIntakeHandler {
            config,
            image,
            pdf,
            links: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Handles one submission. Returns `None`, leaving `state` untouched, when there is
    /// no file or its type is neither an image nor a PDF.
    pub async fn handle(
        &self,
        file: Option<&InputFile>,
        state: &IntakeState,
    ) -> Option<TransformResult> {
        let file = file?;
        let kind = file.kind();
        if kind == FileKind::Other {
            log::debug!("ignoring {} ({})", file.name(), file.mime_type());
            return None;
        }

        let ticket = state.begin();
        let outcome = match kind {
            FileKind::Image => self.compress_image(file).await,
            _ => self.compress_pdf(file).await,
        };

        let policy = self.config.settle;
        let outcome = outcome.map(|bytes| self.link(file, bytes));
        match &outcome {
            Ok(link) => {
                log::info!("{} -> {} ({} bytes)", file.name(), link.url(), link.len());
                state.settle_result(ticket, policy, link.clone());
            }
            Err(err) => {
                state.settle_error(ticket, policy, err.to_string(), err.keeps_prior_result());
            }
        }
        Some(outcome)
    }

    /// Same dispatch without state or worker threads, for callers that block anyway.
    pub fn compress_now(&self, file: &InputFile) -> Option<Result<Vec<u8>, IntakeError>> {
        match file.kind() {
            FileKind::Image => Some(self.run_image(file)),
            FileKind::Pdf => Some(self.check_pdf_size(file).and_then(|()| self.run_pdf(file))),
            FileKind::Other => None,
        }
    }

    async fn compress_image(&self, file: &InputFile) -> Result<Vec<u8>, IntakeError> {
        if !self.config.image.use_background_thread {
            return self.run_image(file);
        }

        let input = file.read().context("Failed to read image").map_err(image_failure)?;
        let transform = Arc::clone(&self.image);
        let options = self.config.image.clone();
        offload(move || transform.compress(&input, &options))
            .await
            .map_err(image_failure)
    }

    fn run_image(&self, file: &InputFile) -> Result<Vec<u8>, IntakeError> {
        file.read()
            .context("Failed to read image")
            .and_then(|input| self.image.compress(&input, &self.config.image))
            .map_err(image_failure)
    }

    async fn compress_pdf(&self, file: &InputFile) -> Result<Vec<u8>, IntakeError> {
        self.check_pdf_size(file)?;
        if !self.config.pdf_in_background {
            return self.run_pdf(file);
        }

        let input = file.read().context("Failed to read PDF").map_err(pdf_failure)?;
        let transform = Arc::clone(&self.pdf);
        offload(move || transform.rewrite(&input))
            .await
            .map_err(pdf_failure)
    }

    fn check_pdf_size(&self, file: &InputFile) -> Result<(), IntakeError> {
        match self.config.pdf_size_limit {
            Some(limit) if file.size() > limit => {
                log::warn!("{} is {} bytes, over the {} byte limit", file.name(), file.size(), limit);
                Err(IntakeError::FileTooLarge {
                    size: file.size(),
                    limit,
                })
            }
            _ => Ok(()),
        }
    }

    fn run_pdf(&self, file: &InputFile) -> Result<Vec<u8>, IntakeError> {
        file.read()
            .context("Failed to read PDF")
            .and_then(|input| self.pdf.rewrite(&input))
            .map_err(pdf_failure)
    }

    fn link(&self, file: &InputFile, bytes: Vec<u8>) -> DownloadLink {
        let n = self.links.fetch_add(1, Ordering::Relaxed) + 1;
        DownloadLink::new(format!("blob:compressed/{}", n), file.mime_type(), bytes)
    }
}

/// Runs `job` on the rayon pool and suspends until it reports back.
async fn offload<T, F>(job: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    rayon::spawn(move || {
        let _ = tx.send(job());
    });
    rx.await
        .context("Worker stopped before finishing")
        .and_then(|result| result)
}

fn image_failure(e: anyhow::Error) -> IntakeError {
    log::error!("Image compression failed: {:?}", e);
    IntakeError::image(e)
}

fn pdf_failure(e: anyhow::Error) -> IntakeError {
    log::error!("PDF compression failed: {:?}", e);
    IntakeError::pdf(e)
}
