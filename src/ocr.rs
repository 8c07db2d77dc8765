//! OCR engines.

use std::{sync::LazyLock, time::Duration};

use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, output_with_timeout},
    cpu_limit::with_cpu_semaphore,
    prelude::*,
};

/// Tesseract sometimes exits successfully after failing to read its input.
static TESSERACT_ERROR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(Error|Image file .* cannot be read)")
        .expect("failed to compile regex")
});

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Recognize the text in a PNG image. An empty string is a valid answer.
    async fn ocr_image(&self, png_path: &Path) -> Result<String>;
}

/// OCR engine wrapping the `tesseract` CLI tool.
#[derive(Debug, Clone)]
pub struct TesseractOcrEngine {
    /// Upper bound for each `tesseract` run.
    timeout: Duration,
}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    #[instrument(level = "debug", skip_all, fields(path = %png_path.display()))]
    async fn ocr_image(&self, png_path: &Path) -> Result<String> {
        let mut cmd = Command::new("tesseract");
        cmd.arg(png_path).arg("stdout");
        let output =
            with_cpu_semaphore(|| output_with_timeout("tesseract", cmd, self.timeout))
                .await?;
        check_for_command_failure("tesseract", &output, Some(&TESSERACT_ERROR_REGEX))?;
        String::from_utf8(output.stdout).context("tesseract output was not valid UTF-8")
    }
}
