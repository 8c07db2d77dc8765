//! Reading pages out of PDF files.
//!
//! We use Poppler's command-line tools, which are fast, robust and widely
//! packaged (`poppler-utils` on Debian and Ubuntu).

use std::{collections::BTreeMap, time::Duration};

use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, output_with_timeout},
    cpu_limit::with_cpu_semaphore,
    prelude::*,
};

/// The embedded text of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextLayer {
    /// The page has no text layer at all (typically a scan).
    Absent,
    /// The page has a text layer, which may still be empty or whitespace.
    Present(String),
}

/// A source of page text and page images.
#[async_trait]
pub trait DocumentSource: Send + Sync + 'static {
    /// How many pages does the document have?
    async fn page_count(&self, path: &Path) -> Result<u32>;

    /// Read the embedded text layer of a 1-based `page`.
    async fn text_layer(&self, path: &Path, page: u32) -> Result<TextLayer>;

    /// Rasterize a 1-based `page` at `dpi` and write it to `out_png`.
    async fn rasterize(&self, path: &Path, page: u32, dpi: u32, out_png: &Path)
    -> Result<()>;
}

/// A [`DocumentSource`] that shells out to Poppler.
#[derive(Debug, Clone)]
pub struct PopplerSource {
    /// Upper bound for each command.
    timeout: Duration,
}

impl PopplerSource {
    /// Create a new Poppler source.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl DocumentSource for PopplerSource {
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn page_count(&self, path: &Path) -> Result<u32> {
        let mut cmd = Command::new("pdfinfo");
        cmd.arg(path);
        let output = output_with_timeout("pdfinfo", cmd, self.timeout).await?;
        check_for_command_failure("pdfinfo", &output, None)?;

        let output =
            String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
        parse_pdfinfo_page_count(&output).with_context(|| {
            format!(
                "failed to parse page count for {:?} from pdfinfo output",
                path.display()
            )
        })
    }

    #[instrument(level = "debug", skip_all, fields(path = %path.display(), page))]
    async fn text_layer(&self, path: &Path, page: u32) -> Result<TextLayer> {
        // A page without any fonts cannot have a text layer.
        let mut cmd = Command::new("pdffonts");
        cmd.arg("-f")
            .arg(page.to_string())
            .arg("-l")
            .arg(page.to_string())
            .arg(path);
        let output = output_with_timeout("pdffonts", cmd, self.timeout).await?;
        check_for_command_failure("pdffonts", &output, None)?;
        if count_pdffonts_fonts(&String::from_utf8_lossy(&output.stdout)) == 0 {
            debug!("No fonts on page, so no text layer");
            return Ok(TextLayer::Absent);
        }

        let mut cmd = Command::new("pdftotext");
        cmd.arg("-f")
            .arg(page.to_string())
            .arg("-l")
            .arg(page.to_string())
            .arg("-enc")
            .arg("UTF-8")
            .arg(path)
            .arg("-");
        let output = output_with_timeout("pdftotext", cmd, self.timeout).await?;
        check_for_command_failure("pdftotext", &output, None)?;
        let text = String::from_utf8(output.stdout)
            .context("pdftotext output was not valid UTF-8")?
            // `pdftotext` ends each page with a form feed.
            .replace('\u{000C}', "");
        Ok(TextLayer::Present(text))
    }

    #[instrument(level = "debug", skip_all, fields(path = %path.display(), page, dpi))]
    async fn rasterize(
        &self,
        path: &Path,
        page: u32,
        dpi: u32,
        out_png: &Path,
    ) -> Result<()> {
        if out_png.extension().is_none_or(|ext| ext != "png") {
            return Err(anyhow!(
                "rasterized pages must be written to a .png file, not {:?}",
                out_png.display()
            ));
        }

        // `pdftocairo -singlefile` adds the extension itself.
        let out_prefix = out_png.with_extension("");
        let mut cmd = Command::new("pdftocairo");
        cmd.arg("-png")
            .arg("-singlefile")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg(page.to_string())
            .arg("-l")
            .arg(page.to_string())
            .arg(path)
            .arg(&out_prefix);

        // `pdftocairo` will use _at least_ 100% of a CPU, and we don't want to
        // run 200 copies of it at once by mistake.
        let output = with_cpu_semaphore(|| {
            output_with_timeout("pdftocairo", cmd, self.timeout)
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, None)?;
        if !tokio::fs::try_exists(out_png).await.unwrap_or(false) {
            return Err(anyhow!(
                "pdftocairo did not write {:?}",
                out_png.display()
            ));
        }
        Ok(())
    }
}

/// Extract the page count from `pdfinfo` output.
fn parse_pdfinfo_page_count(output: &str) -> Result<u32> {
    let mut properties = BTreeMap::new();
    for line in output.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        properties.insert(key, value);
    }
    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    Ok(page_count_str.parse::<u32>()?)
}

/// Count the fonts listed by `pdffonts`, which prints two header lines (the
/// second one made of dashes) and then one line per font.
fn count_pdffonts_fonts(output: &str) -> usize {
    output
        .lines()
        .skip_while(|line| !line.starts_with("---"))
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pdfinfo_output() {
        let output = "Title:          Report\nPages:          3\nEncrypted:      no\n";
        assert_eq!(parse_pdfinfo_page_count(output).unwrap(), 3);
        assert!(parse_pdfinfo_page_count("Title: x\n").is_err());
    }

    #[test]
    fn counts_pdffonts_fonts() {
        let none = "name                                 type              encoding         emb sub uni object ID\n\
                    ------------------------------------ ----------------- ---------------- --- --- --- ---------\n";
        assert_eq!(count_pdffonts_fonts(none), 0);

        let two = format!(
            "{none}BAAAAA+Arial                         TrueType          WinAnsi          yes yes no       9  0\n\
             CAAAAA+Times                         Type 1C           Custom           yes yes no      12  0\n"
        );
        assert_eq!(count_pdffonts_fonts(&two), 2);
    }

    #[tokio::test]
    #[ignore = "Needs poppler-utils installed"]
    async fn missing_files_fail_cleanly() {
        let source = PopplerSource::new(Duration::from_secs(10));
        assert!(source.page_count(Path::new("no/such/file.pdf")).await.is_err());
    }
}
