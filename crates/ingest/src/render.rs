//! PDF page rendering for previews
//!
//! `PdftoppmRenderer` shells out to poppler's `pdftoppm`. Tests and embedders
//! without poppler plug in their own `PageRenderer`.

use anyhow::{Context, Result, bail};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// One rendered page (PNG bytes), numbered from 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub number: usize,
    pub png: Vec<u8>,
}

/// Renders every page of a PDF to PNG
pub trait PageRenderer: Send + Sync {
    fn render_pages(&self, pdf: &[u8]) -> Result<Vec<RenderedPage>>;
}

/// `pdftoppm`-backed renderer
pub struct PdftoppmRenderer {
    binary: PathBuf,
    dpi: u32,
}

impl PdftoppmRenderer {
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("pdftoppm"),
            dpi: 110,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }
}

impl Default for PdftoppmRenderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Page number from a `pdftoppm` output name like `page-07.png`
fn page_number(path: &Path) -> Option<usize> {
    let stem = path.file_stem()?.to_str()?;
    let (_, number) = stem.rsplit_once('-')?;
    number.parse().ok()
}

impl PageRenderer for PdftoppmRenderer {
    fn render_pages(&self, pdf: &[u8]) -> Result<Vec<RenderedPage>> {
        if !pdf.starts_with(b"%PDF") {
            bail!("Input is not a PDF");
        }

        let dir = tempfile::tempdir().context("Failed to create render directory")?;
        let input = dir.path().join("input.pdf");
        fs::write(&input, pdf).context("Failed to write PDF for rendering")?;
        let prefix = dir.path().join("page");

        let output = Command::new(&self.binary)
            .arg("-png")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg(&input)
            .arg(&prefix)
            .output()
            .with_context(|| format!("Failed to run {}", self.binary.display()))?;

        if !output.status.success() {
            bail!(
                "pdftoppm failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let mut pages = Vec::new();
        for entry in fs::read_dir(dir.path())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("png") {
                continue;
            }
            if let Some(number) = page_number(&path) {
                pages.push(RenderedPage {
                    number,
                    png: fs::read(&path)?,
                });
            }
        }
        pages.sort_by_key(|p| p.number);

        if pages.is_empty() {
            bail!("pdftoppm produced no pages");
        }
        debug!("Rendered {} page(s)", pages.len());

        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_number_parsing() {
        assert_eq!(page_number(Path::new("/tmp/x/page-1.png")), Some(1));
        assert_eq!(page_number(Path::new("/tmp/x/page-012.png")), Some(12));
        assert_eq!(page_number(Path::new("/tmp/x/input.pdf")), None);
    }

    #[test]
    fn test_rejects_non_pdf() {
        let renderer = PdftoppmRenderer::new();
        assert!(renderer.render_pages(b"GIF89a").is_err());
    }

    #[test]
    fn test_missing_binary_is_error() {
        let renderer = PdftoppmRenderer::new().with_binary("/nonexistent/pdftoppm");
        assert!(renderer.render_pages(b"%PDF-1.4\n%%EOF").is_err());
    }
}
