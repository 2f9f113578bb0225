use std::{path::PathBuf, process::Command};

use tracing::debug;

use crate::error::{Error, Result};

/// A rasterized page in 8-bit RGB, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub width: u32,
    pub height: u32,
    /// `width * height * 3` bytes, one RGB triple per pixel.
    pub pixels: Vec<u8>,
}

impl PageImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "pixel buffer has {} bytes, expected {expected} for {width}x{height} RGB",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// A uniformly colored page. Used by synthetic fixtures and examples.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width as usize * height as usize) {
            pixels.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            pixels,
        }
    }
}

/// Converts raw document bytes into an ordered sequence of page images.
///
/// Page numbers are 1-based. Unparseable input fails with
/// [`Error::InvalidDocument`]; implementations must not partially succeed.
pub trait Rasterizer: Send + Sync {
    fn rasterize(
        &self,
        document: &[u8],
        dpi: u32,
    ) -> Result<Vec<(u32, PageImage)>>;
}

/// Rasterizes PDFs by shelling out to poppler's `pdftoppm`.
///
/// The document is written to a temporary directory, rendered to one
/// binary PPM file per page, and the PPMs parsed back in page order.
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    binary: PathBuf,
}

impl Default for PdftoppmRasterizer {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("pdftoppm"),
        }
    }
}

impl PdftoppmRasterizer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Rasterizer for PdftoppmRasterizer {
    fn rasterize(
        &self,
        document: &[u8],
        dpi: u32,
    ) -> Result<Vec<(u32, PageImage)>> {
        if dpi == 0 {
            return Err(Error::InvalidArgument(
                "dpi must be positive".into(),
            ));
        }
        if document.is_empty() {
            return Err(Error::InvalidDocument("document is empty".into()));
        }

        let tmp = tempfile::tempdir()?;
        let pdf_path = tmp.path().join("input.pdf");
        std::fs::write(&pdf_path, document)?;
        let prefix = tmp.path().join("page");

        let output = Command::new(&self.binary)
            .arg("-r")
            .arg(dpi.to_string())
            .arg(&pdf_path)
            .arg(&prefix)
            .output()
            .map_err(|e| {
                Error::InvalidDocument(format!(
                    "failed to run {}: {e}",
                    self.binary.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::InvalidDocument(format!(
                "pdftoppm failed: {}",
                stderr.trim()
            )));
        }

        // pdftoppm names pages page-1.ppm, page-2.ppm, ... (zero-padded on
        // longer documents), so sort by parsed page number, not filename.
        let mut pages = Vec::new();
        for entry in std::fs::read_dir(tmp.path())? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(number) = name
                .strip_prefix("page-")
                .and_then(|rest| rest.strip_suffix(".ppm"))
                .and_then(|digits| digits.parse::<u32>().ok())
            else {
                continue;
            };
            let bytes = std::fs::read(entry.path())?;
            pages.push((number, parse_ppm(&bytes)?));
        }

        if pages.is_empty() {
            return Err(Error::InvalidDocument(
                "pdftoppm produced no pages".into(),
            ));
        }

        pages.sort_by_key(|(number, _)| *number);
        debug!(pages = pages.len(), dpi, "rasterized document");
        Ok(pages)
    }
}

/// Parse a binary (P6) PPM image with 8-bit samples.
fn parse_ppm(bytes: &[u8]) -> Result<PageImage> {
    let mut cursor = 0usize;

    let magic = next_token(bytes, &mut cursor)
        .ok_or_else(|| Error::InvalidDocument("truncated PPM header".into()))?;
    if magic != b"P6" {
        return Err(Error::InvalidDocument(
            "expected binary PPM (P6) output".into(),
        ));
    }

    let width: u32 = parse_header_number(bytes, &mut cursor)?;
    let height: u32 = parse_header_number(bytes, &mut cursor)?;
    let max_val: u32 = parse_header_number(bytes, &mut cursor)?;
    if max_val != 255 {
        return Err(Error::InvalidDocument(format!(
            "unsupported PPM max value {max_val}, expected 255"
        )));
    }

    // Exactly one whitespace byte separates the header from pixel data.
    cursor += 1;

    let expected = width as usize * height as usize * 3;
    let pixels = bytes
        .get(cursor..cursor + expected)
        .ok_or_else(|| Error::InvalidDocument("truncated PPM pixel data".into()))?
        .to_vec();

    PageImage::new(width, height, pixels)
}

fn parse_header_number(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    let token = next_token(bytes, cursor)
        .ok_or_else(|| Error::InvalidDocument("truncated PPM header".into()))?;
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::InvalidDocument("malformed PPM header".into()))
}

/// Advance past whitespace and comments, returning the next header token.
/// Leaves the cursor on the byte after the token.
fn next_token<'a>(bytes: &'a [u8], cursor: &mut usize) -> Option<&'a [u8]> {
    loop {
        while *cursor < bytes.len() && bytes[*cursor].is_ascii_whitespace() {
            *cursor += 1;
        }
        if *cursor < bytes.len() && bytes[*cursor] == b'#' {
            while *cursor < bytes.len() && bytes[*cursor] != b'\n' {
                *cursor += 1;
            }
            continue;
        }
        break;
    }

    let start = *cursor;
    while *cursor < bytes.len() && !bytes[*cursor].is_ascii_whitespace() {
        *cursor += 1;
    }
    (*cursor > start).then(|| &bytes[start..*cursor])
}
