use crate::error::{InferenceError, Result};
use std::io::Read;
use std::path::{Path, PathBuf};

const FILE_URI_PREFIX: &str = "file://";

/// A prompt plus an optional local image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Local path or `file://` URI.
    pub image: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Check the request without touching any engine.
    ///
    /// A blank image reference counts as no image.
    pub fn validate(&self) -> Result<ValidatedRequest> {
        if self.prompt.trim().is_empty() {
            return Err(InferenceError::InvalidPrompt);
        }

        let image = match self.image.as_deref().map(str::trim) {
            Some(reference) if !reference.is_empty() => {
                let path = normalize_path(reference);
                check_image(&path)?;
                Some(path)
            }
            _ => None,
        };

        Ok(ValidatedRequest {
            prompt: self.prompt.clone(),
            image,
        })
    }
}

/// A request that passed validation; the image, if any, exists on disk.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub prompt: String,
    pub image: Option<PathBuf>,
}

/// Strip a `file://` scheme, keeping the absolute path.
pub fn normalize_path(reference: &str) -> PathBuf {
    PathBuf::from(reference.strip_prefix(FILE_URI_PREFIX).unwrap_or(reference))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    WebP,
    Bmp,
    Heif,
}

/// Identify an image container from its leading bytes.
pub fn sniff_format(header: &[u8]) -> Option<ImageFormat> {
    match header {
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(ImageFormat::Png),
        [0xFF, 0xD8, 0xFF, ..] => Some(ImageFormat::Jpeg),
        [b'G', b'I', b'F', b'8', ..] => Some(ImageFormat::Gif),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(ImageFormat::WebP),
        [b'B', b'M', ..] => Some(ImageFormat::Bmp),
        [_, _, _, _, b'f', b't', b'y', b'p', brand @ ..] if is_heif_brand(brand) => {
            Some(ImageFormat::Heif)
        }
        _ => None,
    }
}

fn is_heif_brand(brand: &[u8]) -> bool {
    const BRANDS: &[&[u8; 4]] = &[b"heic", b"heix", b"hevc", b"heim", b"heis", b"mif1", b"msf1", b"avif"];
    brand.len() >= 4 && BRANDS.iter().any(|b| &brand[..4] == b.as_slice())
}

fn check_image(path: &Path) -> Result<ImageFormat> {
    let metadata = std::fs::metadata(path).map_err(|_| {
        InferenceError::InvalidImage(format!("Image file does not exist at {}", path.display()))
    })?;
    if !metadata.is_file() {
        return Err(InferenceError::InvalidImage(format!(
            "Not a file: {}",
            path.display()
        )));
    }

    let mut header = [0u8; 16];
    let read = std::fs::File::open(path)
        .and_then(|mut f| f.read(&mut header))
        .map_err(|e| InferenceError::InvalidImage(format!("{}: {e}", path.display())))?;

    sniff_format(&header[..read]).ok_or_else(|| {
        InferenceError::InvalidImage(format!("Unrecognized image format: {}", path.display()))
    })
}
