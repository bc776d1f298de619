//! Upload validation. Turns raw request bytes into an [`ImageBlob`]
//! before any decoding or inference happens.

pub mod store;

use sha2::{Digest, Sha256};

use crate::consts::DEFAULT_MAX_UPLOAD_BYTES;
use crate::error::DiagnosisError;

const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_SOI: &[u8] = &[0xFF, 0xD8, 0xFF];

/// Image formats the gateway accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MimeType {
    Png,
    Jpeg,
}

impl MimeType {
    /// Parse a declared content type. Case-insensitive; parameters after
    /// `;` are ignored. Returns `None` for anything other than PNG or JPEG.
    pub fn parse(declared: &str) -> Option<Self> {
        let essence = declared.split(';').next().unwrap_or("").trim();
        match essence.to_ascii_lowercase().as_str() {
            "image/png" | "png" => Some(MimeType::Png),
            "image/jpeg" | "image/jpg" | "jpeg" | "jpg" => Some(MimeType::Jpeg),
            _ => None,
        }
    }

    /// Guess from a file name's extension.
    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::parse)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MimeType::Png => "image/png",
            MimeType::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            MimeType::Png => "png",
            MimeType::Jpeg => "jpg",
        }
    }

    pub fn image_format(&self) -> image::ImageFormat {
        match self {
            MimeType::Png => image::ImageFormat::Png,
            MimeType::Jpeg => image::ImageFormat::Jpeg,
        }
    }

    fn matches_magic(&self, bytes: &[u8]) -> bool {
        match self {
            MimeType::Png => bytes.starts_with(PNG_SIGNATURE),
            MimeType::Jpeg => bytes.starts_with(JPEG_SOI),
        }
    }
}

/// A validated upload. Lives from ingress until decode.
#[derive(Debug, Clone)]
pub struct ImageBlob {
    bytes: Vec<u8>,
    mime: MimeType,
    digest: String,
}

impl ImageBlob {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime(&self) -> MimeType {
        self.mime
    }

    /// Hex-encoded SHA-256 of the payload.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Validates uploads against the configured limits.
#[derive(Debug, Clone)]
pub struct ImageIngestor {
    max_bytes: usize,
}

impl Default for ImageIngestor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UPLOAD_BYTES)
    }
}

impl ImageIngestor {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Validate raw bytes and a declared MIME type. No side effects.
    pub fn ingest(&self, bytes: Vec<u8>, declared_mime: &str) -> Result<ImageBlob, DiagnosisError> {
        if bytes.is_empty() {
            return Err(DiagnosisError::Validation("upload is empty".to_string()));
        }
        if bytes.len() > self.max_bytes {
            return Err(DiagnosisError::Validation(format!(
                "upload is {} bytes, limit is {} bytes",
                bytes.len(),
                self.max_bytes
            )));
        }
        let mime = MimeType::parse(declared_mime).ok_or_else(|| {
            DiagnosisError::Validation(format!(
                "unsupported mime type '{declared_mime}' (expected image/png or image/jpeg)"
            ))
        })?;
        if !mime.matches_magic(&bytes) {
            return Err(DiagnosisError::Validation(format!(
                "payload content does not look like {}",
                mime.as_str()
            )));
        }

        let digest = hex(&Sha256::digest(&bytes));
        Ok(ImageBlob {
            bytes,
            mime,
            digest,
        })
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn png_bytes() -> Vec<u8> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend_from_slice(&[0u8; 32]);
        bytes
    }

    #[test]
    fn parse_accepts_common_spellings() {
        assert_eq!(MimeType::parse("image/png"), Some(MimeType::Png));
        assert_eq!(MimeType::parse("IMAGE/PNG"), Some(MimeType::Png));
        assert_eq!(MimeType::parse("image/jpeg; q=0.9"), Some(MimeType::Jpeg));
        assert_eq!(MimeType::parse("jpg"), Some(MimeType::Jpeg));
        assert_eq!(MimeType::parse("image/gif"), None);
        assert_eq!(MimeType::parse(""), None);
    }

    #[test]
    fn from_path_uses_extension() {
        let path = std::path::Path::new("/tmp/scan.JPG");
        assert_eq!(MimeType::from_path(path), Some(MimeType::Jpeg));
        assert_eq!(MimeType::from_path(std::path::Path::new("notes.txt")), None);
    }

    #[test]
    fn empty_upload_is_rejected() {
        let err = ImageIngestor::default().ingest(vec![], "image/png").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let ingestor = ImageIngestor::new(16);
        let err = ingestor.ingest(png_bytes(), "image/png").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(err.to_string().contains("limit"));
    }

    #[test]
    fn upload_at_exact_limit_is_accepted() {
        let bytes = png_bytes();
        let ingestor = ImageIngestor::new(bytes.len());
        assert!(ingestor.ingest(bytes, "image/png").is_ok());
    }

    #[test]
    fn unsupported_mime_is_rejected() {
        let err = ImageIngestor::default()
            .ingest(png_bytes(), "image/gif")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn content_must_match_declared_type() {
        let err = ImageIngestor::default()
            .ingest(png_bytes(), "image/jpeg")
            .unwrap_err();
        assert!(err.to_string().contains("image/jpeg"));
    }

    #[test]
    fn digest_is_sha256_hex() {
        let blob = ImageIngestor::default()
            .ingest(png_bytes(), "png")
            .unwrap();
        assert_eq!(blob.digest().len(), 64);
        assert!(blob.digest().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(blob.mime(), MimeType::Png);
        assert_eq!(blob.len(), 40);
    }
}
