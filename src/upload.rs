//! Attachment validation: filename sanitising, size limits and format checks
//! by extension and by content sniffing. Nothing here touches storage.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocumentFormat {
    Pdf,
    Image,
    Text,
}

pub const ALL_FORMATS: [DocumentFormat; 3] =
    [DocumentFormat::Pdf, DocumentFormat::Image, DocumentFormat::Text];

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Image => "image",
            DocumentFormat::Text => "text",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pdf" => Some(DocumentFormat::Pdf),
            "image" => Some(DocumentFormat::Image),
            "text" => Some(DocumentFormat::Text),
            _ => None,
        }
    }

    pub fn mime_types(&self) -> &'static [&'static str] {
        match self {
            DocumentFormat::Pdf => &["application/pdf"],
            DocumentFormat::Image => &["image/jpeg", "image/png", "image/gif"],
            DocumentFormat::Text => &["text/plain"],
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("invalid filename")]
    InvalidFilename,
    #[error("file is empty")]
    Empty,
    #[error("file too large (limit {limit} bytes)")]
    TooLarge { limit: usize },
    #[error("invalid file type")]
    InvalidType,
    #[error("unknown document format {0:?}")]
    UnknownFormat(String),
}

/// Parses a single format (`pdf`) or a comma-joined set (`pdf,image`).
/// The result is sorted and free of duplicates.
pub fn parse_formats(raw: &str) -> Result<Vec<DocumentFormat>, UploadError> {
    let mut formats = raw
        .split(',')
        .map(|part| {
            DocumentFormat::parse(part).ok_or_else(|| UploadError::UnknownFormat(part.trim().into()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    formats.sort();
    formats.dedup();
    Ok(formats)
}

pub fn formats_to_string(formats: &[DocumentFormat]) -> String {
    formats
        .iter()
        .map(DocumentFormat::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Reduces a client supplied filename to its final component.
///
/// Names carrying `..` segments, absolute paths, drive prefixes or control
/// characters are rejected outright; plain relative directories are dropped.
pub fn sanitize_filename(raw: &str) -> Result<String, UploadError> {
    let normalized = raw.replace('\\', "/");
    let trimmed = normalized.trim();

    if trimmed.is_empty()
        || trimmed.starts_with('/')
        || has_drive_prefix(trimmed)
        || trimmed.chars().any(char::is_control)
    {
        return Err(UploadError::InvalidFilename);
    }
    if trimmed.split('/').any(|segment| segment.trim() == "..") {
        return Err(UploadError::InvalidFilename);
    }

    let name = trimmed.rsplit('/').next().unwrap_or_default().trim();
    if name.is_empty() || name == "." || name.len() > 255 {
        return Err(UploadError::InvalidFilename);
    }
    Ok(name.to_string())
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Content type implied by the leading bytes, if recognisable.
pub fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n";

    if bytes.starts_with(b"%PDF-") {
        Some("application/pdf")
    } else if bytes.starts_with(PNG) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if !bytes.contains(&0) && std::str::from_utf8(bytes).is_ok() {
        Some("text/plain")
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct ValidatedFile {
    pub original_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Both the extension and the sniffed content must agree on a content type
/// that one of `allowed` accepts.
pub fn validate_file(
    raw_name: &str,
    bytes: Vec<u8>,
    allowed: &[DocumentFormat],
    max_bytes: usize,
) -> Result<ValidatedFile, UploadError> {
    let original_name = sanitize_filename(raw_name)?;

    if bytes.is_empty() {
        return Err(UploadError::Empty);
    }
    if bytes.len() > max_bytes {
        return Err(UploadError::TooLarge { limit: max_bytes });
    }

    let by_extension = mime_guess::from_path(&original_name)
        .first()
        .ok_or(UploadError::InvalidType)?;
    let by_extension = by_extension.essence_str();
    let sniffed = sniff_content_type(&bytes).ok_or(UploadError::InvalidType)?;

    if by_extension != sniffed {
        return Err(UploadError::InvalidType);
    }
    let permitted = allowed
        .iter()
        .any(|format| format.mime_types().contains(&sniffed));
    if !permitted {
        return Err(UploadError::InvalidType);
    }

    Ok(ValidatedFile {
        original_name,
        content_type: sniffed.to_string(),
        bytes,
    })
}

/// `inline` disposition header value carrying the original filename.
pub fn inline_content_disposition(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            _ => ch,
        })
        .collect();

    let encoded =
        percent_encoding::utf8_percent_encode(&sanitized, percent_encoding::NON_ALPHANUMERIC);
    format!("inline; filename=\"{}\"; filename*=UTF-8''{}", sanitized, encoded)
}
