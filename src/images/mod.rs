//! Decoding and validation of profile/cover image uploads.
//!
//! Uploads arrive either as a `data:` URL (what a browser `FileReader`
//! produces), as bare base64 with an explicit content type, or as an
//! external http(s) URL that is stored by reference.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

use crate::models::{ImageKind, ImageRecord, UploadImageRequest};

#[derive(Error, Debug, PartialEq)]
pub enum ImageError {
    #[error("Please select an image file")]
    NotAnImage,
    #[error("Image size should be less than {0}")]
    TooLarge(String),
    #[error("Image data is empty")]
    Empty,
    #[error("Image data is not valid base64")]
    InvalidBase64,
    #[error("Malformed data URL")]
    MalformedDataUrl,
    #[error("Image URL must be http or https")]
    InvalidUrl,
    #[error("Provide either image_data or image_url")]
    MissingSource,
}

/// Decoded upload, ready to persist
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Split `data:<mime>;base64,<payload>` and decode the payload
pub fn decode_data_url(input: &str) -> Result<DecodedImage, ImageError> {
    let rest = input.strip_prefix("data:").ok_or(ImageError::MalformedDataUrl)?;
    let (header, payload) = rest.split_once(',').ok_or(ImageError::MalformedDataUrl)?;
    let content_type = header
        .strip_suffix(";base64")
        .ok_or(ImageError::MalformedDataUrl)?;

    Ok(DecodedImage {
        content_type: normalize_content_type(content_type),
        data: decode_base64(payload)?,
    })
}

fn decode_base64(payload: &str) -> Result<Vec<u8>, ImageError> {
    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return Err(ImageError::Empty);
    }
    STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|_| ImageError::InvalidBase64)
}

fn normalize_content_type(content_type: &str) -> String {
    content_type.trim().to_ascii_lowercase()
}

fn check_content_type(content_type: &str) -> Result<(), ImageError> {
    if content_type.starts_with("image/") && content_type.len() > "image/".len() {
        Ok(())
    } else {
        Err(ImageError::NotAnImage)
    }
}

fn human_size(bytes: usize) -> String {
    if bytes >= 1024 * 1024 && bytes % (1024 * 1024) == 0 {
        format!("{}MB", bytes / (1024 * 1024))
    } else if bytes >= 1024 && bytes % 1024 == 0 {
        format!("{}KB", bytes / 1024)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Decode an upload payload and enforce the image rules
pub fn decode_upload(
    image_data: &str,
    content_type: Option<&str>,
    max_bytes: usize,
) -> Result<DecodedImage, ImageError> {
    let trimmed = image_data.trim();
    let decoded = if trimmed.starts_with("data:") {
        decode_data_url(trimmed)?
    } else {
        let content_type = content_type.ok_or(ImageError::NotAnImage)?;
        DecodedImage {
            content_type: normalize_content_type(content_type),
            data: decode_base64(trimmed)?,
        }
    };

    check_content_type(&decoded.content_type)?;
    if decoded.data.is_empty() {
        return Err(ImageError::Empty);
    }
    if decoded.data.len() > max_bytes {
        return Err(ImageError::TooLarge(human_size(max_bytes)));
    }
    Ok(decoded)
}

fn check_url(url: &str) -> Result<(), ImageError> {
    let lower = url.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"))
        .ok_or(ImageError::InvalidUrl)?;
    if rest.is_empty() || rest.chars().any(char::is_whitespace) {
        return Err(ImageError::InvalidUrl);
    }
    Ok(())
}

/// Turn an upload request into an unsaved record
pub fn build_record(req: &UploadImageRequest, max_bytes: usize) -> Result<ImageRecord, ImageError> {
    let file_name = req.file_name.trim().to_string();

    let (data, image_url, content_type) = match (&req.image_data, &req.image_url) {
        (Some(raw), _) if !raw.trim().is_empty() => {
            let decoded = decode_upload(raw, req.content_type.as_deref(), max_bytes)?;
            (decoded.data, None, decoded.content_type)
        }
        (_, Some(url)) if !url.trim().is_empty() => {
            let url = url.trim();
            check_url(url)?;
            let content_type = req
                .content_type
                .as_deref()
                .map(normalize_content_type)
                .filter(|ct| !ct.is_empty())
                .unwrap_or_else(|| guess_content_type(url).to_string());
            check_content_type(&content_type)?;
            (Vec::new(), Some(url.to_string()), content_type)
        }
        _ => return Err(ImageError::MissingSource),
    };

    let size = data.len() as i64;
    Ok(ImageRecord {
        id: String::new(),
        kind: req.kind,
        data,
        image_url,
        content_type,
        file_name: if file_name.is_empty() {
            default_file_name(req.kind)
        } else {
            file_name
        },
        size,
        uploaded_at: chrono::Utc::now(),
    })
}

fn default_file_name(kind: ImageKind) -> String {
    format!("{}-image", kind.as_str())
}

/// Best-effort content type from a URL's extension
fn guess_content_type(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    match path.rsplit('.').next() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_BYTES: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    fn png_data_url() -> String {
        format!("data:image/png;base64,{}", STANDARD.encode(PNG_BYTES))
    }

    fn request(kind: ImageKind) -> UploadImageRequest {
        UploadImageRequest {
            kind,
            image_data: None,
            content_type: None,
            image_url: None,
            file_name: String::new(),
        }
    }

    #[test]
    fn test_decode_data_url() {
        let decoded = decode_data_url(&png_data_url()).unwrap();
        assert_eq!(decoded.content_type, "image/png");
        assert_eq!(decoded.data, PNG_BYTES.to_vec());
    }

    #[test]
    fn test_malformed_data_urls() {
        assert_eq!(decode_data_url("data:image/png,abc"), Err(ImageError::MalformedDataUrl));
        assert_eq!(decode_data_url("image/png;base64,abc"), Err(ImageError::MalformedDataUrl));
        assert_eq!(decode_data_url("data:image/png;base64"), Err(ImageError::MalformedDataUrl));
    }

    #[test]
    fn test_rejects_non_images() {
        let text = format!("data:text/plain;base64,{}", STANDARD.encode(b"hello"));
        assert_eq!(decode_upload(&text, None, 1024), Err(ImageError::NotAnImage));

        let bare = STANDARD.encode(PNG_BYTES);
        assert_eq!(decode_upload(&bare, None, 1024), Err(ImageError::NotAnImage));
    }

    #[test]
    fn test_size_limit() {
        let big = vec![0u8; 2048];
        let url = format!("data:image/jpeg;base64,{}", STANDARD.encode(&big));

        assert!(decode_upload(&url, None, 2048).is_ok());
        assert_eq!(
            decode_upload(&url, None, 2047),
            Err(ImageError::TooLarge("2047 bytes".to_string()))
        );
        assert_eq!(
            ImageError::TooLarge(human_size(1024 * 1024)).to_string(),
            "Image size should be less than 1MB"
        );
    }

    #[test]
    fn test_bare_base64_with_content_type() {
        let bare = STANDARD.encode(PNG_BYTES);
        let decoded = decode_upload(&bare, Some("IMAGE/PNG"), 1024).unwrap();
        assert_eq!(decoded.content_type, "image/png");
        assert_eq!(decode_upload("!!!", Some("image/png"), 1024), Err(ImageError::InvalidBase64));
    }

    #[test]
    fn test_build_record_from_data() {
        let mut req = request(ImageKind::Cover);
        req.image_data = Some(png_data_url());
        req.file_name = " cover.png ".to_string();

        let record = build_record(&req, 1024).unwrap();
        assert_eq!(record.kind, ImageKind::Cover);
        assert_eq!(record.size, PNG_BYTES.len() as i64);
        assert_eq!(record.file_name, "cover.png");
        assert!(record.image_url.is_none());
    }

    #[test]
    fn test_build_record_from_url() {
        let mut req = request(ImageKind::Profile);
        req.image_url = Some("https://example.com/me.webp?x=1".to_string());

        let record = build_record(&req, 1024).unwrap();
        assert_eq!(record.content_type, "image/webp");
        assert_eq!(record.size, 0);
        assert_eq!(record.file_name, "profile-image");
        assert_eq!(record.source(), "https://example.com/me.webp?x=1");

        req.image_url = Some("ftp://example.com/me.png".to_string());
        assert_eq!(build_record(&req, 1024).unwrap_err(), ImageError::InvalidUrl);
    }

    #[test]
    fn test_url_content_type_is_normalized() {
        let mut req = request(ImageKind::Cover);
        req.image_url = Some("https://example.com/cover".to_string());
        req.content_type = Some(" IMAGE/PNG ".to_string());

        let record = build_record(&req, 1024).unwrap();
        assert_eq!(record.content_type, "image/png");

        req.content_type = Some("Text/Plain".to_string());
        assert_eq!(build_record(&req, 1024).unwrap_err(), ImageError::NotAnImage);
    }

    #[test]
    fn test_build_record_needs_a_source() {
        let req = request(ImageKind::Profile);
        assert_eq!(build_record(&req, 1024).unwrap_err(), ImageError::MissingSource);
    }
}
