//! Image payload sniffing
//!
//! A fetched payload is only admitted to the cache when its leading bytes
//! identify a known image container.

use std::fmt;

use serde::Serialize;

/// Image container recognised from magic bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    WebP,
    Bmp,
    Heif,
    Avif,
}

const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];

const HEIF_BRANDS: &[&[u8; 4]] = &[b"heic", b"heix", b"hevc", b"hevx", b"mif1", b"msf1"];
const AVIF_BRANDS: &[&[u8; 4]] = &[b"avif", b"avis"];

impl ImageFormat {
    /// Identify the container from the first bytes of a payload
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(PNG_MAGIC) {
            return Some(ImageFormat::Png);
        }
        if bytes.starts_with(JPEG_MAGIC) {
            return Some(ImageFormat::Jpeg);
        }
        if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            return Some(ImageFormat::Gif);
        }
        if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            return Some(ImageFormat::WebP);
        }
        if bytes.len() >= 14 && bytes.starts_with(b"BM") {
            return Some(ImageFormat::Bmp);
        }
        if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
            let brand = &bytes[8..12];
            if AVIF_BRANDS.iter().any(|b| b.as_slice() == brand) {
                return Some(ImageFormat::Avif);
            }
            if HEIF_BRANDS.iter().any(|b| b.as_slice() == brand) {
                return Some(ImageFormat::Heif);
            }
        }
        None
    }

    /// MIME type for the container
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::WebP => "image/webp",
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::Heif => "image/heif",
            ImageFormat::Avif => "image/avif",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime_type())
    }
}

/// Check that a payload is a usable image, returning the reason when not
pub fn validate_payload(bytes: &[u8]) -> std::result::Result<ImageFormat, String> {
    if bytes.is_empty() {
        return Err("empty payload".to_string());
    }
    ImageFormat::sniff(bytes).ok_or_else(|| {
        let head = &bytes[..bytes.len().min(8)];
        format!("unrecognised image signature {}", hex::encode(head))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_common_formats() {
        assert_eq!(
            ImageFormat::sniff(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"),
            Some(ImageFormat::Png)
        );
        assert_eq!(ImageFormat::sniff(b"\xff\xd8\xff\xe0\0\x10JFIF"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::sniff(b"GIF89a\x01\0\x01\0"), Some(ImageFormat::Gif));
        assert_eq!(ImageFormat::sniff(b"RIFF\x24\0\0\0WEBPVP8 "), Some(ImageFormat::WebP));
        assert_eq!(
            ImageFormat::sniff(b"\0\0\0\x1cftypavif\0\0\0\0"),
            Some(ImageFormat::Avif)
        );
        assert_eq!(
            ImageFormat::sniff(b"\0\0\0\x18ftypheic\0\0\0\0"),
            Some(ImageFormat::Heif)
        );
    }

    #[test]
    fn test_sniff_rejects_non_images() {
        assert_eq!(ImageFormat::sniff(b"<html><body>404</body></html>"), None);
        assert_eq!(ImageFormat::sniff(b"\0\0\0\x18ftypmp42\0\0\0\0"), None);
        assert_eq!(ImageFormat::sniff(b"RIFF\x24\0\0\0WAVEfmt "), None);
        assert_eq!(ImageFormat::sniff(b""), None);
    }

    #[test]
    fn test_validate_payload() {
        assert_eq!(validate_payload(b"").unwrap_err(), "empty payload");
        let err = validate_payload(b"not an image").unwrap_err();
        assert!(err.contains("6e6f7420616e2069"));
        assert_eq!(validate_payload(PNG_MAGIC), Ok(ImageFormat::Png));
    }
}
