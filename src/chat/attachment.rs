//! Attachment processing: images and documents into model-consumable content.

use std::io::Cursor;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, Rgb};
use serde::Serialize;
use tracing::{debug, warn};

use crate::chat::core::{
    AttachmentConfig, AttachmentError, ChatError, ChatResult, DocumentImage, EncodedImage,
    ExtractedDocument, ImageFailure,
};
use crate::chat::document::{
    ColorModel, DocumentExtractor, ImageEncoding, LopdfExtractor, RawDocument, RawImage,
};

/// Separator appended after each page's text.
pub const PAGE_SEPARATOR: &str = "\n\n";

/// Attachment family, chosen by declared MIME type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    /// `image/jpeg`, `image/jpg`, `image/png`.
    Image,
    /// `application/pdf`.
    Document,
}

impl AttachmentKind {
    /// Classify a declared MIME type. Parameters and case are ignored.
    #[must_use]
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "image/jpeg" | "image/jpg" | "image/png" => Some(Self::Image),
            "application/pdf" => Some(Self::Document),
            _ => None,
        }
    }
}

/// Uploaded bytes with their declared type.
#[derive(Clone, Debug)]
pub struct Upload {
    /// Raw file content.
    pub bytes: Vec<u8>,
    /// Declared MIME type.
    pub mime_type: String,
}

impl Upload {
    /// Decode a base64 payload. A leading `data:...;base64,` prefix is accepted.
    ///
    /// # Errors
    /// Returns an error if the payload is not valid base64.
    pub fn from_base64(mime_type: impl Into<String>, data: &str) -> Result<Self, AttachmentError> {
        let payload = data
            .split_once(";base64,")
            .map_or(data, |(_, rest)| rest)
            .trim();
        Ok(Self {
            bytes: STANDARD.decode(payload)?,
            mime_type: mime_type.into(),
        })
    }
}

/// Result of processing an upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessedAttachment {
    /// Re-encoded image.
    Image(EncodedImage),
    /// Extracted document.
    Document(ExtractedDocument),
}

/// What the user sees before sending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttachmentPreview {
    /// Image preview.
    Image {
        /// Pixel width.
        width: u32,
        /// Pixel height.
        height: u32,
        /// The image, ready to display.
        image: EncodedImage,
    },
    /// Document preview.
    Document {
        /// Leading text, with `...` appended when cut.
        excerpt: String,
        /// Total characters of extracted text.
        total_chars: usize,
        /// Number of decoded images.
        image_count: usize,
        /// First decoded image.
        first_image: Option<EncodedImage>,
        /// Images that could not be decoded.
        failures: Vec<ImageFailure>,
    },
}

/// Turns uploads into encoded images or extracted documents.
#[derive(Clone)]
pub struct AttachmentProcessor {
    config: AttachmentConfig,
    extractor: Arc<dyn DocumentExtractor>,
}

impl std::fmt::Debug for AttachmentProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentProcessor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AttachmentProcessor {
    /// Processor with a custom document extractor.
    #[must_use]
    pub fn new(config: AttachmentConfig, extractor: Arc<dyn DocumentExtractor>) -> Self {
        Self { config, extractor }
    }

    /// Processor backed by `lopdf`, spooling into `config.spool_dir`.
    #[must_use]
    pub fn with_lopdf(config: AttachmentConfig) -> Self {
        let extractor = Arc::new(
            LopdfExtractor::new(config.spool_dir.clone())
                .with_max_image_bytes(config.max_image_bytes),
        );
        Self::new(config, extractor)
    }

    /// Attachment settings.
    #[must_use]
    pub const fn config(&self) -> &AttachmentConfig {
        &self.config
    }

    /// Check size and declared type without decoding anything.
    ///
    /// # Errors
    /// `UploadTooLarge` or `UnsupportedMediaType`.
    pub fn classify(&self, upload: &Upload) -> ChatResult<AttachmentKind> {
        let limit = self.config.max_upload_bytes;
        if upload.bytes.len() > limit {
            return Err(ChatError::UploadTooLarge {
                size: upload.bytes.len(),
                limit,
            });
        }
        AttachmentKind::from_mime(&upload.mime_type)
            .ok_or_else(|| ChatError::UnsupportedMediaType(upload.mime_type.clone()))
    }

    /// Decode an upload. Blocking; run it off the async executor.
    ///
    /// # Errors
    /// Returns an error if the upload is rejected or cannot be decoded.
    /// Individual document images that fail are recorded, not raised.
    pub fn process(&self, upload: &Upload) -> ChatResult<ProcessedAttachment> {
        match self.classify(upload)? {
            AttachmentKind::Image => Ok(ProcessedAttachment::Image(encode_image(&upload.bytes)?)),
            AttachmentKind::Document => {
                let raw = self.extractor.extract(&upload.bytes)?;
                Ok(ProcessedAttachment::Document(decode_document(raw)))
            }
        }
    }

    /// Build a preview without touching any session.
    ///
    /// # Errors
    /// Same as [`AttachmentProcessor::process`].
    pub fn preview(&self, upload: &Upload) -> ChatResult<AttachmentPreview> {
        Ok(match self.process(upload)? {
            ProcessedAttachment::Image(image) => AttachmentPreview::Image {
                width: image.width,
                height: image.height,
                image,
            },
            ProcessedAttachment::Document(document) => {
                let total_chars = document.text.chars().count();
                let mut excerpt: String =
                    document.text.chars().take(self.config.preview_chars).collect();
                if total_chars > self.config.preview_chars {
                    excerpt.push_str("...");
                }
                AttachmentPreview::Document {
                    excerpt,
                    total_chars,
                    image_count: document.images.len(),
                    first_image: document.images.first().map(|d| d.image.clone()),
                    failures: document.failures,
                }
            }
        })
    }
}

/// Decode image bytes and re-encode them as base64 PNG.
///
/// # Errors
/// Returns an error if the bytes are not a decodable image.
pub fn encode_image(bytes: &[u8]) -> Result<EncodedImage, AttachmentError> {
    let decoded = image::load_from_memory(bytes)?;
    encode_png(&decoded)
}

fn encode_png(image: &DynamicImage) -> Result<EncodedImage, AttachmentError> {
    let mut png = Cursor::new(Vec::new());
    image.write_to(&mut png, ImageFormat::Png)?;
    Ok(EncodedImage {
        width: image.width(),
        height: image.height(),
        png_base64: STANDARD.encode(png.into_inner()),
    })
}

/// Join page texts, each followed by [`PAGE_SEPARATOR`].
#[must_use]
pub fn assemble_text(pages: &[String]) -> String {
    let mut text = String::with_capacity(pages.iter().map(|p| p.len() + PAGE_SEPARATOR.len()).sum());
    for page in pages {
        text.push_str(page);
        text.push_str(PAGE_SEPARATOR);
    }
    text
}

/// Decode every embedded image independently; failures are recorded and skipped.
#[must_use]
pub fn decode_document(raw: RawDocument) -> ExtractedDocument {
    let mut document = ExtractedDocument {
        text: assemble_text(&raw.pages),
        ..ExtractedDocument::default()
    };

    for image in &raw.images {
        match decode_raw_image(image).and_then(|decoded| encode_png(&decoded)) {
            Ok(encoded) => document.images.push(DocumentImage {
                page: image.page,
                index: image.index,
                image: encoded,
            }),
            Err(err) => {
                warn!(
                    page = image.page,
                    index = image.index,
                    "skipping embedded image: {err}"
                );
                document.failures.push(ImageFailure {
                    page: image.page,
                    index: image.index,
                    reason: err.to_string(),
                });
            }
        }
    }

    debug!(
        chars = document.text.len(),
        images = document.images.len(),
        failures = document.failures.len(),
        "document decoded"
    );
    document
}

fn decode_raw_image(raw: &RawImage) -> Result<DynamicImage, AttachmentError> {
    match &raw.encoding {
        ImageEncoding::Jpeg => Ok(image::load_from_memory_with_format(
            &raw.bytes,
            ImageFormat::Jpeg,
        )?),
        ImageEncoding::Bitmap { color, bits: 8 } => decode_bitmap(raw, color),
        ImageEncoding::Bitmap { color, bits } => Err(AttachmentError::UnsupportedEncoding(
            format!("{bits}-bit {color:?} bitmap"),
        )),
        ImageEncoding::Unreadable(reason) => {
            Err(AttachmentError::UnsupportedEncoding(reason.clone()))
        }
    }
}

fn decode_bitmap(raw: &RawImage, color: &ColorModel) -> Result<DynamicImage, AttachmentError> {
    let (width, height) = (raw.width, raw.height);
    let components = match color {
        ColorModel::Other(name) => {
            return Err(AttachmentError::UnsupportedEncoding(format!(
                "colour space {name}"
            )));
        }
        known => known.components().unwrap_or(1),
    };
    let len = u64::from(width)
        .checked_mul(u64::from(height))
        .and_then(|pixels| pixels.checked_mul(u64::from(components)))
        .and_then(|len| usize::try_from(len).ok())
        .ok_or_else(|| AttachmentError::UnsupportedEncoding("image too large".to_string()))?;
    let data = samples(&raw.bytes, len)?;

    let decoded = match color {
        ColorModel::Gray => {
            ImageBuffer::<Luma<u8>, _>::from_raw(width, height, data).map(DynamicImage::ImageLuma8)
        }
        ColorModel::Cmyk => ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, cmyk_to_rgb(&data))
            .map(DynamicImage::ImageRgb8),
        ColorModel::Rgb | ColorModel::Other(_) => {
            ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, data).map(DynamicImage::ImageRgb8)
        }
    };
    decoded.ok_or_else(|| AttachmentError::UnsupportedEncoding("bitmap size mismatch".to_string()))
}

fn samples(bytes: &[u8], len: usize) -> Result<Vec<u8>, AttachmentError> {
    bytes.get(..len).map(<[u8]>::to_vec).ok_or_else(|| {
        AttachmentError::UnsupportedEncoding(format!(
            "expected {len} bytes of samples, found {}",
            bytes.len()
        ))
    })
}

fn cmyk_to_rgb(cmyk: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(cmyk.len() / 4 * 3);
    for px in cmyk.chunks_exact(4) {
        let k = 255 - u16::from(px[3]);
        for &c in &px[..3] {
            let value = (255 - u16::from(c)) * k / 255;
            rgb.push(u8::try_from(value).unwrap_or(u8::MAX));
        }
    }
    rgb
}

/// Solid-colour PNG for tests.
#[cfg(test)]
pub(crate) fn png_fixture(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_pixel(width, height, Rgb([10u8, 20, 30]));
    let mut out = Cursor::new(Vec::new());
    let _ = DynamicImage::ImageRgb8(img).write_to(&mut out, ImageFormat::Png);
    out.into_inner()
}
