//! Document extraction: page text and embedded image records.
//!
//! The extractor only locates data. Decoding embedded images is left to the
//! attachment processor so that one bad image never aborts the document.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::PathBuf;

use flate2::read::ZlibDecoder;

use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::chat::core::AttachmentError;

/// Nesting limit when following `Parent` links, references and forms.
const MAX_INDIRECTION: usize = 32;

/// Default cap on the decoded samples of one embedded image.
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 64 * 1024 * 1024;

/// Inflated data may exceed the declared sample length by this much.
const INFLATE_SLACK: usize = 4096;

/// Colour model of a raw bitmap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColorModel {
    /// One component.
    Gray,
    /// Three components.
    Rgb,
    /// Four components.
    Cmyk,
    /// Anything else (indexed, Lab, separation...).
    Other(String),
}

impl ColorModel {
    /// Samples per pixel, unknown for `Other`.
    #[must_use]
    pub const fn components(&self) -> Option<u32> {
        match self {
            Self::Gray => Some(1),
            Self::Rgb => Some(3),
            Self::Cmyk => Some(4),
            Self::Other(_) => None,
        }
    }
}

/// How the bytes of an embedded image are encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageEncoding {
    /// JPEG file data.
    Jpeg,
    /// Uncompressed samples.
    Bitmap {
        /// Colour model.
        color: ColorModel,
        /// Bits per component.
        bits: u8,
    },
    /// Data the extractor could not make sense of.
    Unreadable(String),
}

/// One embedded image as found in the document.
#[derive(Clone, Debug)]
pub struct RawImage {
    /// 1-based page number.
    pub page: u32,
    /// Position on the page.
    pub index: usize,
    /// Declared width.
    pub width: u32,
    /// Declared height.
    pub height: u32,
    /// Encoding of `bytes`.
    pub encoding: ImageEncoding,
    /// Image data.
    pub bytes: Vec<u8>,
}

/// Extraction output before image decoding.
#[derive(Clone, Debug, Default)]
pub struct RawDocument {
    /// Text of each page in page order.
    pub pages: Vec<String>,
    /// Embedded images in document order.
    pub images: Vec<RawImage>,
}

/// Source of document text and images.
pub trait DocumentExtractor: Send + Sync {
    /// Extract pages and embedded images from document bytes.
    ///
    /// # Errors
    /// Returns an error if the document cannot be opened at all.
    fn extract(&self, bytes: &[u8]) -> Result<RawDocument, AttachmentError>;
}

/// PDF extractor backed by `lopdf`.
///
/// The upload is spooled to a temporary file that is removed when extraction
/// returns, whatever the outcome.
#[derive(Clone, Debug)]
pub struct LopdfExtractor {
    spool_dir: Option<PathBuf>,
    max_image_bytes: usize,
}

impl Default for LopdfExtractor {
    fn default() -> Self {
        Self::new(None)
    }
}

impl LopdfExtractor {
    /// Spool into `spool_dir`, or the system temp dir when `None`.
    #[must_use]
    pub const fn new(spool_dir: Option<PathBuf>) -> Self {
        Self {
            spool_dir,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }

    /// Images whose decoded samples would exceed `max` bytes are not decompressed.
    #[must_use]
    pub const fn with_max_image_bytes(mut self, max: usize) -> Self {
        self.max_image_bytes = max;
        self
    }

    fn spool(&self, bytes: &[u8]) -> Result<NamedTempFile, AttachmentError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("chat-relay-").suffix(".pdf");
        let mut file = match &self.spool_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(bytes)?;
        file.flush()?;
        Ok(file)
    }
}

impl DocumentExtractor for LopdfExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<RawDocument, AttachmentError> {
        let spooled = self.spool(bytes)?;
        let document = Document::load(spooled.path())?;
        let raw = read_document(&document, self.max_image_bytes);
        debug!(
            pages = raw.pages.len(),
            images = raw.images.len(),
            "document extracted"
        );
        Ok(raw)
    }
}

fn read_document(document: &Document, max_image_bytes: usize) -> RawDocument {
    let mut raw = RawDocument::default();
    for (page_no, page_id) in document.get_pages() {
        let text = match document.extract_text(&[page_no]) {
            Ok(text) => text,
            Err(err) => {
                warn!(page = page_no, "page text unavailable: {err}");
                String::new()
            }
        };
        raw.pages.push(text);

        let mut collector = ImageCollector {
            document,
            page: page_no,
            max_image_bytes,
            seen: HashSet::new(),
            images: Vec::new(),
        };
        if let Some(resources) = page_resources(document, page_id) {
            collector.visit(resources, 0);
        }
        raw.images.extend(collector.images);
    }
    raw
}

/// Walks the image XObjects of one page, descending into form XObjects.
struct ImageCollector<'d> {
    document: &'d Document,
    page: u32,
    max_image_bytes: usize,
    seen: HashSet<ObjectId>,
    images: Vec<RawImage>,
}

impl<'d> ImageCollector<'d> {
    fn visit(&mut self, resources: &'d Dictionary, depth: usize) {
        if depth > MAX_INDIRECTION {
            warn!(page = self.page, "form XObjects nested too deep");
            return;
        }
        let Some(xobjects) = resources
            .get(b"XObject")
            .ok()
            .and_then(|o| resolve(self.document, o))
            .and_then(as_dict)
        else {
            return;
        };

        for (_, entry) in xobjects.iter() {
            if let Object::Reference(id) = entry {
                if !self.seen.insert(*id) {
                    continue;
                }
            }
            let Some(Object::Stream(stream)) = resolve(self.document, entry) else {
                continue;
            };
            match name_of(stream.dict.get(b"Subtype").ok()) {
                Some(b"Image") => {
                    let index = self.images.len();
                    let image =
                        raw_image(self.document, self.page, index, stream, self.max_image_bytes);
                    self.images.push(image);
                }
                Some(b"Form") => {
                    let inner = stream
                        .dict
                        .get(b"Resources")
                        .ok()
                        .and_then(|o| resolve(self.document, o))
                        .and_then(as_dict);
                    if let Some(inner) = inner {
                        self.visit(inner, depth + 1);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Resources of a page, inherited from the page tree when absent.
fn page_resources(document: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    let mut node = document.get_object(page_id).ok()?;
    for _ in 0..MAX_INDIRECTION {
        let dict = as_dict(node)?;
        if let Ok(resources) = dict.get(b"Resources") {
            return resolve(document, resources).and_then(as_dict);
        }
        node = resolve(document, dict.get(b"Parent").ok()?)?;
    }
    None
}

fn raw_image(
    document: &Document,
    page: u32,
    index: usize,
    stream: &Stream,
    max_image_bytes: usize,
) -> RawImage {
    let dict = &stream.dict;
    let width = integer(document, dict, b"Width").unwrap_or(0);
    let height = integer(document, dict, b"Height").unwrap_or(0);
    let image_mask = matches!(dict.get(b"ImageMask"), Ok(Object::Boolean(true)));
    let bits = if image_mask {
        1
    } else {
        integer(document, dict, b"BitsPerComponent")
            .and_then(|b| u8::try_from(b).ok())
            .unwrap_or(8)
    };
    let color = if image_mask {
        ColorModel::Gray
    } else {
        color_model(document, dict)
    };

    let filters = filters(document, dict);
    let (encoding, bytes) = match filters.last().map(Vec::as_slice) {
        _ if width == 0 || height == 0 => (
            ImageEncoding::Unreadable("missing dimensions".to_string()),
            Vec::new(),
        ),
        Some(b"DCTDecode") if filters.len() == 1 => (ImageEncoding::Jpeg, stream.content.clone()),
        Some(name @ (b"DCTDecode" | b"JPXDecode" | b"CCITTFaxDecode" | b"JBIG2Decode")) => (
            ImageEncoding::Unreadable(format!(
                "{} not supported",
                String::from_utf8_lossy(name)
            )),
            Vec::new(),
        ),
        None => (ImageEncoding::Bitmap { color, bits }, stream.content.clone()),
        // Unknown colour spaces fail at decode time; no need to inflate them.
        Some(_) if color.components().is_none() => {
            (ImageEncoding::Bitmap { color, bits }, Vec::new())
        }
        Some(_) => match sample_len(width, height, &color, bits) {
            Some(expected) if expected <= max_image_bytes => {
                match decompress(stream, &filters, expected) {
                    Ok(data) => (ImageEncoding::Bitmap { color, bits }, data),
                    Err(reason) => (ImageEncoding::Unreadable(reason), Vec::new()),
                }
            }
            _ => (
                ImageEncoding::Unreadable(format!("image too large: {width}x{height}")),
                Vec::new(),
            ),
        },
    };

    RawImage {
        page,
        index,
        width,
        height,
        encoding,
        bytes,
    }
}

/// Byte length of the decoded samples, each row padded to a whole byte.
fn sample_len(width: u32, height: u32, color: &ColorModel, bits: u8) -> Option<usize> {
    let row_bits = u64::from(width)
        .checked_mul(u64::from(color.components()?))?
        .checked_mul(u64::from(bits))?;
    let total = row_bits.div_ceil(8).checked_mul(u64::from(height))?;
    usize::try_from(total).ok()
}

/// Inflate image samples, refusing output much longer than `expected`.
fn decompress(stream: &Stream, filters: &[Vec<u8>], expected: usize) -> Result<Vec<u8>, String> {
    let limit = expected
        .saturating_add(expected / 4)
        .saturating_add(INFLATE_SLACK);
    let plain_flate = matches!(filters, [only] if only == b"FlateDecode")
        && stream.dict.get(b"DecodeParms").is_err();

    let data = if plain_flate {
        let mut data = Vec::new();
        ZlibDecoder::new(stream.content.as_slice())
            .take(u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1))
            .read_to_end(&mut data)
            .map_err(|e| format!("cannot decompress: {e}"))?;
        data
    } else {
        stream
            .decompressed_content()
            .map_err(|e| format!("cannot decompress: {e}"))?
    };

    if data.len() > limit {
        return Err(format!(
            "decompressed data exceeds the declared {expected} bytes"
        ));
    }
    Ok(data)
}

fn color_model(document: &Document, dict: &Dictionary) -> ColorModel {
    let Some(space) = dict.get(b"ColorSpace").ok().and_then(|o| resolve(document, o)) else {
        return ColorModel::Other("unspecified".to_string());
    };
    match space {
        Object::Name(name) => named_color_model(name),
        Object::Array(items) => {
            let family = name_of(items.first().and_then(|o| resolve(document, o)));
            match family {
                Some(b"ICCBased") => {
                    let components = items
                        .get(1)
                        .and_then(|o| resolve(document, o))
                        .and_then(as_dict)
                        .and_then(|d| integer(document, d, b"N"));
                    match components {
                        Some(1) => ColorModel::Gray,
                        Some(3) => ColorModel::Rgb,
                        Some(4) => ColorModel::Cmyk,
                        other => ColorModel::Other(format!("ICCBased with {other:?} components")),
                    }
                }
                Some(name) => named_color_model(name),
                None => ColorModel::Other("malformed colour space".to_string()),
            }
        }
        _ => ColorModel::Other("malformed colour space".to_string()),
    }
}

fn named_color_model(name: &[u8]) -> ColorModel {
    match name {
        b"DeviceGray" | b"CalGray" | b"G" => ColorModel::Gray,
        b"DeviceRGB" | b"CalRGB" | b"RGB" => ColorModel::Rgb,
        b"DeviceCMYK" | b"CMYK" => ColorModel::Cmyk,
        other => ColorModel::Other(String::from_utf8_lossy(other).into_owned()),
    }
}

fn filters(document: &Document, dict: &Dictionary) -> Vec<Vec<u8>> {
    match dict.get(b"Filter").ok().and_then(|o| resolve(document, o)) {
        Some(Object::Name(name)) => vec![name.clone()],
        Some(Object::Array(items)) => items
            .iter()
            .filter_map(|o| name_of(resolve(document, o)).map(<[u8]>::to_vec))
            .collect(),
        _ => Vec::new(),
    }
}

fn resolve<'d>(document: &'d Document, object: &'d Object) -> Option<&'d Object> {
    let mut current = object;
    for _ in 0..MAX_INDIRECTION {
        match current {
            Object::Reference(id) => current = document.get_object(*id).ok()?,
            other => return Some(other),
        }
    }
    None
}

const fn as_dict(object: &Object) -> Option<&Dictionary> {
    match object {
        Object::Dictionary(dict) => Some(dict),
        Object::Stream(stream) => Some(&stream.dict),
        _ => None,
    }
}

fn name_of(object: Option<&Object>) -> Option<&[u8]> {
    match object {
        Some(Object::Name(name)) => Some(name.as_slice()),
        _ => None,
    }
}

fn integer(document: &Document, dict: &Dictionary, key: &[u8]) -> Option<u32> {
    match dict.get(key).ok().and_then(|o| resolve(document, o)) {
        Some(Object::Integer(value)) => u32::try_from(*value).ok(),
        _ => None,
    }
}

#[cfg(test)]
pub mod testing {
    //! Minimal PDF builder for tests.

    use std::io::Write;

    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use lopdf::content::{Content, Operation};
    use lopdf::{Dictionary, Document, Object, Stream, dictionary};

    /// Build a PDF with one page per text. Images are attached to the first page.
    pub fn sample_pdf(pages: &[&str], images: Vec<Stream>) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let has_images = !images.is_empty();
        let mut xobjects = Dictionary::new();
        for (i, image) in images.into_iter().enumerate() {
            let image_id = doc.add_object(image);
            xobjects.set(format!("Im{i}"), image_id);
        }
        finish(doc, pages, has_images.then_some(xobjects))
    }

    /// One page whose images are only reachable through a form XObject.
    /// The form also lists itself.
    pub fn form_pdf(text: &str, images: Vec<Stream>) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let form_id = doc.new_object_id();
        let mut inner = Dictionary::new();
        for (i, image) in images.into_iter().enumerate() {
            let image_id = doc.add_object(image);
            inner.set(format!("Im{i}"), image_id);
        }
        inner.set("Fm0", form_id);
        let form = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Form",
                "BBox" => vec![0.into(), 0.into(), 10.into(), 10.into()],
                "Resources" => dictionary! { "XObject" => inner },
            },
            b"/Im0 Do".to_vec(),
        );
        doc.objects.insert(form_id, Object::Stream(form));

        let mut outer = Dictionary::new();
        outer.set("Fm0", form_id);
        finish(doc, &[text], Some(outer))
    }

    fn finish(mut doc: Document, pages: &[&str], first_page_xobjects: Option<Dictionary>) -> Vec<u8> {
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
            "Encoding" => "WinAnsiEncoding",
        });
        let shared_resources = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for (i, text) in pages.iter().enumerate() {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 700.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let mut page = dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            };
            if let (0, Some(xobjects)) = (i, &first_page_xobjects) {
                page.set(
                    "Resources",
                    dictionary! {
                        "Font" => dictionary! { "F1" => font_id },
                        "XObject" => xobjects.clone(),
                    },
                );
            }
            kids.push(doc.add_object(page).into());
        }

        let count = i64::try_from(kids.len()).unwrap();
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "Resources" => shared_resources,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    /// Uncompressed 8-bit RGB image stream.
    pub fn rgb_image(width: i64, height: i64, pixels: Vec<u8>) -> Stream {
        Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width,
                "Height" => height,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            pixels,
        )
    }

    /// 8-bit RGB image stream, zlib-compressed.
    pub fn flate_image(width: i64, height: i64, samples: &[u8]) -> Stream {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(samples).unwrap();
        Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width,
                "Height" => height,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "FlateDecode",
            },
            encoder.finish().unwrap(),
        )
    }

    /// Image stream declaring an arbitrary filter.
    pub fn filtered_image(filter: &str, bytes: Vec<u8>) -> Stream {
        Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 4,
                "Height" => 4,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => filter,
            },
            bytes,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{filtered_image, flate_image, form_pdf, rgb_image, sample_pdf};
    use super::*;

    fn spool_entries(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_pages_in_order() {
        let bytes = sample_pdf(&["First page", "Second page"], Vec::new());
        let raw = LopdfExtractor::default().extract(&bytes).unwrap();
        assert_eq!(raw.pages.len(), 2);
        assert!(raw.pages[0].contains("First"));
        assert!(raw.pages[1].contains("Second"));
        assert!(raw.images.is_empty());
    }

    #[test]
    fn test_image_records() {
        let bytes = sample_pdf(
            &["Figures"],
            vec![
                rgb_image(2, 2, vec![200; 12]),
                filtered_image("JPXDecode", vec![0; 8]),
                filtered_image("DCTDecode", vec![0xFF, 0xD8, 0x00]),
            ],
        );
        let raw = LopdfExtractor::default().extract(&bytes).unwrap();
        assert_eq!(raw.images.len(), 3);

        let first = &raw.images[0];
        assert_eq!((first.page, first.index, first.width, first.height), (1, 0, 2, 2));
        assert_eq!(
            first.encoding,
            ImageEncoding::Bitmap {
                color: ColorModel::Rgb,
                bits: 8
            }
        );
        assert_eq!(first.bytes.len(), 12);

        assert!(matches!(raw.images[1].encoding, ImageEncoding::Unreadable(_)));
        assert_eq!(raw.images[2].encoding, ImageEncoding::Jpeg);
        assert_eq!(raw.images[2].index, 2);
    }

    #[test]
    fn test_images_inside_forms_are_collected() {
        let bytes = form_pdf("Diagram", vec![rgb_image(1, 1, vec![10, 20, 30])]);
        let raw = LopdfExtractor::default().extract(&bytes).unwrap();
        assert_eq!(raw.images.len(), 1);
        let image = &raw.images[0];
        assert_eq!((image.page, image.index, image.width, image.height), (1, 0, 1, 1));
        assert_eq!(image.bytes, vec![10, 20, 30]);
    }

    #[test]
    fn test_flate_output_is_bounded_by_declared_size() {
        let honest = flate_image(2, 2, &[7; 12]);
        let inflated = flate_image(4, 4, &vec![0; 1024 * 1024]);
        let bytes = sample_pdf(&["Charts"], vec![honest, inflated]);
        let raw = LopdfExtractor::default().extract(&bytes).unwrap();
        assert_eq!(raw.images.len(), 2);

        assert_eq!(
            raw.images[0].encoding,
            ImageEncoding::Bitmap {
                color: ColorModel::Rgb,
                bits: 8
            }
        );
        assert_eq!(raw.images[0].bytes, vec![7; 12]);

        assert!(matches!(
            &raw.images[1].encoding,
            ImageEncoding::Unreadable(reason) if reason.contains("exceeds")
        ));
        assert!(raw.images[1].bytes.is_empty());
    }

    #[test]
    fn test_images_over_the_cap_are_not_inflated() {
        let bytes = sample_pdf(&["Photo"], vec![flate_image(4, 4, &[1; 48])]);
        let raw = LopdfExtractor::default()
            .with_max_image_bytes(16)
            .extract(&bytes)
            .unwrap();
        assert!(matches!(
            &raw.images[0].encoding,
            ImageEncoding::Unreadable(reason) if reason.starts_with("image too large")
        ));
    }

    #[test]
    fn test_sample_len() {
        assert_eq!(sample_len(2, 2, &ColorModel::Rgb, 8), Some(12));
        assert_eq!(sample_len(3, 2, &ColorModel::Gray, 1), Some(2));
        assert_eq!(sample_len(u32::MAX, u32::MAX, &ColorModel::Cmyk, 16), None);
        assert_eq!(sample_len(1, 1, &ColorModel::Other("Lab".to_string()), 8), None);
    }

    #[test]
    fn test_spool_file_removed_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = LopdfExtractor::new(Some(dir.path().to_path_buf()));
        let bytes = sample_pdf(&["hello"], Vec::new());
        extractor.extract(&bytes).unwrap();
        assert_eq!(spool_entries(dir.path()), 0);
    }

    #[test]
    fn test_spool_file_removed_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = LopdfExtractor::new(Some(dir.path().to_path_buf()));
        let err = extractor.extract(b"definitely not a pdf");
        assert!(matches!(err, Err(AttachmentError::DocumentOpen(_))));
        assert_eq!(spool_entries(dir.path()), 0);
    }

    #[test]
    fn test_named_color_models() {
        assert_eq!(named_color_model(b"DeviceGray"), ColorModel::Gray);
        assert_eq!(named_color_model(b"DeviceRGB"), ColorModel::Rgb);
        assert_eq!(named_color_model(b"DeviceCMYK"), ColorModel::Cmyk);
        assert_eq!(
            named_color_model(b"Indexed"),
            ColorModel::Other("Indexed".to_string())
        );
    }
}
