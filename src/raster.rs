//! Page rasterization.
//!
//! Turns a source file into an ordered list of RGB pages. The source kind is resolved once from
//! the file extension; PDFs are read with `lopdf` and each page is rendered from the raster image
//! it carries (scanned statements, photographed payslips). Pages that cannot be decoded are kept
//! in the list as page-scoped failures so sibling pages still get scored.

use image::imageops::FilterType;
use image::{ImageFormat, RgbImage};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{ForensicError, Result};

/// US Letter in points, used when a page has no MediaBox anywhere in its tree.
const DEFAULT_MEDIA_BOX: [f64; 4] = [0.0, 0.0, 612.0, 792.0];
const POINTS_PER_INCH: f64 = 72.0;
/// Upper bound on either side of a rendered page.
const MAX_PAGE_SIDE: u32 = 20_000;
/// Guards against cyclic `Parent` chains.
const MAX_TREE_DEPTH: usize = 32;

/// Input kind, resolved once at rasterization entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    Image(ImageFormat),
}

impl SourceKind {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let kind = match ext.as_str() {
            "pdf" => SourceKind::Pdf,
            "png" => SourceKind::Image(ImageFormat::Png),
            "jpg" | "jpeg" => SourceKind::Image(ImageFormat::Jpeg),
            "bmp" => SourceKind::Image(ImageFormat::Bmp),
            "gif" => SourceKind::Image(ImageFormat::Gif),
            "tif" | "tiff" => SourceKind::Image(ImageFormat::Tiff),
            "webp" => SourceKind::Image(ImageFormat::WebP),
            _ => {
                return Err(ForensicError::UnsupportedFormat(format!(
                    "{} (extension '{}')",
                    path.display(),
                    ext
                )))
            }
        };
        Ok(kind)
    }
}

/// One rasterized page. Immutable once built.
#[derive(Debug, Clone)]
pub struct Page {
    index: u32,
    image: RgbImage,
}

impl Page {
    pub fn new(index: u32, image: RgbImage) -> Self {
        Self { index, image }
    }

    /// 1-based position within the document.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

/// A page that could not be rasterized.
#[derive(Debug)]
pub struct PageFailure {
    pub index: u32,
    pub error: ForensicError,
}

pub type PageSlot = std::result::Result<Page, PageFailure>;

/// Rasterize a file on disk.
pub fn rasterize(path: &Path, dpi: u32) -> Result<Vec<PageSlot>> {
    let kind = SourceKind::from_path(path)?;
    let bytes = std::fs::read(path)
        .map_err(|e| ForensicError::DecodeError(format!("{}: {}", path.display(), e)))?;
    rasterize_bytes(kind, &bytes, dpi)
}

/// Rasterize already-loaded source bytes.
pub fn rasterize_bytes(kind: SourceKind, bytes: &[u8], dpi: u32) -> Result<Vec<PageSlot>> {
    match kind {
        SourceKind::Pdf => rasterize_pdf(bytes, dpi),
        SourceKind::Image(format) => {
            let img = image::load_from_memory_with_format(bytes, format).map_err(|e| {
                ForensicError::DecodeError(format!("{:?} image: {}", format, e))
            })?;
            Ok(vec![Ok(Page::new(1, img.to_rgb8()))])
        }
    }
}

fn rasterize_pdf(bytes: &[u8], dpi: u32) -> Result<Vec<PageSlot>> {
    let doc = Document::load_mem(bytes)?;
    let pages = doc.get_pages();
    debug!(pages = pages.len(), dpi, "rasterizing PDF");

    let slots = pages
        .iter()
        .map(|(&index, &page_id)| match render_page(&doc, page_id, dpi) {
            Ok(image) => Ok(Page::new(index, image)),
            Err(error) => {
                warn!(page = index, %error, "PDF page could not be rasterized");
                Err(PageFailure { index, error })
            }
        })
        .collect();
    Ok(slots)
}

fn render_page(doc: &Document, page_id: ObjectId, dpi: u32) -> Result<RgbImage> {
    let page = doc.get_dictionary(page_id)?;
    let [x0, y0, x1, y1] = match inherited(doc, page, b"MediaBox") {
        Some(obj) => parse_rect(doc, obj)?,
        None => DEFAULT_MEDIA_BOX,
    };
    let scale = dpi as f64 / POINTS_PER_INCH;
    let width = ((x1 - x0).abs() * scale).round() as u32;
    let height = ((y1 - y0).abs() * scale).round() as u32;
    if width == 0 || height == 0 || width > MAX_PAGE_SIDE || height > MAX_PAGE_SIDE {
        return Err(ForensicError::DecodeError(format!(
            "page size {}x{} px at {} dpi is out of range",
            width, height, dpi
        )));
    }

    let stream = largest_image(doc, page)?.ok_or_else(|| {
        ForensicError::DecodeError("page carries no raster image content".into())
    })?;
    let image = decode_image_stream(doc, stream)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(ForensicError::DecodeError("embedded image has no pixels".into()));
    }
    Ok(image::imageops::resize(
        &image,
        width,
        height,
        FilterType::Triangle,
    ))
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Result<&'a Object> {
    match obj {
        Object::Reference(id) => Ok(doc.get_object(*id)?),
        other => Ok(other),
    }
}

/// Look up a page attribute, following the `Parent` chain for inheritable keys.
fn inherited<'a>(doc: &'a Document, page: &'a Dictionary, key: &[u8]) -> Option<&'a Object> {
    let mut current = page;
    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(value) = current.get(key) {
            return Some(value);
        }
        let parent = current.get(b"Parent").ok()?.as_reference().ok()?;
        current = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn number(doc: &Document, obj: &Object) -> Result<f64> {
    match resolve(doc, obj)? {
        Object::Integer(i) => Ok(*i as f64),
        Object::Real(r) => Ok(*r as f64),
        _ => Err(ForensicError::DecodeError("expected a number".into())),
    }
}

fn parse_rect(doc: &Document, obj: &Object) -> Result<[f64; 4]> {
    let arr = resolve(doc, obj)?
        .as_array()
        .map_err(|_| ForensicError::DecodeError("MediaBox is not an array".into()))?;
    if arr.len() != 4 {
        return Err(ForensicError::DecodeError(format!(
            "MediaBox has {} elements, expected 4",
            arr.len()
        )));
    }
    let mut values = [0.0f64; 4];
    for (slot, item) in values.iter_mut().zip(arr) {
        *slot = number(doc, item)?;
    }
    Ok(values)
}

fn int_entry(doc: &Document, dict: &Dictionary, key: &[u8]) -> Result<i64> {
    let obj = dict.get(key).map_err(|_| {
        ForensicError::DecodeError(format!("image is missing /{}", String::from_utf8_lossy(key)))
    })?;
    match resolve(doc, obj)? {
        Object::Integer(i) => Ok(*i),
        _ => Err(ForensicError::DecodeError(format!(
            "/{} is not an integer",
            String::from_utf8_lossy(key)
        ))),
    }
}

fn is_image(stream: &Stream) -> bool {
    matches!(stream.dict.get(b"Subtype"), Ok(Object::Name(n)) if n.as_slice() == b"Image")
}

/// The image XObject covering the most source pixels on this page.
fn largest_image<'a>(doc: &'a Document, page: &'a Dictionary) -> Result<Option<&'a Stream>> {
    let resources = match inherited(doc, page, b"Resources") {
        Some(obj) => resolve(doc, obj)?
            .as_dict()
            .map_err(|_| ForensicError::DecodeError("Resources is not a dictionary".into()))?,
        None => return Ok(None),
    };
    let xobjects = match resources.get(b"XObject") {
        Ok(obj) => resolve(doc, obj)?
            .as_dict()
            .map_err(|_| ForensicError::DecodeError("XObject is not a dictionary".into()))?,
        Err(_) => return Ok(None),
    };

    let mut best: Option<(u64, &Stream)> = None;
    for (_, obj) in xobjects.iter() {
        let stream = match resolve(doc, obj)?.as_stream() {
            Ok(s) if is_image(s) => s,
            _ => continue,
        };
        let (width, height) = image_dimensions(doc, &stream.dict)?;
        let area = u64::from(width) * u64::from(height);
        if best.map_or(true, |(a, _)| area > a) {
            best = Some((area, stream));
        }
    }
    Ok(best.map(|(_, s)| s))
}

/// `/Width` and `/Height` of an image XObject, bounded by [`MAX_PAGE_SIDE`].
fn image_dimensions(doc: &Document, dict: &Dictionary) -> Result<(u32, u32)> {
    let side = |key: &[u8]| -> Result<u32> {
        let raw = int_entry(doc, dict, key)?;
        match u32::try_from(raw) {
            Ok(v) if v > 0 && v <= MAX_PAGE_SIDE => Ok(v),
            _ => Err(ForensicError::DecodeError(format!(
                "image /{} of {} is out of range",
                String::from_utf8_lossy(key),
                raw
            ))),
        }
    };
    Ok((side(b"Width")?, side(b"Height")?))
}

fn filter_names(doc: &Document, dict: &Dictionary) -> Result<Vec<Vec<u8>>> {
    let obj = match dict.get(b"Filter") {
        Ok(obj) => resolve(doc, obj)?,
        Err(_) => return Ok(Vec::new()),
    };
    match obj {
        Object::Name(n) => Ok(vec![n.clone()]),
        Object::Array(items) => items
            .iter()
            .map(|item| match resolve(doc, item)? {
                Object::Name(n) => Ok(n.clone()),
                _ => Err(ForensicError::DecodeError("malformed /Filter entry".into())),
            })
            .collect(),
        _ => Err(ForensicError::DecodeError("malformed /Filter".into())),
    }
}

fn components(doc: &Document, dict: &Dictionary) -> Result<u32> {
    let obj = match dict.get(b"ColorSpace") {
        Ok(obj) => resolve(doc, obj)?,
        Err(_) => return Ok(3),
    };
    match obj {
        Object::Name(n) => match n.as_slice() {
            b"DeviceRGB" | b"CalRGB" => Ok(3),
            b"DeviceGray" | b"CalGray" => Ok(1),
            other => Err(ForensicError::DecodeError(format!(
                "unsupported color space {}",
                String::from_utf8_lossy(other)
            ))),
        },
        // [/ICCBased <stream>] carries the component count in /N.
        Object::Array(items) if items.len() == 2 => {
            let profile = resolve(doc, &items[1])?
                .as_stream()
                .map_err(|_| ForensicError::DecodeError("ICC profile is not a stream".into()))?;
            match int_entry(doc, &profile.dict, b"N")? {
                1 => Ok(1),
                3 => Ok(3),
                n => Err(ForensicError::DecodeError(format!(
                    "unsupported ICC component count {}",
                    n
                ))),
            }
        }
        _ => Err(ForensicError::DecodeError("unsupported color space".into())),
    }
}

fn decode_image_stream(doc: &Document, stream: &Stream) -> Result<RgbImage> {
    let filters = filter_names(doc, &stream.dict)?;
    let filters: Vec<&[u8]> = filters.iter().map(|f| f.as_slice()).collect();

    if filters == [b"DCTDecode".as_slice()] {
        let img = image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)?;
        return Ok(img.to_rgb8());
    }

    let raw = match filters.as_slice() {
        [] => stream.content.clone(),
        [f] if *f == b"FlateDecode" => stream
            .decompressed_content()
            .map_err(|e| ForensicError::DecodeError(format!("FlateDecode: {}", e)))?,
        other => {
            let names: Vec<String> = other
                .iter()
                .map(|f| String::from_utf8_lossy(f).into_owned())
                .collect();
            return Err(ForensicError::DecodeError(format!(
                "unsupported image filter chain {:?}",
                names
            )));
        }
    };

    let (width, height) = image_dimensions(doc, &stream.dict)?;
    let bpc = match stream.dict.get(b"BitsPerComponent") {
        Ok(_) => int_entry(doc, &stream.dict, b"BitsPerComponent")?,
        Err(_) => 8,
    };
    if bpc != 8 {
        return Err(ForensicError::DecodeError(format!(
            "unsupported bits per component {}",
            bpc
        )));
    }
    let channels = components(doc, &stream.dict)?;
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|px| px.checked_mul(channels as usize))
        .ok_or_else(|| ForensicError::DecodeError("image dimensions overflow".into()))?;
    if raw.len() < expected {
        return Err(ForensicError::DecodeError(format!(
            "image data truncated: {} of {} bytes",
            raw.len(),
            expected
        )));
    }

    let rgb: Vec<u8> = if channels == 3 {
        raw[..expected].to_vec()
    } else {
        raw[..expected].iter().flat_map(|&v| [v, v, v]).collect()
    };
    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| ForensicError::DecodeError("image buffer size mismatch".into()))
}
