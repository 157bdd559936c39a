// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Processing stages of a PictureTransaction. Each stage consumes the buffer
// produced by the previous one and hands its result to the next; a stage
// failure aborts the rest of the chain.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use canonical_error::{CanonicalError, failed_precondition_error, internal_error,
                      invalid_argument_error};
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use fast_image_resize::images::Image;
use image::{DynamicImage, RgbImage, RgbaImage};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, PngEncoder};
use imageproc::rect::Rect;
use log::{debug, info};
use tempfile::NamedTempFile;
use url::Url;

use crate::image_buffer::{EncodedFormat, EncodedImage, ImageBuffer};
use crate::picture_transaction::{PictureTransaction, PROP_JPG_QUALITY, PROP_OUTPUT,
                                 PROP_SKIP_ORIENTATION_NORMALIZATION,
                                 PROP_UPDATE_MEDIA_STORE};

pub const DEFAULT_JPEG_QUALITY: u8 = 100;

/// Stable identity of a stage. A transaction holds at most one stage of
/// each kind.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    Crop,
    NormalizeOrientation,
    /// JPEG and PNG encoders share a kind: a picture is encoded once.
    Encode,
    Persist,
    Custom(String),
}

pub trait ImageProcessor: Send + Sync {
    fn kind(&self) -> StageKind;

    fn process(&self, transaction: &PictureTransaction, buffer: ImageBuffer)
               -> Result<ImageBuffer, CanonicalError>;
}

fn skip_normalization(transaction: &PictureTransaction) -> bool {
    transaction.properties().get_bool(PROP_SKIP_ORIENTATION_NORMALIZATION, false)
}

/// Resizes (optionally) and crops to a fixed box anchored at the top-left
/// corner. When resizing, the scale factor is the larger of the two that
/// would fit width and height, so the scaled image covers the box.
#[derive(Debug)]
pub struct ImageCropper {
    width: u32,
    height: u32,
    resize_first: bool,
}

impl ImageCropper {
    pub fn new(width: u32, height: u32, resize_first: bool) -> Self {
        ImageCropper{width, height, resize_first}
    }

    fn cover_size(&self, width: u32, height: u32) -> (u32, u32) {
        let ratio = f64::max(self.width as f64 / width as f64,
                             self.height as f64 / height as f64);
        let scaled_w = ((width as f64 * ratio).round() as u32).max(self.width);
        let scaled_h = ((height as f64 * ratio).round() as u32).max(self.height);
        (scaled_w, scaled_h)
    }
}

impl ImageProcessor for ImageCropper {
    fn kind(&self) -> StageKind {
        StageKind::Crop
    }

    fn process(&self, transaction: &PictureTransaction, mut buffer: ImageBuffer)
               -> Result<ImageBuffer, CanonicalError> {
        if self.width == 0 || self.height == 0 {
            return Err(invalid_argument_error(
                format!("empty crop box {}x{}", self.width, self.height).as_str()));
        }
        // Cropping must see upright pixels, else the box lands on the
        // wrong corner of the scene.
        if !skip_normalization(transaction) {
            buffer.normalize_orientation();
        }
        if self.resize_first {
            let (w, h) = self.cover_size(buffer.width(), buffer.height());
            let resized = resize(buffer.image(), w, h)?;
            buffer.set_image(resized);
        }
        let bounds = Rect::at(0, 0).of_size(buffer.width(), buffer.height());
        let target = Rect::at(0, 0).of_size(self.width, self.height);
        if bounds.intersect(target) != Some(target) {
            return Err(invalid_argument_error(
                format!("crop box {}x{} exceeds {}x{} buffer",
                        self.width, self.height, buffer.width(), buffer.height()).as_str()));
        }
        let cropped = buffer.image().crop_imm(0, 0, self.width, self.height);
        buffer.set_image(cropped);
        debug!("Cropped to {}x{}", buffer.width(), buffer.height());
        Ok(buffer)
    }
}

fn resize(image: &DynamicImage, width: u32, height: u32)
          -> Result<DynamicImage, CanonicalError> {
    let (src_w, src_h) = (image.width(), image.height());
    let (pixels, pixel_type) = if image.color().has_alpha() {
        (image.to_rgba8().into_raw(), PixelType::U8x4)
    } else {
        (image.to_rgb8().into_raw(), PixelType::U8x3)
    };
    let src = Image::from_vec_u8(src_w, src_h, pixels, pixel_type)
        .map_err(|e| internal_error(format!("resize source: {}", e).as_str()))?;
    let mut dst = Image::new(width, height, pixel_type);
    let options = ResizeOptions::new()
        .resize_alg(ResizeAlg::Convolution(FilterType::Bilinear));
    Resizer::new().resize(&src, &mut dst, &options)
        .map_err(|e| internal_error(format!("resize failed: {}", e).as_str()))?;
    let out = dst.buffer().to_vec();
    let resized = if pixel_type == PixelType::U8x4 {
        RgbaImage::from_raw(width, height, out).map(DynamicImage::ImageRgba8)
    } else {
        RgbImage::from_raw(width, height, out).map(DynamicImage::ImageRgb8)
    };
    resized.ok_or_else(|| internal_error("resize produced a short buffer"))
}

/// Applies the orientation metadata to the pixels. A no-op when the
/// transaction asks to keep the sensor layout.
#[derive(Debug, Default)]
pub struct OrientationNormalizer;

impl ImageProcessor for OrientationNormalizer {
    fn kind(&self) -> StageKind {
        StageKind::NormalizeOrientation
    }

    fn process(&self, transaction: &PictureTransaction, mut buffer: ImageBuffer)
               -> Result<ImageBuffer, CanonicalError> {
        if !skip_normalization(transaction) {
            buffer.normalize_orientation();
        }
        Ok(buffer)
    }
}

#[derive(Debug, Default)]
pub struct JpegEncode {
    /// None reads the quality from the transaction's properties.
    quality: Option<u8>,
}

impl JpegEncode {
    pub fn new() -> Self {
        JpegEncode{quality: None}
    }

    pub fn with_quality(quality: u8) -> Self {
        JpegEncode{quality: Some(quality)}
    }

    fn quality(&self, transaction: &PictureTransaction) -> Result<u8, CanonicalError> {
        let quality = match self.quality {
            Some(q) => q as i64,
            None => transaction.properties().get_int(PROP_JPG_QUALITY)
                .unwrap_or(DEFAULT_JPEG_QUALITY as i64),
        };
        if !(0..=100).contains(&quality) {
            return Err(invalid_argument_error(
                format!("JPEG quality {} outside [0,100]", quality).as_str()));
        }
        // The encoder's scale starts at 1.
        Ok(quality.max(1) as u8)
    }
}

impl ImageProcessor for JpegEncode {
    fn kind(&self) -> StageKind {
        StageKind::Encode
    }

    fn process(&self, transaction: &PictureTransaction, mut buffer: ImageBuffer)
               -> Result<ImageBuffer, CanonicalError> {
        let quality = self.quality(transaction)?;
        if !skip_normalization(transaction) {
            buffer.normalize_orientation();
        }
        let mut jpeg = Vec::new();
        DynamicImage::ImageRgb8(buffer.image().to_rgb8())
            .write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, quality))
            .map_err(|e| internal_error(format!("JPEG encode: {}", e).as_str()))?;
        // The tag describes the final pixel layout: upright after
        // normalization, the sensor's rotation otherwise.
        let tagged = buffer.exif().embed_in_jpeg(&jpeg)?;
        debug!("Encoded {}x{} JPEG at quality {}: {} bytes",
               buffer.width(), buffer.height(), quality, tagged.len());
        buffer.set_encoded(EncodedImage{format: EncodedFormat::Jpeg,
                                        bytes: Arc::new(tagged)});
        Ok(buffer)
    }
}

/// Lossless encoding. PNG carries no orientation tag here, so the pixels
/// are normalized unless the transaction says otherwise.
#[derive(Debug, Default)]
pub struct PngEncode;

impl ImageProcessor for PngEncode {
    fn kind(&self) -> StageKind {
        StageKind::Encode
    }

    fn process(&self, transaction: &PictureTransaction, mut buffer: ImageBuffer)
               -> Result<ImageBuffer, CanonicalError> {
        if !skip_normalization(transaction) {
            buffer.normalize_orientation();
        }
        let mut png = Vec::new();
        let encoder = PngEncoder::new_with_quality(
            &mut png, CompressionType::Default, image::codecs::png::FilterType::Adaptive);
        buffer.image().write_with_encoder(encoder)
            .map_err(|e| internal_error(format!("PNG encode: {}", e).as_str()))?;
        debug!("Encoded {}x{} PNG: {} bytes", buffer.width(), buffer.height(), png.len());
        buffer.set_encoded(EncodedImage{format: EncodedFormat::Png,
                                        bytes: Arc::new(png)});
        Ok(buffer)
    }
}

/// Opens destinations that are not local files, e.g. content providers or
/// network stores.
pub trait DestinationResolver: Send + Sync {
    fn open_writer(&self, location: &Url) -> Result<Box<dyn Write + Send>, CanonicalError>;
}

/// External content index to be told about newly written files.
pub trait MediaIndex: Send + Sync {
    fn scan(&self, path: &Path, mime_type: &str);
}

/// Writes the encoded bytes to the transaction's output location. Local
/// files are written to a temporary sibling, synced, and renamed into
/// place, so a failed write never leaves a truncated picture behind.
#[derive(Default)]
pub struct PersistStage {
    resolver: Option<Arc<dyn DestinationResolver>>,
    media_index: Option<Arc<dyn MediaIndex>>,
}

impl PersistStage {
    pub fn new() -> Self {
        PersistStage::default()
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DestinationResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_media_index(mut self, media_index: Arc<dyn MediaIndex>) -> Self {
        self.media_index = Some(media_index);
        self
    }

    fn write_file(&self, path: &Path, encoded: &EncodedImage)
                  -> Result<PathBuf, CanonicalError> {
        let path = match encoded.format {
            EncodedFormat::Png => png_path(path),
            EncodedFormat::Jpeg => path.to_path_buf(),
        };
        let parent = path.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .map_err(|e| io_error("cannot create", parent, e))?;
        let mut temp = NamedTempFile::new_in(parent)
            .map_err(|e| io_error("cannot create temporary file in", parent, e))?;
        if let Err(e) = write_synced(&mut temp, &encoded.bytes) {
            return Err(io_error("cannot write", temp.path(), e));
        }
        temp.persist(&path)
            .map_err(|e| internal_error(
                format!("cannot rename into {:?}: {}", path, e).as_str()))?;
        Ok(path)
    }

    fn write_other(&self, location: &Url, encoded: &EncodedImage)
                   -> Result<(), CanonicalError> {
        let Some(resolver) = &self.resolver else {
            return Err(failed_precondition_error(
                format!("no resolver for {} destinations", location.scheme()).as_str()));
        };
        let mut writer = resolver.open_writer(location)?;
        writer.write_all(&encoded.bytes)
            .and_then(|()| writer.flush())
            .map_err(|e| internal_error(
                format!("cannot write {}: {}", location, e).as_str()))
    }
}

impl ImageProcessor for PersistStage {
    fn kind(&self) -> StageKind {
        StageKind::Persist
    }

    fn process(&self, transaction: &PictureTransaction, mut buffer: ImageBuffer)
               -> Result<ImageBuffer, CanonicalError> {
        let properties = transaction.properties();
        let Some(location) = properties.get_location(PROP_OUTPUT).cloned() else {
            debug!("No output location; picture kept in memory only");
            return Ok(buffer);
        };
        let Some(encoded) = buffer.encoded().cloned() else {
            return Err(failed_precondition_error("nothing encoded to persist"));
        };
        if location.scheme() != "file" {
            self.write_other(&location, &encoded)?;
            info!("Wrote {} bytes to {}", encoded.bytes.len(), location);
            buffer.set_persisted_to(location);
            return Ok(buffer);
        }

        let path = location.to_file_path()
            .map_err(|()| invalid_argument_error(
                format!("{} is not a local path", location).as_str()))?;
        let written = self.write_file(&path, &encoded)?;
        info!("Wrote {} bytes to {:?}", encoded.bytes.len(), written);
        if properties.get_bool(PROP_UPDATE_MEDIA_STORE, false) {
            match &self.media_index {
                Some(index) => index.scan(&written, encoded.format.mime_type()),
                None => debug!("No media index to update for {:?}", written),
            }
        }
        let written_url = Url::from_file_path(&written)
            .map_err(|()| internal_error(
                format!("{:?} is not absolute", written).as_str()))?;
        buffer.set_persisted_to(written_url);
        Ok(buffer)
    }
}

/// Lossless output always gets a `.png` name: a `.jpg` suffix is replaced,
/// any other name is extended.
pub fn png_path(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("png") => path.to_path_buf(),
        Some(ext) if ext.eq_ignore_ascii_case("jpg") => path.with_extension("png"),
        _ => {
            let mut name = path.as_os_str().to_owned();
            name.push(".png");
            PathBuf::from(name)
        }
    }
}

fn write_synced(temp: &mut NamedTempFile, bytes: &[u8]) -> std::io::Result<()> {
    temp.write_all(bytes)?;
    temp.flush()?;
    temp.as_file().sync_all()
}

fn io_error(what: &str, path: &Path, e: std::io::Error) -> CanonicalError {
    internal_error(format!("{} {:?}: {}", what, path, e).as_str())
}
