// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::io::Cursor;
use std::sync::Arc;

use canonical_error::{CanonicalError, internal_error, invalid_argument_error};
use exif::experimental::Writer;
use exif::{Field, In, Reader, Tag, Value};
use image::DynamicImage;
use image::metadata::Orientation;
use log::debug;
use url::Url;

use crate::event_bus::PictureArtifact;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncodedFormat {
    Jpeg, Png,
}

impl EncodedFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            EncodedFormat::Jpeg => "image/jpeg",
            EncodedFormat::Png => "image/png",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            EncodedFormat::Jpeg => "jpg",
            EncodedFormat::Png => "png",
        }
    }
}

/// Encoded representation of a buffer. The bytes are shared so that the
/// artifact can be handed to every bus subscriber without copying.
#[derive(Clone, Debug)]
pub struct EncodedImage {
    pub format: EncodedFormat,
    pub bytes: Arc<Vec<u8>>,
}

/// Orientation metadata of a frame: how the stored pixels must be rotated
/// (clockwise) and mirrored to appear upright. Maps one-to-one onto the
/// eight EXIF orientation values.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExifModel {
    orientation: Orientation,
}

impl Default for ExifModel {
    fn default() -> Self {
        ExifModel::upright()
    }
}

impl ExifModel {
    pub fn upright() -> Self {
        ExifModel{orientation: Orientation::NoTransforms}
    }

    pub fn from_orientation(orientation: Orientation) -> Self {
        ExifModel{orientation}
    }

    /// `degrees` must be a multiple of 90. A mirrored frame is flipped
    /// horizontally after the rotation.
    pub fn from_rotation(degrees: u32, mirrored: bool) -> Result<Self, CanonicalError> {
        let orientation = match (degrees % 360, mirrored) {
            (0, false) => Orientation::NoTransforms,
            (90, false) => Orientation::Rotate90,
            (180, false) => Orientation::Rotate180,
            (270, false) => Orientation::Rotate270,
            (0, true) => Orientation::FlipHorizontal,
            (90, true) => Orientation::Rotate90FlipH,
            (180, true) => Orientation::FlipVertical,
            (270, true) => Orientation::Rotate270FlipH,
            _ => return Err(invalid_argument_error(
                format!("rotation {} is not a multiple of 90", degrees).as_str())),
        };
        Ok(ExifModel{orientation})
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn degrees(&self) -> u32 {
        match self.orientation {
            Orientation::NoTransforms | Orientation::FlipHorizontal => 0,
            Orientation::Rotate90 | Orientation::Rotate90FlipH => 90,
            Orientation::Rotate180 | Orientation::FlipVertical => 180,
            Orientation::Rotate270 | Orientation::Rotate270FlipH => 270,
        }
    }

    pub fn mirrored(&self) -> bool {
        matches!(self.orientation,
                 Orientation::FlipHorizontal | Orientation::FlipVertical |
                 Orientation::Rotate90FlipH | Orientation::Rotate270FlipH)
    }

    pub fn is_upright(&self) -> bool {
        self.orientation == Orientation::NoTransforms
    }

    /// Reads the orientation tag of a JPEG. Frames without EXIF data, or
    /// with an out-of-range tag, are taken to be upright.
    pub fn read_from_jpeg(jpeg: &[u8]) -> Self {
        let exif = match Reader::new().read_from_container(&mut Cursor::new(jpeg)) {
            Ok(exif) => exif,
            Err(e) => {
                debug!("No usable EXIF data in frame: {}", e);
                return ExifModel::upright();
            }
        };
        exif.get_field(Tag::Orientation, In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .and_then(|value| u8::try_from(value).ok())
            .and_then(Orientation::from_exif)
            .map_or_else(ExifModel::upright, ExifModel::from_orientation)
    }

    /// Serializes the orientation as a TIFF structure, the payload of a
    /// JPEG APP1 "Exif" segment.
    pub fn to_tiff(&self) -> Result<Vec<u8>, CanonicalError> {
        let field = Field{tag: Tag::Orientation,
                          ifd_num: In::PRIMARY,
                          value: Value::Short(vec![self.orientation.to_exif() as u16])};
        let mut writer = Writer::new();
        writer.push_field(&field);
        let mut buf = Cursor::new(Vec::new());
        writer.write(&mut buf, /*little_endian=*/false)
            .map_err(|e| internal_error(&e.to_string()))?;
        Ok(buf.into_inner())
    }

    /// Returns `jpeg` with an APP1 segment holding this orientation. The
    /// segment is placed after the JFIF APP0 segment when there is one.
    pub fn embed_in_jpeg(&self, jpeg: &[u8]) -> Result<Vec<u8>, CanonicalError> {
        if jpeg.len() < 4 || jpeg[0] != 0xFF || jpeg[1] != 0xD8 {
            return Err(invalid_argument_error("not a JPEG stream"));
        }
        let mut insert_at = 2;
        if jpeg[2] == 0xFF && jpeg[3] == 0xE0 && jpeg.len() >= 6 {
            let app0_len = u16::from_be_bytes([jpeg[4], jpeg[5]]) as usize;
            insert_at = usize::min(jpeg.len(), 4 + app0_len);
        }
        let tiff = self.to_tiff()?;
        let segment_len = 2 + EXIF_HEADER.len() + tiff.len();
        let segment_len = u16::try_from(segment_len)
            .map_err(|_| internal_error("EXIF segment too large"))?;

        let mut out = Vec::with_capacity(jpeg.len() + segment_len as usize + 2);
        out.extend_from_slice(&jpeg[..insert_at]);
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&segment_len.to_be_bytes());
        out.extend_from_slice(EXIF_HEADER);
        out.extend_from_slice(&tiff);
        out.extend_from_slice(&jpeg[insert_at..]);
        Ok(out)
    }
}

const EXIF_HEADER: &[u8] = b"Exif\0\0";

/// One captured frame travelling through a PictureTransaction. Owned by
/// exactly one chain invocation; each stage consumes it and returns the
/// buffer for the next stage.
#[derive(Debug)]
pub struct ImageBuffer {
    image: DynamicImage,
    exif: ExifModel,
    encoded: Option<EncodedImage>,
    persisted_to: Option<Url>,
}

impl ImageBuffer {
    pub fn new(image: DynamicImage, exif: ExifModel) -> Self {
        ImageBuffer{image, exif, encoded: None, persisted_to: None}
    }

    /// Decodes a JPEG frame, keeping its orientation tag. The pixels are
    /// left as stored; normalization is a processing stage.
    pub fn from_jpeg(jpeg: &[u8]) -> Result<Self, CanonicalError> {
        let exif = ExifModel::read_from_jpeg(jpeg);
        let image = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
            .map_err(|e| invalid_argument_error(
                format!("cannot decode JPEG frame: {}", e).as_str()))?;
        Ok(ImageBuffer::new(image, exif))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn exif(&self) -> ExifModel {
        self.exif
    }

    pub fn encoded(&self) -> Option<&EncodedImage> {
        self.encoded.as_ref()
    }

    /// Replaces the pixels. Any earlier encoding no longer describes the
    /// buffer and is discarded.
    pub fn set_image(&mut self, image: DynamicImage) {
        self.image = image;
        self.encoded = None;
    }

    pub fn set_encoded(&mut self, encoded: EncodedImage) {
        self.encoded = Some(encoded);
    }

    /// Where the encoded bytes were durably written, if anywhere.
    pub fn persisted_to(&self) -> Option<&Url> {
        self.persisted_to.as_ref()
    }

    pub fn set_persisted_to(&mut self, location: Url) {
        self.persisted_to = Some(location);
    }

    /// Consumes the buffer, keeping only what the caller is told about.
    pub fn into_artifact(self) -> PictureArtifact {
        PictureArtifact{width: self.image.width(),
                        height: self.image.height(),
                        encoded: self.encoded,
                        location: self.persisted_to}
    }

    /// Rotates/mirrors the pixels as the orientation metadata says and
    /// marks the buffer upright. Returns false if it already was.
    pub fn normalize_orientation(&mut self) -> bool {
        if self.exif.is_upright() {
            return false;
        }
        debug!("Normalizing orientation {:?} of {}x{} buffer",
               self.exif.orientation(), self.width(), self.height());
        let mut image = std::mem::take(&mut self.image);
        image.apply_orientation(self.exif.orientation());
        self.set_image(image);
        self.exif = ExifModel::upright();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_rotation_round_trip_through_exif_values() {
        for degrees in [0, 90, 180, 270] {
            for mirrored in [false, true] {
                let model = ExifModel::from_rotation(degrees, mirrored).unwrap();
                assert_eq!(model.degrees(), degrees);
                assert_eq!(model.mirrored(), mirrored);
            }
        }
        assert!(ExifModel::from_rotation(45, false).is_err());
    }

    #[test]
    fn test_normalize_swaps_dimensions() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(40, 10));
        let mut buffer = ImageBuffer::new(
            image, ExifModel::from_rotation(90, false).unwrap());
        assert!(buffer.normalize_orientation());
        assert_eq!((buffer.width(), buffer.height()), (10, 40));
        assert!(buffer.exif().is_upright());
        assert!(!buffer.normalize_orientation());
    }

    #[test]
    fn test_normalize_moves_pixels() {
        let mut raw = RgbImage::new(2, 1);
        raw.put_pixel(0, 0, Rgb([255, 0, 0]));
        let mut buffer = ImageBuffer::new(
            DynamicImage::ImageRgb8(raw), ExifModel::from_rotation(90, false).unwrap());
        buffer.normalize_orientation();
        // Rotating clockwise puts the left pixel at the top.
        let rgb = buffer.image().to_rgb8();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([255, 0, 0]));
        assert_eq!(rgb.get_pixel(0, 1), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_embedded_orientation_is_readable() {
        let mut jpeg = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::new(8, 8))
            .write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg).unwrap();
        assert!(ExifModel::read_from_jpeg(&jpeg).is_upright());

        let tagged = ExifModel::from_rotation(270, false).unwrap()
            .embed_in_jpeg(&jpeg).unwrap();
        let model = ExifModel::read_from_jpeg(&tagged);
        assert_eq!(model.orientation(), Orientation::Rotate270);

        let buffer = ImageBuffer::from_jpeg(&tagged).unwrap();
        assert_eq!(buffer.exif().degrees(), 270);
        assert_eq!((buffer.width(), buffer.height()), (8, 8));
    }

    #[test]
    fn test_set_image_drops_encoding() {
        let mut buffer = ImageBuffer::new(
            DynamicImage::ImageRgb8(RgbImage::new(4, 4)), ExifModel::upright());
        buffer.set_encoded(EncodedImage{format: EncodedFormat::Png,
                                        bytes: Arc::new(vec![1, 2, 3])});
        assert!(buffer.encoded().is_some());
        buffer.set_image(DynamicImage::ImageRgb8(RgbImage::new(2, 2)));
        assert!(buffer.encoded().is_none());
    }

    #[test]
    fn test_embed_rejects_non_jpeg() {
        assert!(ExifModel::upright().embed_in_jpeg(b"\x89PNG\r\n").is_err());
    }
}
