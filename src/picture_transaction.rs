// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::debug;
use url::Url;

use crate::camera_error::CameraError;
use crate::image_buffer::ImageBuffer;
use crate::image_processor::{ImageProcessor, JpegEncode, PersistStage, PngEncode,
                             StageKind};

/// Destination of the finished picture (a Location).
pub const PROP_OUTPUT: &str = "output";
/// Whether the external media index is told about the written file.
pub const PROP_UPDATE_MEDIA_STORE: &str = "update";
/// When set, pixels are left in sensor layout and the orientation tag is
/// kept instead.
pub const PROP_SKIP_ORIENTATION_NORMALIZATION: &str = "skipOrientationNormalization";
/// JPEG quality in [0,100].
pub const PROP_JPG_QUALITY: &str = "jpgQuality";

#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Location(Url),
}

/// Keyed configuration read by the stages. Frozen once the transaction is
/// built.
#[derive(Clone, Debug, Default)]
pub struct Properties {
    values: HashMap<String, PropertyValue>,
}

impl Properties {
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.values.get(key)
    }

    /// Returns `default` if the key is absent or not a Bool.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(PropertyValue::Bool(b)) => *b,
            _ => default,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(PropertyValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_text(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(PropertyValue::Text(t)) => Some(t.as_str()),
            _ => None,
        }
    }

    pub fn get_location(&self, key: &str) -> Option<&Url> {
        match self.values.get(key) {
            Some(PropertyValue::Location(url)) => Some(url),
            _ => None,
        }
    }

    fn set(&mut self, key: &str, value: PropertyValue) {
        self.values.insert(key.to_string(), value);
    }
}

/// Coarse quality choice offered by a shell.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImageQuality {
    Low, High,
}

impl ImageQuality {
    pub fn jpeg_quality(&self) -> u8 {
        match self {
            ImageQuality::Low => 60,
            ImageQuality::High => 100,
        }
    }
}

/// How to turn one captured frame into an artifact: an ordered chain of
/// stages plus the properties they read. Immutable once built; shared by
/// reference with the engine for the duration of a capture.
pub struct PictureTransaction {
    stages: Vec<Box<dyn ImageProcessor>>,
    // Position in `stages` of each kind present.
    index: HashMap<StageKind, usize>,
    properties: Properties,
}

impl fmt::Debug for PictureTransaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PictureTransaction")
            .field("stages", &self.stage_kinds())
            .field("properties", &self.properties)
            .finish()
    }
}

impl PictureTransaction {
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Runs every stage in order, each on the previous stage's output.
    /// The first failure ends the chain; it is reported as a Persist error
    /// if the persist stage raised it, as a Processing error otherwise.
    pub fn process(&self, buffer: ImageBuffer) -> Result<ImageBuffer, CameraError> {
        let mut buffer = buffer;
        for stage in &self.stages {
            let kind = stage.kind();
            debug!("Running stage {:?}", kind);
            buffer = stage.process(self, buffer).map_err(|e| match kind {
                StageKind::Persist => CameraError::Persist(e.to_string()),
                _ => CameraError::Processing(format!("{:?} stage: {}", kind, e)),
            })?;
        }
        Ok(buffer)
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    pub fn find(&self, kind: &StageKind) -> Option<&dyn ImageProcessor> {
        self.index.get(kind).map(|&pos| self.stages[pos].as_ref())
    }
}

#[derive(Default)]
pub struct Builder {
    stages: Vec<Box<dyn ImageProcessor>>,
    // Position in `stages` of each kind present.
    index: HashMap<StageKind, usize>,
    properties: Properties,
}

impl Builder {
    /// Adds `stage` at the end of the chain. If a stage of the same kind is
    /// already present it is replaced in place, keeping its position.
    pub fn append(mut self, stage: impl ImageProcessor + 'static) -> Self {
        self.put(Box::new(stage));
        self
    }

    fn put(&mut self, stage: Box<dyn ImageProcessor>) {
        let kind = stage.kind();
        match self.index.get(&kind) {
            Some(&pos) => self.stages[pos] = stage,
            None => {
                self.index.insert(kind, self.stages.len());
                self.stages.push(stage);
            }
        }
    }

    fn contains(&self, kind: &StageKind) -> bool {
        self.index.contains_key(kind)
    }

    pub fn property(mut self, key: &str, value: PropertyValue) -> Self {
        self.properties.set(key, value);
        self
    }

    /// Encodes (PNG when `lossless`, else JPEG at `jpeg_quality`) and writes
    /// the result to `output`. Calling it again updates the properties and
    /// swaps the encoder without growing the chain. A persist stage already
    /// appended, e.g. one carrying a media index, is kept.
    pub fn to_destination(mut self, output: Url, lossless: bool, jpeg_quality: u8,
                          update_index: bool, skip_normalization: bool) -> Self {
        if lossless {
            self.put(Box::new(PngEncode));
        } else {
            self.put(Box::new(JpegEncode::new()));
        }
        if !self.contains(&StageKind::Persist) {
            self.put(Box::new(PersistStage::new()));
        }
        self.property(PROP_OUTPUT, PropertyValue::Location(output))
            .property(PROP_UPDATE_MEDIA_STORE, PropertyValue::Bool(update_index))
            .property(PROP_SKIP_ORIENTATION_NORMALIZATION,
                      PropertyValue::Bool(skip_normalization))
            .property(PROP_JPG_QUALITY, PropertyValue::Int(jpeg_quality as i64))
    }

    pub fn build(self) -> PictureTransaction {
        PictureTransaction{stages: self.stages, index: self.index, properties: self.properties}
    }

    pub fn build_shared(self) -> Arc<PictureTransaction> {
        Arc::new(self.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use canonical_error::{CanonicalError, internal_error};
    use image::{DynamicImage, RgbImage};
    use crate::image_buffer::ExifModel;
    use crate::image_processor::{ImageCropper, OrientationNormalizer};

    // Records each invocation and tags the buffer width so the next stage
    // can check it received this stage's output.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<(&'static str, u32)>>>,
        fail: bool,
    }

    impl ImageProcessor for Recorder {
        fn kind(&self) -> StageKind {
            StageKind::Custom(self.name.to_string())
        }

        fn process(&self, _transaction: &PictureTransaction, mut buffer: ImageBuffer)
                   -> Result<ImageBuffer, CanonicalError> {
            self.log.lock().unwrap().push((self.name, buffer.width()));
            if self.fail {
                return Err(internal_error("stage failure"));
            }
            buffer.set_image(DynamicImage::ImageRgb8(
                RgbImage::new(buffer.width() + 1, 1)));
            Ok(buffer)
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<(&'static str, u32)>>>,
                fail: bool) -> Recorder {
        Recorder{name, log: log.clone(), fail}
    }

    fn frame() -> ImageBuffer {
        ImageBuffer::new(DynamicImage::ImageRgb8(RgbImage::new(1, 1)), ExifModel::upright())
    }

    #[test]
    fn test_stages_run_in_order_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let xact = PictureTransaction::builder()
            .append(recorder("a", &log, false))
            .append(recorder("b", &log, false))
            .append(recorder("c", &log, false))
            .build();
        let out = xact.process(frame()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![("a", 1), ("b", 2), ("c", 3)]);
        assert_eq!(out.width(), 4);
    }

    #[test]
    fn test_failure_aborts_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let xact = PictureTransaction::builder()
            .append(recorder("a", &log, false))
            .append(recorder("b", &log, true))
            .append(recorder("c", &log, false))
            .build();
        let err = xact.process(frame()).unwrap_err();
        assert!(matches!(err, CameraError::Processing(_)));
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_same_kind_replaces_in_place() {
        let xact = PictureTransaction::builder()
            .append(ImageCropper::new(10, 10, false))
            .append(OrientationNormalizer)
            .append(ImageCropper::new(5, 5, true))
            .build();
        assert_eq!(xact.len(), 2);
        assert_eq!(xact.stage_kinds(),
                   vec![StageKind::Crop, StageKind::NormalizeOrientation]);
        assert!(xact.find(&StageKind::Encode).is_none());
    }

    #[test]
    fn test_find_by_kind_after_replacement() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let xact = PictureTransaction::builder()
            .append(recorder("a", &log, false))
            .append(ImageCropper::new(10, 10, false))
            .append(recorder("b", &log, false))
            .append(ImageCropper::new(5, 5, true))
            .append(recorder("a", &log, true))
            .build();
        assert_eq!(xact.len(), 3);
        for kind in xact.stage_kinds() {
            assert_eq!(xact.find(&kind).map(|s| s.kind()), Some(kind));
        }
        // The replacement, not the original, is what lookup returns.
        let a = xact.find(&StageKind::Custom("a".to_string())).unwrap();
        assert!(a.process(&xact, frame()).is_err());
        assert!(xact.find(&StageKind::Persist).is_none());
    }

    #[test]
    fn test_to_destination_is_idempotent() {
        let out = Url::parse("file:///tmp/pic.jpg").unwrap();
        let xact = PictureTransaction::builder()
            .append(OrientationNormalizer)
            .to_destination(out.clone(), false, 75, false, false)
            .to_destination(out.clone(), true, 80, true, true)
            .build();
        assert_eq!(xact.stage_kinds(),
                   vec![StageKind::NormalizeOrientation, StageKind::Encode,
                        StageKind::Persist]);
        let props = xact.properties();
        assert_eq!(props.get_location(PROP_OUTPUT), Some(&out));
        assert_eq!(props.get_int(PROP_JPG_QUALITY), Some(80));
        assert!(props.get_bool(PROP_UPDATE_MEDIA_STORE, false));
        assert!(props.get_bool(PROP_SKIP_ORIENTATION_NORMALIZATION, false));
    }

    #[test]
    fn test_property_type_mismatch_uses_default() {
        let xact = PictureTransaction::builder()
            .property("flag", PropertyValue::Text("yes".to_string()))
            .build();
        assert!(!xact.properties().get_bool("flag", false));
        assert_eq!(xact.properties().get_text("flag"), Some("yes"));
        assert_eq!(xact.properties().get_int("missing"), None);
    }
}
