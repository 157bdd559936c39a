// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{CanonicalError, invalid_argument_error};
use url::Url;

use crate::abstract_engine::{EngineConfig, EngineId, Facing, FlashMode, FocusMode,
                             SelectionCriteria};
use crate::image_processor::{JpegEncode, PngEncode};
use crate::picture_transaction::{Builder, ImageQuality, PictureTransaction, PropertyValue,
                                 PROP_JPG_QUALITY, PROP_SKIP_ORIENTATION_NORMALIZATION};

/// How the shell lets the user zoom. With None, zoom requests are refused.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ZoomStyle {
    None,
    #[default]
    Pinch,
    Seekbar,
}

/// Screen orientation policy. Carried for the shell; the session itself
/// does not act on it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OrientationLockMode {
    #[default]
    Default,
    Portrait,
    Landscape,
}

/// Snapshot of what the shell asked for.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub facing: Facing,
    pub exact_match: bool,
    /// None lets the capability probe choose.
    pub forced_engine: Option<EngineId>,
    /// None keeps the device default.
    pub focus_mode: Option<FocusMode>,
    /// Priority order; the first mode the camera supports wins.
    pub flash_modes: Vec<FlashMode>,
    /// In [0,100].
    pub jpeg_quality: u8,
    pub mirror_preview: bool,
    pub zoom_style: ZoomStyle,
    pub orientation_lock: OrientationLockMode,
    /// Where pictures go. None keeps them in memory only.
    pub output: Option<Url>,
    /// PNG instead of JPEG.
    pub lossless: bool,
    pub update_media_index: bool,
    pub skip_orientation_normalization: bool,
    pub debug: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig{facing: Facing::Back,
                      exact_match: false,
                      forced_engine: None,
                      focus_mode: Some(FocusMode::Continuous),
                      flash_modes: vec![],
                      jpeg_quality: 100,
                      mirror_preview: false,
                      zoom_style: ZoomStyle::default(),
                      orientation_lock: OrientationLockMode::default(),
                      output: None,
                      lossless: false,
                      update_media_index: false,
                      skip_orientation_normalization: false,
                      debug: false}
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), CanonicalError> {
        if self.jpeg_quality > 100 {
            return Err(invalid_argument_error(
                format!("JPEG quality {} outside [0,100]", self.jpeg_quality).as_str()));
        }
        Ok(())
    }

    pub fn set_image_quality(&mut self, quality: ImageQuality) {
        self.jpeg_quality = quality.jpeg_quality();
    }

    pub fn criteria(&self) -> SelectionCriteria {
        SelectionCriteria{facing: self.facing, exact_match: self.exact_match}
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig{focus_mode: self.focus_mode,
                     flash_modes: self.flash_modes.clone(),
                     debug: self.debug}
    }

    /// Completes `builder` with the encoder, and the persist stage when an
    /// output is configured. Stages already in `builder` run first.
    pub fn finish_transaction(&self, builder: Builder) -> PictureTransaction {
        match &self.output {
            Some(output) => builder.to_destination(output.clone(),
                                                   self.lossless,
                                                   self.jpeg_quality,
                                                   self.update_media_index,
                                                   self.skip_orientation_normalization)
                .build(),
            None => {
                let builder = if self.lossless {
                    builder.append(PngEncode)
                } else {
                    builder.append(JpegEncode::new())
                };
                builder
                    .property(PROP_JPG_QUALITY, PropertyValue::Int(self.jpeg_quality as i64))
                    .property(PROP_SKIP_ORIENTATION_NORMALIZATION,
                              PropertyValue::Bool(self.skip_orientation_normalization))
                    .build()
            }
        }
    }

    pub fn picture_transaction(&self) -> PictureTransaction {
        self.finish_transaction(PictureTransaction::builder())
    }
}
