// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// The seam between the engines and whatever binding talks to the camera
// hardware. Engines only ever reach the hardware through these traits, so a
// binding for a new platform (or the fake ImageDriver) plugs in here.

use async_trait::async_trait;
use canonical_error::CanonicalError;
use image::DynamicImage;
use imageproc::rect::Rect;

use crate::abstract_engine::{Facing, FlashMode, FocusMode};
use crate::image_buffer::ExifModel;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ZoomCapability {
    /// Legacy drivers expose zoom as an index into a table of ratios;
    /// this is the last valid index.
    pub max_index: u32,
    /// Largest digital zoom ratio, for drivers that zoom by cropping.
    pub max_ratio: f32,
    /// Whether the driver animates between zoom indexes.
    pub smooth: bool,
}

/// What the driver reports about one camera.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub id: String,
    pub facing: Facing,
    pub sensor_orientation: u32,
    /// (width, height) of the sensor's active pixel array.
    pub active_array: (u32, u32),
    /// None if the camera cannot zoom.
    pub zoom: Option<ZoomCapability>,
    pub flash_modes: Vec<FlashMode>,
    pub focus_modes: Vec<FocusMode>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ZoomSetting {
    Index(u32),
    /// Region of the active array to scale up to the output size.
    CropRegion(Rect),
}

/// Settings applied when a session is opened.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SessionSetup {
    /// None keeps the device default.
    pub flash_mode: Option<FlashMode>,
    pub focus_mode: Option<FocusMode>,
}

/// A still frame as delivered by the driver.
#[derive(Debug)]
pub enum RawFrame {
    /// Compressed frame; orientation, if any, is in its EXIF data.
    Jpeg(Vec<u8>),
    /// Decoded frame. `orientation` is None if the driver does not know it.
    Pixels { image: DynamicImage, orientation: Option<ExifModel> },
}

#[async_trait]
pub trait CameraDriver: Send + Sync {
    /// Lists the cameras present, in the driver's own order.
    fn devices(&self) -> Result<Vec<DeviceInfo>, CanonicalError>;

    /// Capability probe: true if the device supports the modern driver
    /// interface.
    fn supports_modern_api(&self) -> bool;

    async fn open(&self, device_id: &str, setup: &SessionSetup)
                  -> Result<Box<dyn DriverSession>, CanonicalError>;
}

/// One open camera.
#[async_trait]
pub trait DriverSession: Send {
    /// Starts or stops frame delivery to the preview consumer. Does not
    /// affect capture_still().
    async fn set_preview(&mut self, enabled: bool) -> Result<(), CanonicalError>;

    async fn apply_zoom(&mut self, zoom: ZoomSetting) -> Result<(), CanonicalError>;

    /// Obtains a single full-resolution frame. Blocks (asynchronously)
    /// until the exposure completes.
    async fn capture_still(&mut self) -> Result<RawFrame, CanonicalError>;

    /// Releases the camera. Safe to call more than once.
    async fn close(&mut self);
}
