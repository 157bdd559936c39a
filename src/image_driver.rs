// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Fake driver whose cameras yield a fixed image. For testing.

use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{CanonicalError, failed_precondition_error, internal_error,
                      not_found_error, unavailable_error};
use image::DynamicImage;
use image::codecs::jpeg::JpegEncoder;
use log::debug;

use crate::abstract_engine::{Facing, FlashMode, FocusMode};
use crate::driver::{CameraDriver, DeviceInfo, DriverSession, RawFrame, SessionSetup,
                    ZoomCapability, ZoomSetting};
use crate::image_buffer::ExifModel;

/// Counters shared between an ImageDriver and the sessions it opened, so
/// tests can observe what the engines did to the "hardware".
#[derive(Debug, Default)]
pub struct DriverStats {
    opens: AtomicUsize,
    open_sessions: AtomicUsize,
    captures: AtomicUsize,
    preview_active: AtomicBool,
    last_zoom: Mutex<Option<ZoomSetting>>,
    last_setup: Mutex<Option<SessionSetup>>,
}

impl DriverStats {
    /// Number of successful open() calls so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn preview_active(&self) -> bool {
        self.preview_active.load(Ordering::SeqCst)
    }

    pub fn last_zoom(&self) -> Option<ZoomSetting> {
        *self.last_zoom.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_setup(&self) -> Option<SessionSetup> {
        *self.last_setup.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ImageDriver {
    image: Arc<DynamicImage>,
    devices: Vec<DeviceInfo>,
    modern: bool,
    open_delay: Duration,
    capture_delay: Duration,
    fail_open: bool,
    capture_fault: Option<CaptureFault>,
    zoom_steps_before_fault: Option<usize>,
    stats: Arc<DriverStats>,
}

#[derive(Copy, Clone, Debug)]
enum CaptureFault {
    // The sensor may deliver again on the next request.
    Transient,
    // The sensor is gone for good.
    Broken,
}

impl ImageDriver {
    /// A driver with no cameras; add some with with_camera().
    pub fn new(image: DynamicImage) -> Self {
        ImageDriver{image: Arc::new(image),
                    devices: vec![],
                    modern: false,
                    open_delay: Duration::ZERO,
                    capture_delay: Duration::ZERO,
                    fail_open: false,
                    capture_fault: None,
                    zoom_steps_before_fault: None,
                    stats: Arc::new(DriverStats::default())}
    }

    /// Adds a camera with smooth zoom over 30 steps up to 4x, the usual
    /// flash modes, and continuous autofocus. `sensor_orientation` is the
    /// clockwise rotation its frames need to appear upright.
    pub fn with_camera(self, facing: Facing, sensor_orientation: u32) -> Self {
        let id = self.devices.len().to_string();
        let (width, height) = (self.image.width(), self.image.height());
        self.with_device(DeviceInfo{
            id,
            facing,
            sensor_orientation,
            active_array: (width, height),
            zoom: Some(ZoomCapability{max_index: 30, max_ratio: 4.0, smooth: true}),
            flash_modes: vec![FlashMode::Off, FlashMode::Auto, FlashMode::Always],
            focus_modes: vec![FocusMode::Continuous, FocusMode::Off],
        })
    }

    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.devices.push(device);
        self
    }

    /// What the capability probe reports. Modern sessions deliver decoded,
    /// untagged frames; legacy sessions deliver EXIF-tagged JPEG.
    pub fn with_modern_api(mut self, modern: bool) -> Self {
        self.modern = modern;
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    /// Every open() fails, as when another process holds the camera.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Every capture_still() fails after the capture delay, with an error
    /// a later capture could recover from.
    pub fn failing_capture(mut self) -> Self {
        self.capture_fault = Some(CaptureFault::Transient);
        self
    }

    /// Every capture_still() fails with an internal driver error.
    pub fn broken_sensor(mut self) -> Self {
        self.capture_fault = Some(CaptureFault::Broken);
        self
    }

    /// Each session applies `steps` zoom settings, then every further
    /// apply_zoom() fails.
    pub fn failing_zoom_after(mut self, steps: usize) -> Self {
        self.zoom_steps_before_fault = Some(steps);
        self
    }

    pub fn stats(&self) -> Arc<DriverStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl CameraDriver for ImageDriver {
    fn devices(&self) -> Result<Vec<DeviceInfo>, CanonicalError> {
        Ok(self.devices.clone())
    }

    fn supports_modern_api(&self) -> bool {
        self.modern
    }

    async fn open(&self, device_id: &str, setup: &SessionSetup)
                  -> Result<Box<dyn DriverSession>, CanonicalError> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        let device = self.devices.iter().find(|d| d.id == device_id)
            .ok_or_else(|| not_found_error(
                format!("no camera with id {}", device_id).as_str()))?;
        if self.fail_open {
            return Err(failed_precondition_error(
                format!("camera {} is in use by another client", device_id).as_str()));
        }
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        self.stats.open_sessions.fetch_add(1, Ordering::SeqCst);
        *self.stats.last_setup.lock().unwrap_or_else(PoisonError::into_inner) = Some(*setup);
        debug!("ImageDriver opened camera {}", device_id);
        Ok(Box::new(ImageSession{image: self.image.clone(),
                                 sensor_orientation: device.sensor_orientation,
                                 deliver_jpeg: !self.modern,
                                 capture_delay: self.capture_delay,
                                 capture_fault: self.capture_fault,
                                 zoom_steps_left: self.zoom_steps_before_fault,
                                 zoom: None,
                                 closed: false,
                                 stats: self.stats.clone()}))
    }
}

struct ImageSession {
    image: Arc<DynamicImage>,
    sensor_orientation: u32,
    deliver_jpeg: bool,
    capture_delay: Duration,
    capture_fault: Option<CaptureFault>,
    // None when zoom never fails.
    zoom_steps_left: Option<usize>,
    zoom: Option<ZoomSetting>,
    closed: bool,
    stats: Arc<DriverStats>,
}

impl ImageSession {
    fn zoomed_image(&self) -> DynamicImage {
        match self.zoom {
            Some(ZoomSetting::CropRegion(rect)) => self.image.crop_imm(
                rect.left().max(0) as u32, rect.top().max(0) as u32,
                rect.width(), rect.height()),
            _ => self.image.as_ref().clone(),
        }
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stats.preview_active.store(false, Ordering::SeqCst);
            self.stats.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl DriverSession for ImageSession {
    async fn set_preview(&mut self, enabled: bool) -> Result<(), CanonicalError> {
        if self.closed {
            return Err(failed_precondition_error("session is closed"));
        }
        self.stats.preview_active.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_zoom(&mut self, zoom: ZoomSetting) -> Result<(), CanonicalError> {
        if self.closed {
            return Err(failed_precondition_error("session is closed"));
        }
        match &mut self.zoom_steps_left {
            Some(0) => return Err(unavailable_error("zoom actuator stalled")),
            Some(left) => *left -= 1,
            None => (),
        }
        self.zoom = Some(zoom);
        *self.stats.last_zoom.lock().unwrap_or_else(PoisonError::into_inner) = Some(zoom);
        Ok(())
    }

    async fn capture_still(&mut self) -> Result<RawFrame, CanonicalError> {
        if self.closed {
            return Err(failed_precondition_error("session is closed"));
        }
        if !self.capture_delay.is_zero() {
            tokio::time::sleep(self.capture_delay).await;
        }
        match self.capture_fault {
            Some(CaptureFault::Transient) =>
                return Err(unavailable_error("sensor readout failed")),
            Some(CaptureFault::Broken) =>
                return Err(internal_error("sensor not responding")),
            None => (),
        }
        self.stats.captures.fetch_add(1, Ordering::SeqCst);
        let image = self.zoomed_image();
        if !self.deliver_jpeg {
            return Ok(RawFrame::Pixels{image, orientation: None});
        }
        let mut jpeg = Vec::new();
        DynamicImage::ImageRgb8(image.to_rgb8())
            .write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, 95))
            .map_err(|e| internal_error(&e.to_string()))?;
        let exif = ExifModel::from_rotation(self.sensor_orientation, false)?;
        Ok(RawFrame::Jpeg(exif.embed_in_jpeg(&jpeg)?))
    }

    async fn close(&mut self) {
        self.release();
    }
}

/// We arrange to release the camera when the session goes out of scope.
impl Drop for ImageSession {
    fn drop(&mut self) {
        self.release();
    }
}
