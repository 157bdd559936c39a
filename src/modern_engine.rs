// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use imageproc::rect::Rect;

use crate::abstract_engine::{CameraDescriptor, EngineId};
use crate::driver::{DeviceInfo, ZoomSetting};
use crate::driver_engine::{DriverEngine, DriverGeneration};

/// Number of zoom levels exposed for a zoom ratio range.
pub const ZOOM_LEVELS: u32 = 100;

/// Modern driver generation. Zoom is a ratio, realized by cropping a
/// centered region of the sensor's active array; changes take effect at
/// once. Frames are untagged; their orientation is the sensor's.
pub struct Modern;

pub type ModernEngine = DriverEngine<Modern>;

impl DriverGeneration for Modern {
    const ID: EngineId = EngineId::Modern;

    fn describe(devices: &[DeviceInfo]) -> Vec<CameraDescriptor> {
        devices.iter().enumerate().map(|(index, device)| {
            let zooms = device.zoom.is_some_and(|z| z.max_ratio > 1.0);
            CameraDescriptor{
                index,
                device_id: device.id.clone(),
                facing: device.facing,
                sensor_orientation: device.sensor_orientation,
                max_zoom: if zooms { ZOOM_LEVELS } else { 0 },
                smooth_zoom: false,
                flash_modes: device.flash_modes.clone(),
                focus_modes: device.focus_modes.clone(),
            }
        }).collect()
    }

    fn zoom_setting(device: &DeviceInfo, max_zoom: u32, level: u32) -> ZoomSetting {
        let max_ratio = device.zoom.map_or(1.0, |z| z.max_ratio.max(1.0));
        let fraction = if max_zoom == 0 { 0.0 } else { level.min(max_zoom) as f32 / max_zoom as f32 };
        let ratio = 1.0 + (max_ratio - 1.0) * fraction;
        let (width, height) = device.active_array;
        let crop_w = ((width as f32 / ratio).round() as u32).clamp(1, width.max(1));
        let crop_h = ((height as f32 / ratio).round() as u32).clamp(1, height.max(1));
        let left = (width - crop_w.min(width)) / 2;
        let top = (height - crop_h.min(height)) / 2;
        ZoomSetting::CropRegion(Rect::at(left as i32, top as i32).of_size(crop_w, crop_h))
    }
}
