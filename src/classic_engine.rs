// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use crate::abstract_engine::{CameraDescriptor, EngineId};
use crate::driver::{DeviceInfo, ZoomSetting};
use crate::driver_engine::{DriverEngine, DriverGeneration};

/// Legacy driver generation. Zoom is an index into the driver's ratio table
/// and may animate; frames arrive as JPEG carrying their own orientation.
pub struct Classic;

pub type ClassicEngine = DriverEngine<Classic>;

impl DriverGeneration for Classic {
    const ID: EngineId = EngineId::Classic;

    fn describe(devices: &[DeviceInfo]) -> Vec<CameraDescriptor> {
        devices.iter().enumerate().map(|(index, device)| {
            CameraDescriptor{
                index,
                device_id: device.id.clone(),
                facing: device.facing,
                sensor_orientation: device.sensor_orientation,
                max_zoom: device.zoom.map_or(0, |z| z.max_index),
                smooth_zoom: device.zoom.is_some_and(|z| z.smooth),
                flash_modes: device.flash_modes.clone(),
                focus_modes: device.focus_modes.clone(),
            }
        }).collect()
    }

    fn zoom_setting(_device: &DeviceInfo, _max_zoom: u32, level: u32) -> ZoomSetting {
        ZoomSetting::Index(level)
    }
}
