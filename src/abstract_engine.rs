// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fmt;
use std::sync::Arc;

use crate::camera_error::CameraError;
use crate::event_bus::EventPublisher;
use crate::picture_transaction::PictureTransaction;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Facing {
    Back, Front,
}

impl Facing {
    pub fn opposite(&self) -> Facing {
        match self {
            Facing::Back => Facing::Front,
            Facing::Front => Facing::Back,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FlashMode {
    Off, Always, Auto, RedEye, Torch,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FocusMode {
    Continuous, Off, Edof, Macro,
}

/// The two driver generations we can sit on top of.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EngineId {
    /// Legacy driver: integer zoom ladder, optional smooth zoom, frames
    /// arrive as EXIF-tagged JPEG.
    Classic,
    /// Modern driver: zoom expressed as a crop of the sensor's active
    /// array, frames arrive untagged.
    Modern,
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)  // Just re-use Debug.
    }
}

/// Identity and capabilities of one physical camera, as seen by a
/// particular engine generation. Descriptors are produced by
/// CameraEngine::enumerate() and never change afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraDescriptor {
    /// Driver-specific index: position in the driver's enumeration.
    pub index: usize,
    /// Driver-specific identifier used to open the device.
    pub device_id: String,
    pub facing: Facing,
    /// Clockwise rotation (0, 90, 180, 270) to apply to sensor output for
    /// it to appear upright.
    pub sensor_orientation: u32,
    /// Largest zoom level; 0 means zoom is not supported.
    pub max_zoom: u32,
    /// Whether zoom changes animate and report completion.
    pub smooth_zoom: bool,
    pub flash_modes: Vec<FlashMode>,
    pub focus_modes: Vec<FocusMode>,
}

impl CameraDescriptor {
    pub fn zoom_supported(&self) -> bool {
        self.max_zoom > 0
    }
}

/// What camera the session wants.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SelectionCriteria {
    pub facing: Facing,
    /// When set, cameras of the other facing are never used and a failure
    /// to find one ends the session.
    pub exact_match: bool,
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        SelectionCriteria{facing: Facing::Back, exact_match: false}
    }
}

impl SelectionCriteria {
    /// Orders `descriptors` by preference: cameras with the desired facing
    /// first (keeping driver order among equals). With `exact_match`,
    /// other facings are dropped instead.
    pub fn rank(&self, descriptors: &[CameraDescriptor]) -> Vec<CameraDescriptor> {
        let (mut preferred, others): (Vec<_>, Vec<_>) = descriptors.iter().cloned()
            .partition(|d| d.facing == self.facing);
        if !self.exact_match {
            preferred.extend(others);
        }
        preferred
    }
}

/// Identifies one open (or opening) camera for the lifetime of an engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Runtime identity of one opened camera. Owned by the controller; only
/// meaningful to the engine that issued it.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineHandle {
    pub id: HandleId,
    pub descriptor: CameraDescriptor,
}

/// Engine-wide settings applied whenever a camera is opened.
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    /// None means the device default.
    pub focus_mode: Option<FocusMode>,
    /// Flash modes in priority-first order. The first one the camera
    /// supports is used; when none is supported the device default is kept.
    pub flash_modes: Vec<FlashMode>,
    /// Raises per-engine diagnostics to info level.
    pub debug: bool,
}

impl EngineConfig {
    pub fn choose_flash_mode(&self, descriptor: &CameraDescriptor) -> Option<FlashMode> {
        self.flash_modes.iter().copied()
            .find(|mode| descriptor.flash_modes.contains(mode))
    }

    pub fn choose_focus_mode(&self, descriptor: &CameraDescriptor) -> Option<FocusMode> {
        self.focus_mode.filter(|mode| descriptor.focus_modes.contains(mode))
    }
}

/// Result of a zoom request that was actually initiated.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ZoomChange {
    /// The clamped level being moved to.
    pub level: u32,
    /// If true, the change animates and a SmoothZoomCompleted notification
    /// follows; otherwise the change is already in effect.
    pub smooth: bool,
}

/// CameraEngine models one driver generation. All hardware work happens on
/// a background context owned by the engine; methods here only validate
/// and enqueue, so they never block the caller. Completion of open() and
/// capture() is reported solely through the event bus.
pub trait CameraEngine: Send {
    fn id(&self) -> EngineId;

    /// Connects the engine to the bus it publishes on. Must precede open().
    fn attach(&mut self, publisher: EventPublisher);

    fn config(&self) -> &EngineConfig;
    fn config_mut(&mut self) -> &mut EngineConfig;

    /// Returns the cameras usable under `criteria`, most preferred first.
    /// The driver is queried lazily, on the first call only. Returns
    /// NoSuchCamera if nothing matches.
    fn enumerate(&mut self, criteria: &SelectionCriteria)
                 -> Result<Vec<CameraDescriptor>, CameraError>;

    /// Begins opening `descriptor`. The returned handle is not usable until
    /// an EngineOpened notification for it arrives; that notification
    /// carries a fault if the driver could not open the camera.
    fn open(&mut self, descriptor: &CameraDescriptor)
            -> Result<EngineHandle, CameraError>;

    /// Idempotent. Any open() issued afterwards starts only once the close
    /// has finished.
    fn close(&mut self, handle: &EngineHandle);

    fn start_preview(&mut self, handle: &EngineHandle) -> Result<(), CameraError>;
    fn stop_preview(&mut self, handle: &EngineHandle) -> Result<(), CameraError>;

    /// Begins a capture whose frame is run through `transaction`. Only one
    /// capture may be outstanding; a second fails with CaptureBusy.
    fn capture(&mut self, handle: &EngineHandle,
               transaction: Arc<PictureTransaction>) -> Result<(), CameraError>;

    /// Current zoom level of an open handle.
    fn zoom_level(&self, handle: &EngineHandle) -> Option<u32>;

    /// Moves zoom by `delta` levels, clamped to [0, max_zoom]. Returns None
    /// if nothing was initiated (unsupported, already at the bound, or the
    /// handle is not open).
    fn change_zoom(&mut self, handle: &EngineHandle, delta: i32) -> Option<ZoomChange>;

    /// As change_zoom(), to an absolute level.
    fn set_zoom(&mut self, handle: &EngineHandle, level: u32) -> Option<ZoomChange>;
}
