// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// CameraEngine implementation shared by both driver generations. The
// generation-specific parts (how devices are described, how a zoom level is
// expressed to the driver) come from a DriverGeneration policy.
//
// All driver calls run on a worker task that owns the open driver sessions
// and executes commands strictly in the order they were issued. This is
// what makes a close() finish before a following open() starts, and what
// keeps the notifications of a handle in completion order.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error};
use log::{Level, debug, log, warn};
use tokio::sync::mpsc;

use crate::abstract_engine::{CameraDescriptor, CameraEngine, EngineConfig, EngineHandle,
                             EngineId, HandleId, SelectionCriteria, ZoomChange};
use crate::camera_error::CameraError;
use crate::driver::{CameraDriver, DeviceInfo, DriverSession, RawFrame, SessionSetup,
                    ZoomSetting};
use crate::event_bus::{CameraEvent, EventPublisher, PictureArtifact};
use crate::image_buffer::{ExifModel, ImageBuffer};
use crate::picture_transaction::PictureTransaction;

/// Pause between the steps of a smooth zoom.
const SMOOTH_ZOOM_STEP: Duration = Duration::from_millis(5);

pub trait DriverGeneration: Send + Sync + 'static {
    const ID: EngineId;

    /// Turns the driver's device list into descriptors, in enumeration
    /// order.
    fn describe(devices: &[DeviceInfo]) -> Vec<CameraDescriptor>;

    /// Expresses zoom `level` (in [0, max_zoom]) the way the driver wants
    /// it.
    fn zoom_setting(device: &DeviceInfo, max_zoom: u32, level: u32) -> ZoomSetting;
}

/// Decodes a driver frame into a buffer. Frames that do not state their
/// orientation get the camera's sensor orientation.
pub fn frame_to_buffer(frame: RawFrame, descriptor: &CameraDescriptor)
                       -> Result<ImageBuffer, CanonicalError> {
    match frame {
        RawFrame::Jpeg(bytes) => ImageBuffer::from_jpeg(&bytes),
        RawFrame::Pixels{image, orientation} => {
            let exif = match orientation {
                Some(exif) => exif,
                None => ExifModel::from_rotation(descriptor.sensor_orientation, false)?,
            };
            Ok(ImageBuffer::new(image, exif))
        }
    }
}

// Zoom of one open camera. `requested` is the level last asked of the
// driver, `reached` the level the driver has applied. A request that fails
// rolls `requested` back to `reached` unless a newer one replaced it.
#[derive(Default)]
struct ZoomTrack {
    requested: AtomicU32,
    reached: AtomicU32,
}

// Engine-side view of an open (or opening) camera.
struct OpenCamera {
    descriptor: CameraDescriptor,
    device: DeviceInfo,
    zoom: Arc<ZoomTrack>,
}

enum Command {
    Open { handle: HandleId, device_id: String, setup: SessionSetup },
    Close { handle: HandleId },
    Preview { handle: HandleId, enabled: bool },
    // `steps` are (level, setting) pairs applied in turn, ending at
    // `target`. A smooth zoom always announces where it stopped.
    Zoom { handle: HandleId, steps: Vec<(u32, ZoomSetting)>, target: u32, smooth: bool,
           track: Arc<ZoomTrack> },
    Capture { handle: HandleId, descriptor: CameraDescriptor,
              transaction: Arc<PictureTransaction> },
}

pub struct DriverEngine<G: DriverGeneration> {
    driver: Arc<dyn CameraDriver>,
    config: EngineConfig,
    publisher: Option<EventPublisher>,

    // Filled on first enumeration.
    devices: Option<Vec<DeviceInfo>>,
    descriptors: Option<Vec<CameraDescriptor>>,

    next_handle: u64,
    open_cameras: HashMap<HandleId, OpenCamera>,

    // Set while a capture is in flight; cleared by the worker just before
    // the capture's PictureTaken is published.
    capturing: Arc<AtomicBool>,

    // Started by the first open().
    commands: Option<mpsc::UnboundedSender<Command>>,

    _generation: PhantomData<G>,
}

impl<G: DriverGeneration> DriverEngine<G> {
    pub fn new(driver: Arc<dyn CameraDriver>, config: EngineConfig) -> Self {
        DriverEngine{driver,
                     config,
                     publisher: None,
                     devices: None,
                     descriptors: None,
                     next_handle: 1,
                     open_cameras: HashMap::new(),
                     capturing: Arc::new(AtomicBool::new(false)),
                     commands: None,
                     _generation: PhantomData}
    }

    fn log_level(&self) -> Level {
        if self.config.debug { Level::Info } else { Level::Debug }
    }

    fn load_devices(&mut self) -> Result<(), CameraError> {
        if self.devices.is_none() {
            let devices = self.driver.devices().map_err(|e| CameraError::fatal(&e))?;
            log!(self.log_level(), "{} engine found {} cameras", G::ID, devices.len());
            self.descriptors = Some(G::describe(&devices));
            self.devices = Some(devices);
        }
        Ok(())
    }

    fn worker(&mut self) -> Result<&mpsc::UnboundedSender<Command>, CameraError> {
        if self.commands.is_none() {
            let Some(publisher) = self.publisher.clone() else {
                return Err(CameraError::invalid_state("open", "engine not attached to a bus"));
            };
            let runtime = tokio::runtime::Handle::try_current()
                .map_err(|e| CameraError::FatalEngine(e.to_string()))?;
            let (sender, receiver) = mpsc::unbounded_channel();
            runtime.spawn(run_worker(self.driver.clone(), publisher,
                                     self.capturing.clone(), self.log_level(), receiver));
            self.commands = Some(sender);
        }
        // Just set if it was absent.
        self.commands.as_ref()
            .ok_or_else(|| CameraError::FatalEngine("worker not running".to_string()))
    }

    fn send(&self, command: Command) {
        match &self.commands {
            Some(sender) => {
                if sender.send(command).is_err() {
                    warn!("{} engine worker has exited", G::ID);
                }
            },
            None => debug!("{} engine worker not started", G::ID),
        }
    }

    fn checked_handle(&self, operation: &'static str, handle: &EngineHandle)
                      -> Result<&OpenCamera, CameraError> {
        self.open_cameras.get(&handle.id)
            .ok_or_else(|| CameraError::invalid_state(operation, handle.id))
    }
}

impl<G: DriverGeneration> CameraEngine for DriverEngine<G> {
    fn id(&self) -> EngineId {
        G::ID
    }

    fn attach(&mut self, publisher: EventPublisher) {
        self.publisher = Some(publisher);
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    fn enumerate(&mut self, criteria: &SelectionCriteria)
                 -> Result<Vec<CameraDescriptor>, CameraError> {
        self.load_devices()?;
        let ranked = criteria.rank(self.descriptors.as_deref().unwrap_or_default());
        if ranked.is_empty() {
            return Err(CameraError::NoSuchCamera(
                format!("no camera matches {:?}", criteria)));
        }
        Ok(ranked)
    }

    fn open(&mut self, descriptor: &CameraDescriptor) -> Result<EngineHandle, CameraError> {
        self.load_devices()?;
        let device = self.devices.iter().flatten()
            .find(|d| d.id == descriptor.device_id)
            .cloned()
            .ok_or_else(|| CameraError::NoSuchCamera(
                format!("camera {} is gone", descriptor.device_id)))?;
        let setup = SessionSetup{flash_mode: self.config.choose_flash_mode(descriptor),
                                 focus_mode: self.config.choose_focus_mode(descriptor)};
        let id = HandleId(self.next_handle);
        self.worker()?.send(Command::Open{handle: id,
                                          device_id: device.id.clone(),
                                          setup})
            .map_err(|_| CameraError::FatalEngine("engine worker has exited".to_string()))?;
        self.next_handle += 1;
        log!(self.log_level(), "{} engine opening camera {} as {} with {:?}",
             G::ID, descriptor.device_id, id, setup);
        self.open_cameras.insert(id, OpenCamera{descriptor: descriptor.clone(),
                                                device,
                                                zoom: Arc::new(ZoomTrack::default())});
        Ok(EngineHandle{id, descriptor: descriptor.clone()})
    }

    fn close(&mut self, handle: &EngineHandle) {
        if self.open_cameras.remove(&handle.id).is_some() {
            log!(self.log_level(), "{} engine closing {}", G::ID, handle.id);
            self.send(Command::Close{handle: handle.id});
        }
    }

    fn start_preview(&mut self, handle: &EngineHandle) -> Result<(), CameraError> {
        self.checked_handle("start_preview", handle)?;
        self.send(Command::Preview{handle: handle.id, enabled: true});
        Ok(())
    }

    fn stop_preview(&mut self, handle: &EngineHandle) -> Result<(), CameraError> {
        self.checked_handle("stop_preview", handle)?;
        self.send(Command::Preview{handle: handle.id, enabled: false});
        Ok(())
    }

    fn capture(&mut self, handle: &EngineHandle,
               transaction: Arc<PictureTransaction>) -> Result<(), CameraError> {
        let descriptor = self.checked_handle("capture", handle)?.descriptor.clone();
        if self.capturing.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CameraError::CaptureBusy);
        }
        self.send(Command::Capture{handle: handle.id, descriptor, transaction});
        Ok(())
    }

    fn zoom_level(&self, handle: &EngineHandle) -> Option<u32> {
        self.open_cameras.get(&handle.id).map(|c| c.zoom.requested.load(Ordering::SeqCst))
    }

    fn change_zoom(&mut self, handle: &EngineHandle, delta: i32) -> Option<ZoomChange> {
        let camera = self.open_cameras.get(&handle.id)?;
        let max = camera.descriptor.max_zoom as i64;
        let current = camera.zoom.requested.load(Ordering::SeqCst);
        let level = (current as i64 + delta as i64).clamp(0, max);
        self.set_zoom(handle, level as u32)
    }

    fn set_zoom(&mut self, handle: &EngineHandle, level: u32) -> Option<ZoomChange> {
        let camera = self.open_cameras.get(&handle.id)?;
        if !camera.descriptor.zoom_supported() {
            return None;
        }
        let max_zoom = camera.descriptor.max_zoom;
        let target = level.min(max_zoom);
        let from = camera.zoom.requested.load(Ordering::SeqCst);
        if target == from {
            return None;
        }
        let smooth = camera.descriptor.smooth_zoom;
        let levels: Vec<u32> = if !smooth {
            vec![target]
        } else if target > from {
            (from + 1..=target).collect()
        } else {
            (target..from).rev().collect()
        };
        let steps = levels.into_iter()
            .map(|l| (l, G::zoom_setting(&camera.device, max_zoom, l)))
            .collect();
        camera.zoom.requested.store(target, Ordering::SeqCst);
        let track = camera.zoom.clone();
        self.send(Command::Zoom{handle: handle.id, steps, target, smooth, track});
        Some(ZoomChange{level: target, smooth})
    }
}

async fn run_worker(driver: Arc<dyn CameraDriver>,
                    publisher: EventPublisher,
                    capturing: Arc<AtomicBool>,
                    level: Level,
                    mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut sessions: HashMap<HandleId, Box<dyn DriverSession>> = HashMap::new();
    while let Some(command) = commands.recv().await {
        match command {
            Command::Open{handle, device_id, setup} => {
                match driver.open(&device_id, &setup).await {
                    Ok(session) => {
                        log!(level, "Opened camera {} as {}", device_id, handle);
                        sessions.insert(handle, session);
                        publisher.publish(CameraEvent::EngineOpened{handle, fault: None});
                    },
                    Err(e) => {
                        warn!("Could not open camera {}: {}", device_id, e);
                        publisher.publish(CameraEvent::EngineOpened{
                            handle, fault: Some(CameraError::engine_open(&e))});
                    }
                }
            },
            Command::Close{handle} => {
                if let Some(mut session) = sessions.remove(&handle) {
                    session.close().await;
                    log!(level, "Closed {}", handle);
                }
            },
            Command::Preview{handle, enabled} => {
                let Some(session) = sessions.get_mut(&handle) else {
                    debug!("Preview change for {} which is not open", handle);
                    continue;
                };
                if let Err(e) = session.set_preview(enabled).await {
                    publisher.publish(CameraEvent::FatalEngineFault{
                        fault: CameraError::fatal(&e)});
                }
            },
            Command::Zoom{handle, steps, target, smooth, track} => {
                let Some(session) = sessions.get_mut(&handle) else {
                    debug!("Zoom change for {} which is not open", handle);
                    continue;
                };
                let count = steps.len();
                let mut fault = None;
                for (i, (zoom, setting)) in steps.into_iter().enumerate() {
                    if let Err(e) = session.apply_zoom(setting).await {
                        warn!("Zoom to {:?} failed: {}", setting, e);
                        fault = Some(CameraError::driver(&e));
                        break;
                    }
                    track.reached.store(zoom, Ordering::SeqCst);
                    if smooth && i + 1 < count {
                        tokio::time::sleep(SMOOTH_ZOOM_STEP).await;
                    }
                }
                let reached = track.reached.load(Ordering::SeqCst);
                let rolled_back = fault.is_some() &&
                    track.requested.compare_exchange(target, reached, Ordering::SeqCst,
                                                     Ordering::SeqCst).is_ok();
                if smooth || rolled_back {
                    publisher.publish(CameraEvent::SmoothZoomCompleted{
                        handle, level: reached, fault});
                }
            },
            Command::Capture{handle, descriptor, transaction} => {
                let result = capture(sessions.get_mut(&handle), descriptor, transaction).await;
                match &result {
                    Ok(artifact) => log!(level, "Picture taken on {}: {}x{}",
                                         handle, artifact.width, artifact.height),
                    Err(e) => warn!("Picture on {} failed: {}", handle, e),
                }
                capturing.store(false, Ordering::SeqCst);
                publisher.publish(CameraEvent::PictureTaken{handle, result});
            },
        }
    }
    // The engine is gone; release whatever is still open.
    for (handle, mut session) in sessions.drain() {
        debug!("Releasing {} on engine shutdown", handle);
        session.close().await;
    }
}

async fn capture(session: Option<&mut Box<dyn DriverSession>>,
                 descriptor: CameraDescriptor,
                 transaction: Arc<PictureTransaction>)
                 -> Result<PictureArtifact, CameraError> {
    let Some(session) = session else {
        return Err(CameraError::fatal(&invalid_argument_error("camera is not open")));
    };
    let frame = session.capture_still().await.map_err(|e| CameraError::driver(&e))?;
    // Decoding and the stage chain are CPU and I/O bound.
    tokio::task::spawn_blocking(move || {
        let buffer = frame_to_buffer(frame, &descriptor)
            .map_err(|e| CameraError::Processing(e.to_string()))?;
        transaction.process(buffer).map(ImageBuffer::into_artifact)
    }).await
        .map_err(|e| CameraError::Processing(format!("processing aborted: {}", e)))?
}
