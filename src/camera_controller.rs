// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Session state machine. The controller owns the engine and the current
// handle; requests are validated against the current state and either
// rejected at once or handed to the engine, whose completions come back
// through the bus and are applied by pump().

use std::sync::Arc;

use log::{debug, info, warn};

use crate::abstract_engine::{CameraDescriptor, CameraEngine, EngineHandle, HandleId,
                             SelectionCriteria, ZoomChange};
use crate::camera_error::CameraError;
use crate::event_bus::{CameraEvent, ControllerId, EventBus, EventPublisher, Inbox};
use crate::picture_transaction::PictureTransaction;
use crate::session_config::ZoomStyle;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusyKind {
    Capturing, Switching,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Uninitialized,
    EngineAssigned,
    Starting,
    Ready,
    Busy(BusyKind),
    Stopped,
    Destroyed,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ZoomState {
    pub level: u32,
    pub smooth_in_progress: bool,
}

pub struct CameraController {
    id: ControllerId,
    publisher: EventPublisher,
    // Everything `publisher` sends, the engine's completions included.
    events: Inbox,
    state: ControllerState,
    engine: Option<Box<dyn CameraEngine>>,
    criteria: SelectionCriteria,
    zoom_style: ZoomStyle,

    // Usable cameras, most preferred first, and which one is selected.
    descriptors: Vec<CameraDescriptor>,
    selected: usize,

    // The open camera. Still set while Stopped if the stop expected a
    // configuration change.
    current: Option<EngineHandle>,
    // Camera being opened while Starting or switching.
    pending: Option<EngineHandle>,

    zoom: ZoomState,
}

impl CameraController {
    /// A controller registered on `bus`. Its notifications carry its own
    /// ControllerId.
    pub fn new(bus: &EventBus) -> Self {
        let id = bus.register_controller();
        let (publisher, events) = bus.publisher_with_inbox(id);
        CameraController{id,
                         publisher,
                         events,
                         state: ControllerState::Uninitialized,
                         engine: None,
                         criteria: SelectionCriteria::default(),
                         zoom_style: ZoomStyle::Pinch,
                         descriptors: vec![],
                         selected: 0,
                         current: None,
                         pending: None,
                         zoom: ZoomState::default()}
    }

    pub fn with_zoom_style(mut self, zoom_style: ZoomStyle) -> Self {
        self.zoom_style = zoom_style;
        self
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn current_handle(&self) -> Option<&EngineHandle> {
        self.current.as_ref()
    }

    pub fn zoom(&self) -> ZoomState {
        self.zoom
    }

    pub fn engine(&self) -> Option<&dyn CameraEngine> {
        self.engine.as_deref()
    }

    pub fn engine_mut(&mut self) -> Option<&mut (dyn CameraEngine + 'static)> {
        self.engine.as_deref_mut()
    }

    /// Installs the engine and resolves the cameras `criteria` allows.
    /// If none does, NoSuchCamera is announced and the session ends.
    pub fn set_engine(&mut self, mut engine: Box<dyn CameraEngine>,
                      criteria: SelectionCriteria) -> Result<(), CameraError> {
        if self.state != ControllerState::Uninitialized {
            return Err(CameraError::invalid_state("set_engine", self.state));
        }
        engine.attach(self.publisher.clone());
        self.criteria = criteria;
        let descriptors = match engine.enumerate(&criteria) {
            Ok(descriptors) => descriptors,
            Err(e) => {
                self.engine = Some(engine);
                match &e {
                    CameraError::NoSuchCamera(_) => {
                        warn!("No camera for {:?}", criteria);
                        self.publisher.publish(CameraEvent::NoSuchCamera{criteria});
                    },
                    _ => self.publisher.publish(CameraEvent::FatalEngineFault{
                        fault: e.clone()}),
                }
                self.terminate();
                return Err(e);
            }
        };
        if descriptors[0].facing != criteria.facing {
            info!("No {:?} camera; using {:?} camera {}",
                  criteria.facing, descriptors[0].facing, descriptors[0].device_id);
        }
        info!("{} engine assigned with {} usable cameras",
              engine.id(), descriptors.len());
        self.descriptors = descriptors;
        self.selected = 0;
        self.engine = Some(engine);
        self.state = ControllerState::EngineAssigned;
        Ok(())
    }

    /// Opens the selected camera; Ready follows its EngineOpened. From
    /// Stopped with the camera still open, preview resumes at once.
    pub fn start(&mut self) -> Result<(), CameraError> {
        match self.state {
            ControllerState::EngineAssigned => self.open_selected(ControllerState::Starting),
            ControllerState::Stopped => {
                let Some(handle) = self.current.clone() else {
                    return self.open_selected(ControllerState::Starting);
                };
                self.engine_ref()?.start_preview(&handle)?;
                self.state = ControllerState::Ready;
                self.publisher.publish(CameraEvent::ControllerReady{handle});
                Ok(())
            },
            state => Err(CameraError::invalid_state("start", state)),
        }
    }

    /// Captures one picture and runs it through `transaction`. The outcome
    /// is the PictureTaken notification.
    pub fn take_picture(&mut self, transaction: Arc<PictureTransaction>)
                        -> Result<(), CameraError> {
        match self.state {
            ControllerState::Ready => (),
            ControllerState::Busy(BusyKind::Capturing) => return Err(CameraError::CaptureBusy),
            state => return Err(CameraError::invalid_state("take_picture", state)),
        }
        let handle = self.current.clone()
            .ok_or_else(|| CameraError::invalid_state("take_picture", "no open camera"))?;
        self.engine_ref()?.capture(&handle, transaction)?;
        self.state = ControllerState::Busy(BusyKind::Capturing);
        Ok(())
    }

    /// Moves to the next camera facing the other way. The current camera
    /// is closed before the new one is opened; ControllerReady follows.
    pub fn switch_camera(&mut self) -> Result<(), CameraError> {
        if self.state != ControllerState::Ready {
            return Err(CameraError::invalid_state("switch_camera", self.state));
        }
        if self.criteria.exact_match {
            return Err(CameraError::invalid_state("switch_camera",
                                                  "exact facing match required"));
        }
        let Some(current) = self.current.clone() else {
            return Err(CameraError::invalid_state("switch_camera", "no open camera"));
        };
        let count = self.descriptors.len();
        let next = (1..count)
            .map(|offset| (self.selected + offset) % count)
            .find(|&i| self.descriptors[i].facing != current.descriptor.facing)
            .ok_or_else(|| CameraError::NoSuchCamera(
                format!("no {:?} camera to switch to", current.descriptor.facing.opposite())))?;

        let engine = self.engine_ref()?;
        if let Err(e) = engine.stop_preview(&current) {
            debug!("stop_preview before switch: {}", e);
        }
        engine.close(&current);
        self.current = None;
        self.selected = next;
        info!("Switching from camera {} to {}",
              current.descriptor.device_id, self.descriptors[next].device_id);
        self.open_selected(ControllerState::Busy(BusyKind::Switching))
    }

    /// Stops preview and refuses further pictures. With `config_change`
    /// the camera stays open so a later start() resumes without reopening.
    /// An in-flight capture still completes.
    pub fn stop(&mut self, config_change: bool) -> Result<(), CameraError> {
        match self.state {
            ControllerState::Ready | ControllerState::Busy(_) | ControllerState::Starting => (),
            ControllerState::Stopped => return Ok(()),
            state => return Err(CameraError::invalid_state("stop", state)),
        }
        let pending = self.pending.take();
        let current = if config_change { self.current.clone() } else { self.current.take() };
        let engine = self.engine_ref()?;
        if let Some(handle) = pending {
            engine.close(&handle);
        }
        if let Some(handle) = &current {
            if let Err(e) = engine.stop_preview(handle) {
                debug!("stop_preview on stop: {}", e);
            }
            if !config_change {
                engine.close(handle);
            }
        }
        self.zoom.smooth_in_progress = false;
        self.state = ControllerState::Stopped;
        info!("Controller {:?} stopped{}", self.id,
              if config_change { " for configuration change" } else { "" });
        Ok(())
    }

    /// Releases the engine and every camera. Terminal; repeated calls do
    /// nothing.
    pub fn destroy(&mut self) {
        self.terminate();
    }

    /// Moves zoom by `delta` levels. False if nothing was initiated.
    pub fn change_zoom(&mut self, delta: i32) -> bool {
        self.zoom_with(|engine, handle| engine.change_zoom(handle, delta))
    }

    /// Moves zoom to `level`, clamped to the camera's range. False if
    /// nothing was initiated.
    pub fn set_zoom(&mut self, level: u32) -> bool {
        self.zoom_with(|engine, handle| engine.set_zoom(handle, level))
    }

    fn zoom_with<F>(&mut self, request: F) -> bool
    where F: FnOnce(&mut dyn CameraEngine, &EngineHandle) -> Option<ZoomChange>
    {
        if self.state != ControllerState::Ready || self.zoom_style == ZoomStyle::None ||
            self.zoom.smooth_in_progress
        {
            return false;
        }
        let (Some(engine), Some(handle)) = (self.engine.as_deref_mut(), self.current.as_ref())
        else {
            return false;
        };
        match request(engine, handle) {
            Some(change) => {
                self.zoom = ZoomState{level: change.level, smooth_in_progress: change.smooth};
                true
            },
            None => false,
        }
    }

    /// Waits for the next notification addressed to this controller and
    /// applies it. The event is returned so a caller can react to it too.
    /// Nothing is lost however busy the shared bus is.
    pub async fn pump(&mut self) -> Option<CameraEvent> {
        let notification = self.events.recv().await?;
        self.apply(&notification.event);
        Some(notification.event)
    }

    /// Applies every notification already queued, without waiting.
    pub fn pump_pending(&mut self) -> Vec<CameraEvent> {
        let mut applied = Vec::new();
        while let Some(notification) = self.events.try_recv() {
            self.apply(&notification.event);
            applied.push(notification.event);
        }
        applied
    }

    fn apply(&mut self, event: &CameraEvent) {
        match event {
            CameraEvent::EngineOpened{handle, fault} => self.on_opened(*handle, fault),
            CameraEvent::PictureTaken{result, ..} => {
                if self.state == ControllerState::Busy(BusyKind::Capturing) {
                    self.state = ControllerState::Ready;
                }
                if let Err(fault) = result {
                    if fault.is_session_fatal() && self.state != ControllerState::Destroyed {
                        self.publisher.publish(CameraEvent::FatalEngineFault{
                            fault: fault.clone()});
                        self.terminate();
                    }
                }
            },
            CameraEvent::SmoothZoomCompleted{handle, level, fault} => {
                if self.current.as_ref().map(|h| h.id) != Some(*handle) {
                    debug!("Ignoring zoom completion for stale {}", handle);
                    return;
                }
                if let Some(fault) = fault {
                    warn!("Zoom stopped at level {}: {}", level, fault);
                }
                self.zoom = ZoomState{level: *level, smooth_in_progress: false};
            },
            CameraEvent::FatalEngineFault{fault} => {
                if self.state != ControllerState::Destroyed {
                    warn!("Fatal engine fault: {}", fault);
                    self.terminate();
                }
            },
            // Our own announcements.
            CameraEvent::ControllerReady{..} | CameraEvent::NoSuchCamera{..} |
            CameraEvent::ControllerDestroyed => (),
        }
    }

    fn on_opened(&mut self, handle: HandleId, fault: &Option<CameraError>) {
        if self.pending.as_ref().map(|h| h.id) != Some(handle) {
            debug!("Ignoring EngineOpened for stale {}", handle);
            return;
        }
        let Some(opened) = self.pending.take() else { return };
        if let Some(fault) = fault {
            warn!("Could not open camera {}: {}", opened.descriptor.device_id, fault);
            self.terminate();
            return;
        }
        if let Some(engine) = self.engine.as_deref_mut() {
            if let Err(e) = engine.start_preview(&opened) {
                warn!("start_preview failed: {}", e);
            }
        }
        self.current = Some(opened.clone());
        self.zoom = ZoomState::default();
        self.state = ControllerState::Ready;
        info!("Controller {:?} ready on camera {}", self.id, opened.descriptor.device_id);
        self.publisher.publish(CameraEvent::ControllerReady{handle: opened});
    }

    fn open_selected(&mut self, next_state: ControllerState) -> Result<(), CameraError> {
        let descriptor = self.descriptors.get(self.selected).cloned()
            .ok_or_else(|| CameraError::invalid_state("start", "no camera selected"))?;
        let opened = self.engine_ref()?.open(&descriptor);
        match opened {
            Ok(handle) => {
                self.pending = Some(handle);
                self.state = next_state;
                Ok(())
            },
            Err(e) => {
                if e.is_session_fatal() {
                    self.publisher.publish(CameraEvent::FatalEngineFault{fault: e.clone()});
                    self.terminate();
                }
                Err(e)
            }
        }
    }

    fn engine_ref(&mut self) -> Result<&mut (dyn CameraEngine + 'static), CameraError> {
        let state = self.state;
        self.engine.as_deref_mut()
            .ok_or_else(|| CameraError::invalid_state("engine access", state))
    }

    fn terminate(&mut self) {
        if self.state == ControllerState::Destroyed {
            return;
        }
        if let Some(mut engine) = self.engine.take() {
            for handle in self.current.take().into_iter().chain(self.pending.take()) {
                engine.close(&handle);
            }
        }
        self.state = ControllerState::Destroyed;
        info!("Controller {:?} destroyed", self.id);
        self.publisher.publish(CameraEvent::ControllerDestroyed);
    }
}
