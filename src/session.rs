// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Wires one camera session together: bus, engine, controller, and the
// default picture transaction derived from the configuration.

use std::sync::Arc;

use canonical_error::{CanonicalError, failed_precondition_error, not_found_error,
                      unavailable_error};
use log::info;

use crate::abstract_engine::CameraEngine;
use crate::camera_controller::CameraController;
use crate::camera_error::CameraError;
use crate::driver::CameraDriver;
use crate::event_bus::{CameraEvent, EventBus, Subscription};
use crate::picture_transaction::PictureTransaction;
use crate::select_engine::select_engine;
use crate::session_config::SessionConfig;

/// Application-specific customization supplied when a session is built.
pub trait SessionStrategy: Send + Sync {
    /// Last chance to adjust the engine before any camera is opened.
    fn configure_engine(&self, _engine: &mut dyn CameraEngine) {}

    /// Permissions the session cannot run without.
    fn needed_permissions(&self) -> Vec<String> {
        vec![]
    }

    fn has_permission(&self, _permission: &str) -> bool {
        true
    }
}

/// Needs nothing, changes nothing.
pub struct DefaultStrategy;

impl SessionStrategy for DefaultStrategy {}

pub struct CameraSession {
    bus: EventBus,
    config: SessionConfig,
    controller: CameraController,
    transaction: Arc<PictureTransaction>,
}

impl CameraSession {
    pub fn new(config: SessionConfig,
               driver: Arc<dyn CameraDriver>,
               strategy: &dyn SessionStrategy) -> Result<Self, CanonicalError> {
        Self::with_bus(EventBus::new(), config, driver, strategy)
    }

    /// As new(), on a caller-supplied bus. Subscribe to `bus` beforehand to
    /// observe notifications raised while the session is assembled, such
    /// as NoSuchCamera.
    pub fn with_bus(bus: EventBus,
                    config: SessionConfig,
                    driver: Arc<dyn CameraDriver>,
                    strategy: &dyn SessionStrategy) -> Result<Self, CanonicalError> {
        config.validate()?;
        let missing: Vec<String> = strategy.needed_permissions().into_iter()
            .filter(|p| !strategy.has_permission(p))
            .collect();
        if !missing.is_empty() {
            return Err(failed_precondition_error(
                format!("Missing permissions: {}", missing.join(", ")).as_str()));
        }

        let mut engine = select_engine(config.forced_engine, driver, config.engine_config())?;
        strategy.configure_engine(engine.as_mut());

        let mut controller = CameraController::new(&bus).with_zoom_style(config.zoom_style);
        controller.set_engine(engine, config.criteria()).map_err(|e| match e {
            CameraError::NoSuchCamera(msg) => not_found_error(msg.as_str()),
            other => unavailable_error(other.to_string().as_str()),
        })?;
        info!("Session {:?} assembled for {:?} camera", controller.id(), config.facing);
        let transaction = Arc::new(config.picture_transaction());
        Ok(CameraSession{bus, config, controller, transaction})
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Notifications of this session only.
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe_to(self.controller.id())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn controller(&self) -> &CameraController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut CameraController {
        &mut self.controller
    }

    /// The transaction take_picture() uses.
    pub fn transaction(&self) -> Arc<PictureTransaction> {
        self.transaction.clone()
    }

    pub fn start(&mut self) -> Result<(), CameraError> {
        self.controller.start()
    }

    pub fn stop(&mut self, config_change: bool) -> Result<(), CameraError> {
        self.controller.stop(config_change)
    }

    pub fn destroy(&mut self) {
        self.controller.destroy()
    }

    pub fn switch_camera(&mut self) -> Result<(), CameraError> {
        self.controller.switch_camera()
    }

    pub fn take_picture(&mut self) -> Result<(), CameraError> {
        self.controller.take_picture(self.transaction.clone())
    }

    pub fn take_picture_with(&mut self, transaction: Arc<PictureTransaction>)
                             -> Result<(), CameraError> {
        self.controller.take_picture(transaction)
    }

    pub fn change_zoom(&mut self, delta: i32) -> bool {
        self.controller.change_zoom(delta)
    }

    pub fn set_zoom(&mut self, level: u32) -> bool {
        self.controller.set_zoom(level)
    }

    /// Applies the next notification of this session; see
    /// CameraController::pump().
    pub async fn pump(&mut self) -> Option<CameraEvent> {
        self.controller.pump().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};
    use crate::abstract_engine::{EngineId, Facing, FlashMode};
    use crate::camera_controller::ControllerState;
    use crate::image_driver::ImageDriver;

    fn driver() -> Arc<dyn CameraDriver> {
        Arc::new(ImageDriver::new(DynamicImage::ImageRgb8(RgbImage::new(8, 8)))
                 .with_camera(Facing::Back, 0))
    }

    struct Strict {
        granted: bool,
    }

    impl SessionStrategy for Strict {
        fn configure_engine(&self, engine: &mut dyn CameraEngine) {
            engine.config_mut().flash_modes = vec![FlashMode::Auto];
        }

        fn needed_permissions(&self) -> Vec<String> {
            vec!["camera".to_string()]
        }

        fn has_permission(&self, _permission: &str) -> bool {
            self.granted
        }
    }

    #[test]
    fn test_missing_permission_fails_fast() {
        let result = CameraSession::new(SessionConfig::default(), driver(),
                                        &Strict{granted: false});
        assert!(result.is_err());
    }

    #[test]
    fn test_strategy_configures_engine() {
        let session = CameraSession::new(SessionConfig::default(), driver(),
                                         &Strict{granted: true}).unwrap();
        let engine = session.controller().engine().unwrap();
        assert_eq!(engine.config().flash_modes, vec![FlashMode::Auto]);
        assert_eq!(engine.id(), EngineId::Classic);
        assert_eq!(session.controller().state(), ControllerState::EngineAssigned);
    }

    #[test]
    fn test_exact_match_miss_announces_no_such_camera() {
        let bus = EventBus::new();
        let mut observer = bus.subscribe();
        let config = SessionConfig{facing: Facing::Front, exact_match: true,
                                   ..Default::default()};
        assert!(CameraSession::with_bus(bus, config, driver(), &DefaultStrategy).is_err());
        assert!(matches!(observer.try_recv().unwrap().event,
                         CameraEvent::NoSuchCamera{..}));
        assert!(matches!(observer.try_recv().unwrap().event,
                         CameraEvent::ControllerDestroyed));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SessionConfig{jpeg_quality: 200, ..Default::default()};
        assert!(CameraSession::new(config, driver(), &DefaultStrategy).is_err());
    }
}
