// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;

use canonical_error::{CanonicalError, failed_precondition_error};
use log::info;

use crate::abstract_engine::{CameraEngine, EngineConfig, EngineId};
use crate::classic_engine::ClassicEngine;
use crate::driver::CameraDriver;
use crate::modern_engine::ModernEngine;

// Chooses the engine generation for a session; the choice is never revisited.
// * If `forced` is given, that generation is used. Forcing Modern on a device
//   that lacks the modern driver interface is an error.
// * Otherwise the driver's capability probe decides: Modern where supported,
//   Classic elsewhere.
pub fn select_engine(forced: Option<EngineId>,
                     driver: Arc<dyn CameraDriver>,
                     config: EngineConfig)
                     -> Result<Box<dyn CameraEngine>, CanonicalError> {
    let modern_available = driver.supports_modern_api();
    let id = match forced {
        Some(EngineId::Modern) if !modern_available => {
            return Err(failed_precondition_error(
                "Modern engine was requested but the device only supports Classic"));
        },
        Some(id) => id,
        None if modern_available => EngineId::Modern,
        None => EngineId::Classic,
    };
    info!("Using {} engine{}", id, if forced.is_some() { " (forced)" } else { "" });
    match id {
        EngineId::Classic => Ok(Box::new(ClassicEngine::new(driver, config))),
        EngineId::Modern => Ok(Box::new(ModernEngine::new(driver, config))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};
    use crate::abstract_engine::Facing;
    use crate::image_driver::ImageDriver;

    fn driver(modern: bool) -> Arc<dyn CameraDriver> {
        Arc::new(ImageDriver::new(DynamicImage::ImageRgb8(RgbImage::new(8, 8)))
                 .with_camera(Facing::Back, 0)
                 .with_modern_api(modern))
    }

    #[test]
    fn test_capability_decides_engine() {
        let config = EngineConfig::default();
        assert_eq!(select_engine(None, driver(true), config.clone()).unwrap().id(),
                   EngineId::Modern);
        assert_eq!(select_engine(None, driver(false), config).unwrap().id(),
                   EngineId::Classic);
    }

    #[test]
    fn test_forced() {
        let config = EngineConfig{debug: true, ..Default::default()};
        let engine = select_engine(Some(EngineId::Classic), driver(true), config.clone())
            .unwrap();
        assert_eq!(engine.id(), EngineId::Classic);
        assert!(engine.config().debug);
        assert!(select_engine(Some(EngineId::Modern), driver(false), config).is_err());
    }
}
