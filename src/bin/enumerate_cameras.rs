// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;

use clap::Parser;
use image::{DynamicImage, RgbImage};

use camera_session::abstract_engine::{CameraEngine, EngineConfig, Facing,
                                      SelectionCriteria};
use camera_session::classic_engine::ClassicEngine;
use camera_session::driver::CameraDriver;
use camera_session::image_driver::ImageDriver;
use camera_session::modern_engine::ModernEngine;

/// Lists the cameras of a simulated device as each engine generation
/// describes them.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Cameras to simulate, as facing:sensor_orientation pairs.
    #[arg(short, long, value_delimiter = ',', default_value = "back:90,front:270")]
    cameras: Vec<String>,
}

fn parse_camera(camera: &str) -> (Facing, u32) {
    let (facing, orientation) = camera.split_once(':').unwrap_or((camera, "0"));
    let facing = match facing {
        "front" => Facing::Front,
        "back" => Facing::Back,
        other => panic!("Unknown facing {}", other),
    };
    (facing, orientation.parse().expect("sensor orientation must be a number"))
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut driver = ImageDriver::new(DynamicImage::ImageRgb8(RgbImage::new(640, 480)));
    for camera in &args.cameras {
        let (facing, orientation) = parse_camera(camera);
        driver = driver.with_camera(facing, orientation);
    }
    let driver: Arc<dyn CameraDriver> = Arc::new(driver);
    let criteria = SelectionCriteria::default();

    let mut engines: Vec<Box<dyn CameraEngine>> = vec![
        Box::new(ClassicEngine::new(driver.clone(), EngineConfig::default())),
        Box::new(ModernEngine::new(driver, EngineConfig::default())),
    ];
    for engine in engines.iter_mut() {
        match engine.enumerate(&criteria) {
            Ok(descriptors) => {
                println!("{} engine sees {} cameras: ", engine.id(), descriptors.len());
                for d in descriptors {
                    println!("{}: {:?}", d.index, d);
                }
            },
            Err(e) => println!("{} engine: {}", engine.id(), e),
        }
    }
}
