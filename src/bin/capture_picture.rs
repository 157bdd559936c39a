// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::offset::Local;
use clap::{Parser, ValueEnum};
use futures::StreamExt;
use log::{error, info};
use url::Url;

use camera_session::abstract_engine::{EngineId, Facing};
use camera_session::event_bus::CameraEvent;
use camera_session::image_driver::ImageDriver;
use camera_session::image_processor::ImageCropper;
use camera_session::picture_transaction::PictureTransaction;
use camera_session::session::{CameraSession, DefaultStrategy};
use camera_session::session_config::SessionConfig;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FacingArg {
    Back, Front,
}

/// Runs a camera session against a simulated device whose cameras all see
/// the given input image, and saves one picture.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Image the simulated cameras deliver.
    #[arg(short, long)]
    input: PathBuf,

    /// Where to write the picture. Defaults to a timestamped name in the
    /// current directory.
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = FacingArg::Back)]
    facing: FacingArg,

    /// Fail instead of using a camera of the other facing.
    #[arg(long, default_value_t = false)]
    exact: bool,

    /// Switch to the other camera before taking the picture.
    #[arg(long, default_value_t = false)]
    switch: bool,

    /// Simulate a device with the modern driver interface.
    #[arg(long, default_value_t = false)]
    modern: bool,

    /// Clockwise rotation the simulated sensor needs.
    #[arg(long, default_value_t = 90)]
    sensor_orientation: u32,

    #[arg(short, long, default_value_t = 100)]
    quality: u8,

    /// Write PNG instead of JPEG.
    #[arg(long, default_value_t = false)]
    lossless: bool,

    /// Resize and crop to WIDTHxHEIGHT.
    #[arg(long)]
    crop: Option<String>,

    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn output_path(args: &Args) -> PathBuf {
    let path = args.output.clone().unwrap_or_else(|| {
        let extension = if args.lossless { "png" } else { "jpg" };
        PathBuf::from(format!("picture_{}.{}",
                              Local::now().format("%Y%m%d_%H%M%S"), extension))
    });
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir().unwrap().join(path)
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let image = image::open(&args.input).unwrap();
    let driver = ImageDriver::new(image)
        .with_camera(Facing::Back, args.sensor_orientation)
        .with_camera(Facing::Front, (args.sensor_orientation + 180) % 360)
        .with_modern_api(args.modern);

    let config = SessionConfig{
        facing: match args.facing {
            FacingArg::Back => Facing::Back,
            FacingArg::Front => Facing::Front,
        },
        exact_match: args.exact,
        forced_engine: if args.modern { None } else { Some(EngineId::Classic) },
        jpeg_quality: args.quality,
        lossless: args.lossless,
        output: Some(Url::from_file_path(output_path(&args)).unwrap()),
        debug: args.debug,
        ..Default::default()
    };
    let mut session = CameraSession::new(config.clone(), Arc::new(driver), &DefaultStrategy)
        .unwrap();

    // Report everything the session announces.
    let mut notifications = session.subscribe().into_stream();
    tokio::spawn(async move {
        while let Some(n) = notifications.next().await {
            info!("{:?}: {:?}", n.controller, n.event);
        }
    });

    let transaction = match &args.crop {
        Some(crop) => {
            let (w, h) = crop.split_once('x').expect("crop must be WIDTHxHEIGHT");
            let cropper = ImageCropper::new(w.parse().unwrap(), h.parse().unwrap(), true);
            Arc::new(config.finish_transaction(PictureTransaction::builder().append(cropper)))
        },
        None => session.transaction(),
    };

    session.start().unwrap();
    let mut switched = !args.switch;
    let mut picture_requested = false;
    let started = Local::now();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), session.pump()).await
            .expect("camera session stalled");
        match event {
            Some(CameraEvent::ControllerReady{handle}) => {
                info!("Ready on {:?} camera {}", handle.descriptor.facing,
                      handle.descriptor.device_id);
                if !switched {
                    switched = true;
                    session.switch_camera().unwrap();
                } else if !picture_requested {
                    picture_requested = true;
                    session.take_picture_with(transaction.clone()).unwrap();
                }
            },
            Some(CameraEvent::PictureTaken{result, ..}) => {
                match result {
                    Ok(artifact) => info!(
                        "Saved {}x{} picture to {} after {}ms",
                        artifact.width, artifact.height,
                        artifact.location.map_or("<memory>".to_string(), |l| l.to_string()),
                        (Local::now() - started).num_milliseconds()),
                    Err(e) => error!("Picture failed: {}", e),
                }
                session.destroy();
            },
            Some(CameraEvent::ControllerDestroyed) | None => break,
            Some(_) => (),
        }
    }
}
