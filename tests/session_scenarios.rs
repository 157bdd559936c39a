// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, GenericImageView, RgbImage};
use url::Url;

use camera_session::abstract_engine::{EngineId, Facing};
use camera_session::camera_controller::{BusyKind, ControllerState};
use camera_session::camera_error::CameraError;
use camera_session::event_bus::{CameraEvent, EventBus, Subscription};
use camera_session::image_buffer::ExifModel;
use camera_session::image_driver::ImageDriver;
use camera_session::image_processor::{ImageCropper, JpegEncode, OrientationNormalizer,
                                      PersistStage};
use camera_session::picture_transaction::{PictureTransaction, PropertyValue, PROP_OUTPUT};
use camera_session::session::{CameraSession, DefaultStrategy};
use camera_session::session_config::SessionConfig;

const WAIT: Duration = Duration::from_secs(20);

fn image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }))
}

fn classic(config: SessionConfig) -> SessionConfig {
    SessionConfig{forced_engine: Some(EngineId::Classic), ..config}
}

/// Pumps `session` until an event matching `wanted` arrives, and returns it.
async fn pump_until(session: &mut CameraSession,
                    wanted: impl Fn(&CameraEvent) -> bool) -> CameraEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match session.pump().await {
                Some(event) if wanted(&event) => return event,
                Some(_) => (),
                None => panic!("bus closed"),
            }
        }
    }).await.expect("timed out waiting for notification")
}

async fn until_ready(session: &mut CameraSession) {
    pump_until(session, |e| matches!(e, CameraEvent::ControllerReady{..})).await;
}

fn drain(observer: &mut Subscription) -> Vec<CameraEvent> {
    let mut events = Vec::new();
    while let Some(n) = observer.try_recv() {
        events.push(n.event);
    }
    events
}

#[tokio::test]
async fn back_request_degrades_to_front_camera() {
    let driver = ImageDriver::new(image(64, 48)).with_camera(Facing::Front, 270);
    let bus = EventBus::new();
    let mut observer = bus.subscribe();
    let mut session = CameraSession::with_bus(
        bus, SessionConfig::default(), Arc::new(driver), &DefaultStrategy).unwrap();
    session.start().unwrap();
    until_ready(&mut session).await;

    let events = drain(&mut observer);
    let opened = events.iter().position(|e| matches!(e, CameraEvent::EngineOpened{..}))
        .unwrap();
    let ready = events.iter().position(|e| matches!(e, CameraEvent::ControllerReady{..}))
        .unwrap();
    assert!(opened < ready);
    match (&events[opened], &events[ready]) {
        (CameraEvent::EngineOpened{handle, fault},
         CameraEvent::ControllerReady{handle: ready_handle}) => {
            assert!(fault.is_none());
            assert_eq!(*handle, ready_handle.id);
            assert_eq!(ready_handle.descriptor.facing, Facing::Front);
        },
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn exact_match_miss_ends_session_without_open_handles() {
    let driver = ImageDriver::new(image(64, 48)).with_camera(Facing::Front, 270);
    let stats = driver.stats();
    let bus = EventBus::new();
    let mut observer = bus.subscribe();
    let config = SessionConfig{facing: Facing::Back, exact_match: true, ..Default::default()};
    assert!(CameraSession::with_bus(bus, config, Arc::new(driver), &DefaultStrategy).is_err());

    let events = drain(&mut observer);
    assert!(events.iter().any(|e| matches!(e, CameraEvent::NoSuchCamera{..})));
    assert!(matches!(events.last(), Some(CameraEvent::ControllerDestroyed)));
    assert_eq!(stats.opens(), 0);
    assert_eq!(stats.open_sessions(), 0);
}

#[tokio::test]
async fn rotated_frame_is_resized_cropped_and_persisted_upright() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.jpg");
    let driver = ImageDriver::new(image(1920, 1080)).with_camera(Facing::Back, 90);
    let mut session = CameraSession::new(classic(SessionConfig::default()),
                                         Arc::new(driver), &DefaultStrategy).unwrap();
    let transaction = PictureTransaction::builder()
        .append(ImageCropper::new(640, 480, true))
        .append(OrientationNormalizer)
        .append(JpegEncode::with_quality(75))
        .append(PersistStage::new())
        .property(PROP_OUTPUT, PropertyValue::Location(Url::from_file_path(&out).unwrap()))
        .build_shared();

    session.start().unwrap();
    until_ready(&mut session).await;
    session.take_picture_with(transaction).unwrap();
    let event = pump_until(&mut session, |e| matches!(e, CameraEvent::PictureTaken{..})).await;
    let CameraEvent::PictureTaken{result, ..} = event else { unreachable!() };
    let artifact = result.unwrap();
    assert_eq!((artifact.width, artifact.height), (640, 480));
    assert_eq!(artifact.location.unwrap().to_file_path().unwrap(), out);

    let bytes = std::fs::read(&out).unwrap();
    assert_eq!(image::load_from_memory(&bytes).unwrap().dimensions(), (640, 480));
    assert!(ExifModel::read_from_jpeg(&bytes).is_upright());
    assert_eq!(session.controller().state(), ControllerState::Ready);
}

#[tokio::test]
async fn second_switch_while_switching_is_rejected() {
    let driver = ImageDriver::new(image(64, 48))
        .with_camera(Facing::Back, 90)
        .with_camera(Facing::Front, 270)
        .with_open_delay(Duration::from_millis(50));
    let stats = driver.stats();
    let mut session = CameraSession::new(classic(SessionConfig::default()),
                                         Arc::new(driver), &DefaultStrategy).unwrap();
    session.start().unwrap();
    until_ready(&mut session).await;

    session.switch_camera().unwrap();
    assert_eq!(session.controller().state(), ControllerState::Busy(BusyKind::Switching));
    assert!(matches!(session.switch_camera(), Err(CameraError::InvalidState{..})));

    let event = pump_until(&mut session,
                           |e| matches!(e, CameraEvent::ControllerReady{..})).await;
    let CameraEvent::ControllerReady{handle} = event else { unreachable!() };
    assert_eq!(handle.descriptor.facing, Facing::Front);
    assert_eq!(session.controller().state(), ControllerState::Ready);
    assert_eq!(session.controller().current_handle(), Some(&handle));
    assert_eq!(stats.opens(), 2);
    assert_eq!(stats.open_sessions(), 1);
}

#[tokio::test]
async fn capture_while_capturing_is_busy() {
    let driver = ImageDriver::new(image(64, 48))
        .with_camera(Facing::Back, 0)
        .with_capture_delay(Duration::from_millis(100));
    let mut session = CameraSession::new(classic(SessionConfig::default()),
                                         Arc::new(driver), &DefaultStrategy).unwrap();
    session.start().unwrap();
    until_ready(&mut session).await;

    session.take_picture().unwrap();
    assert_eq!(session.take_picture(), Err(CameraError::CaptureBusy));
    let event = pump_until(&mut session, |e| matches!(e, CameraEvent::PictureTaken{..})).await;
    let CameraEvent::PictureTaken{result, ..} = event else { unreachable!() };
    let artifact = result.unwrap();
    assert_eq!((artifact.width, artifact.height), (64, 48));
    assert!(artifact.encoded.is_some());
    assert!(artifact.location.is_none());
    assert_eq!(session.controller().state(), ControllerState::Ready);
}

#[tokio::test]
async fn persist_failure_is_reported_and_session_continues() {
    let dir = tempfile::tempdir().unwrap();
    // A regular file where the destination directory should be.
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"x").unwrap();
    let config = SessionConfig{
        output: Some(Url::from_file_path(blocker.join("pic.jpg")).unwrap()),
        ..classic(SessionConfig::default())
    };
    let driver = ImageDriver::new(image(64, 48)).with_camera(Facing::Back, 0);
    let mut session = CameraSession::new(config, Arc::new(driver), &DefaultStrategy).unwrap();
    session.start().unwrap();
    until_ready(&mut session).await;

    session.take_picture().unwrap();
    let event = pump_until(&mut session, |e| matches!(e, CameraEvent::PictureTaken{..})).await;
    assert!(matches!(event, CameraEvent::PictureTaken{result: Err(CameraError::Persist(_)), ..}));
    assert_eq!(session.controller().state(), ControllerState::Ready);

    // Still usable: an in-memory picture succeeds.
    session.take_picture_with(PictureTransaction::builder().build_shared()).unwrap();
    let event = pump_until(&mut session, |e| matches!(e, CameraEvent::PictureTaken{..})).await;
    assert!(matches!(event, CameraEvent::PictureTaken{result: Ok(_), ..}));
}

#[tokio::test]
async fn transient_capture_failure_keeps_session() {
    let driver = ImageDriver::new(image(64, 48))
        .with_camera(Facing::Back, 0)
        .failing_capture();
    let stats = driver.stats();
    let mut session = CameraSession::new(classic(SessionConfig::default()),
                                         Arc::new(driver), &DefaultStrategy).unwrap();
    session.start().unwrap();
    until_ready(&mut session).await;

    for _ in 0..2 {
        session.take_picture().unwrap();
        let event = pump_until(&mut session,
                               |e| matches!(e, CameraEvent::PictureTaken{..})).await;
        assert!(matches!(event,
                         CameraEvent::PictureTaken{result: Err(CameraError::Driver(_)), ..}));
        assert_eq!(session.controller().state(), ControllerState::Ready);
    }
    assert_eq!(stats.open_sessions(), 1);
}

#[tokio::test]
async fn broken_sensor_ends_session() {
    let driver = ImageDriver::new(image(64, 48))
        .with_camera(Facing::Back, 0)
        .broken_sensor();
    let stats = driver.stats();
    let mut session = CameraSession::new(classic(SessionConfig::default()),
                                         Arc::new(driver), &DefaultStrategy).unwrap();
    session.start().unwrap();
    until_ready(&mut session).await;

    session.take_picture().unwrap();
    pump_until(&mut session, |e| matches!(e, CameraEvent::FatalEngineFault{..})).await;
    pump_until(&mut session, |e| matches!(e, CameraEvent::ControllerDestroyed)).await;
    assert_eq!(session.controller().state(), ControllerState::Destroyed);
    assert!(session.take_picture().is_err());
    tokio::time::timeout(WAIT, async {
        while stats.open_sessions() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }).await.unwrap();
}

#[tokio::test]
async fn stop_refuses_new_pictures_but_finishes_the_one_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("late.jpg");
    let config = SessionConfig{
        output: Some(Url::from_file_path(&out).unwrap()),
        ..classic(SessionConfig::default())
    };
    let driver = ImageDriver::new(image(64, 48))
        .with_camera(Facing::Back, 0)
        .with_capture_delay(Duration::from_millis(100));
    let stats = driver.stats();
    let mut session = CameraSession::new(config, Arc::new(driver), &DefaultStrategy).unwrap();
    session.start().unwrap();
    until_ready(&mut session).await;

    session.take_picture().unwrap();
    session.stop(false).unwrap();
    assert_eq!(session.controller().state(), ControllerState::Stopped);
    assert!(matches!(session.take_picture(), Err(CameraError::InvalidState{..})));

    let event = pump_until(&mut session, |e| matches!(e, CameraEvent::PictureTaken{..})).await;
    let CameraEvent::PictureTaken{result, ..} = event else { unreachable!() };
    let location = result.unwrap().location.unwrap().to_file_path().unwrap();
    assert_eq!(location, out);
    assert_eq!(image::open(&out).unwrap().dimensions(), (64, 48));
    assert_eq!(session.controller().state(), ControllerState::Stopped);
    assert!(session.take_picture().is_err());
    assert_eq!(stats.captures(), 1);
}

#[tokio::test]
async fn modern_engine_session_writes_png() {
    let dir = tempfile::tempdir().unwrap();
    let config = SessionConfig{
        output: Some(Url::from_file_path(dir.path().join("shots/pic.jpg")).unwrap()),
        lossless: true,
        ..Default::default()
    };
    let driver = ImageDriver::new(image(64, 48))
        .with_camera(Facing::Back, 90)
        .with_modern_api(true);
    let mut session = CameraSession::new(config, Arc::new(driver), &DefaultStrategy).unwrap();
    assert_eq!(session.controller().engine().unwrap().id(), EngineId::Modern);
    session.start().unwrap();
    until_ready(&mut session).await;
    session.take_picture().unwrap();
    let event = pump_until(&mut session, |e| matches!(e, CameraEvent::PictureTaken{..})).await;
    let CameraEvent::PictureTaken{result, ..} = event else { unreachable!() };
    let location = result.unwrap().location.unwrap().to_file_path().unwrap();
    assert_eq!(location, dir.path().join("shots/pic.png"));
    let decoded = image::open(&location).unwrap();
    // Normalized from the 90 degree sensor.
    assert_eq!(decoded.dimensions(), (48, 64));
}
