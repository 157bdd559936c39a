// Copyright (c) 2023 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod abstract_engine;
pub mod camera_controller;
pub mod camera_error;
pub mod classic_engine;
pub mod driver;
pub mod driver_engine;
pub mod event_bus;
pub mod image_buffer;
pub mod image_driver;
pub mod image_processor;
pub mod modern_engine;
pub mod picture_transaction;
pub mod select_engine;
pub mod session;
pub mod session_config;
