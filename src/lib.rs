//! Parking space detection over slippy-map imagery: plan an overlapping grid
//! of tile mosaics, run an external OBB detector on each, and reconcile the
//! detections across block borders into one set of parking spaces.

pub mod config;
pub mod coords;
pub mod detection;
pub mod error;
pub mod export;
pub mod fetch;
pub mod georef;
pub mod grid;
pub mod job;
pub mod manager;
pub mod polygon;
pub mod progress;
pub mod providers;
pub mod reconcile;
