//! Core types and traits for the peerlink messaging driver.
//!
//! This crate defines the data structures shared by every driver
//! implementation and by the layers that sit on top of one: the session
//! message envelope, the driver configuration, the error taxonomy and the
//! [`Driver`](driver::Driver) trait. It contains no I/O.

pub mod config;
pub mod driver;
pub mod error;
pub mod message;

pub use config::{ConfigError, DriverConfig};
pub use driver::Driver;
pub use error::{WireError, WireResult};
pub use message::{SessionMessage, SessionType, WILDCARD};
