//! PS3 Eye (OV534 bridge + OV772x sensor) camera driver.

pub(crate) mod constants;
pub mod driver;
pub mod frame;
pub(crate) mod register_io;

pub use driver::{Camera, CameraProperties};
pub use frame::FrameReader;
