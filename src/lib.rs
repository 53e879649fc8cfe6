//! Capture core for PS3 Eye tracking cameras: an asynchronous USB device
//! manager bridging application code and libusb's blocking event machinery,
//! and a camera driver programming the OV534 bridge / OV772x sensor over it.
pub mod camera;
pub mod task;
pub mod usb;

pub use camera::{Camera, CameraProperties, FrameReader};
pub use usb::{
    ControlTransfer, DeviceHandle, DeviceInfo, DevicePort, RequestSink, ResultCode,
    StartBulkTransfer, TRACKER_WHITELIST, TransferRequest, TransferResult, UsbDeviceManager,
};
