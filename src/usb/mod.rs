//! Asynchronous USB device management over libusb: device registry, request
//! queue, worker thread and bulk transfer bundles.

pub(crate) mod bundle;
pub(crate) mod context;
pub(crate) mod host;
pub(crate) mod libusb_host;
pub mod manager;
pub mod registry;
pub mod request;

pub use manager::UsbDeviceManager;
pub use registry::TRACKER_WHITELIST;
pub use request::{
    ControlTransfer, DeviceHandle, DeviceInfo, DevicePort, RequestSink, ResultCode,
    StartBulkTransfer, TransferRequest, TransferResult,
};
