use std::fmt;

use libusb1_sys::constants::{
    LIBUSB_ENDPOINT_IN, LIBUSB_ENDPOINT_OUT, LIBUSB_RECIPIENT_DEVICE, LIBUSB_REQUEST_TYPE_VENDOR,
};

/// Largest control-transfer payload carried inline in a request.
pub const MAX_CONTROL_PAYLOAD: usize = 32;

/// Capacity of the main-thread to worker request ring.
pub const REQUEST_QUEUE_CAPACITY: usize = 128;

/// Identifier of a device known to a running manager. Stable for the
/// lifetime of a manager run; numerically it is the device's index in the
/// filtered device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle(pub(crate) usize);

impl DeviceHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Vendor/product id pair of a USB device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Completion code delivered with every transfer result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    // Success codes
    Started,
    Canceled,
    Completed,

    // Failure codes
    GeneralError,
    BadHandle,
    NoMemory,
    SubmitFailed,
    DeviceNotOpen,
    TransferNotActive,
    TransferAlreadyStarted,
    Overflow,
    Pipe,
    TimedOut,
}

impl ResultCode {
    pub fn is_failure(self) -> bool {
        !matches!(
            self,
            ResultCode::Started | ResultCode::Canceled | ResultCode::Completed
        )
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResultCode::Started => "request started",
            ResultCode::Canceled => "request canceled",
            ResultCode::Completed => "request completed",
            ResultCode::GeneralError => "request failed: general request error",
            ResultCode::BadHandle => "request failed: bad USB device handle",
            ResultCode::NoMemory => "request failed: no memory",
            ResultCode::SubmitFailed => "request failed: submit failed",
            ResultCode::DeviceNotOpen => "request failed: device not open",
            ResultCode::TransferNotActive => "request failed: transfer not active",
            ResultCode::TransferAlreadyStarted => "request failed: transfer already started",
            ResultCode::Overflow => "request failed: transfer overflow",
            ResultCode::Pipe => "request failed: transfer pipe error",
            ResultCode::TimedOut => "request failed: transfer timed out",
        };
        f.write_str(text)
    }
}

/// Per-packet callback of a bulk stream. Runs on the USB worker thread
/// inside the transfer completion handler; it must not block and must only
/// share state through atomics.
pub type PacketCallback = Box<dyn FnMut(&[u8]) + Send>;

/// One vendor/class control transfer. The payload travels inline in both
/// directions; `w_length` bytes of `data` are written for OUT transfers and
/// overwritten for IN transfers.
pub struct ControlTransfer {
    pub handle: DeviceHandle,
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
    pub data: [u8; MAX_CONTROL_PAYLOAD],
    pub timeout_ms: u32,
}

/// Bring up a bulk-IN stream of `packet_count` in-flight transfers of
/// `packet_size` bytes each.
pub struct StartBulkTransfer {
    pub handle: DeviceHandle,
    pub packet_size: usize,
    pub packet_count: usize,
    pub auto_resubmit: bool,
    pub on_data: PacketCallback,
}

/// A request for the USB worker thread.
pub enum TransferRequest {
    Control(ControlTransfer),
    StartBulk(StartBulkTransfer),
    CancelBulk { handle: DeviceHandle },
}

impl TransferRequest {
    pub fn handle(&self) -> DeviceHandle {
        match self {
            TransferRequest::Control(control) => control.handle,
            TransferRequest::StartBulk(start) => start.handle,
            TransferRequest::CancelBulk { handle } => *handle,
        }
    }
}

/// Result of a control transfer, including a copy of the inline payload.
#[derive(Debug, Clone, Copy)]
pub struct ControlResult {
    pub handle: DeviceHandle,
    pub code: ResultCode,
    pub data: [u8; MAX_CONTROL_PAYLOAD],
    pub len: usize,
}

/// Result of a bulk stream start/cancel request.
#[derive(Debug, Clone, Copy)]
pub struct BulkResult {
    pub handle: DeviceHandle,
    pub code: ResultCode,
}

/// Reply matching a [`TransferRequest`].
#[derive(Debug, Clone, Copy)]
pub enum TransferResult {
    Control(ControlResult),
    Bulk(BulkResult),
}

impl TransferResult {
    pub fn code(&self) -> ResultCode {
        match self {
            TransferResult::Control(control) => control.code,
            TransferResult::Bulk(bulk) => bulk.code,
        }
    }
}

/// Callback fired exactly once per dispatched request, on the USB worker
/// thread. The sink it receives queues follow-up requests without touching
/// the main thread's side of the request ring.
pub type ResultCallback = Box<dyn FnOnce(TransferResult, &mut dyn RequestSink) + Send>;

/// Accepts transfer requests bound for the USB worker thread. Implemented by
/// the device manager (main-thread producer of the SPSC ring) and by the
/// worker's own follow-up queue.
pub trait RequestSink {
    /// Queue `request`. Returns `false` when the queue is full; the request
    /// and its callback are dropped in that case and the caller is expected
    /// to retry or fail the surrounding operation.
    fn submit(&mut self, request: TransferRequest, on_result: ResultCallback) -> bool;
}

/// What a camera needs from the device manager it is attached to.
pub trait DevicePort: RequestSink {
    /// Dotted port-number chain of the device, e.g. `"1.2"`.
    fn port_path(&self, handle: DeviceHandle) -> Option<String>;

    fn as_sink(&mut self) -> &mut dyn RequestSink;
}

#[inline]
pub fn vendor_device_request_out() -> u8 {
    (LIBUSB_REQUEST_TYPE_VENDOR | LIBUSB_RECIPIENT_DEVICE | LIBUSB_ENDPOINT_OUT) as u8
}

#[inline]
pub fn vendor_device_request_in() -> u8 {
    (LIBUSB_REQUEST_TYPE_VENDOR | LIBUSB_RECIPIENT_DEVICE | LIBUSB_ENDPOINT_IN) as u8
}
