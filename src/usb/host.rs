use std::io;
use std::time::Duration;

use crate::usb::request::{DeviceHandle, PacketCallback, ResultCode};

/// A device seen during enumeration, before whitelist filtering.
pub(crate) struct Candidate<D> {
    pub device: D,
    pub vendor_id: u16,
    pub product_id: u16,
    pub port_numbers: Vec<u8>,
}

/// Outcome of the open-and-close accessibility probe run on every
/// whitelisted device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeAccess {
    /// The device opened and closed cleanly.
    Openable,
    /// Present, but the OS denied access; recorded as non-openable.
    Denied,
    /// Any other failure; the device is dropped from the table.
    Unavailable,
}

/// Setup packet of one control transfer, independent of the host stack.
pub(crate) struct ControlSetup {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub timeout_ms: u32,
}

/// Sizing of a bulk-IN stream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamConfig {
    pub packet_size: usize,
    pub packet_count: usize,
    pub auto_resubmit: bool,
}

/// Result of trying to bring up a bulk stream.
pub(crate) enum StreamStart<S> {
    /// Every transfer submitted.
    Started(S),
    /// Some transfers went in flight before a submission failed. The caller
    /// must cancel the stream and keep it alive until it drains.
    Partial(S),
    /// Nothing was submitted.
    Failed(ResultCode),
}

/// The host-stack seam the device manager drives. The production
/// implementation wraps libusb; tests substitute a scripted mock.
pub(crate) trait UsbHost: Send + Sync + 'static {
    type Device: Clone + Send + Sync;
    type Open: Clone + Send + Sync;
    type Stream: BulkStream + Send;

    /// List every device visible to the host.
    fn enumerate(&self) -> io::Result<Vec<Candidate<Self::Device>>>;

    /// Open-and-close accessibility check.
    fn probe(&self, device: &Self::Device) -> ProbeAccess;

    fn open(&self, device: &Self::Device) -> io::Result<Self::Open>;

    fn claim_interface(&self, open: &Self::Open, interface: u8) -> io::Result<()>;

    fn release_interface(&self, open: &Self::Open, interface: u8) -> io::Result<()>;

    /// Blocking control transfer; `data` is the in/out payload buffer.
    fn control(
        &self,
        open: &Self::Open,
        setup: &ControlSetup,
        data: &mut [u8],
    ) -> Result<usize, ResultCode>;

    /// Build a bulk-IN stream over the device's streaming endpoint and
    /// submit its transfers. `handle` identifies the device in logs.
    fn start_stream(
        &self,
        handle: DeviceHandle,
        device: &Self::Device,
        open: &Self::Open,
        config: StreamConfig,
        on_data: PacketCallback,
    ) -> StreamStart<Self::Stream>;

    /// Deliver pending transfer completions, waiting at most `timeout`.
    fn pump_events(&self, timeout: Duration);
}

/// Worker-side view of a running (or draining) bulk stream.
pub(crate) trait BulkStream {
    /// Ask every in-flight transfer to cancel. Completion is asynchronous;
    /// the stream has drained once [`active_transfers`] reaches zero.
    ///
    /// [`active_transfers`]: BulkStream::active_transfers
    fn cancel(&mut self);

    /// Transfers still awaiting their terminal callback.
    fn active_transfers(&self) -> usize;
}
