use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::usb::host::{BulkStream, ControlSetup, StreamConfig, StreamStart, UsbHost};
use crate::usb::libusb_host::LibusbHost;
use crate::usb::registry::{DeviceTable, TRACKER_WHITELIST};
use crate::usb::request::{
    BulkResult, ControlResult, ControlTransfer, DeviceHandle, DeviceInfo, DevicePort,
    MAX_CONTROL_PAYLOAD, REQUEST_QUEUE_CAPACITY, RequestSink, ResultCallback, ResultCode,
    StartBulkTransfer, TransferRequest, TransferResult,
};

/// How long one event-pump pass may wait while transfers are in flight.
const PUMP_TIMEOUT: Duration = Duration::from_millis(50);
/// Idle sleep when no bundles exist and the request queue is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(100);
/// Default bound on the shutdown cancellation drain.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct PendingRequest {
    request: TransferRequest,
    on_result: ResultCallback,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Manager logic, generic over the host stack so the worker loop can be
/// exercised against a scripted mock.
pub(crate) struct ManagerCore<H: UsbHost> {
    host: Arc<H>,
    table: Arc<Mutex<DeviceTable<H::Device, H::Open>>>,
    requests: Option<HeapProd<PendingRequest>>,
    exit_signaled: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    drain_timeout: Duration,
}

impl<H: UsbHost> ManagerCore<H> {
    pub(crate) fn new(host: H) -> Self {
        Self {
            host: Arc::new(host),
            table: Arc::new(Mutex::new(DeviceTable::default())),
            requests: None,
            exit_signaled: Arc::new(AtomicBool::new(false)),
            worker: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub(crate) fn set_drain_timeout(&mut self, timeout: Duration) {
        self.drain_timeout = timeout;
    }

    /// Enumerate whitelisted devices and spawn the worker thread. A no-op if
    /// the worker is already running.
    pub(crate) fn startup(&mut self) -> io::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        info!("scanning for whitelisted USB devices");
        let candidates = self.host.enumerate()?;
        let host = Arc::clone(&self.host);
        let table = DeviceTable::build(candidates, TRACKER_WHITELIST, |device| host.probe(device));
        info!("{} whitelisted USB device(s) found", table.len());
        *lock(&self.table) = table;

        let (producer, consumer) = HeapRb::new(REQUEST_QUEUE_CAPACITY).split();
        self.requests = Some(producer);
        self.exit_signaled.store(false, Ordering::SeqCst);

        info!("starting USB worker thread");
        let worker = Worker {
            host: Arc::clone(&self.host),
            table: Arc::clone(&self.table),
            requests: consumer,
            followups: VecDeque::new(),
            active: Vec::new(),
            cancelled: Vec::new(),
            exit_signaled: Arc::clone(&self.exit_signaled),
            drain_timeout: self.drain_timeout,
        };
        self.worker = Some(
            thread::Builder::new()
                .name("usb-worker".into())
                .spawn(move || worker.run())?,
        );
        Ok(())
    }

    /// Stop the worker, close every open device and forget the device table.
    /// Idempotent.
    pub(crate) fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        info!("stopping USB worker thread");
        self.exit_signaled.store(true, Ordering::SeqCst);
        self.requests = None;
        if worker.join().is_err() {
            error!("USB worker thread panicked during shutdown");
        } else {
            info!("USB worker thread stopped");
        }

        let mut table = lock(&self.table);
        for record in table.records_mut() {
            if record.interface_claimed {
                if let Some(open) = record.open.as_ref() {
                    if let Err(e) = self.host.release_interface(open, 0) {
                        debug!("release_interface at shutdown: {e}");
                    }
                }
                record.interface_claimed = false;
            }
            record.open = None;
        }
        table.clear();
    }

    /// Open the device and claim its streaming interface. Returns false when
    /// the handle is invalid or the device is already open.
    pub(crate) fn open(&mut self, handle: DeviceHandle) -> bool {
        let mut table = lock(&self.table);
        let Some(record) = table.get_mut(handle) else {
            warn!("open: invalid device handle {handle}");
            return false;
        };
        if record.open.is_some() {
            warn!("open: device {handle} is already open");
            return false;
        }
        if !record.openable {
            warn!("open: access to device {handle} was denied during enumeration");
            return false;
        }

        let open = match self.host.open(&record.device) {
            Ok(open) => open,
            Err(e) => {
                error!("failed to open device {handle}: {e}");
                return false;
            }
        };
        if let Err(e) = self.host.claim_interface(&open, 0) {
            error!("failed to claim interface 0 on device {handle}: {e}");
            return false;
        }

        record.open = Some(open);
        record.interface_claimed = true;
        info!("opened device {handle}");
        true
    }

    /// Release the interface and close the device. Safe to call on a device
    /// that is not open.
    pub(crate) fn close(&mut self, handle: DeviceHandle) {
        let mut table = lock(&self.table);
        let Some(record) = table.get_mut(handle) else {
            return;
        };
        if record.interface_claimed {
            if let Some(open) = record.open.as_ref() {
                if let Err(e) = self.host.release_interface(open, 0) {
                    debug!("release_interface on device {handle}: {e}");
                }
            }
            record.interface_claimed = false;
        }
        if record.open.take().is_some() {
            info!("closed device {handle}");
        }
    }

    /// Push a request onto the worker's queue. Returns false when the queue
    /// is full or the manager is not running; the caller may retry later.
    pub(crate) fn submit(&mut self, request: TransferRequest, on_result: ResultCallback) -> bool {
        let Some(producer) = self.requests.as_mut() else {
            return false;
        };
        producer
            .try_push(PendingRequest { request, on_result })
            .is_ok()
    }

    pub(crate) fn device_count(&self) -> usize {
        lock(&self.table).len()
    }

    pub(crate) fn device_info(&self, handle: DeviceHandle) -> Option<DeviceInfo> {
        lock(&self.table).device_info(handle)
    }

    pub(crate) fn device_path(&self, handle: DeviceHandle) -> Option<String> {
        lock(&self.table).device_path(handle)
    }

    pub(crate) fn device_port_path(&self, handle: DeviceHandle) -> Option<String> {
        lock(&self.table).port_path(handle)
    }

    pub(crate) fn is_open(&self, handle: DeviceHandle) -> bool {
        lock(&self.table).is_open(handle)
    }

    pub(crate) fn first_handle(&self) -> Option<DeviceHandle> {
        lock(&self.table).first_handle()
    }

    pub(crate) fn next_handle(&self, handle: DeviceHandle) -> Option<DeviceHandle> {
        lock(&self.table).next_handle(handle)
    }
}

impl<H: UsbHost> Drop for ManagerCore<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the USB worker thread.
struct Worker<H: UsbHost> {
    host: Arc<H>,
    table: Arc<Mutex<DeviceTable<H::Device, H::Open>>>,
    requests: HeapCons<PendingRequest>,
    /// Continuation requests submitted from inside result callbacks. Kept
    /// apart from the SPSC ring so that ring keeps exactly one producer.
    followups: VecDeque<PendingRequest>,
    active: Vec<(DeviceHandle, H::Stream)>,
    cancelled: Vec<(DeviceHandle, H::Stream)>,
    exit_signaled: Arc<AtomicBool>,
    drain_timeout: Duration,
}

/// Request sink handed to result callbacks running on the worker.
struct FollowupSink<'a> {
    queue: &'a mut VecDeque<PendingRequest>,
}

impl RequestSink for FollowupSink<'_> {
    fn submit(&mut self, request: TransferRequest, on_result: ResultCallback) -> bool {
        self.queue.push_back(PendingRequest { request, on_result });
        true
    }
}

impl<H: UsbHost> Worker<H> {
    fn run(mut self) {
        while !self.exit_signaled.load(Ordering::SeqCst) {
            self.drain_requests();

            if self.active.is_empty() && self.cancelled.is_empty() {
                thread::sleep(IDLE_SLEEP);
            } else {
                self.host.pump_events(PUMP_TIMEOUT);
                self.sweep_cancelled();
            }
        }

        // Exit protocol: discard queued work, cancel what is in flight and
        // pump until the cancellations drain (bounded by drain_timeout).
        let mut discarded = 0usize;
        while self.next_request().is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!("discarded {discarded} queued USB request(s) at shutdown");
        }

        for (handle, mut stream) in self.active.drain(..) {
            debug!("cancelling bulk transfer bundle for device {handle} at shutdown");
            stream.cancel();
            self.cancelled.push((handle, stream));
        }

        let deadline = Instant::now() + self.drain_timeout;
        while !self.cancelled.is_empty() {
            if Instant::now() >= deadline {
                error!(
                    "{} bulk transfer bundle(s) failed to drain within {:?}; leaking them",
                    self.cancelled.len(),
                    self.drain_timeout
                );
                for bundle in self.cancelled.drain(..) {
                    std::mem::forget(bundle);
                }
                break;
            }
            self.host.pump_events(PUMP_TIMEOUT);
            self.sweep_cancelled();
        }
    }

    fn next_request(&mut self) -> Option<PendingRequest> {
        self.followups
            .pop_front()
            .or_else(|| self.requests.try_pop())
    }

    fn drain_requests(&mut self) {
        while let Some(pending) = self.next_request() {
            self.dispatch(pending);
        }
    }

    fn dispatch(&mut self, pending: PendingRequest) {
        let PendingRequest { request, on_result } = pending;
        let result = match request {
            TransferRequest::Control(control) => self.handle_control(control),
            TransferRequest::StartBulk(start) => self.handle_start_bulk(start),
            TransferRequest::CancelBulk { handle } => self.handle_cancel_bulk(handle),
        };
        let mut sink = FollowupSink {
            queue: &mut self.followups,
        };
        on_result(result, &mut sink);
    }

    /// Clone the device's open handle out of the table so the transfer does
    /// not hold the table lock for its full (up to 500 ms) duration.
    fn open_handle_for(&self, handle: DeviceHandle) -> Result<(H::Device, H::Open), ResultCode> {
        let table = lock(&self.table);
        let Some(record) = table.get(handle) else {
            return Err(ResultCode::BadHandle);
        };
        match record.open.as_ref() {
            Some(open) => Ok((record.device.clone(), open.clone())),
            None => Err(ResultCode::DeviceNotOpen),
        }
    }

    fn handle_control(&mut self, request: ControlTransfer) -> TransferResult {
        let handle = request.handle;
        let mut data = request.data;
        let length = (request.w_length as usize).min(MAX_CONTROL_PAYLOAD);

        let control_result = |code: ResultCode, data, len| {
            TransferResult::Control(ControlResult {
                handle,
                code,
                data,
                len,
            })
        };

        let (_, open) = match self.open_handle_for(handle) {
            Ok(found) => found,
            Err(code) => {
                warn!("control transfer on device {handle}: {code}");
                return control_result(code, data, 0);
            }
        };

        let setup = ControlSetup {
            bm_request_type: request.bm_request_type,
            b_request: request.b_request,
            w_value: request.w_value,
            w_index: request.w_index,
            timeout_ms: request.timeout_ms,
        };
        match self.host.control(&open, &setup, &mut data[..length]) {
            Ok(len) => control_result(ResultCode::Completed, data, len),
            Err(code) => {
                warn!("control transfer on device {handle} failed: {code}");
                control_result(code, data, 0)
            }
        }
    }

    fn handle_start_bulk(&mut self, request: StartBulkTransfer) -> TransferResult {
        let handle = request.handle;
        let bulk_result = |code| TransferResult::Bulk(BulkResult { handle, code });

        // At most one bundle per device.
        if self.active.iter().any(|(active, _)| *active == handle) {
            warn!("bulk transfer already started for device {handle}");
            return bulk_result(ResultCode::TransferAlreadyStarted);
        }

        let (device, open) = match self.open_handle_for(handle) {
            Ok(found) => found,
            Err(code) => {
                warn!("start bulk transfer on device {handle}: {code}");
                return bulk_result(code);
            }
        };

        let config = StreamConfig {
            packet_size: request.packet_size,
            packet_count: request.packet_count,
            auto_resubmit: request.auto_resubmit,
        };
        match self
            .host
            .start_stream(handle, &device, &open, config, request.on_data)
        {
            StreamStart::Started(stream) => {
                debug!(
                    "started bulk transfer bundle for device {handle} ({} x {} bytes)",
                    request.packet_count, request.packet_size
                );
                self.active.push((handle, stream));
                bulk_result(ResultCode::Started)
            }
            StreamStart::Partial(mut stream) => {
                error!("only part of the bulk transfer bundle for device {handle} started");
                stream.cancel();
                self.cancelled.push((handle, stream));
                bulk_result(ResultCode::SubmitFailed)
            }
            StreamStart::Failed(code) => {
                error!("failed to start bulk transfer bundle for device {handle}: {code}");
                bulk_result(code)
            }
        }
    }

    fn handle_cancel_bulk(&mut self, handle: DeviceHandle) -> TransferResult {
        let bulk_result = |code| TransferResult::Bulk(BulkResult { handle, code });

        if lock(&self.table).get(handle).is_none() {
            warn!("cancel bulk transfer: invalid device handle {handle}");
            return bulk_result(ResultCode::BadHandle);
        }

        let Some(position) = self.active.iter().position(|(active, _)| *active == handle) else {
            warn!("no active bulk transfer bundle for device {handle}");
            return bulk_result(ResultCode::TransferNotActive);
        };

        let (handle, mut stream) = self.active.remove(position);
        stream.cancel();
        // The bundle is deleted once every transfer has fired its terminal
        // callback; until then it sits in the cancelled set.
        self.cancelled.push((handle, stream));
        bulk_result(ResultCode::Canceled)
    }

    fn sweep_cancelled(&mut self) {
        self.cancelled.retain(|(handle, stream)| {
            if stream.active_transfers() == 0 {
                debug!("bulk transfer bundle for device {handle} drained");
                false
            } else {
                true
            }
        });
    }
}

/// Owns the libusb context, the filtered device table and the worker thread
/// that services transfer requests. Lives on the main thread; the result
/// callbacks it invokes run on the worker thread.
pub struct UsbDeviceManager {
    core: ManagerCore<LibusbHost>,
}

impl UsbDeviceManager {
    /// Create a manager over a fresh libusb context. Call
    /// [`startup`](UsbDeviceManager::startup) before anything else.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            core: ManagerCore::new(LibusbHost::new()?),
        })
    }

    /// Enumerate whitelisted devices and start the USB worker thread.
    pub fn startup(&mut self) -> io::Result<()> {
        self.core.startup()
    }

    /// Stop the worker thread, draining cancelled transfers first, and close
    /// every open device. Idempotent.
    pub fn shutdown(&mut self) {
        self.core.shutdown()
    }

    /// Bound the shutdown cancellation drain. Takes effect at the next
    /// [`startup`](UsbDeviceManager::startup).
    pub fn set_drain_timeout(&mut self, timeout: Duration) {
        self.core.set_drain_timeout(timeout)
    }

    /// Open the device and claim its first interface.
    pub fn open(&mut self, handle: DeviceHandle) -> bool {
        self.core.open(handle)
    }

    /// Release the interface and close the device. Safe on a closed device.
    pub fn close(&mut self, handle: DeviceHandle) {
        self.core.close(handle)
    }

    /// Queue a transfer request for the worker thread. `on_result` fires
    /// exactly once, on the worker. Returns false when the queue is full.
    pub fn submit(&mut self, request: TransferRequest, on_result: ResultCallback) -> bool {
        self.core.submit(request, on_result)
    }

    pub fn device_count(&self) -> usize {
        self.core.device_count()
    }

    pub fn device_info(&self, handle: DeviceHandle) -> Option<DeviceInfo> {
        self.core.device_info(handle)
    }

    /// Human-readable identifier, e.g. `USB\VID_1415&PID_2000\0`.
    pub fn device_path(&self, handle: DeviceHandle) -> Option<String> {
        self.core.device_path(handle)
    }

    /// Dotted port-number chain, e.g. `"1.2"`.
    pub fn device_port_path(&self, handle: DeviceHandle) -> Option<String> {
        self.core.device_port_path(handle)
    }

    pub fn is_open(&self, handle: DeviceHandle) -> bool {
        self.core.is_open(handle)
    }

    pub fn first_handle(&self) -> Option<DeviceHandle> {
        self.core.first_handle()
    }

    pub fn next_handle(&self, handle: DeviceHandle) -> Option<DeviceHandle> {
        self.core.next_handle(handle)
    }
}

impl RequestSink for UsbDeviceManager {
    fn submit(&mut self, request: TransferRequest, on_result: ResultCallback) -> bool {
        self.core.submit(request, on_result)
    }
}

impl DevicePort for UsbDeviceManager {
    fn port_path(&self, handle: DeviceHandle) -> Option<String> {
        self.core.device_port_path(handle)
    }

    fn as_sink(&mut self) -> &mut dyn RequestSink {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::host::{BulkStream, Candidate, ProbeAccess};
    use crate::usb::request::vendor_device_request_out;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[derive(Clone)]
    struct MockDevice;

    #[derive(Clone)]
    struct MockOpen;

    #[derive(Default)]
    struct MockStreamState {
        active: AtomicUsize,
        cancel_requested: AtomicBool,
        data_callbacks: AtomicUsize,
        pumps_after_cancel: AtomicUsize,
        dropped: AtomicBool,
    }

    struct MockStream {
        state: Arc<MockStreamState>,
        _on_data: crate::usb::request::PacketCallback,
    }

    impl BulkStream for MockStream {
        fn cancel(&mut self) {
            self.state.cancel_requested.store(true, Ordering::SeqCst);
        }

        fn active_transfers(&self) -> usize {
            self.state.active.load(Ordering::SeqCst)
        }
    }

    impl Drop for MockStream {
        fn drop(&mut self) {
            assert_eq!(self.state.active.load(Ordering::SeqCst), 0);
            self.state.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockHost {
        devices: Vec<(u16, u16, Vec<u8>)>,
        control_log: Mutex<Vec<(u16, u8, u8)>>, // (w_index, bm_request_type, byte0)
        streams: Mutex<Vec<Arc<MockStreamState>>>,
        drain_on_pump: bool,
    }

    impl MockHost {
        fn with_one_device() -> Self {
            Self {
                devices: vec![(0x1415, 0x2000, vec![1, 2])],
                drain_on_pump: true,
                ..Self::default()
            }
        }
    }

    impl UsbHost for MockHost {
        type Device = MockDevice;
        type Open = MockOpen;
        type Stream = MockStream;

        fn enumerate(&self) -> io::Result<Vec<Candidate<MockDevice>>> {
            Ok(self
                .devices
                .iter()
                .map(|(vendor_id, product_id, ports)| Candidate {
                    device: MockDevice,
                    vendor_id: *vendor_id,
                    product_id: *product_id,
                    port_numbers: ports.clone(),
                })
                .collect())
        }

        fn probe(&self, _device: &MockDevice) -> ProbeAccess {
            ProbeAccess::Openable
        }

        fn open(&self, _device: &MockDevice) -> io::Result<MockOpen> {
            Ok(MockOpen)
        }

        fn claim_interface(&self, _open: &MockOpen, _interface: u8) -> io::Result<()> {
            Ok(())
        }

        fn release_interface(&self, _open: &MockOpen, _interface: u8) -> io::Result<()> {
            Ok(())
        }

        fn control(
            &self,
            _open: &MockOpen,
            setup: &ControlSetup,
            data: &mut [u8],
        ) -> Result<usize, ResultCode> {
            lock(&self.control_log).push((
                setup.w_index,
                setup.bm_request_type,
                data.first().copied().unwrap_or(0),
            ));
            Ok(data.len())
        }

        fn start_stream(
            &self,
            _handle: DeviceHandle,
            _device: &MockDevice,
            _open: &MockOpen,
            config: StreamConfig,
            on_data: crate::usb::request::PacketCallback,
        ) -> StreamStart<MockStream> {
            let state = Arc::new(MockStreamState::default());
            state.active.store(config.packet_count, Ordering::SeqCst);
            lock(&self.streams).push(Arc::clone(&state));
            StreamStart::Started(MockStream {
                state,
                _on_data: on_data,
            })
        }

        fn pump_events(&self, _timeout: Duration) {
            // One "terminal callback" per stream per pump: live streams get a
            // data packet, cancelled streams retire one transfer.
            thread::sleep(Duration::from_millis(1));
            let streams = lock(&self.streams);
            for state in streams.iter() {
                if state.cancel_requested.load(Ordering::SeqCst) {
                    state.pumps_after_cancel.fetch_add(1, Ordering::SeqCst);
                    if self.drain_on_pump && state.active.load(Ordering::SeqCst) > 0 {
                        state.active.fetch_sub(1, Ordering::SeqCst);
                    }
                } else {
                    state.data_callbacks.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    fn started_manager(host: MockHost) -> ManagerCore<MockHost> {
        let mut manager = ManagerCore::new(host);
        manager.startup().unwrap();
        manager
    }

    fn control_request(handle: DeviceHandle, w_index: u16, value: u8) -> TransferRequest {
        let mut data = [0u8; MAX_CONTROL_PAYLOAD];
        data[0] = value;
        TransferRequest::Control(ControlTransfer {
            handle,
            bm_request_type: vendor_device_request_out(),
            b_request: 0x01,
            w_value: 0,
            w_index,
            w_length: 1,
            data,
            timeout_ms: 500,
        })
    }

    #[test]
    fn open_close_round_trip() {
        let mut manager = started_manager(MockHost::with_one_device());
        let handle = manager.first_handle().unwrap();

        assert!(!manager.is_open(handle));
        assert!(manager.open(handle));
        assert!(manager.is_open(handle));
        assert!(!manager.open(handle), "double open must fail");

        manager.close(handle);
        assert!(!manager.is_open(handle));
        manager.close(handle); // idempotent

        manager.shutdown();
        assert_eq!(manager.device_count(), 0);
    }

    #[test]
    fn per_device_request_ordering() {
        let mut manager = started_manager(MockHost::with_one_device());
        let handle = manager.first_handle().unwrap();
        assert!(manager.open(handle));

        let (tx, rx) = mpsc::channel();
        for index in 0u16..3 {
            let tx = tx.clone();
            let accepted = manager.submit(
                control_request(handle, 0x10 + index, index as u8),
                Box::new(move |result, _sink| {
                    assert_eq!(result.code(), ResultCode::Completed);
                    tx.send(index).unwrap();
                }),
            );
            assert!(accepted);
        }

        for expected in 0u16..3 {
            let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(got, expected);
        }

        let log = lock(&manager.host.control_log).clone();
        let indices: Vec<u16> = log.iter().map(|(w_index, _, _)| *w_index).collect();
        assert_eq!(indices, vec![0x10, 0x11, 0x12]);
        manager.shutdown();
    }

    #[test]
    fn followup_requests_submitted_from_callbacks_run() {
        let mut manager = started_manager(MockHost::with_one_device());
        let handle = manager.first_handle().unwrap();
        assert!(manager.open(handle));

        let (tx, rx) = mpsc::channel();
        let inner_tx = tx.clone();
        manager.submit(
            control_request(handle, 0x20, 0),
            Box::new(move |result, sink| {
                assert_eq!(result.code(), ResultCode::Completed);
                // Continuation issued from the worker-side callback.
                sink.submit(
                    control_request(handle, 0x21, 0),
                    Box::new(move |result, _sink| {
                        assert_eq!(result.code(), ResultCode::Completed);
                        inner_tx.send(2).unwrap();
                    }),
                );
                tx.send(1).unwrap();
            }),
        );

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        manager.shutdown();
    }

    #[test]
    fn invalid_handle_and_unopened_device_fail_fast() {
        let mut manager = started_manager(MockHost::with_one_device());
        let handle = manager.first_handle().unwrap();

        let (tx, rx) = mpsc::channel();
        let bad = DeviceHandle(99);
        let tx_bad = tx.clone();
        manager.submit(
            control_request(bad, 1, 0),
            Box::new(move |result, _sink| tx_bad.send(result.code()).unwrap()),
        );
        manager.submit(
            control_request(handle, 1, 0),
            Box::new(move |result, _sink| tx.send(result.code()).unwrap()),
        );

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            ResultCode::BadHandle
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            ResultCode::DeviceNotOpen
        );
        manager.shutdown();
    }

    #[test]
    fn submit_before_startup_reports_backpressure() {
        let mut manager = ManagerCore::new(MockHost::with_one_device());
        let accepted = manager.submit(
            control_request(DeviceHandle(0), 1, 0),
            Box::new(|_result, _sink| {}),
        );
        assert!(!accepted);
    }

    fn start_bulk_request(handle: DeviceHandle) -> TransferRequest {
        TransferRequest::StartBulk(StartBulkTransfer {
            handle,
            packet_size: 16384,
            packet_count: 8,
            auto_resubmit: true,
            on_data: Box::new(|_data| {}),
        })
    }

    #[test]
    fn second_start_bulk_is_rejected() {
        let mut manager = started_manager(MockHost::with_one_device());
        let handle = manager.first_handle().unwrap();
        assert!(manager.open(handle));

        let (tx, rx) = mpsc::channel();
        for _ in 0..2 {
            let tx = tx.clone();
            manager.submit(
                start_bulk_request(handle),
                Box::new(move |result, _sink| tx.send(result.code()).unwrap()),
            );
        }

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            ResultCode::Started
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            ResultCode::TransferAlreadyStarted
        );
        manager.shutdown();
    }

    #[test]
    fn cancellation_drains_before_destruction() {
        let mut manager = started_manager(MockHost::with_one_device());
        let handle = manager.first_handle().unwrap();
        assert!(manager.open(handle));

        let (tx, rx) = mpsc::channel();
        let start_tx = tx.clone();
        manager.submit(
            start_bulk_request(handle),
            Box::new(move |result, _sink| start_tx.send(result.code()).unwrap()),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            ResultCode::Started
        );

        // Let a few data callbacks through before cancelling.
        thread::sleep(Duration::from_millis(200));

        manager.submit(
            TransferRequest::CancelBulk { handle },
            Box::new(move |result, _sink| tx.send(result.code()).unwrap()),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            ResultCode::Canceled
        );

        let state = Arc::clone(&lock(&manager.host.streams)[0]);
        let callbacks_at_cancel = state.data_callbacks.load(Ordering::SeqCst);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !state.dropped.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "bundle never drained");
            thread::sleep(Duration::from_millis(10));
        }

        // One terminal callback per outstanding transfer before teardown,
        // and no data callbacks after the cancel was accepted.
        assert!(state.pumps_after_cancel.load(Ordering::SeqCst) >= 8);
        assert_eq!(
            state.data_callbacks.load(Ordering::SeqCst),
            callbacks_at_cancel
        );
        manager.shutdown();
    }

    #[test]
    fn cancel_without_stream_reports_not_active() {
        let mut manager = started_manager(MockHost::with_one_device());
        let handle = manager.first_handle().unwrap();
        assert!(manager.open(handle));

        let (tx, rx) = mpsc::channel();
        manager.submit(
            TransferRequest::CancelBulk { handle },
            Box::new(move |result, _sink| tx.send(result.code()).unwrap()),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            ResultCode::TransferNotActive
        );
        manager.shutdown();
    }

    #[test]
    fn shutdown_drain_is_bounded() {
        let host = MockHost {
            drain_on_pump: false,
            ..MockHost::with_one_device()
        };
        let mut manager = ManagerCore::new(host);
        manager.set_drain_timeout(Duration::from_millis(100));
        manager.startup().unwrap();
        let handle = manager.first_handle().unwrap();
        assert!(manager.open(handle));

        let (tx, rx) = mpsc::channel();
        manager.submit(
            start_bulk_request(handle),
            Box::new(move |result, _sink| tx.send(result.code()).unwrap()),
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            ResultCode::Started
        );

        let started = Instant::now();
        manager.shutdown();
        assert!(started.elapsed() < Duration::from_secs(3));

        // The stuck bundle was leaked, not dropped with transfers in flight.
        let state = Arc::clone(&lock(&manager.host.streams)[0]);
        assert!(!state.dropped.load(Ordering::SeqCst));
    }
}
