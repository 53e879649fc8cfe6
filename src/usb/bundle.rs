use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use libusb1_sys as libusb;
use libusb1_sys::constants::{
    LIBUSB_ERROR_NOT_FOUND, LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_COMPLETED,
    LIBUSB_TRANSFER_TYPE_BULK,
};
use log::{debug, warn};

use crate::usb::context::{OpenHandle, libusb_error_string, transfer_status_to_result_code};
use crate::usb::host::{BulkStream, StreamConfig};
use crate::usb::request::{DeviceHandle, PacketCallback};

/// State shared with the libusb completion callbacks through each transfer's
/// `user_data` pointer. Boxed by [`TransferBundle`] so it cannot move while
/// transfers are in flight.
struct BundleCore {
    handle: DeviceHandle,
    auto_resubmit: bool,
    cancel_flag: AtomicBool,
    active_count: AtomicUsize,
    on_data: PacketCallback,
}

/// A group of bulk-IN transfers over one contiguous buffer, started,
/// cancelled and torn down as a unit.
///
/// Lifetime rules: the bundle must not be dropped while `active_transfers()`
/// is non-zero — every in-flight transfer holds a raw pointer to the core
/// and a slice of the buffer. The manager keeps draining bundles in its
/// cancelled set until they hit zero.
pub(crate) struct TransferBundle {
    core: Box<BundleCore>,
    transfers: Vec<*mut libusb::libusb_transfer>,
    // Backing storage the transfers slice into.
    _buffer: Vec<u8>,
    // Holds the device open for as long as transfers may reference it.
    _device: OpenHandle,
}

unsafe impl Send for TransferBundle {}

impl TransferBundle {
    /// Allocate the transfer objects and the backing buffer. Nothing is
    /// submitted yet.
    pub(crate) fn new(
        handle: DeviceHandle,
        open: &OpenHandle,
        endpoint: u8,
        config: StreamConfig,
        on_data: PacketCallback,
    ) -> Option<Self> {
        let mut buffer = vec![0u8; config.packet_count * config.packet_size];
        let mut core = Box::new(BundleCore {
            handle,
            auto_resubmit: config.auto_resubmit,
            cancel_flag: AtomicBool::new(false),
            active_count: AtomicUsize::new(0),
            on_data,
        });
        let core_ptr = &mut *core as *mut BundleCore as *mut c_void;

        let mut transfers = Vec::with_capacity(config.packet_count);
        for index in 0..config.packet_count {
            let transfer = unsafe { libusb::libusb_alloc_transfer(0) };
            if transfer.is_null() {
                for &transfer in &transfers {
                    unsafe { libusb::libusb_free_transfer(transfer) };
                }
                return None;
            }
            unsafe {
                (*transfer).dev_handle = open.raw();
                (*transfer).endpoint = endpoint;
                (*transfer).transfer_type = LIBUSB_TRANSFER_TYPE_BULK;
                (*transfer).timeout = 0;
                (*transfer).callback = transfer_callback;
                (*transfer).user_data = core_ptr;
                (*transfer).buffer = buffer.as_mut_ptr().add(index * config.packet_size);
                (*transfer).length = config.packet_size as c_int;
            }
            transfers.push(transfer);
        }

        Some(Self {
            core,
            transfers,
            _buffer: buffer,
            _device: open.clone(),
        })
    }

    /// Submit every transfer, stopping at the first failure. Returns the
    /// number that went in flight.
    pub(crate) fn submit_transfers(&mut self) -> usize {
        let mut submitted = 0;
        for &transfer in &self.transfers {
            let rc = unsafe { libusb::libusb_submit_transfer(transfer) };
            if rc < 0 {
                warn!(
                    "device {}: bulk transfer submit failed: {}",
                    self.core.handle,
                    libusb_error_string(rc)
                );
                break;
            }
            self.core.active_count.fetch_add(1, Ordering::AcqRel);
            submitted += 1;
        }
        submitted
    }
}

impl BulkStream for TransferBundle {
    fn cancel(&mut self) {
        if self.core.cancel_flag.swap(true, Ordering::AcqRel) {
            return;
        }
        for &transfer in &self.transfers {
            // NOT_FOUND means the transfer already reached a terminal state.
            let rc = unsafe { libusb::libusb_cancel_transfer(transfer) };
            if rc < 0 && rc != LIBUSB_ERROR_NOT_FOUND {
                debug!(
                    "device {}: cancel_transfer: {}",
                    self.core.handle,
                    libusb_error_string(rc)
                );
            }
        }
    }

    fn active_transfers(&self) -> usize {
        self.core.active_count.load(Ordering::Acquire)
    }
}

impl Drop for TransferBundle {
    fn drop(&mut self) {
        let active = self.active_transfers();
        if active != 0 {
            warn!(
                "device {}: dropping bulk transfer bundle with {active} transfers still active",
                self.core.handle
            );
        }
        for &transfer in &self.transfers {
            unsafe { libusb::libusb_free_transfer(transfer) };
        }
    }
}

/// Terminal callback of every transfer in a bundle. Runs on the USB worker
/// thread inside the libusb event pump; the core pointer is valid because
/// the bundle outlives all in-flight transfers.
extern "system" fn transfer_callback(transfer: *mut libusb::libusb_transfer) {
    let core = unsafe { &mut *((*transfer).user_data as *mut BundleCore) };
    let status = unsafe { (*transfer).status };
    let cancelled = core.cancel_flag.load(Ordering::Acquire);

    if status == LIBUSB_TRANSFER_COMPLETED {
        if !cancelled {
            let data = unsafe {
                std::slice::from_raw_parts((*transfer).buffer, (*transfer).actual_length as usize)
            };
            (core.on_data)(data);
        }
    } else if status != LIBUSB_TRANSFER_CANCELLED {
        debug!(
            "device {}: bulk transfer ended: {}",
            core.handle,
            transfer_status_to_result_code(status)
        );
    }

    // Resubmit to keep the stream saturated; an accepted cancel overrides
    // the auto-resubmit so the bundle can drain.
    if core.auto_resubmit && status != LIBUSB_TRANSFER_CANCELLED && !cancelled {
        let rc = unsafe { libusb::libusb_submit_transfer(transfer) };
        if rc == 0 {
            return;
        }
        warn!(
            "device {}: bulk transfer resubmit failed: {}",
            core.handle,
            libusb_error_string(rc)
        );
    }

    let previous = core.active_count.fetch_sub(1, Ordering::AcqRel);
    debug_assert!(previous > 0);
}
