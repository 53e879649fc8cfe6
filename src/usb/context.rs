use std::ffi::CStr;
use std::io;
use std::mem::MaybeUninit;
use std::os::raw::c_int;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use libusb1_sys as libusb;
use libusb1_sys::constants::{
    LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_NO_DEVICE, LIBUSB_ERROR_NOT_FOUND,
    LIBUSB_ERROR_NO_MEM, LIBUSB_ERROR_OVERFLOW, LIBUSB_ERROR_PIPE, LIBUSB_ERROR_TIMEOUT,
    LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_NO_DEVICE,
    LIBUSB_TRANSFER_OVERFLOW, LIBUSB_TRANSFER_STALL, LIBUSB_TRANSFER_TIMED_OUT,
};
use log::warn;

use crate::usb::request::ResultCode;

/// Deepest port-number chain libusb reports for a device.
pub(crate) const MAX_PORT_DEPTH: usize = 7;

#[derive(Copy, Clone)]
pub(crate) struct ContextPtr(pub(crate) *mut libusb::libusb_context);

unsafe impl Send for ContextPtr {}
unsafe impl Sync for ContextPtr {}

/// RAII wrapper owning a libusb context. All transfer completions are
/// delivered while the USB worker thread sits in [`handle_events`].
///
/// [`handle_events`]: LibusbContext::handle_events
pub(crate) struct LibusbContext {
    pub(crate) ptr: ContextPtr,
}

impl LibusbContext {
    pub(crate) fn new() -> io::Result<Self> {
        let mut ctx = ptr::null_mut();
        let rc = unsafe { libusb::libusb_init(&mut ctx) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(Self {
            ptr: ContextPtr(ctx),
        })
    }

    /// Run the libusb event loop once, waiting at most `timeout` for
    /// transfer completions.
    pub(crate) fn handle_events(&self, timeout: Duration) {
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            libusb::libusb_handle_events_timeout_completed(self.ptr.0, &mut tv, ptr::null_mut())
        };
        if rc < 0 && rc != LIBUSB_ERROR_INTERRUPTED {
            warn!("libusb event loop error: {}", libusb_error_string(rc));
        }
    }
}

impl Drop for LibusbContext {
    fn drop(&mut self) {
        unsafe { libusb::libusb_exit(self.ptr.0) };
    }
}

/// Ref-counted reference to an enumerated (not necessarily open) device.
pub(crate) struct DeviceRef {
    ptr: *mut libusb::libusb_device,
}

unsafe impl Send for DeviceRef {}
unsafe impl Sync for DeviceRef {}

impl DeviceRef {
    /// Take a new strong reference to `ptr`.
    pub(crate) fn from_raw(ptr: *mut libusb::libusb_device) -> Self {
        unsafe { libusb::libusb_ref_device(ptr) };
        Self { ptr }
    }

    pub(crate) fn raw(&self) -> *mut libusb::libusb_device {
        self.ptr
    }

    pub(crate) fn descriptor(&self) -> io::Result<libusb::libusb_device_descriptor> {
        let mut desc = MaybeUninit::<libusb::libusb_device_descriptor>::uninit();
        let rc = unsafe { libusb::libusb_get_device_descriptor(self.ptr, desc.as_mut_ptr()) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(unsafe { desc.assume_init() })
    }

    /// Bus-topology port chain of the device, outermost hub first. Empty if
    /// the platform cannot report it.
    pub(crate) fn port_numbers(&self) -> Vec<u8> {
        let mut ports = [0u8; MAX_PORT_DEPTH];
        let filled = unsafe {
            libusb::libusb_get_port_numbers(self.ptr, ports.as_mut_ptr(), ports.len() as c_int)
        };
        if filled <= 0 {
            return Vec::new();
        }
        ports[..filled as usize].to_vec()
    }
}

impl Clone for DeviceRef {
    fn clone(&self) -> Self {
        Self::from_raw(self.ptr)
    }
}

impl Drop for DeviceRef {
    fn drop(&mut self) {
        unsafe { libusb::libusb_unref_device(self.ptr) };
    }
}

struct HandlePtr(*mut libusb::libusb_device_handle);

unsafe impl Send for HandlePtr {}
unsafe impl Sync for HandlePtr {}

impl Drop for HandlePtr {
    fn drop(&mut self) {
        unsafe { libusb::libusb_close(self.0) };
    }
}

/// Shared handle to an opened device; the last clone dropped closes it. The
/// worker clones this out of the device table so the main thread can close a
/// device without pulling the handle out from under an executing transfer.
#[derive(Clone)]
pub(crate) struct OpenHandle {
    inner: Arc<HandlePtr>,
}

impl OpenHandle {
    pub(crate) fn open(device: &DeviceRef) -> io::Result<Self> {
        let mut handle = ptr::null_mut();
        let rc = unsafe { libusb::libusb_open(device.raw(), &mut handle) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(Self {
            inner: Arc::new(HandlePtr(handle)),
        })
    }

    pub(crate) fn raw(&self) -> *mut libusb::libusb_device_handle {
        self.inner.0
    }

    pub(crate) fn claim_interface(&self, interface: c_int) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_claim_interface(self.inner.0, interface) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }

    pub(crate) fn release_interface(&self, interface: c_int) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_release_interface(self.inner.0, interface) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }

    pub(crate) fn clear_halt(&self, endpoint: u8) -> io::Result<()> {
        let rc = unsafe { libusb::libusb_clear_halt(self.inner.0, endpoint) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }

    /// Blocking control transfer. `data` is sent for OUT requests and
    /// overwritten for IN requests; returns the transferred byte count.
    pub(crate) fn control_transfer(
        &self,
        bm_request_type: u8,
        b_request: u8,
        w_value: u16,
        w_index: u16,
        data: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, ResultCode> {
        let rc = unsafe {
            libusb::libusb_control_transfer(
                self.inner.0,
                bm_request_type,
                b_request,
                w_value,
                w_index,
                data.as_mut_ptr(),
                data.len() as u16,
                timeout_ms,
            )
        };
        if rc < 0 {
            return Err(error_to_result_code(rc));
        }
        Ok(rc as usize)
    }
}

pub(crate) fn libusb_error_string(code: i32) -> String {
    unsafe {
        let ptr = libusb::libusb_error_name(code);
        if ptr.is_null() {
            format!("libusb error {code}")
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}

pub(crate) fn map_libusb_error(code: i32) -> io::Error {
    let kind = match code {
        LIBUSB_ERROR_TIMEOUT => io::ErrorKind::WouldBlock,
        LIBUSB_ERROR_PIPE => io::ErrorKind::BrokenPipe,
        LIBUSB_ERROR_NO_DEVICE => io::ErrorKind::NotConnected,
        LIBUSB_ERROR_NOT_FOUND => io::ErrorKind::NotFound,
        LIBUSB_ERROR_INTERRUPTED => io::ErrorKind::Interrupted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, libusb_error_string(code))
}

/// Map a negative libusb return value onto the transfer result codes the
/// request API reports.
pub(crate) fn error_to_result_code(code: i32) -> ResultCode {
    match code {
        LIBUSB_ERROR_TIMEOUT => ResultCode::TimedOut,
        LIBUSB_ERROR_PIPE => ResultCode::Pipe,
        LIBUSB_ERROR_OVERFLOW => ResultCode::Overflow,
        LIBUSB_ERROR_NO_MEM => ResultCode::NoMemory,
        _ => ResultCode::GeneralError,
    }
}

/// Map a terminal transfer status onto the transfer result codes.
pub(crate) fn transfer_status_to_result_code(status: c_int) -> ResultCode {
    match status {
        LIBUSB_TRANSFER_COMPLETED => ResultCode::Completed,
        LIBUSB_TRANSFER_CANCELLED => ResultCode::Canceled,
        LIBUSB_TRANSFER_TIMED_OUT => ResultCode::TimedOut,
        LIBUSB_TRANSFER_STALL => ResultCode::Pipe,
        LIBUSB_TRANSFER_OVERFLOW => ResultCode::Overflow,
        LIBUSB_TRANSFER_NO_DEVICE => ResultCode::DeviceNotOpen,
        _ => ResultCode::GeneralError,
    }
}
