use std::io;
use std::os::raw::c_int;
use std::ptr;
use std::time::Duration;

use libusb1_sys as libusb;
use libusb1_sys::constants::{
    LIBUSB_ENDPOINT_IN, LIBUSB_ERROR_ACCESS, LIBUSB_SUCCESS, LIBUSB_TRANSFER_TYPE_BULK,
};
use log::{debug, error};

use crate::usb::bundle::TransferBundle;
use crate::usb::context::{
    DeviceRef, LibusbContext, OpenHandle, libusb_error_string, map_libusb_error,
};
use crate::usb::host::{Candidate, ControlSetup, ProbeAccess, StreamConfig, StreamStart, UsbHost};
use crate::usb::request::{DeviceHandle, PacketCallback, ResultCode};

/// Production host stack: thin dispatch onto libusb through the RAII
/// wrappers in [`crate::usb::context`].
pub(crate) struct LibusbHost {
    context: LibusbContext,
}

impl LibusbHost {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            context: LibusbContext::new()?,
        })
    }
}

impl UsbHost for LibusbHost {
    type Device = DeviceRef;
    type Open = OpenHandle;
    type Stream = TransferBundle;

    fn enumerate(&self) -> io::Result<Vec<Candidate<DeviceRef>>> {
        let mut list = ptr::null();
        let count = unsafe { libusb::libusb_get_device_list(self.context.ptr.0, &mut list) };
        if count < 0 {
            return Err(map_libusb_error(count as i32));
        }

        let mut candidates = Vec::new();
        for index in 0..count as usize {
            let raw = unsafe { *list.add(index) };
            let device = DeviceRef::from_raw(raw);
            let descriptor = match device.descriptor() {
                Ok(descriptor) => descriptor,
                Err(error) => {
                    debug!("skipping device without readable descriptor: {error}");
                    continue;
                }
            };
            let port_numbers = device.port_numbers();
            candidates.push(Candidate {
                device,
                vendor_id: descriptor.idVendor,
                product_id: descriptor.idProduct,
                port_numbers,
            });
        }
        unsafe { libusb::libusb_free_device_list(list, 1) };

        Ok(candidates)
    }

    fn probe(&self, device: &DeviceRef) -> ProbeAccess {
        let mut handle = ptr::null_mut();
        let rc = unsafe { libusb::libusb_open(device.raw(), &mut handle) };
        match rc {
            LIBUSB_SUCCESS => {
                unsafe { libusb::libusb_close(handle) };
                ProbeAccess::Openable
            }
            LIBUSB_ERROR_ACCESS => ProbeAccess::Denied,
            _ => {
                debug!("device probe failed: {}", libusb_error_string(rc));
                ProbeAccess::Unavailable
            }
        }
    }

    fn open(&self, device: &DeviceRef) -> io::Result<OpenHandle> {
        OpenHandle::open(device)
    }

    fn claim_interface(&self, open: &OpenHandle, interface: u8) -> io::Result<()> {
        open.claim_interface(interface as c_int)
    }

    fn release_interface(&self, open: &OpenHandle, interface: u8) -> io::Result<()> {
        open.release_interface(interface as c_int)
    }

    fn control(
        &self,
        open: &OpenHandle,
        setup: &ControlSetup,
        data: &mut [u8],
    ) -> Result<usize, ResultCode> {
        open.control_transfer(
            setup.bm_request_type,
            setup.b_request,
            setup.w_value,
            setup.w_index,
            data,
            setup.timeout_ms,
        )
    }

    fn start_stream(
        &self,
        handle: DeviceHandle,
        device: &DeviceRef,
        open: &OpenHandle,
        config: StreamConfig,
        on_data: PacketCallback,
    ) -> StreamStart<TransferBundle> {
        let Some(endpoint) = (unsafe { find_bulk_in_endpoint(device.raw()) }) else {
            error!("device {handle}: no bulk-IN endpoint found on streaming interface");
            return StreamStart::Failed(ResultCode::GeneralError);
        };
        if let Err(error) = open.clear_halt(endpoint) {
            debug!("device {handle}: clear_halt on endpoint {endpoint:#04x}: {error}");
        }

        let Some(mut bundle) = TransferBundle::new(handle, open, endpoint, config, on_data) else {
            return StreamStart::Failed(ResultCode::NoMemory);
        };

        let submitted = bundle.submit_transfers();
        if submitted == config.packet_count {
            StreamStart::Started(bundle)
        } else if submitted == 0 {
            StreamStart::Failed(ResultCode::SubmitFailed)
        } else {
            StreamStart::Partial(bundle)
        }
    }

    fn pump_events(&self, timeout: Duration) {
        self.context.handle_events(timeout);
    }
}

/// Walk the active configuration for the streaming interface's first
/// bulk-IN endpoint: interface 0, alt setting 0.
unsafe fn find_bulk_in_endpoint(device: *mut libusb::libusb_device) -> Option<u8> {
    let config = unsafe { ConfigDescriptor::active(device) }?;
    let config_ptr = config.0;

    let interface_count = unsafe { (*config_ptr).bNumInterfaces };
    for interface_index in 0..interface_count as usize {
        let interface = unsafe { &*(*config_ptr).interface.add(interface_index) };
        if interface.num_altsetting == 0 {
            continue;
        }
        let descriptor = unsafe { &*interface.altsetting };
        if descriptor.bInterfaceNumber != 0 {
            continue;
        }
        for endpoint_index in 0..descriptor.bNumEndpoints as usize {
            let endpoint = unsafe { &*descriptor.endpoint.add(endpoint_index) };
            if endpoint.bmAttributes & 0x3 == LIBUSB_TRANSFER_TYPE_BULK
                && endpoint.bEndpointAddress & LIBUSB_ENDPOINT_IN != 0
                && endpoint.wMaxPacketSize != 0
            {
                return Some(endpoint.bEndpointAddress);
            }
        }
        break;
    }
    None
}

struct ConfigDescriptor(*const libusb::libusb_config_descriptor);

impl ConfigDescriptor {
    unsafe fn active(device: *mut libusb::libusb_device) -> Option<Self> {
        let mut ptr = ptr::null();
        let rc = unsafe { libusb::libusb_get_active_config_descriptor(device, &mut ptr) };
        if rc < 0 {
            debug!(
                "unable to read active config descriptor: {}",
                libusb_error_string(rc)
            );
            return None;
        }
        Some(Self(ptr))
    }
}

impl Drop for ConfigDescriptor {
    fn drop(&mut self) {
        unsafe { libusb::libusb_free_config_descriptor(self.0) };
    }
}
