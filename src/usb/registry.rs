use log::{debug, info};

use crate::usb::host::{Candidate, ProbeAccess};
use crate::usb::request::{DeviceHandle, DeviceInfo};

/// Tracking cameras the service recognizes.
pub const TRACKER_WHITELIST: &[DeviceInfo] = &[
    DeviceInfo {
        vendor_id: 0x1415,
        product_id: 0x2000,
    }, // PS3Eye
    //DeviceInfo { vendor_id: 0x05a9, product_id: 0x058a }, // PS4 Camera - TODO
    //DeviceInfo { vendor_id: 0x045e, product_id: 0x02ae }, // V1 Kinect - TODO
];

/// One entry of the filtered device table.
pub(crate) struct DeviceRecord<D, O> {
    pub device: D,
    pub vendor_id: u16,
    pub product_id: u16,
    pub port_numbers: Vec<u8>,
    /// False when the accessibility probe was denied; `open` will never
    /// succeed for such a device but it is still listed.
    pub openable: bool,
    pub open: Option<O>,
    pub interface_claimed: bool,
}

/// Filtered device table built once at manager startup. Handles are indices
/// into this table and stay valid until shutdown.
pub(crate) struct DeviceTable<D, O> {
    records: Vec<DeviceRecord<D, O>>,
}

impl<D, O> Default for DeviceTable<D, O> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
        }
    }
}

impl<D, O> DeviceTable<D, O> {
    /// Filter `candidates` against `whitelist`, dropping enumerator aliases
    /// that repeat the previous device's port path, and probe each survivor
    /// for accessibility.
    pub(crate) fn build(
        candidates: Vec<Candidate<D>>,
        whitelist: &[DeviceInfo],
        mut probe: impl FnMut(&D) -> ProbeAccess,
    ) -> Self {
        let mut records: Vec<DeviceRecord<D, O>> = Vec::new();
        let mut last_ports: Option<Vec<u8>> = None;

        for candidate in candidates {
            let whitelisted = whitelist.iter().any(|entry| {
                entry.vendor_id == candidate.vendor_id && entry.product_id == candidate.product_id
            });
            if !whitelisted {
                continue;
            }
            if candidate.port_numbers.is_empty() {
                debug!(
                    "skipping {:04x}:{:04x}: no port path",
                    candidate.vendor_id, candidate.product_id
                );
                continue;
            }
            // Some enumerators report the same physical device twice; a
            // repeat of the previous port path is such an alias.
            if last_ports.as_deref() == Some(candidate.port_numbers.as_slice()) {
                debug!(
                    "skipping {:04x}:{:04x}: duplicate port path",
                    candidate.vendor_id, candidate.product_id
                );
                continue;
            }

            let openable = match probe(&candidate.device) {
                ProbeAccess::Openable => true,
                ProbeAccess::Denied => false,
                ProbeAccess::Unavailable => {
                    debug!(
                        "dropping {:04x}:{:04x}: device unavailable",
                        candidate.vendor_id, candidate.product_id
                    );
                    continue;
                }
            };

            last_ports = Some(candidate.port_numbers.clone());
            info!(
                "device {}: {:04x}:{:04x} at port path {}{}",
                records.len(),
                candidate.vendor_id,
                candidate.product_id,
                format_port_path(&candidate.port_numbers),
                if openable { "" } else { " (access denied)" }
            );
            records.push(DeviceRecord {
                device: candidate.device,
                vendor_id: candidate.vendor_id,
                product_id: candidate.product_id,
                port_numbers: candidate.port_numbers,
                openable,
                open: None,
                interface_claimed: false,
            });
        }

        Self { records }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn get(&self, handle: DeviceHandle) -> Option<&DeviceRecord<D, O>> {
        self.records.get(handle.0)
    }

    pub(crate) fn get_mut(&mut self, handle: DeviceHandle) -> Option<&mut DeviceRecord<D, O>> {
        self.records.get_mut(handle.0)
    }

    pub(crate) fn records_mut(&mut self) -> impl Iterator<Item = &mut DeviceRecord<D, O>> {
        self.records.iter_mut()
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }

    pub(crate) fn device_info(&self, handle: DeviceHandle) -> Option<DeviceInfo> {
        self.get(handle).map(|record| DeviceInfo {
            vendor_id: record.vendor_id,
            product_id: record.product_id,
        })
    }

    /// Human-readable identifier, e.g. `USB\VID_1415&PID_2000\0`.
    pub(crate) fn device_path(&self, handle: DeviceHandle) -> Option<String> {
        self.get(handle).map(|record| {
            format!(
                "USB\\VID_{:04X}&PID_{:04X}\\{}",
                record.vendor_id, record.product_id, handle.0
            )
        })
    }

    /// Dotted port-number chain, e.g. `"1.2"`.
    pub(crate) fn port_path(&self, handle: DeviceHandle) -> Option<String> {
        self.get(handle)
            .map(|record| format_port_path(&record.port_numbers))
    }

    pub(crate) fn is_open(&self, handle: DeviceHandle) -> bool {
        self.get(handle)
            .is_some_and(|record| record.open.is_some())
    }

    pub(crate) fn first_handle(&self) -> Option<DeviceHandle> {
        (!self.records.is_empty()).then_some(DeviceHandle(0))
    }

    pub(crate) fn next_handle(&self, handle: DeviceHandle) -> Option<DeviceHandle> {
        (handle.0 + 1 < self.records.len()).then_some(DeviceHandle(handle.0 + 1))
    }
}

fn format_port_path(ports: &[u8]) -> String {
    let mut path = String::new();
    for (index, port) in ports.iter().enumerate() {
        if index > 0 {
            path.push('.');
        }
        path.push_str(&port.to_string());
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(vendor_id: u16, product_id: u16, ports: &[u8]) -> Candidate<u32> {
        Candidate {
            device: 0,
            vendor_id,
            product_id,
            port_numbers: ports.to_vec(),
        }
    }

    fn build(
        candidates: Vec<Candidate<u32>>,
        probe: impl FnMut(&u32) -> ProbeAccess,
    ) -> DeviceTable<u32, ()> {
        DeviceTable::build(candidates, TRACKER_WHITELIST, probe)
    }

    #[test]
    fn whitelist_and_port_dedup() {
        let table = build(
            vec![
                candidate(0x1415, 0x2000, &[1, 2]),
                candidate(0xdead, 0xbeef, &[1, 3]),
                candidate(0x1415, 0x2000, &[1, 2]),
            ],
            |_| ProbeAccess::Openable,
        );

        assert_eq!(table.len(), 1);
        let handle = table.first_handle().unwrap();
        assert_eq!(
            table.device_path(handle).unwrap(),
            "USB\\VID_1415&PID_2000\\0"
        );
        assert_eq!(table.port_path(handle).unwrap(), "1.2");
        assert_eq!(table.next_handle(handle), None);
    }

    #[test]
    fn distinct_ports_are_distinct_devices() {
        let table = build(
            vec![
                candidate(0x1415, 0x2000, &[1, 2]),
                candidate(0x1415, 0x2000, &[1, 3]),
            ],
            |_| ProbeAccess::Openable,
        );
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.device_path(DeviceHandle(1)).unwrap(),
            "USB\\VID_1415&PID_2000\\1"
        );
    }

    #[test]
    fn denied_devices_are_listed_but_not_openable() {
        let table = build(
            vec![candidate(0x1415, 0x2000, &[4])],
            |_| ProbeAccess::Denied,
        );
        assert_eq!(table.len(), 1);
        assert!(!table.get(DeviceHandle(0)).unwrap().openable);
    }

    #[test]
    fn unavailable_devices_are_dropped() {
        let mut first = candidate(0x1415, 0x2000, &[4]);
        first.device = 1;
        let second = candidate(0x1415, 0x2000, &[5]);
        let table = build(vec![first, second], |device| {
            if *device == 1 {
                ProbeAccess::Unavailable
            } else {
                ProbeAccess::Openable
            }
        });
        assert_eq!(table.len(), 1);
        assert_eq!(table.port_path(DeviceHandle(0)).unwrap(), "5");
    }

    #[test]
    fn whitelist_misses_do_not_update_port_cache() {
        // The non-whitelisted device in the middle must not break the
        // aliased-pair detection around it.
        let table = build(
            vec![
                candidate(0x1415, 0x2000, &[1, 2]),
                candidate(0xdead, 0xbeef, &[1, 2]),
                candidate(0x1415, 0x2000, &[1, 2]),
            ],
            |_| ProbeAccess::Openable,
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn whitelisted_info_round_trips() {
        let table = build(
            vec![candidate(0x1415, 0x2000, &[7])],
            |_| ProbeAccess::Openable,
        );
        let info = table.device_info(DeviceHandle(0)).unwrap();
        assert!(TRACKER_WHITELIST.contains(&info));
    }
}
