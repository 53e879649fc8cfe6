//! OV534 bridge and OV772x sensor register access, composed from chained
//! asynchronous control transfers.
//!
//! Bridge registers are one vendor control transfer away. Sensor registers
//! sit behind the bridge's SCCB tunnel: an operation is staged through the
//! SUBADDR/WRITE/OPERATION registers and confirmed by polling STATUS.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, warn};

use crate::task::{ChainError, LoopDone, Step, StepDone, series, whilst};
use crate::usb::request::{
    ControlTransfer, DeviceHandle, MAX_CONTROL_PAYLOAD, RequestSink, ResultCode, TransferRequest,
    TransferResult, vendor_device_request_in, vendor_device_request_out,
};

use super::constants::{
    CTRL_TIMEOUT_MS, OV534_OP_READ_2, OV534_OP_WRITE_2, OV534_OP_WRITE_3, OV534_REG_OPERATION,
    OV534_REG_READ, OV534_REG_STATUS, OV534_REG_SUBADDR, OV534_REG_WRITE, SCCB_STATUS_POLLS,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Submit `request` and resolve `done` with `map(result)` on success or the
/// failure code otherwise. `expected` is the success code of this request
/// kind. A full request queue fails the step with `SubmitFailed`.
pub(crate) fn submit_step(
    sink: &mut dyn RequestSink,
    op: &'static str,
    request: TransferRequest,
    expected: ResultCode,
    map: impl FnOnce(&TransferResult) -> i32 + Send + 'static,
    done: StepDone,
) {
    let done = Arc::new(Mutex::new(Some(done)));
    let completion = Arc::clone(&done);
    let accepted = sink.submit(
        request,
        Box::new(move |result, sink| {
            let Some(done) = lock(&completion).take() else {
                return;
            };
            let code = result.code();
            if code == expected {
                done(sink, Ok(map(&result)));
            } else {
                error!("{op}: {code}");
                done(sink, Err(ChainError(code as i32)));
            }
        }),
    );
    if !accepted {
        warn!("{op}: request queue full");
        if let Some(done) = lock(&done).take() {
            done(sink, Err(ChainError(ResultCode::SubmitFailed as i32)));
        }
    }
}

fn control_request(
    handle: DeviceHandle,
    bm_request_type: u8,
    reg: u16,
    value: u8,
) -> TransferRequest {
    let mut data = [0u8; MAX_CONTROL_PAYLOAD];
    data[0] = value;
    TransferRequest::Control(ControlTransfer {
        handle,
        bm_request_type,
        b_request: 0x01,
        w_value: 0x00,
        w_index: reg,
        w_length: 1,
        data,
        timeout_ms: CTRL_TIMEOUT_MS,
    })
}

/// Write one OV534 bridge register. Resolves with the transfer result code.
pub(crate) fn ov534_reg_write(
    sink: &mut dyn RequestSink,
    handle: DeviceHandle,
    reg: u16,
    value: u8,
    done: StepDone,
) {
    let request = control_request(handle, vendor_device_request_out(), reg, value);
    submit_step(
        sink,
        "ov534_reg_write",
        request,
        ResultCode::Completed,
        |result| result.code() as i32,
        done,
    );
}

/// Read one OV534 bridge register. Resolves with the register value.
pub(crate) fn ov534_reg_read(
    sink: &mut dyn RequestSink,
    handle: DeviceHandle,
    reg: u16,
    done: StepDone,
) {
    let request = control_request(handle, vendor_device_request_in(), reg, 0);
    submit_step(
        sink,
        "ov534_reg_read",
        request,
        ResultCode::Completed,
        |result| match result {
            TransferResult::Control(control) => i32::from(control.data[0]),
            TransferResult::Bulk(_) => 0,
        },
        done,
    );
}

/// Run `tasks` in order and resolve `done` with the final step's value.
fn series_last(sink: &mut dyn RequestSink, tasks: Vec<Step>, done: StepDone) {
    series(sink, tasks, move |sink, outcome, results| {
        let last = results.last().copied().unwrap_or(0);
        match outcome {
            Ok(()) => done(sink, Ok(last)),
            Err(err) => done(sink, Err(err)),
        }
    });
}

/// Map a status-poll outcome onto the owning chain: anything but a confirmed
/// success aborts it.
fn sccb_status_step(sink: &mut dyn RequestSink, handle: DeviceHandle, done: StepDone) {
    sccb_check_status(
        sink,
        handle,
        Box::new(move |sink, result| match result {
            Ok(1) => done(sink, Ok(1)),
            Ok(status) => done(sink, Err(ChainError(status))),
            Err(err) => done(sink, Err(err)),
        }),
    );
}

/// Write one sensor register through the SCCB tunnel.
pub(crate) fn sccb_reg_write(
    sink: &mut dyn RequestSink,
    handle: DeviceHandle,
    reg: u8,
    value: u8,
    done: StepDone,
) {
    let tasks: Vec<Step> = vec![
        Box::new(move |sink, done| ov534_reg_write(sink, handle, OV534_REG_SUBADDR, reg, done)),
        Box::new(move |sink, done| ov534_reg_write(sink, handle, OV534_REG_WRITE, value, done)),
        Box::new(move |sink, done| {
            ov534_reg_write(sink, handle, OV534_REG_OPERATION, OV534_OP_WRITE_3, done)
        }),
        Box::new(move |sink, done| sccb_status_step(sink, handle, done)),
    ];
    series_last(sink, tasks, done);
}

/// Read one sensor register through the SCCB tunnel. Resolves with the
/// register value.
pub(crate) fn sccb_reg_read(
    sink: &mut dyn RequestSink,
    handle: DeviceHandle,
    reg: u8,
    done: StepDone,
) {
    let tasks: Vec<Step> = vec![
        Box::new(move |sink, done| ov534_reg_write(sink, handle, OV534_REG_SUBADDR, reg, done)),
        Box::new(move |sink, done| {
            ov534_reg_write(sink, handle, OV534_REG_OPERATION, OV534_OP_WRITE_2, done)
        }),
        Box::new(move |sink, done| sccb_status_step(sink, handle, done)),
        Box::new(move |sink, done| {
            ov534_reg_write(sink, handle, OV534_REG_OPERATION, OV534_OP_READ_2, done)
        }),
        Box::new(move |sink, done| sccb_status_step(sink, handle, done)),
        Box::new(move |sink, done| ov534_reg_read(sink, handle, OV534_REG_READ, done)),
    ];
    series_last(sink, tasks, done);
}

struct StatusPoll {
    attempts: usize,
    settled: bool,
    result: i32,
}

/// Poll the SCCB status register until it reports a conclusive value, up to
/// [`SCCB_STATUS_POLLS`] times. Resolves with 1 (operation confirmed) or 0
/// (operation failed or still pending after the last poll). Read errors
/// consume an attempt and keep polling.
pub(crate) fn sccb_check_status(sink: &mut dyn RequestSink, handle: DeviceHandle, done: StepDone) {
    let poll = Arc::new(Mutex::new(StatusPoll {
        attempts: 0,
        settled: false,
        result: 0,
    }));

    let cond_poll = Arc::clone(&poll);
    let condition = move || {
        let mut guard = lock(&cond_poll);
        if guard.settled || guard.attempts >= SCCB_STATUS_POLLS {
            return false;
        }
        guard.attempts += 1;
        true
    };

    let body_poll = Arc::clone(&poll);
    let body = move |sink: &mut dyn RequestSink, loop_done: LoopDone| {
        let poll = Arc::clone(&body_poll);
        ov534_reg_read(
            sink,
            handle,
            OV534_REG_STATUS,
            Box::new(move |sink, result| {
                if let Ok(status) = result {
                    let mut guard = lock(&poll);
                    match status {
                        0x00 => {
                            guard.result = 1;
                            guard.settled = true;
                        }
                        0x04 => {
                            guard.result = 0;
                            guard.settled = true;
                        }
                        0x03 => {}
                        other => warn!("sccb_check_status: unknown sccb status {other:#04x}"),
                    }
                }
                // A failed read just consumed one attempt.
                loop_done(sink, Ok(()));
            }),
        );
    };

    let finish_poll = Arc::clone(&poll);
    whilst(sink, condition, body, move |sink, outcome| {
        let result = lock(&finish_poll).result;
        match outcome {
            Ok(()) => done(sink, Ok(result)),
            Err(err) => done(sink, Err(err)),
        }
    });
}

/// Write a `(register, value)` table to the bridge.
pub(crate) fn ov534_write_array(
    sink: &mut dyn RequestSink,
    handle: DeviceHandle,
    table: &'static [(u8, u8)],
    done: StepDone,
) {
    let cursor = Arc::new(AtomicUsize::new(0));
    let cond_cursor = Arc::clone(&cursor);
    whilst(
        sink,
        move || cond_cursor.load(Ordering::Relaxed) < table.len(),
        move |sink, loop_done| {
            let (reg, value) = table[cursor.fetch_add(1, Ordering::Relaxed)];
            ov534_reg_write(
                sink,
                handle,
                u16::from(reg),
                value,
                Box::new(move |sink, result| loop_done(sink, result.map(|_| ()))),
            );
        },
        move |sink, outcome| match outcome {
            Ok(()) => done(sink, Ok(0)),
            Err(err) => done(sink, Err(err)),
        },
    );
}

/// Write a `(register, value)` table to the sensor. A row with register
/// 0xff is a settle delay: read sensor register `value` once, then write
/// 0x00 to register 0xff.
pub(crate) fn sccb_write_array(
    sink: &mut dyn RequestSink,
    handle: DeviceHandle,
    table: &'static [(u8, u8)],
    done: StepDone,
) {
    let cursor = Arc::new(AtomicUsize::new(0));
    let cond_cursor = Arc::clone(&cursor);
    whilst(
        sink,
        move || cond_cursor.load(Ordering::Relaxed) < table.len(),
        move |sink, loop_done| {
            let (reg, value) = table[cursor.fetch_add(1, Ordering::Relaxed)];
            if reg == 0xff {
                let tasks: Vec<Step> = vec![
                    Box::new(move |sink, done| sccb_reg_read(sink, handle, value, done)),
                    Box::new(move |sink, done| sccb_reg_write(sink, handle, 0xff, 0x00, done)),
                ];
                series(sink, tasks, move |sink, outcome, _results| {
                    loop_done(sink, outcome)
                });
            } else {
                sccb_reg_write(
                    sink,
                    handle,
                    reg,
                    value,
                    Box::new(move |sink, result| loop_done(sink, result.map(|_| ()))),
                );
            }
        },
        move |sink, outcome| match outcome {
            Ok(()) => done(sink, Ok(0)),
            Err(err) => done(sink, Err(err)),
        },
    );
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::usb::request::{BulkResult, ControlResult, PacketCallback, ResultCallback};
    use std::collections::{HashMap, VecDeque};

    /// Direction + register + payload byte of one recorded control transfer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Recorded {
        Write { reg: u16, value: u8 },
        Read { reg: u16 },
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum BulkEvent {
        Start {
            packet_size: usize,
            packet_count: usize,
            auto_resubmit: bool,
        },
        Cancel,
    }

    /// Request sink that executes requests immediately: control transfers
    /// run against a scripted register file, bulk requests are recorded and
    /// acknowledged.
    #[derive(Default)]
    pub(crate) struct MockControlSink {
        pub log: Vec<Recorded>,
        /// Scripted replies per register; the last value is sticky.
        pub replies: HashMap<u16, VecDeque<u8>>,
        /// Registers whose reads fail with a pipe error.
        pub broken_regs: Vec<u16>,
        pub bulk_events: Vec<BulkEvent>,
        /// Data callback of the last accepted bulk stream.
        pub stream: Option<PacketCallback>,
    }

    impl MockControlSink {
        pub(crate) fn script(&mut self, reg: u16, values: &[u8]) {
            self.replies.insert(reg, values.iter().copied().collect());
        }

        fn next_reply(&mut self, reg: u16) -> u8 {
            match self.replies.get_mut(&reg) {
                Some(values) if values.len() > 1 => values.pop_front().unwrap_or(0),
                Some(values) => values.front().copied().unwrap_or(0),
                None => 0,
            }
        }

        pub(crate) fn writes(&self) -> Vec<(u16, u8)> {
            self.log
                .iter()
                .filter_map(|entry| match entry {
                    Recorded::Write { reg, value } => Some((*reg, *value)),
                    Recorded::Read { .. } => None,
                })
                .collect()
        }

        pub(crate) fn reads_of(&self, reg: u16) -> usize {
            self.log
                .iter()
                .filter(|entry| matches!(entry, Recorded::Read { reg: r } if *r == reg))
                .count()
        }
    }

    impl RequestSink for MockControlSink {
        fn submit(&mut self, request: TransferRequest, on_result: ResultCallback) -> bool {
            let control = match request {
                TransferRequest::Control(control) => control,
                TransferRequest::StartBulk(start) => {
                    self.bulk_events.push(BulkEvent::Start {
                        packet_size: start.packet_size,
                        packet_count: start.packet_count,
                        auto_resubmit: start.auto_resubmit,
                    });
                    self.stream = Some(start.on_data);
                    on_result(
                        TransferResult::Bulk(BulkResult {
                            handle: start.handle,
                            code: ResultCode::Started,
                        }),
                        self,
                    );
                    return true;
                }
                TransferRequest::CancelBulk { handle } => {
                    self.bulk_events.push(BulkEvent::Cancel);
                    self.stream = None;
                    on_result(
                        TransferResult::Bulk(BulkResult {
                            handle,
                            code: ResultCode::Canceled,
                        }),
                        self,
                    );
                    return true;
                }
            };
            let reg = control.w_index;
            let is_read = control.bm_request_type & 0x80 != 0;

            let mut data = control.data;
            let code = if self.broken_regs.contains(&reg) {
                ResultCode::Pipe
            } else if is_read {
                self.log.push(Recorded::Read { reg });
                data[0] = self.next_reply(reg);
                ResultCode::Completed
            } else {
                self.log.push(Recorded::Write {
                    reg,
                    value: control.data[0],
                });
                ResultCode::Completed
            };

            on_result(
                TransferResult::Control(ControlResult {
                    handle: control.handle,
                    code,
                    data,
                    len: control.w_length as usize,
                }),
                self,
            );
            true
        }
    }

    use crate::task::StepResult;

    fn capture_result() -> (Arc<Mutex<Option<StepResult>>>, StepDone) {
        let cell: Arc<Mutex<Option<StepResult>>> = Arc::new(Mutex::new(None));
        let writer = Arc::clone(&cell);
        let done: StepDone = Box::new(move |_sink, result| {
            *lock(&writer) = Some(result);
        });
        (cell, done)
    }

    const HANDLE: DeviceHandle = DeviceHandle(0);

    #[test]
    fn chained_bridge_writes_in_order() {
        let mut sink = MockControlSink::default();
        let result: Arc<Mutex<Option<StepResult>>> = Arc::new(Mutex::new(None));
        let tasks: Vec<Step> = vec![
            Box::new(|sink, done| ov534_reg_write(sink, HANDLE, 0xe7, 0x3a, done)),
            Box::new(|sink, done| ov534_reg_write(sink, HANDLE, 0xe0, 0x08, done)),
            Box::new(|sink, done| ov534_reg_write(sink, HANDLE, 0x21, 0xf0, done)),
        ];
        series(&mut sink, tasks, {
            let result = Arc::clone(&result);
            move |_sink, outcome, _results| {
                *lock(&result) = Some(outcome.map(|()| 0));
            }
        });

        assert_eq!(*lock(&result), Some(Ok(0)));
        assert_eq!(
            sink.writes(),
            vec![(0xe7, 0x3a), (0xe0, 0x08), (0x21, 0xf0)]
        );
    }

    #[test]
    fn status_poll_stops_on_success() {
        let mut sink = MockControlSink::default();
        sink.script(OV534_REG_STATUS, &[0x03, 0x03, 0x00]);
        let (result, done) = capture_result();
        sccb_check_status(&mut sink, HANDLE, done);

        assert_eq!(*lock(&result), Some(Ok(1)));
        assert_eq!(sink.reads_of(OV534_REG_STATUS), 3);
    }

    #[test]
    fn status_poll_gives_up_after_five_attempts() {
        let mut sink = MockControlSink::default();
        sink.script(OV534_REG_STATUS, &[0x03]);
        let (result, done) = capture_result();
        sccb_check_status(&mut sink, HANDLE, done);

        assert_eq!(*lock(&result), Some(Ok(0)));
        assert_eq!(sink.reads_of(OV534_REG_STATUS), 5);
    }

    #[test]
    fn status_poll_reports_failure_byte() {
        let mut sink = MockControlSink::default();
        sink.script(OV534_REG_STATUS, &[0x04]);
        let (result, done) = capture_result();
        sccb_check_status(&mut sink, HANDLE, done);

        assert_eq!(*lock(&result), Some(Ok(0)));
        assert_eq!(sink.reads_of(OV534_REG_STATUS), 1);
    }

    #[test]
    fn sccb_write_stages_the_tunnel_operation() {
        let mut sink = MockControlSink::default();
        sink.script(OV534_REG_STATUS, &[0x00]);
        let (result, done) = capture_result();
        sccb_reg_write(&mut sink, HANDLE, 0x12, 0x80, done);

        assert_eq!(*lock(&result), Some(Ok(1)));
        assert_eq!(
            sink.writes(),
            vec![
                (OV534_REG_SUBADDR, 0x12),
                (OV534_REG_WRITE, 0x80),
                (OV534_REG_OPERATION, OV534_OP_WRITE_3),
            ]
        );
    }

    #[test]
    fn sccb_write_fails_when_status_never_confirms() {
        let mut sink = MockControlSink::default();
        sink.script(OV534_REG_STATUS, &[0x04]);
        let (result, done) = capture_result();
        sccb_reg_write(&mut sink, HANDLE, 0x12, 0x80, done);

        assert_eq!(*lock(&result), Some(Err(ChainError(0))));
    }

    #[test]
    fn sccb_read_returns_the_register_value() {
        let mut sink = MockControlSink::default();
        sink.script(OV534_REG_STATUS, &[0x00]);
        sink.script(OV534_REG_READ, &[0x77]);
        let (result, done) = capture_result();
        sccb_reg_read(&mut sink, HANDLE, 0x0a, done);

        assert_eq!(*lock(&result), Some(Ok(0x77)));
        assert_eq!(
            sink.writes(),
            vec![
                (OV534_REG_SUBADDR, 0x0a),
                (OV534_REG_OPERATION, OV534_OP_WRITE_2),
                (OV534_REG_OPERATION, OV534_OP_READ_2),
            ]
        );
    }

    #[test]
    fn bridge_array_write_preserves_table_order() {
        let mut sink = MockControlSink::default();
        static TABLE: &[(u8, u8)] = &[(0x1c, 0x00), (0x1d, 0x40), (0x1d, 0x02)];
        let (result, done) = capture_result();
        ov534_write_array(&mut sink, HANDLE, TABLE, done);

        assert_eq!(*lock(&result), Some(Ok(0)));
        assert_eq!(
            sink.writes(),
            vec![(0x1c, 0x00), (0x1d, 0x40), (0x1d, 0x02)]
        );
    }

    #[test]
    fn sensor_array_write_expands_the_delay_sentinel() {
        let mut sink = MockControlSink::default();
        sink.script(OV534_REG_STATUS, &[0x00]);
        static TABLE: &[(u8, u8)] = &[(0x12, 0x80), (0xff, 0x11), (0x3d, 0x03)];
        let (result, done) = capture_result();
        sccb_write_array(&mut sink, HANDLE, TABLE, done);

        assert_eq!(*lock(&result), Some(Ok(0)));
        // Sentinel row reads register 0x11 and then clears register 0xff.
        let writes = sink.writes();
        assert!(writes.contains(&(OV534_REG_SUBADDR, 0x11)));
        assert!(writes.contains(&(OV534_REG_SUBADDR, 0xff)));
        assert!(writes.contains(&(OV534_REG_WRITE, 0x00)));
        assert_eq!(writes.first(), Some(&(OV534_REG_SUBADDR, 0x12)));
        assert_eq!(sink.reads_of(OV534_REG_READ), 1);
    }

    #[test]
    fn transfer_failure_short_circuits_the_chain() {
        let mut sink = MockControlSink {
            broken_regs: vec![OV534_REG_WRITE],
            ..Default::default()
        };
        let (result, done) = capture_result();
        sccb_reg_write(&mut sink, HANDLE, 0x12, 0x80, done);

        assert_eq!(
            *lock(&result),
            Some(Err(ChainError(ResultCode::Pipe as i32)))
        );
        // The tunnel operation was never staged.
        assert_eq!(sink.writes(), vec![(OV534_REG_SUBADDR, 0x12)]);
    }
}
