//! PS3 Eye camera driver: bring-up/teardown sequences and cached controls.
//!
//! Every operation is a named task chain on the camera's task queue, so
//! hardware programming happens strictly in the order it was requested.
//! Setters update the cached value synchronously; the matching register
//! writes converge on the device as their chain runs.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU16, Ordering};

use log::{info, warn};

use crate::task::{AsyncTaskQueue, Step, series};
use crate::usb::request::{
    DeviceHandle, DevicePort, ResultCode, StartBulkTransfer, TransferRequest,
};

use super::constants::{
    FrameRateEntry, NUM_TRANSFERS, OV534_REG_INITDATA, OV534_REG_SENSOR_ADDRESS,
    OV772X_REG_INITDATA, SensorMode, TRANSFER_SIZE, bridge_start_table, closest_frame_rate,
    sensor_start_table,
};
use super::frame::{FrameReader, PacketScanner};
use super::register_io::{
    ov534_reg_read, ov534_reg_write, ov534_write_array, sccb_reg_read, sccb_reg_write,
    sccb_write_array, submit_step,
};

/// Cached camera controls, mirrored to hardware through queued register
/// writes.
#[derive(Debug, Clone, Default)]
pub struct CameraProperties {
    pub autogain: bool,
    pub gain: u8,      // 0..=63
    pub exposure: u8,  // 0..=255
    pub sharpness: u8, // 0..=63
    pub hue: u8,       // 0..=255
    pub awb: bool,
    pub brightness: u8, // 0..=255
    pub contrast: u8,   // 0..=255
    pub blue_balance: u8,
    pub red_balance: u8,
    pub green_balance: u8,
    pub flip_h: bool,
    pub flip_v: bool,

    pub frame_width: u32,
    pub frame_height: u32,
    pub frame_stride: u32,
    pub frame_rate: u8,
}

/// One PS3 Eye camera attached through the shared device manager.
pub struct Camera {
    port: Rc<RefCell<dyn DevicePort>>,
    handle: DeviceHandle,
    properties: CameraProperties,
    mode: Option<SensorMode>,
    is_streaming: bool,
    task_queue: AsyncTaskQueue,
    frames: Option<FrameReader>,
}

impl Camera {
    pub fn new(port: Rc<RefCell<dyn DevicePort>>, handle: DeviceHandle) -> Self {
        Self {
            port,
            handle,
            properties: CameraProperties::default(),
            mode: None,
            is_streaming: false,
            task_queue: AsyncTaskQueue::new(),
            frames: None,
        }
    }

    /// Clamp to a supported mode, pick the effective frame rate, allocate
    /// the frame buffers and queue the sensor bring-up sequence. Returns
    /// false while streaming (the buffers must not be reallocated under a
    /// live stream).
    pub fn init(&mut self, width: u32, height: u32, frame_rate: u32) -> bool {
        if self.is_streaming {
            warn!("camera {}: cannot re-init while streaming", self.handle);
            return false;
        }

        let mode = if width != 0 && width <= 320 && height <= 240 {
            SensorMode::Qvga
        } else {
            SensorMode::Vga
        };
        let (frame_width, frame_height) = mode.dimensions();
        let rate = closest_frame_rate(mode, frame_rate);

        self.mode = Some(mode);
        self.properties.frame_width = frame_width;
        self.properties.frame_height = frame_height;
        self.properties.frame_stride = frame_width * 2; // YUYV
        self.properties.frame_rate = rate.fps;
        self.frames = Some(FrameReader::new((frame_width * frame_height * 2) as usize));
        info!(
            "camera {}: {}x{} @ {} fps",
            self.handle, frame_width, frame_height, rate.fps
        );

        let handle = self.handle;
        let sensor_id = Arc::new(AtomicU16::new(0));
        let mut tasks: Vec<Step> = Vec::new();

        // Bridge reset, then point the bridge's SCCB master at the sensor.
        tasks.push(ov534_write_step(handle, 0xe7, 0x3a));
        tasks.push(ov534_write_step(handle, 0xe0, 0x08));
        tasks.push(ov534_write_step(handle, OV534_REG_SENSOR_ADDRESS, 0x42));
        // Sensor soft reset.
        tasks.push(sccb_write_step(handle, 0x12, 0x80));
        // Probe the sensor id; each half is read twice, the first read after
        // reset being stale.
        tasks.push(sccb_read_step(handle, 0x0a));
        {
            let sensor_id = Arc::clone(&sensor_id);
            tasks.push(Box::new(move |sink, done| {
                sccb_reg_read(
                    sink,
                    handle,
                    0x0a,
                    Box::new(move |sink, result| {
                        if let Ok(value) = result {
                            sensor_id.store(((value as u16) & 0xff) << 8, Ordering::Relaxed);
                        }
                        done(sink, result)
                    }),
                );
            }));
        }
        tasks.push(sccb_read_step(handle, 0x0b));
        {
            let sensor_id = Arc::clone(&sensor_id);
            tasks.push(Box::new(move |sink, done| {
                sccb_reg_read(
                    sink,
                    handle,
                    0x0b,
                    Box::new(move |sink, result| {
                        if let Ok(value) = result {
                            let id = sensor_id.load(Ordering::Relaxed) | ((value as u16) & 0xff);
                            sensor_id.store(id, Ordering::Relaxed);
                            info!("sensor id {id:#06x}");
                        }
                        done(sink, result)
                    }),
                );
            }));
        }
        tasks.push(ov534_array_step(handle, OV534_REG_INITDATA));
        tasks.push(led_step(handle, true));
        tasks.push(sccb_array_step(handle, OV772X_REG_INITDATA));
        // Keep the stream gated off until start().
        tasks.push(ov534_write_step(handle, 0xe0, 0x09));
        tasks.push(led_step(handle, false));

        self.enqueue_chain("init_camera", tasks);
        true
    }

    /// Queue the start sequence: resolution tables, frame rate, every cached
    /// control, LED on, stream gate open, bulk stream up.
    pub fn start(&mut self) {
        if self.is_streaming {
            return;
        }
        let (Some(mode), Some(frames)) = (self.mode, self.frames.as_ref()) else {
            warn!("camera {}: start() before init()", self.handle);
            return;
        };

        let handle = self.handle;
        let rate = closest_frame_rate(mode, u32::from(self.properties.frame_rate));
        let scanner = frames.scanner();
        let props = self.properties.clone();

        let mut tasks: Vec<Step> = Vec::new();
        tasks.push(ov534_array_step(handle, bridge_start_table(mode)));
        tasks.push(sccb_array_step(handle, sensor_start_table(mode)));
        tasks.push(frame_rate_step(handle, rate));
        // Push every cached control so the device converges on the cache.
        tasks.extend(autogain_tasks(
            handle,
            props.autogain,
            props.gain,
            props.exposure,
        ));
        tasks.push(awb_step(handle, props.awb));
        tasks.push(gain_step(handle, props.gain));
        tasks.push(hue_step(handle, props.hue));
        tasks.extend(exposure_tasks(handle, props.exposure));
        tasks.push(brightness_step(handle, props.brightness));
        tasks.push(contrast_step(handle, props.contrast));
        tasks.extend(sharpness_tasks(handle, props.sharpness));
        tasks.push(red_balance_step(handle, props.red_balance));
        tasks.push(blue_balance_step(handle, props.blue_balance));
        tasks.push(green_balance_step(handle, props.green_balance));
        tasks.extend(flip_tasks(handle, props.flip_h, props.flip_v));
        tasks.push(led_step(handle, true));
        tasks.push(ov534_write_step(handle, 0xe0, 0x00)); // stream on
        tasks.push(start_bulk_step(handle, scanner));

        self.enqueue_chain("start_camera", tasks);
        self.is_streaming = true;
    }

    /// Queue the stop sequence: stream gate closed, LED off, bulk stream
    /// cancelled.
    pub fn stop(&mut self) {
        if !self.is_streaming {
            return;
        }
        let handle = self.handle;
        let tasks: Vec<Step> = vec![
            ov534_write_step(handle, 0xe0, 0x09), // stream off
            led_step(handle, false),
            cancel_bulk_step(handle),
        ];
        self.enqueue_chain("stop_camera", tasks);
        self.is_streaming = false;
    }

    pub fn set_autogain(&mut self, enable: bool) {
        self.properties.autogain = enable;
        let tasks = autogain_tasks(
            self.handle,
            enable,
            self.properties.gain,
            self.properties.exposure,
        );
        self.enqueue_chain("set_autogain", tasks);
    }

    pub fn set_auto_white_balance(&mut self, enable: bool) {
        self.properties.awb = enable;
        let task = awb_step(self.handle, enable);
        self.enqueue_chain("set_auto_white_balance", vec![task]);
    }

    pub fn set_gain(&mut self, value: u8) {
        self.properties.gain = value;
        let task = gain_step(self.handle, value);
        self.enqueue_chain("set_gain", vec![task]);
    }

    pub fn set_exposure(&mut self, value: u8) {
        self.properties.exposure = value;
        let tasks = exposure_tasks(self.handle, value);
        self.enqueue_chain("set_exposure", tasks);
    }

    pub fn set_sharpness(&mut self, value: u8) {
        self.properties.sharpness = value;
        let tasks = sharpness_tasks(self.handle, value);
        self.enqueue_chain("set_sharpness", tasks);
    }

    pub fn set_contrast(&mut self, value: u8) {
        self.properties.contrast = value;
        let task = contrast_step(self.handle, value);
        self.enqueue_chain("set_contrast", vec![task]);
    }

    pub fn set_brightness(&mut self, value: u8) {
        self.properties.brightness = value;
        let task = brightness_step(self.handle, value);
        self.enqueue_chain("set_brightness", vec![task]);
    }

    pub fn set_hue(&mut self, value: u8) {
        self.properties.hue = value;
        let task = hue_step(self.handle, value);
        self.enqueue_chain("set_hue", vec![task]);
    }

    pub fn set_red_balance(&mut self, value: u8) {
        self.properties.red_balance = value;
        let task = red_balance_step(self.handle, value);
        self.enqueue_chain("set_red_balance", vec![task]);
    }

    pub fn set_green_balance(&mut self, value: u8) {
        self.properties.green_balance = value;
        let task = green_balance_step(self.handle, value);
        self.enqueue_chain("set_green_balance", vec![task]);
    }

    pub fn set_blue_balance(&mut self, value: u8) {
        self.properties.blue_balance = value;
        let task = blue_balance_step(self.handle, value);
        self.enqueue_chain("set_blue_balance", vec![task]);
    }

    pub fn set_flip(&mut self, horizontal: bool, vertical: bool) {
        self.properties.flip_h = horizontal;
        self.properties.flip_v = vertical;
        let tasks = flip_tasks(self.handle, horizontal, vertical);
        self.enqueue_chain("set_flip", tasks);
    }

    pub fn autogain(&self) -> bool {
        self.properties.autogain
    }

    pub fn auto_white_balance(&self) -> bool {
        self.properties.awb
    }

    pub fn gain(&self) -> u8 {
        self.properties.gain
    }

    pub fn exposure(&self) -> u8 {
        self.properties.exposure
    }

    pub fn sharpness(&self) -> u8 {
        self.properties.sharpness
    }

    pub fn contrast(&self) -> u8 {
        self.properties.contrast
    }

    pub fn brightness(&self) -> u8 {
        self.properties.brightness
    }

    pub fn hue(&self) -> u8 {
        self.properties.hue
    }

    pub fn red_balance(&self) -> u8 {
        self.properties.red_balance
    }

    pub fn green_balance(&self) -> u8 {
        self.properties.green_balance
    }

    pub fn blue_balance(&self) -> u8 {
        self.properties.blue_balance
    }

    pub fn flip_h(&self) -> bool {
        self.properties.flip_h
    }

    pub fn flip_v(&self) -> bool {
        self.properties.flip_v
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }

    pub fn width(&self) -> u32 {
        self.properties.frame_width
    }

    pub fn height(&self) -> u32 {
        self.properties.frame_height
    }

    pub fn row_bytes(&self) -> u32 {
        self.properties.frame_stride
    }

    pub fn frame_rate(&self) -> u8 {
        self.properties.frame_rate
    }

    pub fn properties(&self) -> &CameraProperties {
        &self.properties
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// USB port path of the camera, e.g. `"1.2"`.
    pub fn port_path(&self) -> Option<String> {
        self.port.borrow().port_path(self.handle)
    }

    /// Frames completed by the stream so far.
    pub fn frames_received(&self) -> u32 {
        self.frames
            .as_ref()
            .map(FrameReader::frames_received)
            .unwrap_or(0)
    }

    /// Latest completed frame (YUYV), copied out of the streaming buffers.
    /// Valid until the next call; `None` before `init`.
    pub fn frame(&mut self) -> Option<&[u8]> {
        self.frames.as_mut().map(FrameReader::latest)
    }

    fn enqueue_chain(&mut self, name: &'static str, tasks: Vec<Step>) {
        let mut port = self.port.borrow_mut();
        self.task_queue
            .enqueue(port.as_sink(), name, chain_step(tasks));
    }
}

/// Wrap a task list into a single step resolving with the chain outcome.
fn chain_step(tasks: Vec<Step>) -> Step {
    Box::new(move |sink, done| {
        series(sink, tasks, move |sink, outcome, _results| match outcome {
            Ok(()) => done(sink, Ok(0)),
            Err(err) => done(sink, Err(err)),
        });
    })
}

fn ov534_write_step(handle: DeviceHandle, reg: u16, value: u8) -> Step {
    Box::new(move |sink, done| ov534_reg_write(sink, handle, reg, value, done))
}

fn sccb_write_step(handle: DeviceHandle, reg: u8, value: u8) -> Step {
    Box::new(move |sink, done| sccb_reg_write(sink, handle, reg, value, done))
}

fn sccb_read_step(handle: DeviceHandle, reg: u8) -> Step {
    Box::new(move |sink, done| sccb_reg_read(sink, handle, reg, done))
}

fn ov534_array_step(handle: DeviceHandle, table: &'static [(u8, u8)]) -> Step {
    Box::new(move |sink, done| ov534_write_array(sink, handle, table, done))
}

fn sccb_array_step(handle: DeviceHandle, table: &'static [(u8, u8)]) -> Step {
    Box::new(move |sink, done| sccb_write_array(sink, handle, table, done))
}

fn ov534_read_into(handle: DeviceHandle, reg: u16, cell: Arc<AtomicU8>) -> Step {
    Box::new(move |sink, done| {
        ov534_reg_read(
            sink,
            handle,
            reg,
            Box::new(move |sink, result| {
                if let Ok(value) = result {
                    cell.store(value as u8, Ordering::Relaxed);
                }
                done(sink, result)
            }),
        );
    })
}

/// The LED hangs off two bridge GPIO registers: 0x21 gates the pin as an
/// output, 0x23 drives it.
fn led_step(handle: DeviceHandle, on: bool) -> Step {
    let line = Arc::new(AtomicU8::new(0));
    let mut tasks: Vec<Step> = Vec::new();

    tasks.push(ov534_read_into(handle, 0x21, Arc::clone(&line)));
    {
        let line = Arc::clone(&line);
        tasks.push(Box::new(move |sink, done| {
            let value = line.load(Ordering::Relaxed) | 0x80;
            ov534_reg_write(sink, handle, 0x21, value, done);
        }));
    }
    tasks.push(ov534_read_into(handle, 0x23, Arc::clone(&line)));
    {
        let line = Arc::clone(&line);
        tasks.push(Box::new(move |sink, done| {
            let value = line.load(Ordering::Relaxed);
            let value = if on { value | 0x80 } else { value & !0x80 };
            ov534_reg_write(sink, handle, 0x23, value, done);
        }));
    }
    if !on {
        tasks.push(ov534_read_into(handle, 0x21, Arc::clone(&line)));
        let line = Arc::clone(&line);
        tasks.push(Box::new(move |sink, done| {
            let value = line.load(Ordering::Relaxed) & !0x80;
            ov534_reg_write(sink, handle, 0x21, value, done);
        }));
    }

    chain_step(tasks)
}

/// Program the selected rate row: sensor clock dividers, then the bridge
/// rate register.
fn frame_rate_step(handle: DeviceHandle, rate: &'static FrameRateEntry) -> Step {
    let tasks: Vec<Step> = vec![
        sccb_write_step(handle, 0x11, rate.r11),
        sccb_write_step(handle, 0x0d, rate.r0d),
        ov534_write_step(handle, 0xe5, rate.re5),
    ];
    chain_step(tasks)
}

/// The sensor's two gain-range bits expand into its stage encoding.
fn mapped_gain(value: u8) -> u8 {
    let low = value & 0x0f;
    match value & 0x30 {
        0x00 => low,
        0x10 => low | 0x30,
        0x20 => low | 0x70,
        _ => low | 0xf0,
    }
}

fn gain_step(handle: DeviceHandle, value: u8) -> Step {
    sccb_write_step(handle, 0x00, mapped_gain(value))
}

fn awb_step(handle: DeviceHandle, enable: bool) -> Step {
    sccb_write_step(handle, 0x63, if enable { 0xe0 } else { 0xaa })
}

fn hue_step(handle: DeviceHandle, value: u8) -> Step {
    sccb_write_step(handle, 0x01, value)
}

fn brightness_step(handle: DeviceHandle, value: u8) -> Step {
    sccb_write_step(handle, 0x9b, value)
}

fn contrast_step(handle: DeviceHandle, value: u8) -> Step {
    sccb_write_step(handle, 0x9c, value)
}

fn red_balance_step(handle: DeviceHandle, value: u8) -> Step {
    sccb_write_step(handle, 0x43, value)
}

fn green_balance_step(handle: DeviceHandle, value: u8) -> Step {
    sccb_write_step(handle, 0x44, value)
}

fn blue_balance_step(handle: DeviceHandle, value: u8) -> Step {
    sccb_write_step(handle, 0x42, value)
}

fn exposure_tasks(handle: DeviceHandle, value: u8) -> Vec<Step> {
    vec![
        sccb_write_step(handle, 0x08, value >> 7),
        sccb_write_step(handle, 0x10, value << 1),
    ]
}

fn sharpness_tasks(handle: DeviceHandle, value: u8) -> Vec<Step> {
    vec![
        sccb_write_step(handle, 0x91, value),
        sccb_write_step(handle, 0x8e, value),
    ]
}

/// AGC/AEC/AWB enable plus the 0x64 companion bits; disabling re-pushes the
/// manual gain and exposure.
fn autogain_tasks(handle: DeviceHandle, enable: bool, gain: u8, exposure: u8) -> Vec<Step> {
    let reg64 = Arc::new(AtomicU8::new(0));
    let mut tasks: Vec<Step> = Vec::new();

    if enable {
        tasks.push(sccb_write_step(handle, 0x13, 0xf7)); // AGC,AEC,AWB on
        tasks.push(sccb_read_into(handle, 0x64, Arc::clone(&reg64)));
        tasks.push(Box::new(move |sink, done| {
            let value = reg64.load(Ordering::Relaxed) | 0x03;
            sccb_reg_write(sink, handle, 0x64, value, done);
        }));
    } else {
        tasks.push(sccb_write_step(handle, 0x13, 0xf0)); // AGC,AEC,AWB off
        tasks.push(sccb_read_into(handle, 0x64, Arc::clone(&reg64)));
        tasks.push(Box::new(move |sink, done| {
            let value = reg64.load(Ordering::Relaxed) & 0xfc;
            sccb_reg_write(sink, handle, 0x64, value, done);
        }));
        tasks.push(gain_step(handle, gain));
        tasks.extend(exposure_tasks(handle, exposure));
    }
    tasks
}

fn sccb_read_into(handle: DeviceHandle, reg: u8, cell: Arc<AtomicU8>) -> Step {
    Box::new(move |sink, done| {
        sccb_reg_read(
            sink,
            handle,
            reg,
            Box::new(move |sink, result| {
                if let Ok(value) = result {
                    cell.store(value as u8, Ordering::Relaxed);
                }
                done(sink, result)
            }),
        );
    })
}

/// Horizontal/vertical mirroring via sensor register 0x0c, preserving the
/// unrelated low bits.
fn flip_tasks(handle: DeviceHandle, horizontal: bool, vertical: bool) -> Vec<Step> {
    let reg0c = Arc::new(AtomicU8::new(0));
    let read_cell = Arc::clone(&reg0c);
    vec![
        Box::new(move |sink, done| {
            let cell = Arc::clone(&read_cell);
            sccb_reg_read(
                sink,
                handle,
                0x0c,
                Box::new(move |sink, result| {
                    if let Ok(value) = result {
                        cell.store((value as u8) & !0xc0, Ordering::Relaxed);
                    }
                    done(sink, result)
                }),
            );
        }),
        Box::new(move |sink, done| {
            let mut value = reg0c.load(Ordering::Relaxed);
            if !horizontal {
                value |= 0x40;
            }
            if !vertical {
                value |= 0x80;
            }
            sccb_reg_write(sink, handle, 0x0c, value, done);
        }),
    ]
}

fn start_bulk_step(handle: DeviceHandle, mut scanner: PacketScanner) -> Step {
    Box::new(move |sink, done| {
        let request = TransferRequest::StartBulk(StartBulkTransfer {
            handle,
            packet_size: TRANSFER_SIZE,
            packet_count: NUM_TRANSFERS,
            auto_resubmit: true,
            on_data: Box::new(move |data| scanner.process_payload(data)),
        });
        submit_step(
            sink,
            "start_bulk_transfer",
            request,
            ResultCode::Started,
            |result| result.code() as i32,
            done,
        );
    })
}

fn cancel_bulk_step(handle: DeviceHandle) -> Step {
    Box::new(move |sink, done| {
        submit_step(
            sink,
            "cancel_bulk_transfer",
            TransferRequest::CancelBulk { handle },
            ResultCode::Canceled,
            |result| result.code() as i32,
            done,
        );
    })
}
