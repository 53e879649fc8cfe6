//! UVC payload reassembly and double-buffered frame publication.
//!
//! The packet scanner runs on the USB worker thread inside the bulk transfer
//! callback; the frame reader runs on the main thread. They share two frame
//! buffers and a single atomic counter: the scanner writes only
//! `buffers[counter % 2]` and bumps the counter (release) when a frame
//! completes, so the completed frame always sits at
//! `buffers[(counter + 1) % 2]`. The reader copies that buffer and re-reads
//! the counter to detect a racing publication, retrying a bounded number of
//! times and preferring a skipped frame over a torn one.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use log::debug;

/// Bulk payloads are carved into fixed-size packets.
pub(crate) const PACKET_SIZE: usize = 2048;
/// Every packet starts with a 12-byte UVC-style header.
pub(crate) const HEADER_SIZE: usize = 12;

// Header flag bits (byte 1).
const UVC_STREAM_ERR: u8 = 0x40;
const UVC_STREAM_PTS: u8 = 0x04;
const UVC_STREAM_EOF: u8 = 0x02;
const UVC_STREAM_FID: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketKind {
    First,
    Inter,
    Last,
    Discard,
}

struct SharedFrames {
    frame_size: usize,
    buffers: [UnsafeCell<Box<[u8]>>; 2],
    counter: AtomicU32,
}

// The buffers are raced deliberately; the counter protocol above keeps the
// reader off the buffer the scanner is filling except during a publication
// race, which the reader detects and retries.
unsafe impl Send for SharedFrames {}
unsafe impl Sync for SharedFrames {}

/// Producer half: reassembles UVC packets into frames. Owned by the bulk
/// transfer data callback on the USB worker thread.
pub(crate) struct PacketScanner {
    shared: Arc<SharedFrames>,
    last_pts: u32,
    last_fid: u8,
    last_kind: PacketKind,
    bytes_written: usize,
}

impl PacketScanner {
    /// Feed one bulk transfer's payload through the packet state machine.
    pub(crate) fn process_payload(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let len = data.len().min(PACKET_SIZE);
            self.scan_packet(&data[..len]);
            data = &data[len..];
        }
    }

    /// Frames start when the FID toggles or the PTS changes, and end on an
    /// EOF packet that completes the exact frame byte count.
    fn scan_packet(&mut self, packet: &[u8]) {
        if packet.len() < HEADER_SIZE || packet[0] != HEADER_SIZE as u8 {
            debug!("bad packet header");
            self.frame_add(PacketKind::Discard, &[]);
            return;
        }
        let flags = packet[1];
        if flags & UVC_STREAM_ERR != 0 {
            debug!("payload error");
            self.frame_add(PacketKind::Discard, &[]);
            return;
        }
        if flags & UVC_STREAM_PTS == 0 {
            debug!("PTS not present");
            self.frame_add(PacketKind::Discard, &[]);
            return;
        }

        let pts = u32::from_le_bytes([packet[2], packet[3], packet[4], packet[5]]);
        let fid = flags & UVC_STREAM_FID;
        let payload = &packet[HEADER_SIZE..];

        if pts != self.last_pts || fid != self.last_fid {
            // New frame boundary; an unfinished frame is dropped.
            if self.last_kind == PacketKind::Inter {
                self.frame_add(PacketKind::Discard, &[]);
            }
            self.last_pts = pts;
            self.last_fid = fid;
            self.frame_add(PacketKind::First, payload);
        } else if flags & UVC_STREAM_EOF != 0 {
            self.last_pts = 0;
            if self.bytes_written + payload.len() != self.shared.frame_size {
                debug!(
                    "wrong frame length at EOF: {} + {} != {}",
                    self.bytes_written,
                    payload.len(),
                    self.shared.frame_size
                );
                self.frame_add(PacketKind::Discard, &[]);
            } else {
                self.frame_add(PacketKind::Last, payload);
            }
        } else {
            self.frame_add(PacketKind::Inter, payload);
        }
    }

    fn frame_add(&mut self, kind: PacketKind, data: &[u8]) {
        let mut kind = kind;
        if kind == PacketKind::First {
            self.bytes_written = 0;
        } else {
            match self.last_kind {
                PacketKind::Discard => {
                    if kind == PacketKind::Last {
                        self.last_kind = kind;
                        self.bytes_written = 0;
                    }
                    return;
                }
                PacketKind::Last => return,
                _ => {}
            }
        }

        if !data.is_empty() {
            if self.bytes_written + data.len() > self.shared.frame_size {
                debug!("frame overflow, discarding");
                kind = PacketKind::Discard;
                self.bytes_written = 0;
            } else {
                let index = (self.shared.counter.load(Ordering::Relaxed) % 2) as usize;
                unsafe {
                    let buffer = self.shared.buffers[index].get();
                    ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        (*buffer).as_mut_ptr().add(self.bytes_written),
                        data.len(),
                    );
                }
                self.bytes_written += data.len();
            }
        }

        self.last_kind = kind;

        if kind == PacketKind::Last {
            self.bytes_written = 0;
            self.shared.counter.fetch_add(1, Ordering::Release);
        }
    }
}

/// Consumer half: owns the copy buffer handed out to callers.
pub struct FrameReader {
    shared: Arc<SharedFrames>,
    seen: u32,
    copy: Box<[u8]>,
}

impl FrameReader {
    pub(crate) fn new(frame_size: usize) -> Self {
        Self {
            shared: Arc::new(SharedFrames {
                frame_size,
                buffers: [
                    UnsafeCell::new(vec![0u8; frame_size].into_boxed_slice()),
                    UnsafeCell::new(vec![0u8; frame_size].into_boxed_slice()),
                ],
                counter: AtomicU32::new(0),
            }),
            seen: 0,
            copy: vec![0u8; frame_size].into_boxed_slice(),
        }
    }

    /// Fresh producer state over the same buffers. Built once per stream
    /// start; the buffers themselves must not be reallocated while a stream
    /// is running.
    pub(crate) fn scanner(&self) -> PacketScanner {
        PacketScanner {
            shared: Arc::clone(&self.shared),
            last_pts: 0,
            last_fid: 0,
            last_kind: PacketKind::Discard,
            bytes_written: 0,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.shared.frame_size
    }

    /// Frames published by the producer so far.
    pub fn frames_received(&self) -> u32 {
        self.shared.counter.load(Ordering::Acquire)
    }

    /// Latest completed frame. The slice stays valid until the next call;
    /// before the first published frame it is all zeroes.
    pub fn latest(&mut self) -> &[u8] {
        for _ in 0..3 {
            let published = self.shared.counter.load(Ordering::Acquire);
            if published == self.seen {
                break;
            }
            let index = ((published + 1) % 2) as usize;
            unsafe {
                let buffer = self.shared.buffers[index].get();
                ptr::copy_nonoverlapping(
                    (*buffer).as_ptr(),
                    self.copy.as_mut_ptr(),
                    self.shared.frame_size,
                );
            }
            self.seen = published;
            if self.shared.counter.load(Ordering::Acquire) == published {
                break;
            }
            // A publication raced the copy; go around again rather than
            // hand out a torn frame.
        }
        &self.copy
    }
}
