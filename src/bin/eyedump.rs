use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::Parser;

use pseye_capture::{Camera, DevicePort, DeviceHandle, UsbDeviceManager};

/// Stream frames from a PS3 Eye camera and print capture statistics.
#[derive(Debug, Parser)]
#[command(name = "eyedump")]
#[command(about = "List and stream PS3 Eye cameras")]
struct Args {
    /// only list detected cameras and exit
    #[arg(short = 'l', long)]
    list: bool,

    /// camera index to stream from
    #[arg(short = 'c', long, default_value_t = 0)]
    camera: usize,

    /// requested frame width
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// requested frame height
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// requested frame rate
    #[arg(short = 'r', long, default_value_t = 60)]
    fps: u32,

    /// stop after this many frames (0 = run until ctrl-c)
    #[arg(short = 'n', long, default_value_t = 0)]
    frames: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut manager = UsbDeviceManager::new().context("libusb initialization failed")?;
    manager.startup().context("USB manager startup failed")?;

    let mut cameras: Vec<DeviceHandle> = Vec::new();
    let mut cursor = manager.first_handle();
    while let Some(handle) = cursor {
        if let Some(path) = manager.device_path(handle) {
            let port = manager.device_port_path(handle).unwrap_or_default();
            println!("{}: {} (port {})", handle.index(), path, port);
        }
        cameras.push(handle);
        cursor = manager.next_handle(handle);
    }
    if cameras.is_empty() {
        println!("no cameras detected");
    }

    if args.list || cameras.is_empty() {
        manager.shutdown();
        return Ok(());
    }

    let Some(&handle) = cameras.get(args.camera) else {
        manager.shutdown();
        bail!("no camera with index {}", args.camera);
    };
    if !manager.open(handle) {
        manager.shutdown();
        bail!("unable to open camera {} (insufficient permissions?)", args.camera);
    }

    let manager = Rc::new(RefCell::new(manager));
    let port: Rc<RefCell<dyn DevicePort>> = manager.clone();
    let mut camera = Camera::new(port, handle);
    if !camera.init(args.width, args.height, args.fps) {
        manager.borrow_mut().shutdown();
        bail!("camera initialization failed");
    }
    println!(
        "streaming {}x{} @ {} fps",
        camera.width(),
        camera.height(),
        camera.frame_rate()
    );
    camera.start();

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("failed to install ctrl-c handler")?;
    }

    let started = Instant::now();
    let mut captured = 0u64;
    let mut seen = 0u32;
    let mut last_report = Instant::now();
    let mut frames_since_report = 0u64;

    while running.load(Ordering::SeqCst) {
        let received = camera.frames_received();
        if received != seen {
            let fresh = received.wrapping_sub(seen) as u64;
            captured += fresh;
            frames_since_report += fresh;
            seen = received;
            let _frame = camera.frame();
        }

        if last_report.elapsed() >= Duration::from_secs(1) {
            println!(
                "{:6.1}s  {:5.1} fps  {} frames total",
                started.elapsed().as_secs_f32(),
                frames_since_report as f32 / last_report.elapsed().as_secs_f32(),
                captured
            );
            last_report = Instant::now();
            frames_since_report = 0;
        }

        if args.frames != 0 && captured >= args.frames {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    camera.stop();
    manager.borrow_mut().shutdown();
    println!(
        "captured {captured} frames in {:.1}s",
        started.elapsed().as_secs_f32()
    );
    Ok(())
}
