use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use snow_relay::{
    BufferMode, ClipRect, DeviceCreateRequest, DeviceState, DirtyFlags, DisplayMode, Event,
    HeadlessFramework, PixelFormat, RelayError, RelayHub,
};
use tracing_subscriber::EnvFilter;

const WIDTH: u16 = 320;
const HEIGHT: u16 = 240;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let framework = HeadlessFramework::new();
    let hub = RelayHub::builder()
        .reply_timeout(Duration::from_secs(1))
        .drain_poll_interval(Duration::from_millis(50))
        .build(framework.clone());

    let endpoint = Arc::new(hub.open()?);
    let registration = endpoint.create_device(
        DeviceCreateRequest::new(
            "echo",
            DisplayMode::fixed(WIDTH, HEIGHT),
            vec![PixelFormat::Rgb565],
        )
        .with_buffer_mode(BufferMode::EMULATE_XRGB8888),
    )?;
    let index = registration.index;
    let buffer = registration
        .buffer
        .context("emulation should allocate a side buffer")?;
    println!(
        "device {index}: side buffer {}x{} {:?}, pitch {}",
        buffer.width(),
        buffer.height(),
        buffer.format(),
        buffer.pitch()
    );

    let consumer = {
        let endpoint = endpoint.clone();
        thread::Builder::new()
            .name("echo-consumer".into())
            .spawn(move || -> Result<usize> {
                let mut buf = [0u8; 512];
                let mut seen = 0;
                loop {
                    let len = match endpoint.read(&mut buf) {
                        Ok(len) => len,
                        Err(RelayError::Cancelled | RelayError::NotInitialized) => return Ok(seen),
                        Err(err) => return Err(err.into()),
                    };
                    let event = Event::decode(&buf[..len])?;
                    match &event {
                        Event::SurfaceDirty { id, clips, .. } => {
                            let clip = clips.first().copied().unwrap_or_default();
                            let sample = buffer.read(|bytes| {
                                let offset = usize::from(clip.y1) * buffer.pitch()
                                    + usize::from(clip.x1) * 2;
                                bytes
                                    .get(offset..offset + 2)
                                    .map(|pixel| u16::from_le_bytes([pixel[0], pixel[1]]))
                            });
                            println!("surface {id} dirty {clip:?}, first pixel {sample:04x?}");
                        }
                        other => println!("{other:?}"),
                    }
                    seen += 1;
                    endpoint.write(&0i32.to_le_bytes())?;
                }
            })?
    };

    let surface = framework.create_surface(index, WIDTH, HEIGHT, PixelFormat::Xrgb8888)?;
    framework.enable(index)?;
    framework.set_plane(index, Some(&surface))?;
    thread::sleep(Duration::from_millis(50));

    for step in 0u8..4 {
        let shade = step.wrapping_mul(64);
        surface.write_pixels(|pixels| {
            for pixel in pixels.chunks_exact_mut(4) {
                pixel.copy_from_slice(&[shade, 0xFF - shade, 0x80, 0x00]);
            }
        });
        let x = u16::from(step) * 40;
        let clip = ClipRect::new(x, 20, x + 64, 84);
        let code = framework.flush(index, &surface, DirtyFlags::empty(), 0, &[clip])?;
        println!("flush {step} acknowledged with {code}");
    }

    framework.disable(index)?;
    framework.set_plane(index, None)?;
    framework.destroy_surface(index, &surface)?;

    let stats = endpoint.device().mailbox().stats().snapshot();
    println!("mailbox: {stats:?}");

    endpoint.close();
    let device = endpoint.device().clone();
    device.wait_for_state(DeviceState::Destroyed, Duration::from_secs(2));
    let seen = consumer
        .join()
        .map_err(|_| anyhow::anyhow!("consumer thread panicked"))??;
    println!("consumer handled {seen} events, device {:?}", device.state());
    Ok(())
}
