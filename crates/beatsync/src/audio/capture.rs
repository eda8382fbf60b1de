use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream};

/// Power of two so indices wrap with a mask.
const RING_SIZE: usize = 1 << 16;
const RING_MASK: usize = RING_SIZE - 1;

/// Single-producer single-consumer sample queue between the cpal callback
/// and the analysis thread. Samples are stored as `f32` bits in atomics, so
/// neither side ever blocks. When the reader falls more than `RING_SIZE`
/// samples behind, the oldest samples are overwritten.
pub struct SampleRing {
    data: Box<[AtomicU32]>,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
}

impl SampleRing {
    pub fn new() -> Self {
        Self {
            data: (0..RING_SIZE).map(|_| AtomicU32::new(0)).collect(),
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
        }
    }

    /// Producer side. Only the capture callback calls this.
    pub fn push(&self, samples: impl IntoIterator<Item = f32>) {
        let mut wp = self.write_pos.load(Ordering::Relaxed);
        for sample in samples {
            self.data[wp & RING_MASK].store(sample.to_bits(), Ordering::Relaxed);
            wp = wp.wrapping_add(1);
        }
        self.write_pos.store(wp, Ordering::Release);
    }

    /// Consumer side. Returns the number of samples copied into `dst`.
    pub fn read(&self, dst: &mut [f32]) -> usize {
        let wp = self.write_pos.load(Ordering::Acquire);
        let mut rp = self.read_pos.load(Ordering::Relaxed);
        let mut available = wp.wrapping_sub(rp);
        if available > RING_SIZE {
            // Overrun: skip to the oldest sample still intact.
            rp = wp.wrapping_sub(RING_SIZE);
            available = RING_SIZE;
        }
        let n = available.min(dst.len());
        for (i, slot) in dst[..n].iter_mut().enumerate() {
            *slot = f32::from_bits(self.data[rp.wrapping_add(i) & RING_MASK].load(Ordering::Relaxed));
        }
        self.read_pos.store(rp.wrapping_add(n), Ordering::Release);
        n
    }

    pub fn available(&self) -> usize {
        let wp = self.write_pos.load(Ordering::Acquire);
        let rp = self.read_pos.load(Ordering::Relaxed);
        wp.wrapping_sub(rp).min(RING_SIZE)
    }
}

impl Default for SampleRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Live mono input from a cpal device. The stream stops when this is dropped.
pub struct AudioInput {
    _stream: Stream,
    pub ring: Arc<SampleRing>,
    pub sample_rate: u32,
    pub device_name: String,
}

impl AudioInput {
    /// Open the named input device, or the default one when `device` is
    /// `None`.
    pub fn open(device: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device {
            Some(wanted) => host
                .input_devices()?
                .find(|d| device_label(d) == wanted)
                .with_context(|| format!("no input device named '{wanted}'"))?,
            None => host
                .default_input_device()
                .context("no audio input device found")?,
        };
        let device_name = device_label(&device);
        log::info!("Audio capture device: {device_name}");

        let config = device.default_input_config()?;
        let sample_rate = config.sample_rate();
        let channels = usize::from(config.channels()).max(1);
        log::info!("Audio config: {sample_rate}Hz, {channels}ch, {:?}", config.sample_format());

        let ring = Arc::new(SampleRing::new());
        let producer = Arc::clone(&ring);
        let stream = device.build_input_stream(
            &config.into(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if channels == 1 {
                    producer.push(data.iter().copied());
                } else {
                    producer.push(
                        data.chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                    );
                }
            },
            |err| log::error!("Audio stream error: {err}"),
            None,
        )?;
        stream.play()?;
        log::info!("Audio capture started");

        Ok(Self {
            _stream: stream,
            ring,
            sample_rate,
            device_name,
        })
    }

    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        Ok(host.input_devices()?.map(|d| device_label(&d)).collect())
    }
}

fn device_label(device: &Device) -> String {
    device
        .description()
        .map(|d| d.name().to_string())
        .unwrap_or_else(|_| "Unknown".into())
}
