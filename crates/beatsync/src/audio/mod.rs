//! Live audio frontend: cpal capture → [`FrameAnalyzer`] → [`SyncEngine`]
//! on a dedicated thread.

pub mod analyzer;
pub mod capture;

pub use analyzer::FrameAnalyzer;
pub use capture::{AudioInput, SampleRing};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};

use crate::config::SyncConfig;
use crate::sync::{BeatEvent, SyncEngine, SyncHandle, SyncMetrics};

/// Poll interval of the analysis thread.
const POLL: Duration = Duration::from_millis(10);

/// Runs capture, analysis and beat sync until stopped.
pub struct AudioPipeline {
    thread: Option<JoinHandle<SyncEngine>>,
    shutdown: Arc<AtomicBool>,
    sync: SyncHandle,
    beats: Receiver<BeatEvent>,
    pub device_name: String,
}

impl AudioPipeline {
    /// Start processing `input`. The engine runs at the device's sample
    /// rate regardless of `config.sample_rate`.
    pub fn start(input: AudioInput, mut config: SyncConfig) -> Result<Self> {
        if config.sample_rate != input.sample_rate {
            log::info!(
                "Using device sample rate {} Hz instead of configured {} Hz",
                input.sample_rate,
                config.sample_rate
            );
            config.sample_rate = input.sample_rate;
        }
        let engine = SyncEngine::new(config.clone())?;
        let sync = engine.handle();

        let (tx, rx) = crossbeam_channel::bounded(64);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let device_name = input.device_name.clone();

        let thread = thread::Builder::new()
            .name("beatsync-audio".into())
            .spawn(move || audio_thread(input, &config, engine, &flag, &tx))?;

        Ok(Self {
            thread: Some(thread),
            shutdown,
            sync,
            beats: rx,
            device_name,
        })
    }

    pub fn sync_handle(&self) -> SyncHandle {
        self.sync.clone()
    }

    /// Beat events as they are accepted. Events are dropped when nobody
    /// drains the channel.
    pub fn beats(&self) -> &Receiver<BeatEvent> {
        &self.beats
    }

    /// Stop the thread, dispose the engine and return its final metrics.
    pub fn stop(mut self) -> Option<SyncMetrics> {
        self.join()
    }

    fn join(&mut self) -> Option<SyncMetrics> {
        self.shutdown.store(true, Ordering::Relaxed);
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(mut engine) => {
                engine.dispose();
                Some(engine.get_metrics())
            }
            Err(_) => {
                log::error!("Audio thread panicked");
                None
            }
        }
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.join();
    }
}

fn audio_thread(
    input: AudioInput,
    config: &SyncConfig,
    mut engine: SyncEngine,
    shutdown: &AtomicBool,
    tx: &Sender<BeatEvent>,
) -> SyncEngine {
    let mut analyzer = FrameAnalyzer::new(input.sample_rate, config.fft_size, config.hop_size);
    let mut read_buf = vec![0.0f32; 8192];

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(POLL);

        let read = input.ring.read(&mut read_buf);
        if read == 0 {
            continue;
        }
        for frame in analyzer.push(&read_buf[..read]) {
            if let Some(event) = engine.process_frame(&frame) {
                // Non-blocking; a slow consumer only loses notifications.
                let _ = tx.try_send(event);
            }
        }
    }

    log::info!("Audio thread shutting down");
    engine
}
