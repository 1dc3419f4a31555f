//! Lokale Medienaufnahme - Mikrofon Capture und Playback
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Die Aufnahme gehört
//! exklusiv der CallSession: `LocalMedia::release()` stoppt alle
//! Spuren, und ein Handle, das nach Abbruch der Session eintrifft,
//! wird sofort wieder freigegeben statt angehängt.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use ringbuf::{traits::*, HeapRb};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaError {
    #[error("no capture device found")]
    NoDeviceFound,

    #[error("media access denied: {0}")]
    AccessDenied(String),
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Welche Medien die Session anfordert
///
/// `video` steuert nur den Transceiver-Aufbau; eine Kamera-Anbindung
/// gibt es im Audio-Stack nicht.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

// ============================================================================
// MEDIA SOURCE
// ============================================================================

/// Quelle für lokale Medien-Handles
///
/// Produktiv implementiert durch [`DeviceMediaSource`]; Tests verwenden
/// die Mock-Quelle aus [`crate::mock`]. Die Acquisition darf beliebig
/// lange dauern (Permission-Prompt) und wird von der Session per
/// Generationszähler storniert, nicht per Timeout.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Geräte-gestützte Quelle: Standard-Mikrofon und -Lautsprecher
pub struct DeviceMediaSource;

#[async_trait]
impl MediaSource for DeviceMediaSource {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        if !constraints.audio {
            return Ok(LocalMedia::new(constraints, None));
        }

        // cpal blockiert; nicht auf dem Event-Loop ausführen
        let capture = tokio::task::spawn_blocking(move || {
            let mut capture = AudioCapture::new()?;
            capture.start_capture()?;
            capture.start_playback()?;
            Ok::<_, MediaError>(capture)
        })
        .await
        .map_err(|e| MediaError::AccessDenied(e.to_string()))??;

        Ok(LocalMedia::new(constraints, Some(capture)))
    }
}

// ============================================================================
// LOCAL MEDIA HANDLE
// ============================================================================

/// Exklusiv von der CallSession gehaltenes Medien-Handle
///
/// `release()` ist idempotent und stoppt alle lokalen Spuren; Drop
/// räumt als Sicherheitsnetz ebenfalls auf.
pub struct LocalMedia {
    constraints: MediaConstraints,
    capture: Option<AudioCapture>,
    stopped: Arc<AtomicBool>,
}

impl LocalMedia {
    pub(crate) fn new(constraints: MediaConstraints, capture: Option<AudioCapture>) -> Self {
        Self {
            constraints,
            capture,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn constraints(&self) -> MediaConstraints {
        self.constraints
    }

    /// Stoppt alle Spuren; beliebig oft aufrufbar
    pub fn release(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        tracing::debug!("Local media released");
    }

    /// Meldet ob alle Spuren gestoppt sind
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Flag, das auch nach dem Drop des Handles lesbar bleibt
    pub(crate) fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }

    /// Setzt den Mute-Status der Aufnahme
    pub fn set_muted(&self, muted: bool) {
        if let Some(capture) = self.capture.as_ref() {
            capture.set_muted(muted);
        }
    }

    /// Gibt den Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        self.capture
            .as_ref()
            .map(AudioCapture::is_muted)
            .unwrap_or(false)
    }

    /// Aktueller Eingangspegel (0.0 - 1.0) für die Anzeige
    pub fn input_level(&self) -> f32 {
        self.capture
            .as_ref()
            .map(AudioCapture::input_level)
            .unwrap_or(0.0)
    }

    /// Liest einen Frame aufgenommenes Audio (Raw PCM)
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        self.capture.as_ref().and_then(AudioCapture::read_frame)
    }

    /// Schreibt empfangene Samples in den Playback-Puffer
    pub fn write_samples(&self, samples: &[f32]) {
        if let Some(capture) = self.capture.as_ref() {
            capture.write_samples(samples);
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("constraints", &self.constraints)
            .field("is_stopped", &self.is_stopped())
            .finish()
    }
}

// ============================================================================
// AUDIO CAPTURE
// ============================================================================

/// Mikrofon-Capture und Lautsprecher-Playback über cpal
///
/// Note: Stream ist nicht Send, daher wrappen wir in Send-fähige Container
pub struct AudioCapture {
    input_device: Option<Device>,
    output_device: Option<Device>,
    // Streams werden in Option gehalten und können bei stop() gedroppt werden
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,

    /// Ring-Buffer für aufgenommenes Audio (Raw PCM)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Ring-Buffer für zu spielendes Audio (decoded PCM)
    playback_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Mute-Status
    is_muted: Arc<Mutex<bool>>,

    /// Audio Level (0.0 - 1.0) für Visualisierung
    input_level: Arc<Mutex<f32>>,
}

// AudioCapture ist nicht automatisch Send wegen Stream
// Wir müssen die Streams daher separat verwalten
unsafe impl Send for AudioCapture {}
unsafe impl Sync for AudioCapture {}

impl AudioCapture {
    /// Öffnet die Standard-Geräte, startet aber noch keine Streams
    pub fn new() -> Result<Self, MediaError> {
        let host = cpal::default_host();

        let input_device = host.default_input_device();
        let output_device = host.default_output_device();

        if input_device.is_none() {
            return Err(MediaError::NoDeviceFound);
        }
        if output_device.is_none() {
            tracing::warn!("No audio output device found, playback disabled");
        }

        let capture_buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
        let playback_buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));

        tracing::info!(
            "AudioCapture initialized: {}Hz, {} channel(s)",
            SAMPLE_RATE,
            CHANNELS
        );

        Ok(Self {
            input_device,
            output_device,
            input_stream: None,
            output_stream: None,
            capture_buffer,
            playback_buffer,
            is_muted: Arc::new(Mutex::new(false)),
            input_level: Arc::new(Mutex::new(0.0)),
        })
    }

    /// Startet Audio Capture (Mikrofon)
    pub fn start_capture(&mut self) -> Result<(), MediaError> {
        let device = self
            .input_device
            .as_ref()
            .ok_or(MediaError::NoDeviceFound)?;

        let config = Self::find_best_config(
            device
                .supported_input_configs()
                .map_err(|e| MediaError::AccessDenied(e.to_string()))?
                .collect(),
        )?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::clone(&self.capture_buffer);
        let is_muted = Arc::clone(&self.is_muted);
        let input_level = Arc::clone(&self.input_level);
        let target_sample_rate = SAMPLE_RATE;
        let source_sample_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let muted = *is_muted.lock();

                    // Audio Level berechnen (RMS)
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *input_level.lock() = rms.min(1.0);

                    if muted {
                        return;
                    }

                    // Resampling falls nötig (zu 48kHz)
                    let samples: Vec<f32> = if source_sample_rate != target_sample_rate {
                        // Einfaches Linear-Resampling
                        let ratio = target_sample_rate as f32 / source_sample_rate as f32;
                        let new_len = (data.len() as f32 * ratio) as usize;
                        (0..new_len)
                            .map(|i| {
                                let src_idx = i as f32 / ratio;
                                let idx = src_idx as usize;
                                let frac = src_idx - idx as f32;
                                let s1 = data.get(idx).copied().unwrap_or(0.0);
                                let s2 = data.get(idx + 1).copied().unwrap_or(s1);
                                s1 + (s2 - s1) * frac
                            })
                            .collect()
                    } else {
                        data.to_vec()
                    };

                    // In Ring-Buffer schreiben
                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::AccessDenied(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::AccessDenied(e.to_string()))?;

        self.input_stream = Some(stream);
        Ok(())
    }

    /// Startet Audio Playback (Lautsprecher)
    pub fn start_playback(&mut self) -> Result<(), MediaError> {
        let device = match self.output_device.as_ref() {
            Some(device) => device,
            // Kein Lautsprecher ist kein Abbruchgrund für den Anruf
            None => return Ok(()),
        };

        let config = Self::find_best_config(
            device
                .supported_output_configs()
                .map_err(|e| MediaError::AccessDenied(e.to_string()))?
                .collect(),
        )?;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let playback_buffer = Arc::clone(&self.playback_buffer);
        let source_sample_rate = SAMPLE_RATE;
        let target_sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buffer = playback_buffer.lock();

                    // Mono zu Stereo (falls nötig) und Resampling
                    let samples_needed = data.len() / channels;
                    let ratio = source_sample_rate as f32 / target_sample_rate as f32;
                    let source_samples_needed = (samples_needed as f32 * ratio) as usize;

                    for i in 0..samples_needed {
                        let src_idx = (i as f32 * ratio) as usize;

                        let sample = if src_idx < source_samples_needed {
                            buffer.try_pop().unwrap_or(0.0)
                        } else {
                            0.0
                        };

                        // Auf alle Kanäle verteilen
                        for c in 0..channels {
                            if let Some(s) = data.get_mut(i * channels + c) {
                                *s = sample;
                            }
                        }
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::AccessDenied(e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::AccessDenied(e.to_string()))?;

        self.output_stream = Some(stream);
        Ok(())
    }

    /// Stoppt alle Audio-Streams
    pub fn stop(&mut self) {
        self.input_stream = None;
        self.output_stream = None;
        tracing::info!("Audio streams stopped");
    }

    /// Liest einen Frame von aufgenommenem Audio
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() >= FRAME_SIZE {
            let mut frame = Vec::with_capacity(FRAME_SIZE);
            for _ in 0..FRAME_SIZE {
                if let Some(sample) = buffer.try_pop() {
                    frame.push(sample);
                }
            }
            Some(frame)
        } else {
            None
        }
    }

    /// Schreibt Audio-Samples in den Playback-Buffer
    pub fn write_samples(&self, samples: &[f32]) {
        let mut buffer = self.playback_buffer.lock();
        for sample in samples {
            let _ = buffer.try_push(*sample);
        }
    }

    /// Setzt den Mute-Status
    pub fn set_muted(&self, muted: bool) {
        *self.is_muted.lock() = muted;
        tracing::debug!("Audio muted: {}", muted);
    }

    /// Gibt den Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        *self.is_muted.lock()
    }

    /// Gibt den Eingangspegel zurück
    pub fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }

    /// Wählt die beste Konfiguration aus einer Liste
    fn find_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, MediaError> {
        // Priorität: 48kHz > andere, F32 > andere
        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        // Versuche exakt 48kHz zu finden
        for config in &configs {
            if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target_rate).into());
            }
        }

        // Fallback auf beste verfügbare F32-Konfiguration
        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                let rate = if config.min_sample_rate() <= target_rate
                    && config.max_sample_rate() >= target_rate
                {
                    target_rate
                } else {
                    config.max_sample_rate()
                };
                return Ok(config.with_sample_rate(rate).into());
            }
        }

        // Nehme erste verfügbare Konfiguration
        if let Some(config) = configs.first() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(MediaError::AccessDenied(
            "no suitable audio configuration found".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraints_default_to_audio_and_video() {
        let constraints = MediaConstraints::default();
        assert!(constraints.audio);
        assert!(constraints.video);
    }

    #[test]
    fn test_release_is_idempotent_and_marks_stopped() {
        let mut media = LocalMedia::new(MediaConstraints::default(), None);
        assert!(!media.is_stopped());

        media.release();
        media.release();
        assert!(media.is_stopped());
    }

    #[test]
    fn test_stop_flag_outlives_handle() {
        let media = LocalMedia::new(MediaConstraints::default(), None);
        let flag = media.stop_flag();

        drop(media);
        assert!(flag.load(Ordering::SeqCst));
    }
}
