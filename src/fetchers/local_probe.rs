//! Headless local-file probe backed by `lofty` and `symphonia`.
//!
//! Loading tries the cheap paths first: container header properties via lofty,
//! then symphonia's track parameters. Streams with no declared length fall back to
//! an incremental packet scan that advances a bounded amount per poll, so the
//! caller can time out or cancel between polls.

use std::fs::File;
use std::path::Path;

use log::debug;
use lofty::file::AudioFile;
use lofty::read_from_path;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::TimeBase;

use super::{PlaybackEngine, ProbeSession};
use crate::errors::FetchError;

const PACKETS_PER_POLL: usize = 2048;

/// Default local engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymphoniaProbeEngine;

impl SymphoniaProbeEngine {
    pub fn new() -> Self {
        Self
    }
}

impl PlaybackEngine for SymphoniaProbeEngine {
    fn name(&self) -> &'static str {
        "symphonia"
    }

    fn load(&self, path: &Path) -> Result<Box<dyn ProbeSession>, FetchError> {
        if !path.exists() {
            return Err(FetchError::NotFound(path.display().to_string()));
        }

        if let Some(seconds) = header_duration(path) {
            return Ok(Box::new(KnownDuration(seconds)));
        }

        let (format, track_id, time_base, declared) = open_format(path)?;
        if let Some(seconds) = declared {
            return Ok(Box::new(KnownDuration(seconds)));
        }
        debug!(
            "LocalProbe: no declared length for {}, scanning packets",
            path.display()
        );
        Ok(Box::new(PacketScan::new(format, track_id, time_base)))
    }
}

fn header_duration(path: &Path) -> Option<f64> {
    match read_from_path(path) {
        Ok(tagged_file) => {
            let seconds = tagged_file.properties().duration().as_secs_f64();
            (seconds > 0.0).then_some(seconds)
        }
        Err(err) => {
            debug!(
                "LocalProbe: header read failed for {}: {}",
                path.display(),
                err
            );
            None
        }
    }
}

type OpenedFormat = (Box<dyn FormatReader>, u32, Option<TimeBase>, Option<f64>);

fn open_format(path: &Path) -> Result<OpenedFormat, FetchError> {
    let file = File::open(path)
        .map_err(|err| FetchError::Failed(format!("Failed to open {}: {}", path.display(), err)))?;
    let media_source = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            media_source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| FetchError::Failed(format!("Failed to probe media: {}", err)))?;

    let track = probed
        .format
        .default_track()
        .ok_or_else(|| FetchError::Failed("No default track found".to_string()))?;
    let track_id = track.id;
    let time_base = track.codec_params.time_base.or_else(|| {
        track
            .codec_params
            .sample_rate
            .map(|sample_rate| TimeBase::new(1, sample_rate))
    });
    let declared = match (time_base, track.codec_params.n_frames) {
        (Some(time_base), Some(n_frames)) if n_frames > 0 => {
            let time = time_base.calc_time(n_frames);
            Some(time.seconds as f64 + time.frac)
        }
        _ => None,
    };
    Ok((probed.format, track_id, time_base, declared))
}

struct KnownDuration(f64);

impl ProbeSession for KnownDuration {
    fn poll_duration(&mut self) -> Result<Option<f64>, FetchError> {
        Ok(Some(self.0))
    }
}

/// Walks packets of one track and reports the end timestamp at EOF.
struct PacketScan {
    format: Box<dyn FormatReader>,
    track_id: u32,
    time_base: Option<TimeBase>,
    end_ts: u64,
}

impl PacketScan {
    fn new(format: Box<dyn FormatReader>, track_id: u32, time_base: Option<TimeBase>) -> Self {
        Self {
            format,
            track_id,
            time_base,
            end_ts: 0,
        }
    }

    fn finish(&self) -> Result<Option<f64>, FetchError> {
        let Some(time_base) = self.time_base else {
            return Err(FetchError::NoDuration);
        };
        let time = time_base.calc_time(self.end_ts);
        Ok(Some(time.seconds as f64 + time.frac))
    }
}

impl ProbeSession for PacketScan {
    fn poll_duration(&mut self) -> Result<Option<f64>, FetchError> {
        for _ in 0..PACKETS_PER_POLL {
            match self.format.next_packet() {
                Ok(packet) => {
                    if packet.track_id() == self.track_id {
                        self.end_ts = self.end_ts.max(packet.ts() + packet.dur());
                    }
                }
                Err(SymphoniaError::IoError(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return self.finish();
                }
                Err(SymphoniaError::ResetRequired) => continue,
                Err(err) => {
                    return Err(FetchError::Failed(format!("Failed reading packets: {}", err)));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_path(file_name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after UNIX_EPOCH")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "durafetch_probe_{}_{}_{}",
            std::process::id(),
            nanos,
            file_name
        ))
    }

    /// Minimal 16-bit mono PCM WAV of silence.
    fn write_wav(path: &Path, sample_rate: u32, seconds: u32) {
        let data_len = sample_rate * seconds * 2;
        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        bytes.resize(44 + data_len as usize, 0);
        std::fs::write(path, bytes).expect("wav should be writable");
    }

    fn poll_to_completion(session: &mut dyn ProbeSession) -> f64 {
        for _ in 0..10_000 {
            if let Some(seconds) = session.poll_duration().expect("probe should succeed") {
                return seconds;
            }
        }
        panic!("probe did not finish");
    }

    #[test]
    fn test_load_reports_wav_duration() {
        let path = unique_temp_path("two_seconds.wav");
        write_wav(&path, 8_000, 2);
        let mut session = SymphoniaProbeEngine::new()
            .load(&path)
            .expect("wav should load");
        let seconds = poll_to_completion(session.as_mut());
        assert!((seconds - 2.0).abs() < 0.01, "unexpected duration {seconds}");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_packet_scan_measures_stream_end() {
        let path = unique_temp_path("scan.wav");
        write_wav(&path, 8_000, 3);
        let (format, track_id, time_base, _) = open_format(&path).expect("wav should probe");
        let mut scan = PacketScan::new(format, track_id, time_base);
        let seconds = poll_to_completion(&mut scan);
        assert!((seconds - 3.0).abs() < 0.01, "unexpected duration {seconds}");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let path = unique_temp_path("missing.mp3");
        let err = SymphoniaProbeEngine::new()
            .load(&path)
            .err()
            .expect("missing file should fail");
        assert!(matches!(err, FetchError::NotFound(_)));
    }

    #[test]
    fn test_garbage_file_fails_without_panicking() {
        let path = unique_temp_path("garbage.bin");
        std::fs::write(&path, b"definitely not media").expect("write garbage");
        let result = SymphoniaProbeEngine::new().load(&path);
        assert!(matches!(result, Err(FetchError::Failed(_))));
        let _ = std::fs::remove_file(path);
    }
}
