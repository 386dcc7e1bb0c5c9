//! Peak bit-rate smoothing statistics and planner.
//!
//! The first parsing pass records the XLL payload size of every audio
//! frame. At end of pass the planner walks the records from last to first,
//! clamping each frame to a target size and carrying the excess towards
//! earlier frames, so pre-buffered data absorbs the peaks. Targets come
//! from the `.dtspbr` statistics file (collapsed to its average frame size)
//! or fall back to a fixed 3200-byte budget.

use anyhow::{Result, bail};
use log::debug;

use crate::utils::errors::DtsPbrError;

/// Per-frame target size used without a statistics file.
pub const FAKE_TARGET_FRAME_SIZE: u32 = 3200;

/// Parsed `.dtspbr` statistics file.
///
/// First line is a decimal frame rate, every following line is a
/// `HH:MM:SS:FF,size` record with strictly increasing timestamps starting
/// at zero.
#[derive(Clone, Debug, Default)]
pub struct PbrFile {
    pub frame_rate: f64,
    entries: Vec<(u64, u32)>,
}

impl PbrFile {
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();

        let frame_rate: f64 = lines
            .next()
            .and_then(|line| line.trim().parse().ok())
            .filter(|rate| *rate >= 1.0)
            .ok_or(DtsPbrError::MissingFrameRate)?;

        let mut file = Self {
            frame_rate,
            entries: Vec::new(),
        };

        for (index, line) in lines.enumerate() {
            let line_number = index + 2;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let entry = Self::parse_entry(line)
                .ok_or(DtsPbrError::MalformedEntry(line_number))?;

            match file.entries.last() {
                None if entry.0 != 0 => bail!(DtsPbrError::NonZeroFirstTimestamp),
                Some((previous, _)) if entry.0 <= *previous => {
                    bail!(DtsPbrError::NonMonotonicTimestamp(line_number))
                }
                _ => {}
            }

            file.entries.push(entry);
        }

        Ok(file)
    }

    fn parse_entry(line: &str) -> Option<(u64, u32)> {
        let (timecode, size) = line.split_once(',')?;

        let mut fields = timecode.split(':');
        let hours: u64 = fields.next()?.parse().ok()?;
        let minutes: u64 = fields.next()?.parse().ok()?;
        let seconds: u64 = fields.next()?.parse().ok()?;
        let frames: u64 = fields.next()?.parse().ok()?;
        if fields.next().is_some() {
            return None;
        }

        let timestamp = hours * 3_600_000 + minutes * 60_000 + seconds * 1_000 + frames;
        let size: u32 = size.trim().parse().ok()?;

        Some((timestamp, size))
    }

    /// Target size of the most recent record at or before `timestamp_ms`.
    pub fn max_size(&self, timestamp_ms: u64) -> u32 {
        let mut size = self.entries.first().map(|e| e.1).unwrap_or(0);
        for (ts, value) in &self.entries {
            if *ts > timestamp_ms {
                break;
            }
            size = *value;
        }
        size
    }

    /// Running average of the recorded target sizes, rounded up.
    pub fn avg_size(&self) -> u32 {
        let mut avg = 0.0f64;
        for (i, (_, value)) in self.entries.iter().enumerate() {
            avg += (*value as f64 - avg) / (i + 1) as f64;
        }
        avg.ceil() as u32
    }
}

/// PBR smoothing statistics accumulated during the first pass.
#[derive(Debug, Default)]
pub struct PbrSmoothingStats {
    /// Per audio frame: timestamp and recorded (then planned) size.
    frames: Vec<(u64, u32)>,
    /// Configured smoothing buffer capacity in bytes, 0 when disabled.
    pub max_buffer_size: u32,
}

impl PbrSmoothingStats {
    pub fn nb_frames(&self) -> usize {
        self.frames.len()
    }

    /// Records the XLL payload size of one audio frame. Frames may be
    /// registered incrementally but only in order.
    pub fn save_frame_size(
        &mut self,
        audio_frame_idx: usize,
        timestamp: u64,
        size: u32,
    ) -> Result<()> {
        match audio_frame_idx {
            idx if idx == self.frames.len() => {
                self.frames.push((timestamp, size));
                Ok(())
            }
            idx if idx + 1 == self.frames.len() => {
                self.frames[idx].1 += size;
                Ok(())
            }
            idx => bail!(DtsPbrError::UnknownFrameIndex {
                index: idx,
                count: self.frames.len(),
            }),
        }
    }

    /// Planned target size for one audio frame, valid after
    /// [`Self::compute`].
    pub fn target_size(&self, audio_frame_idx: usize) -> Result<u32> {
        match self.frames.get(audio_frame_idx) {
            Some((_, size)) => Ok(*size),
            None => bail!(DtsPbrError::UnknownFrameIndex {
                index: audio_frame_idx,
                count: self.frames.len(),
            }),
        }
    }

    /// Redistributes the recorded sizes from last frame to first so no
    /// frame exceeds its target while the total byte count is preserved.
    pub fn compute(&mut self, pbr_file: Option<&PbrFile>) -> Result<()> {
        let (target, buffer_size) = match pbr_file {
            Some(file) => (file.avg_size(), self.max_buffer_size),
            None => (FAKE_TARGET_FRAME_SIZE, 0),
        };

        debug!(
            "PBR smoothing: {} frames, target {} bytes, buffer {} bytes",
            self.frames.len(),
            target,
            buffer_size
        );

        let mut buffered: u64 = 0;
        let mut max_buffered: u64 = 0;

        for (_, size) in self.frames.iter_mut().rev() {
            let required = *size as u64 + buffered;

            let mut emitted = required.min(target as u64);
            if buffer_size != 0
                && (buffer_size as u64) < required
                && emitted < required - buffer_size as u64
            {
                // Forced up so the carried data fits the smoothing buffer.
                emitted = required - buffer_size as u64;
            }

            buffered = required - emitted;
            max_buffered = max_buffered.max(buffered);

            *size = emitted as u32;
        }

        if buffered > 0 {
            bail!(DtsPbrError::SmoothingInfeasible(buffered as u32));
        }

        debug!("PBR smoothing: max buffered size {max_buffered} bytes");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtspbr_file_parses() -> Result<()> {
        let file = PbrFile::parse("23.976\n00:00:00:00,4096\n00:00:01:00,2048\n")?;
        assert_eq!(file.frame_rate, 23.976);
        assert_eq!(file.max_size(0), 4096);
        assert_eq!(file.max_size(999), 4096);
        assert_eq!(file.max_size(1_000), 2048);
        assert_eq!(file.avg_size(), 3072);
        Ok(())
    }

    #[test]
    fn first_entry_must_be_at_zero() {
        assert!(PbrFile::parse("24\n00:00:01:00,4096\n").is_err());
    }

    #[test]
    fn timestamps_must_increase() {
        assert!(PbrFile::parse("24\n00:00:00:00,1\n00:00:00:00,2\n").is_err());
    }

    #[test]
    fn redistribution_preserves_totals() -> Result<()> {
        let mut stats = PbrSmoothingStats {
            max_buffer_size: 100_000,
            ..Default::default()
        };
        stats.save_frame_size(0, 0, 10_000)?;
        stats.save_frame_size(1, 1, 80_000)?;
        stats.save_frame_size(2, 2, 60_000)?;

        let file = PbrFile::parse("24\n00:00:00:00,50000\n")?;
        stats.compute(Some(&file))?;

        let recorded = [10_000u32, 80_000, 60_000];
        let mut emitted = Vec::new();
        for i in 0..3 {
            emitted.push(stats.target_size(i)?);
        }

        // Total byte count is preserved.
        assert_eq!(
            emitted.iter().map(|s| *s as u64).sum::<u64>(),
            recorded.iter().map(|s| *s as u64).sum::<u64>()
        );

        // Every frame fits its source plus the buffer capacity, and the
        // plan stays monotone-consumable in both directions.
        let mut cum_emitted = 0u64;
        let mut cum_recorded = 0u64;
        for i in 0..3 {
            assert!(emitted[i] as u64 <= recorded[i] as u64 + 100_000);
            cum_emitted += emitted[i] as u64;
            cum_recorded += recorded[i] as u64;
            assert!(cum_emitted <= cum_recorded + 100_000);
            assert!(cum_emitted + 100_000 >= cum_recorded);
        }
        Ok(())
    }

    #[test]
    fn infeasible_plan_is_rejected() {
        // Without a statistics file the buffer adjustment is disabled and
        // the fixed target cannot absorb a large first frame.
        let mut stats = PbrSmoothingStats::default();
        stats.save_frame_size(0, 0, 100_000).unwrap();
        stats.save_frame_size(1, 1, 100).unwrap();

        assert!(stats.compute(None).is_err());
    }
}
