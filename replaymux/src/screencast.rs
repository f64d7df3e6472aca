//! Screencast capture bookkeeping: frame counting and on-disk layout.
//!
//! Encoding the captured frames is someone else's job; this module only
//! lands the PNG payloads where the encoder expects them and keeps the
//! per-target counters the finalizer reads.

use std::path::PathBuf;

use base64::Engine;
use hashbrown::{HashMap, HashSet};

use replaymux_cdp::cdp::browser_protocol::target::TargetId;

use crate::error::Result;

#[derive(Debug)]
pub(crate) struct CaptureSession {
    base_dir: PathBuf,
    frames: HashMap<TargetId, u64>,
    stopped: HashSet<TargetId>,
    all_stopped: bool,
}

impl CaptureSession {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            frames: Default::default(),
            stopped: Default::default(),
            all_stopped: false,
        }
    }

    fn frame_dir(&self, target_id: &TargetId) -> PathBuf {
        self.base_dir.join(target_id.as_ref()).join("frames")
    }

    pub fn start_target(&mut self, target_id: &TargetId) {
        self.frames.entry(target_id.clone()).or_insert(0);
    }

    /// Registers one incoming frame; returns where to write it. `None` once
    /// the target (or the whole capture) stopped.
    pub fn record_frame(&mut self, target_id: &TargetId) -> Option<(PathBuf, u64)> {
        if self.all_stopped || self.stopped.contains(target_id) {
            return None;
        }
        let count = self.frames.entry(target_id.clone()).or_insert(0);
        let index = *count;
        *count += 1;
        let path = self
            .frame_dir(target_id)
            .join(format!("frame_{index:06}.png"));
        Some((path, index))
    }

    pub fn frame_count(&self, target_id: &TargetId) -> u64 {
        self.frames.get(target_id).copied().unwrap_or(0)
    }

    /// Stops this target's capture and returns its final frame count.
    pub fn stop_target(&mut self, target_id: &TargetId) -> u64 {
        self.stopped.insert(target_id.clone());
        self.frame_count(target_id)
    }

    pub fn stop_all(&mut self) {
        self.all_stopped = true;
    }

    /// Decodes and writes one frame; runs on a spawned task off the
    /// coordinator loop.
    pub async fn write_frame(path: PathBuf, base64_data: String) -> Result<()> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(base64_data.as_bytes())
            .map_err(|err| crate::error::CdpError::msg(format!("bad frame payload: {err}")))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_counters_are_per_target() {
        let mut capture = CaptureSession::new(PathBuf::from("/tmp/replaymux-test"));
        let t1: TargetId = "T1".into();
        let t2: TargetId = "T2".into();
        capture.start_target(&t1);

        let (path, idx) = capture.record_frame(&t1).unwrap();
        assert_eq!(idx, 0);
        assert!(path.to_string_lossy().contains("T1/frames/frame_000000.png"));
        capture.record_frame(&t1).unwrap();
        capture.record_frame(&t2).unwrap();

        assert_eq!(capture.frame_count(&t1), 2);
        assert_eq!(capture.frame_count(&t2), 1);
    }

    #[test]
    fn stopped_targets_reject_frames_but_keep_counts() {
        let mut capture = CaptureSession::new(PathBuf::from("/tmp/replaymux-test"));
        let t1: TargetId = "T1".into();
        capture.record_frame(&t1).unwrap();
        assert_eq!(capture.stop_target(&t1), 1);
        assert!(capture.record_frame(&t1).is_none());
        assert_eq!(capture.frame_count(&t1), 1);

        let t2: TargetId = "T2".into();
        capture.stop_all();
        assert!(capture.record_frame(&t2).is_none());
    }

    #[tokio::test]
    async fn write_frame_rejects_bad_base64() {
        let err = CaptureSession::write_frame(
            PathBuf::from("/tmp/replaymux-test/never.png"),
            "!!!not-base64!!!".to_string(),
        )
        .await;
        assert!(err.is_err());
    }
}
