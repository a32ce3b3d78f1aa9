//! Capture pipeline: meter → resample → encode → send.

use super::frame::{AudioFrame, EncodedFrame};
use super::level_meter::rms;
use super::pcm_codec;
use super::resampler::resample;
use crate::net_link::SessionSender;
use crate::volume::VolumeObserver;

pub struct CapturePipeline {
    target_rate: u32,
    observer: VolumeObserver,
    dropped: u64,
}

impl CapturePipeline {
    pub fn new(target_rate: u32, observer: VolumeObserver) -> Self {
        Self {
            target_rate,
            observer,
            dropped: 0,
        }
    }

    /// Meter and encode one input buffer.
    ///
    /// Reports `(level, 0)` to the observer. Returns `None` when nothing is
    /// left to send after resampling.
    pub fn process(&self, frame: &AudioFrame) -> Option<EncodedFrame> {
        let mono = frame.channel(0);
        (self.observer)(rms(mono), 0.0);

        let resampled = resample(mono, frame.sample_rate, self.target_rate);
        if resampled.is_empty() {
            return None;
        }
        Some(pcm_codec::encode(&resampled, self.target_rate))
    }

    /// Process one buffer and hand it to the session.
    ///
    /// Send failures drop the frame and never interrupt capture.
    pub fn push(&mut self, frame: &AudioFrame, session: &SessionSender) {
        let Some(encoded) = self.process(frame) else {
            return;
        };
        if let Err(e) = session.send_audio(encoded) {
            self.dropped += 1;
            log::debug!("Dropped capture frame ({} so far): {}", self.dropped, e);
        }
    }

    /// Frames the session refused since this pipeline was created.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc;

    use super::*;
    use crate::net_link::NetCommand;

    fn recording_observer() -> (VolumeObserver, Arc<Mutex<Vec<(f32, f32)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let observer: VolumeObserver = Arc::new(move |i, o| sink.lock().unwrap().push((i, o)));
        (observer, calls)
    }

    #[test]
    fn reports_input_level_only() {
        let (observer, calls) = recording_observer();
        let pipeline = CapturePipeline::new(16000, observer);
        pipeline.process(&AudioFrame::mono(vec![0.5; 480], 16000));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!((calls[0].0 - 0.5).abs() < 1e-6);
        assert_eq!(calls[0].1, 0.0);
    }

    #[test]
    fn resamples_before_encoding() {
        let (observer, _) = recording_observer();
        let pipeline = CapturePipeline::new(16000, observer);
        let encoded = pipeline
            .process(&AudioFrame::mono(vec![0.1; 2048], 48000))
            .unwrap();
        assert_eq!(encoded.sample_rate, 16000);
        assert_eq!(encoded.sample_count(), 683);
    }

    #[test]
    fn empty_buffer_is_not_sent() {
        let (observer, calls) = recording_observer();
        let pipeline = CapturePipeline::new(16000, observer);
        assert!(pipeline.process(&AudioFrame::mono(Vec::new(), 44100)).is_none());
        // The meter still runs
        assert_eq!(calls.lock().unwrap().as_slice(), &[(0.0, 0.0)]);
    }

    #[test]
    fn closed_session_swallows_frames() {
        let (observer, _) = recording_observer();
        let mut pipeline = CapturePipeline::new(16000, observer);
        let (tx, rx) = mpsc::channel::<NetCommand>(4);
        drop(rx);
        let session = SessionSender::new(tx);

        pipeline.push(&AudioFrame::mono(vec![0.2; 160], 16000), &session);
        pipeline.push(&AudioFrame::mono(vec![0.2; 160], 16000), &session);
        assert_eq!(pipeline.dropped(), 2);
    }

    #[test]
    fn open_session_receives_frames_in_order() {
        let (observer, _) = recording_observer();
        let mut pipeline = CapturePipeline::new(16000, observer);
        let (tx, mut rx) = mpsc::channel::<NetCommand>(4);
        let session = SessionSender::new(tx);

        pipeline.push(&AudioFrame::mono(vec![0.0; 10], 16000), &session);
        pipeline.push(&AudioFrame::mono(vec![0.0; 20], 16000), &session);

        let sizes: Vec<usize> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|cmd| match cmd {
                NetCommand::SendAudio(frame) => frame.sample_count(),
                NetCommand::Close => 0,
            })
            .collect();
        assert_eq!(sizes, vec![10, 20]);
        assert_eq!(pipeline.dropped(), 0);
    }
}
