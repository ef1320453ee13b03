use super::ExecutionPath;
use crate::capture::{FrameStream, VideoTrack};
use crate::frame::Frame;
use futures::StreamExt;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

/// Frames from a track, along whichever path was resolved for it.
pub enum FrameSource {
    Streaming {
        track: Box<dyn VideoTrack>,
        frames: FrameStream,
    },
    Fallback {
        track: Box<dyn VideoTrack>,
        max_fps: u32,
        ticker: Interval,
    },
}

impl FrameSource {
    /// Open `track` along `path`. A track whose stream was already taken
    /// is polled at `max_fps` instead.
    pub fn open(mut track: Box<dyn VideoTrack>, path: ExecutionPath, max_fps: u32) -> Self {
        match path {
            ExecutionPath::Streaming => match track.frames() {
                Some(frames) => Self::Streaming { track, frames },
                None => {
                    tracing::warn!(max_fps, "Track stream unavailable, polling instead");
                    Self::fallback(track, max_fps)
                }
            },
            ExecutionPath::Fallback { max_fps } => Self::fallback(track, max_fps),
        }
    }

    fn fallback(track: Box<dyn VideoTrack>, max_fps: u32) -> Self {
        let max_fps = max_fps.max(1);
        let mut ticker = tokio::time::interval(Duration::from_secs(1) / max_fps);
        // Late ticks push the schedule back rather than bursting.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self::Fallback {
            track,
            max_fps,
            ticker,
        }
    }

    pub fn path(&self) -> ExecutionPath {
        match self {
            Self::Streaming { .. } => ExecutionPath::Streaming,
            Self::Fallback { max_fps, .. } => ExecutionPath::Fallback { max_fps: *max_fps },
        }
    }

    /// Next frame from the track; `None` once the track has ended.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        match self {
            Self::Streaming { frames, .. } => frames.next().await,
            Self::Fallback { track, ticker, .. } => loop {
                ticker.tick().await;
                match track.grab() {
                    Ok(Some(frame)) => return Some(frame),
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::debug!("Fallback capture ended: {:#}", e);
                        return None;
                    }
                }
            },
        }
    }

    pub fn into_track(self) -> Box<dyn VideoTrack> {
        match self {
            Self::Streaming { track, .. } | Self::Fallback { track, .. } => track,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TestPatternTrack;
    use std::time::Instant;

    #[tokio::test]
    async fn taken_stream_falls_back_at_configured_rate() {
        let mut track = TestPatternTrack::new(8, 8);
        let _taken = track.frames();
        let source = FrameSource::open(Box::new(track), ExecutionPath::Streaming, 5);
        assert_eq!(source.path(), ExecutionPath::Fallback { max_fps: 5 });
    }

    #[tokio::test]
    async fn fallback_paces_reads() {
        let track = TestPatternTrack::new(8, 8).without_streaming();
        let mut source = FrameSource::open(Box::new(track), ExecutionPath::Fallback { max_fps: 50 }, 50);

        let started = Instant::now();
        for _ in 0..6 {
            assert!(source.next_frame().await.is_some());
        }
        // First tick is immediate, then one per 20ms.
        assert!(started.elapsed() >= Duration::from_millis(95));
    }

    #[tokio::test]
    async fn stopped_track_ends_fallback() {
        let track = TestPatternTrack::new(8, 8).without_streaming();
        let mut source = FrameSource::open(Box::new(track), ExecutionPath::Fallback { max_fps: 100 }, 100);
        assert!(source.next_frame().await.is_some());

        let mut track = source.into_track();
        track.stop();
        let mut source = FrameSource::open(track, ExecutionPath::Fallback { max_fps: 100 }, 100);
        assert!(source.next_frame().await.is_none());
    }
}
