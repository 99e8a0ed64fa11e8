//! MJPEG frame demultiplexing.
//!
//! A video process writes concatenated JPEG images to a pipe with no framing
//! of its own. `FrameDemuxer` accumulates the raw bytes and cuts out every
//! complete `start marker ..= end marker` slice; `FrameReader` feeds it from
//! any `AsyncRead`.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of a single read from the byte source.
pub const READ_CHUNK: usize = 4096;
/// Default ceiling for bytes buffered without a complete frame.
pub const DEFAULT_MAX_BUFFER: usize = 8 * 1024 * 1024;

/// Start/end byte pairs delimiting one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Markers {
    pub start: [u8; 2],
    pub end: [u8; 2],
}

impl Markers {
    /// JPEG start-of-image / end-of-image.
    pub const JPEG: Markers = Markers {
        start: [0xFF, 0xD8],
        end: [0xFF, 0xD9],
    };
}

impl Default for Markers {
    fn default() -> Self {
        Self::JPEG
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DemuxError {
    #[error("frame buffer exceeded {limit} bytes without a complete frame")]
    Overflow { limit: usize },
    #[error("byte source failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Accumulation buffer that yields complete frames.
///
/// Search progress is kept between calls, so bytes are scanned once no
/// matter how many reads a frame is spread over.
#[derive(Debug)]
pub struct FrameDemuxer {
    markers: Markers,
    buffer: BytesMut,
    max_buffer: usize,
    /// Offset of the pending frame's start marker.
    start: Option<usize>,
    /// Buffer length already searched for the marker being looked for.
    scanned: usize,
}

impl Default for FrameDemuxer {
    fn default() -> Self {
        Self::new(Markers::JPEG)
    }
}

impl FrameDemuxer {
    pub fn new(markers: Markers) -> Self {
        Self {
            markers,
            buffer: BytesMut::with_capacity(READ_CHUNK * 4),
            max_buffer: DEFAULT_MAX_BUFFER,
            start: None,
            scanned: 0,
        }
    }

    pub fn with_max_buffer(
        mut self,
        max_buffer: usize,
    ) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    /// Append newly read bytes.
    pub fn push(
        &mut self,
        chunk: &[u8],
    ) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Cut out the next complete frame, if the buffer holds one.
    ///
    /// A frame is emitted only when an end marker follows a start marker. The
    /// returned slice runs from the start marker through the end marker; every
    /// buffered byte before the frame's end is dropped.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let start = match self.start {
            Some(start) => start,
            None => {
                let start = self.resume(self.markers.start, 0)?;
                self.start = Some(start);
                self.scanned = start + self.markers.start.len();
                start
            }
        };

        let body = start + self.markers.start.len();
        let end = self.resume(self.markers.end, body)?;
        let frame_end = end + self.markers.end.len();

        let mut frame = self.buffer.split_to(frame_end);
        frame.advance(start);
        self.start = None;
        self.scanned = 0;
        Some(frame.freeze())
    }

    /// Look for `marker` at or after `from`, skipping what earlier calls
    /// already searched. Records the new search position on a miss.
    fn resume(
        &mut self,
        marker: [u8; 2],
        from: usize,
    ) -> Option<usize> {
        // back up one byte so a marker split across pushes is still found
        let offset = from.max(self.scanned.saturating_sub(1));
        let found = self
            .buffer
            .get(offset..)
            .and_then(|rest| find(rest, marker))
            .map(|at| offset + at);
        if found.is_none() {
            self.scanned = self.buffer.len();
        }
        found
    }

    /// Lazily drain every complete frame currently buffered.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { demuxer: self }
    }

    /// Fail once the bytes left over after draining exceed the ceiling.
    pub fn ensure_bounded(&self) -> Result<(), DemuxError> {
        if self.buffer.len() > self.max_buffer {
            return Err(DemuxError::Overflow {
                limit: self.max_buffer,
            });
        }
        Ok(())
    }

    /// Bytes waiting for the rest of a frame.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Forget everything buffered so the demuxer can be reused.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.start = None;
        self.scanned = 0;
    }
}

/// Iterator returned by [`FrameDemuxer::frames`].
pub struct Frames<'a> {
    demuxer: &'a mut FrameDemuxer,
}

impl Iterator for Frames<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Self::Item> {
        self.demuxer.next_frame()
    }
}

fn find(
    haystack: &[u8],
    marker: [u8; 2],
) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker.as_slice())
}

/// Pulls frames out of an async byte source.
pub struct FrameReader<R> {
    source: R,
    demuxer: FrameDemuxer,
    chunk: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(
        source: R,
        demuxer: FrameDemuxer,
    ) -> Self {
        Self {
            source,
            demuxer,
            chunk: vec![0; READ_CHUNK].into_boxed_slice(),
        }
    }

    /// Wait for the next complete frame.
    ///
    /// Returns `Ok(None)` at end of stream; a partial trailing frame is
    /// discarded. Cancel safe: dropping the future loses no buffered bytes.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, DemuxError> {
        loop {
            if let Some(frame) = self.demuxer.next_frame() {
                return Ok(Some(frame));
            }
            self.demuxer.ensure_bounded()?;

            let n = self.source.read(&mut self.chunk).await?;
            if n == 0 {
                if !self.demuxer.buffered().is_empty() {
                    tracing::debug!(
                        bytes = self.demuxer.buffered().len(),
                        "discarding partial frame at end of stream"
                    );
                    self.demuxer.reset();
                }
                return Ok(None);
            }
            self.demuxer.push(&self.chunk[..n]);
        }
    }

    pub fn demuxer(&self) -> &FrameDemuxer {
        &self.demuxer
    }

    pub fn into_inner(self) -> R {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOI: [u8; 2] = [0xFF, 0xD8];
    const EOI: [u8; 2] = [0xFF, 0xD9];

    fn jpeg(body: &[u8]) -> Vec<u8> {
        [&SOI[..], body, &EOI[..]].concat()
    }

    fn sample() -> Vec<u8> {
        [&b"junk"[..], &jpeg(b"abc"), &b"tail"[..]].concat()
    }

    #[test]
    fn test_single_frame_any_split() {
        let input = sample();
        for split in 0..=input.len() {
            let mut demuxer = FrameDemuxer::default();
            let mut frames = Vec::new();
            for chunk in [&input[..split], &input[split..]] {
                demuxer.push(chunk);
                frames.extend(demuxer.frames());
            }
            assert_eq!(frames, vec![Bytes::from(jpeg(b"abc"))], "split at {split}");
            assert_eq!(demuxer.buffered(), b"tail", "split at {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut demuxer = FrameDemuxer::default();
        let mut frames = Vec::new();
        for byte in sample() {
            demuxer.push(&[byte]);
            frames.extend(demuxer.frames());
        }
        assert_eq!(frames, vec![Bytes::from(jpeg(b"abc"))]);
        assert_eq!(demuxer.buffered(), b"tail");
    }

    #[test]
    fn test_several_frames_in_one_chunk() {
        let input = [jpeg(b"one"), b"--".to_vec(), jpeg(b"two"), jpeg(b"three")].concat();
        let mut demuxer = FrameDemuxer::default();
        demuxer.push(&input);
        let frames: Vec<Bytes> = demuxer.frames().collect();
        assert_eq!(
            frames,
            vec![
                Bytes::from(jpeg(b"one")),
                Bytes::from(jpeg(b"two")),
                Bytes::from(jpeg(b"three")),
            ]
        );
        assert!(demuxer.buffered().is_empty());
    }

    #[test]
    fn test_orphan_start_stays_buffered() {
        let mut demuxer = FrameDemuxer::default();
        demuxer.push(b"xx");
        demuxer.push(&SOI);
        demuxer.push(b"partial");
        assert!(demuxer.next_frame().is_none());
        assert_eq!(demuxer.buffered().len(), 2 + 2 + 7);

        demuxer.push(&EOI);
        assert_eq!(demuxer.next_frame(), Some(Bytes::from(jpeg(b"partial"))));
    }

    #[test]
    fn test_search_resumes_where_it_left_off() {
        let mut demuxer = FrameDemuxer::default();
        demuxer.push(b"noise");
        assert!(demuxer.next_frame().is_none());
        assert_eq!(demuxer.scanned, 5);

        demuxer.push(&[0xFF]);
        assert!(demuxer.next_frame().is_none());
        demuxer.push(&[0xD8]);
        assert!(demuxer.next_frame().is_none());
        assert_eq!(demuxer.start, Some(5));

        // a stalled frame only costs the newly pushed bytes
        for _ in 0..4 {
            demuxer.push(&[0x11; READ_CHUNK]);
            assert!(demuxer.next_frame().is_none());
            assert_eq!(demuxer.scanned, demuxer.buffered().len());
        }

        demuxer.push(&[0xFF]);
        assert!(demuxer.next_frame().is_none());
        demuxer.push(&[0xD9]);
        let frame = demuxer.next_frame().unwrap();
        assert_eq!(frame.len(), 2 + 4 * READ_CHUNK + 2);
        assert_eq!((demuxer.start, demuxer.scanned), (None, 0));

        demuxer.push(&jpeg(b"next"));
        assert_eq!(demuxer.next_frame(), Some(Bytes::from(jpeg(b"next"))));
    }

    #[test]
    fn test_stray_end_before_start_does_not_stall() {
        let input = [&EOI[..], b"noise", &jpeg(b"ok")].concat();
        let mut demuxer = FrameDemuxer::default();
        demuxer.push(&input);
        assert_eq!(demuxer.next_frame(), Some(Bytes::from(jpeg(b"ok"))));
        assert!(demuxer.buffered().is_empty());
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut demuxer = FrameDemuxer::default().with_max_buffer(16);
        demuxer.push(&SOI);
        demuxer.push(&[0u8; 32]);
        assert!(demuxer.next_frame().is_none());
        assert!(matches!(
            demuxer.ensure_bounded(),
            Err(DemuxError::Overflow { limit: 16 })
        ));
        demuxer.reset();
        assert!(demuxer.ensure_bounded().is_ok());
    }

    #[test]
    fn test_custom_markers() {
        let markers = Markers {
            start: *b"<<",
            end: *b">>",
        };
        let mut demuxer = FrameDemuxer::new(markers);
        demuxer.push(b"..<<payload>>..");
        assert_eq!(demuxer.next_frame(), Some(Bytes::from_static(b"<<payload>>")));
    }

    #[tokio::test]
    async fn test_reader_discards_partial_trailing_frame() {
        let input = [jpeg(b"first"), jpeg(b"second"), SOI.to_vec(), b"cut".to_vec()].concat();
        let mut reader = FrameReader::new(&input[..], FrameDemuxer::default());

        assert_eq!(reader.next_frame().await.unwrap(), Some(Bytes::from(jpeg(b"first"))));
        assert_eq!(reader.next_frame().await.unwrap(), Some(Bytes::from(jpeg(b"second"))));
        assert_eq!(reader.next_frame().await.unwrap(), None);
        assert!(reader.demuxer().buffered().is_empty());
    }

    #[tokio::test]
    async fn test_reader_overflow_on_garbage() {
        let garbage = vec![0x11u8; READ_CHUNK * 3];
        let demuxer = FrameDemuxer::default().with_max_buffer(READ_CHUNK);
        let mut reader = FrameReader::new(&garbage[..], demuxer);
        assert!(matches!(
            reader.next_frame().await,
            Err(DemuxError::Overflow { .. })
        ));
    }
}
