//! Raw stream file writer.

use crate::error::{Error, Result};
use crate::format::StreamPara;
use crate::stage::{Flow, ProcessContext, StageBackend, StageKind};
use bytes::Bytes;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writes the active bytes of every consumed frame to a file.
///
/// The file is created in `setup()`. If a header is set (codec configuration
/// such as SPS/PPS) it is written first. With a frame limit the stage ends
/// the stream once the limit is reached.
pub struct FileSink {
    path: PathBuf,
    header: Option<Bytes>,
    max_frames: Option<u64>,
    writer: Option<BufWriter<File>>,
    frames_written: u64,
    bytes_written: u64,
}

impl FileSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            header: None,
            max_frames: None,
            writer: None,
            frames_written: 0,
            bytes_written: 0,
        }
    }

    /// Bytes written before the first frame.
    pub fn with_header(mut self, header: Option<Bytes>) -> Self {
        self.header = header.filter(|h| !h.is_empty());
        self
    }

    /// Stop after `max_frames` frames. 0 means no limit.
    pub fn with_max_frames(mut self, max_frames: u64) -> Self {
        self.max_frames = (max_frames > 0).then_some(max_frames);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn limit_reached(&self) -> bool {
        self.max_frames.is_some_and(|max| self.frames_written >= max)
    }
}

impl StageBackend for FileSink {
    fn kind(&self) -> StageKind {
        StageKind::FileWriter
    }

    fn negotiate(&mut self, input: Option<&StreamPara>) -> Result<StreamPara> {
        input
            .copied()
            .ok_or_else(|| Error::config(format!("file writer for {} needs a producer", self.path.display())))
    }

    fn setup(&mut self) -> Result<()> {
        let mut writer = BufWriter::new(File::create(&self.path)?);
        if let Some(header) = &self.header {
            writer.write_all(header)?;
            self.bytes_written += header.len() as u64;
        }
        self.writer = Some(writer);
        tracing::debug!(path = %self.path.display(), "file writer opened");
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(error) = writer.flush() {
                tracing::warn!(path = %self.path.display(), error = %error, "flush failed");
            }
        }
        tracing::debug!(
            path = %self.path.display(),
            frames = self.frames_written,
            bytes = self.bytes_written,
            "file writer closed"
        );
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<Flow> {
        if self.limit_reached() {
            return Ok(Flow::Eos);
        }
        let Some(frame) = ctx.input() else {
            return Ok(Flow::Skip);
        };
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::InvalidState(format!("{} is not open", self.path.display())))?;
        let data = frame.active_data();
        writer
            .write_all(data)
            .map_err(|e| Error::fatal(format!("writing {}: {e}", self.path.display())))?;
        self.frames_written += 1;
        self.bytes_written += data.len() as u64;

        if self.max_frames.is_some_and(|max| self.frames_written >= max) {
            writer.flush()?;
            return Ok(Flow::Eos);
        }
        Ok(Flow::Consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Frame, FrameMeta};
    use tempfile::tempdir;

    fn frame(bytes: &[u8]) -> Frame {
        Frame::detached(bytes.to_vec(), FrameMeta::default())
    }

    #[test]
    fn test_writes_header_and_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.h264");
        let mut sink = FileSink::new(&path).with_header(Some(Bytes::from_static(b"HDR")));

        let para = sink.negotiate(Some(&StreamPara::Opaque)).unwrap();
        sink.setup().unwrap();
        for chunk in [&b"ab"[..], b"cd"] {
            let input = frame(chunk);
            let mut ctx = ProcessContext::new(Some(&input), None, &para);
            assert_eq!(sink.process(&mut ctx).unwrap(), Flow::Consumed);
        }
        sink.teardown();

        assert_eq!(std::fs::read(&path).unwrap(), b"HDRabcd");
        assert_eq!(sink.frames_written(), 2);
        assert_eq!(sink.bytes_written(), 7);
    }

    #[test]
    fn test_max_frames_ends_stream() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.raw");
        let mut sink = FileSink::new(&path).with_max_frames(2);

        let para = sink.negotiate(Some(&StreamPara::Opaque)).unwrap();
        sink.setup().unwrap();
        let input = frame(b"x");
        let mut flows = Vec::new();
        for _ in 0..3 {
            let mut ctx = ProcessContext::new(Some(&input), None, &para);
            flows.push(sink.process(&mut ctx).unwrap());
        }
        sink.teardown();

        assert_eq!(flows, [Flow::Consumed, Flow::Eos, Flow::Eos]);
        assert_eq!(std::fs::read(&path).unwrap(), b"xx");
    }

    #[test]
    fn test_setup_fails_on_bad_path() {
        let dir = tempdir().unwrap();
        let mut sink = FileSink::new(dir.path().join("missing").join("out.raw"));
        assert!(matches!(sink.setup(), Err(Error::Io(_))));
    }

    #[test]
    fn test_needs_producer() {
        let mut sink = FileSink::new("unused.raw");
        assert!(sink.negotiate(None).is_err());
    }
}
