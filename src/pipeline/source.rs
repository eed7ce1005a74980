//! Input classification and shared sources.

use crate::error::{Error, Result};
use crate::stage::Stage;
use rustix::fs::{FileType, stat};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Which kind of source stage an input needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Video capture device node.
    Camera,
    /// Raw elementary stream read from a file.
    FileReader,
    /// Container file (`.mp4`, `.mkv`) demuxed on read.
    Container,
    /// `rtsp://` client.
    RtspClient,
    /// `rtmp://` client.
    RtmpClient,
}

impl SourceKind {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::FileReader => "file reader",
            Self::Container => "container reader",
            Self::RtspClient => "rtsp client",
            Self::RtmpClient => "rtmp client",
        }
    }

    /// Whether the source's output always needs a decoder.
    pub const fn is_container(&self) -> bool {
        matches!(self, Self::Container)
    }

    /// Whether the source is a network client.
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::RtspClient | Self::RtmpClient)
    }

    /// Pool size for the source stage. Cameras hand out one buffer at a
    /// time; readers and network clients demux in bursts and get room for
    /// them.
    pub const fn default_buffer_count(&self) -> usize {
        match self {
            Self::Camera => 1,
            Self::FileReader | Self::Container | Self::RtspClient | Self::RtmpClient => 20,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decide the source kind for `input`.
///
/// URLs are recognised by scheme; anything else must exist on disk as a
/// character device (camera) or a regular file.
pub fn classify(input: &str) -> Result<SourceKind> {
    let lower = input.to_ascii_lowercase();
    if lower.starts_with("rtsp://") {
        return Ok(SourceKind::RtspClient);
    }
    if lower.starts_with("rtmp://") {
        return Ok(SourceKind::RtmpClient);
    }

    let st = stat(input).map_err(|errno| {
        Error::config(format!("input '{input}' cannot be opened: {errno}"))
    })?;
    match FileType::from_raw_mode(st.st_mode) {
        FileType::CharacterDevice => Ok(SourceKind::Camera),
        FileType::RegularFile => {
            let extension = Path::new(input)
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase());
            match extension.as_deref() {
                Some("mp4" | "mkv") => Ok(SourceKind::Container),
                _ => Ok(SourceKind::FileReader),
            }
        }
        other => Err(Error::config(format!(
            "input '{input}' is a {other:?}, not a device, file or URL"
        ))),
    }
}

/// Source stages shared between instances, keyed by input.
///
/// The first instance to ask for an input builds its source; later instances
/// link to the same stage.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: Arc<Mutex<HashMap<String, Stage>>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registered source for `input`, building it with `build` if there
    /// is none. Failed builds are not registered.
    pub fn get_or_try_insert(
        &self,
        input: &str,
        build: impl FnOnce() -> Result<Stage>,
    ) -> Result<(Stage, bool)> {
        let mut sources = self.sources.lock().unwrap();
        if let Some(stage) = sources.get(input) {
            return Ok((stage.clone(), false));
        }
        let stage = build()?;
        sources.insert(input.to_string(), stage.clone());
        Ok((stage, true))
    }

    pub fn get(&self, input: &str) -> Option<Stage> {
        self.sources.lock().unwrap().get(input).cloned()
    }

    /// Forget `input`; its stage lives on while instances hold it.
    pub fn remove(&self, input: &str) -> Option<Stage> {
        self.sources.lock().unwrap().remove(input)
    }

    pub fn len(&self) -> usize {
        self.sources.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sources = self.sources.lock().unwrap();
        f.debug_struct("SourceRegistry")
            .field("inputs", &sources.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::PatternSource;
    use crate::format::{ImagePara, PixelFormat};
    use tempfile::tempdir;

    #[test]
    fn test_classify_urls() {
        assert_eq!(classify("rtsp://10.0.0.2/stream").unwrap(), SourceKind::RtspClient);
        assert_eq!(classify("RTMP://host/live").unwrap(), SourceKind::RtmpClient);
        assert!(SourceKind::RtspClient.is_network());
    }

    #[test]
    fn test_classify_files() {
        let dir = tempdir().unwrap();
        let raw = dir.path().join("clip.h264");
        let mp4 = dir.path().join("clip.MP4");
        std::fs::write(&raw, b"x").unwrap();
        std::fs::write(&mp4, b"x").unwrap();

        assert_eq!(classify(raw.to_str().unwrap()).unwrap(), SourceKind::FileReader);
        assert_eq!(classify(mp4.to_str().unwrap()).unwrap(), SourceKind::Container);
        assert!(SourceKind::Container.is_container());
    }

    #[test]
    fn test_classify_rejects() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            classify(dir.path().to_str().unwrap()),
            Err(Error::Configuration(_))
        ));
        assert!(classify(dir.path().join("missing").to_str().unwrap()).is_err());
    }

    #[test]
    fn test_classify_char_device() {
        // /dev/null is a character device on every Linux system.
        assert_eq!(classify("/dev/null").unwrap(), SourceKind::Camera);
    }

    #[test]
    fn test_registry_shares() {
        let registry = SourceRegistry::new();
        let build = || {
            Ok(Stage::new(
                "src",
                PatternSource::new(ImagePara::new(8, 8, PixelFormat::Gray8)),
            ))
        };
        let (a, built_a) = registry.get_or_try_insert("cam", build).unwrap();
        let (b, built_b) = registry.get_or_try_insert("cam", build).unwrap();
        assert!(built_a);
        assert!(!built_b);
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);

        assert!(
            registry
                .get_or_try_insert("other", || Err(Error::config("no backend")))
                .is_err()
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.remove("cam"), Some(a));
        assert!(registry.is_empty());
    }
}
