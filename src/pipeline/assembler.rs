//! Pipeline assembly from a [`PipelineConfig`].
//!
//! For each instance the assembler builds and initializes stages in order,
//! reading every stage's negotiated output before deciding on the next one:
//!
//! ```text
//! source ─┬─> [decoder] ─> [transform] ─┬─> [display]
//!         │                             ├─> [encoder] ─┬─> [file writer]
//!         └─> [audio decoder]           │              └─> [push server]
//!                                       └─> [file writer]   (no encoder)
//! ```
//!
//! Bracketed stages are only inserted when needed or requested. If any
//! `init()` fails the stages already initialized for that instance are
//! stopped in reverse order and the error is returned; other instances are
//! not affected.

use super::config::{PipelineConfig, PushConfig};
use super::factory::{BackendFactory, BoxedBackend, SourceSpec};
use super::negotiate::{TileLayout, WindowRect, needs_decode, plan_transform, resolve_target};
use super::source::{SourceKind, SourceRegistry, classify};
use crate::buffer::Frame;
use crate::error::{Error, Result};
use crate::format::{ImagePara, MediaType, VideoCodec};
use crate::observability::span_pipeline;
use crate::stage::{Stage, StageOptions, StageState};
use crate::synchronize::Synchronizer;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::Span;

/// Pool sizes per inserted stage.
pub const DECODER_BUFFERS: usize = 10;
pub const TRANSFORM_BUFFERS: usize = 2;
pub const DISPLAY_BUFFERS: usize = 1;
pub const ENCODER_BUFFERS: usize = 8;
pub const AUDIO_DECODER_BUFFERS: usize = 1;

// ============================================================================
// AssemblyReport
// ============================================================================

/// What was built for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyReport {
    pub index: usize,
    pub input: String,
    pub source_kind: SourceKind,
    /// Source output.
    pub input_para: ImagePara,
    /// Output of the last raw stage (before any encoder).
    pub output_para: ImagePara,
    pub decoder: bool,
    pub transform: bool,
    pub encoder: Option<VideoCodec>,
    pub display: Option<WindowRect>,
    pub file_output: Option<PathBuf>,
    pub dump_file: Option<PathBuf>,
    /// `scheme://<host>:port/live/N`
    pub push: Option<String>,
    pub audio: bool,
    pub shared_source: bool,
}

fn enabled(on: bool) -> &'static str {
    if on { "enable" } else { "disable" }
}

impl fmt::Display for AssemblyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = |p: &Option<PathBuf>| {
            p.as_ref()
                .map_or_else(|| "disable".to_string(), |p| p.display().to_string())
        };
        writeln!(f, "Instance:       {}", self.index)?;
        writeln!(f, "Input source:   {} ({})", self.input, self.source_kind)?;
        writeln!(f, "Input format:   {}", self.input_para)?;
        writeln!(f, "Output format:  {}", self.output_para)?;
        writeln!(f, "Decoder:        {}", enabled(self.decoder))?;
        writeln!(f, "Transform:      {}", enabled(self.transform))?;
        match self.encoder {
            Some(codec) => writeln!(f, "Encoder:        {codec:?}")?,
            None => writeln!(f, "Encoder:        disable")?,
        }
        match self.display {
            Some(w) => writeln!(f, "Display:        {}x{} at ({}, {})", w.width, w.height, w.x, w.y)?,
            None => writeln!(f, "Display:        disable")?,
        }
        writeln!(f, "File writer:    {}", path(&self.file_output))?;
        writeln!(f, "Dump file:      {}", path(&self.dump_file))?;
        writeln!(f, "Push:           {}", self.push.as_deref().unwrap_or("disable"))?;
        write!(f, "Audio:          {}", enabled(self.audio))
    }
}

// ============================================================================
// Instance
// ============================================================================

/// One assembled pipeline.
pub struct Instance {
    index: usize,
    source: Stage,
    owns_source: bool,
    /// Stages this instance created, in build order.
    stages: Vec<Stage>,
    last: Stage,
    sync: Option<Arc<Synchronizer>>,
    report: AssemblyReport,
}

impl Instance {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn source(&self) -> &Stage {
        &self.source
    }

    /// Whether this instance built (and stops) the source.
    pub fn owns_source(&self) -> bool {
        self.owns_source
    }

    /// Stages this instance created, in build order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The stage further destinations would attach to.
    pub fn last_stage(&self) -> &Stage {
        &self.last
    }

    pub fn synchronizer(&self) -> Option<&Arc<Synchronizer>> {
        self.sync.as_ref()
    }

    pub fn report(&self) -> &AssemblyReport {
        &self.report
    }

    /// Start every stage, consumers before producers. A shared source that
    /// is already running is left alone. On failure the stages started here
    /// are stopped again.
    pub fn start(&self) -> Result<()> {
        let mut started: Vec<&Stage> = Vec::new();
        for stage in self.stages.iter().rev() {
            if stage.state() == StageState::Running {
                continue;
            }
            if let Err(error) = stage.start() {
                for stage in started.iter().rev() {
                    stage.stop();
                }
                return Err(error);
            }
            started.push(stage);
        }
        if !self.owns_source && self.source.state() == StageState::Initialized {
            self.source.start()?;
        }
        Ok(())
    }

    /// Stop every stage this instance created, producers first.
    pub fn stop(&self) {
        for stage in &self.stages {
            stage.stop();
        }
    }

    /// Topology tree below the source.
    pub fn dump(&self) -> String {
        self.source.dump_pipe()
    }

    /// Per-stage counters below the source.
    pub fn dump_summary(&self) -> String {
        self.source.dump_pipe_summary()
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("index", &self.index)
            .field("source", &self.source.name())
            .field("stages", &self.stages.len())
            .finish()
    }
}

/// The result of [`Assembler::assemble_all`].
#[derive(Debug, Default)]
pub struct Assembly {
    pub instances: Vec<Instance>,
    /// Instances that failed to assemble, with the error.
    pub failures: Vec<(usize, Error)>,
}

impl Assembly {
    /// Start every instance; returns the instances that failed to start.
    pub fn start_all(&self) -> Vec<(usize, Error)> {
        self.instances
            .iter()
            .filter_map(|instance| instance.start().err().map(|e| (instance.index, e)))
            .collect()
    }

    /// Stop every instance, in reverse order.
    pub fn stop_all(&self) {
        for instance in self.instances.iter().rev() {
            instance.stop();
        }
    }
}

// ============================================================================
// Assembler
// ============================================================================

/// Builds pipeline instances from a configuration.
pub struct Assembler {
    factory: Arc<dyn BackendFactory>,
    registry: SourceRegistry,
}

impl Assembler {
    pub fn new(factory: impl BackendFactory + 'static) -> Self {
        Self {
            factory: Arc::new(factory),
            registry: SourceRegistry::new(),
        }
    }

    /// Share sources through an existing registry.
    pub fn with_registry(mut self, registry: SourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    /// Assemble `config.instance_count` instances. A failed instance is
    /// recorded and does not prevent the others.
    pub fn assemble_all(&self, config: &PipelineConfig) -> Assembly {
        let mut assembly = Assembly::default();
        for index in 0..config.instance_count {
            match self.assemble(config, index) {
                Ok(instance) => assembly.instances.push(instance),
                Err(error) => {
                    tracing::error!(instance = index, error = %error, "instance assembly failed");
                    assembly.failures.push((index, error));
                }
            }
        }
        assembly
    }

    /// Assemble instance `index`.
    pub fn assemble(&self, config: &PipelineConfig, index: usize) -> Result<Instance> {
        config.validate()?;
        let span = if config.tracing.pipeline_spans {
            span_pipeline(&format!("{}#{index}", config.input))
        } else {
            Span::none()
        };
        let _guard = span.enter();

        let mut build = Build {
            factory: self.factory.as_ref(),
            config,
            index,
            created: Vec::new(),
        };
        match build.run(&self.registry) {
            Ok(instance) => {
                tracing::info!(instance = index, "assembled\n{}", instance.report);
                Ok(instance)
            }
            Err(error) => {
                tracing::warn!(
                    instance = index,
                    stages = build.created.len(),
                    error = %error,
                    "tearing down partial instance"
                );
                for stage in build.created.iter().rev() {
                    stage.stop();
                }
                // Stages hanging off a shared source this instance did not
                // build must not stay on its consumer list.
                for stage in &build.created {
                    if stage.producer().is_some_and(|p| !build.created.contains(&p)) {
                        stage.unlink();
                    }
                }
                // A shared source this instance built is dead now.
                if let Some(shared) = self.registry.get(&config.input) {
                    if build.created.contains(&shared) {
                        self.registry.remove(&config.input);
                    }
                }
                Err(error)
            }
        }
    }
}

impl fmt::Debug for Assembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Assembler")
            .field("registry", &self.registry)
            .finish()
    }
}

/// State of one instance while it is being built.
struct Build<'a> {
    factory: &'a dyn BackendFactory,
    config: &'a PipelineConfig,
    index: usize,
    /// Stages created so far, in build order.
    created: Vec<Stage>,
}

impl Build<'_> {
    fn options(&self, buffer_count: usize) -> StageOptions {
        StageOptions::default()
            .with_buffer_count(buffer_count)
            .with_tracing(self.config.tracing.clone())
    }

    fn name(&self, role: &str) -> String {
        format!("{role}-{}", self.index)
    }

    /// Create a stage after `upstream`, attach the clock if given and
    /// initialize it.
    fn add(
        &mut self,
        role: &str,
        backend: BoxedBackend,
        buffer_count: usize,
        upstream: &Stage,
        sync: Option<&Arc<Synchronizer>>,
    ) -> Result<Stage> {
        let stage = Stage::with_options(self.name(role), backend, self.options(buffer_count));
        stage.set_productor(upstream)?;
        if let Some(sync) = sync {
            stage.set_synchronize(sync.clone());
        }
        self.created.push(stage.clone());
        stage.init()?;
        Ok(stage)
    }

    fn create_source(&mut self, kind: SourceKind, sync: Option<&Arc<Synchronizer>>) -> Result<Stage> {
        let spec = SourceSpec {
            input: &self.config.input,
            kind,
            para: self.config.input_para,
            rtsp_transport: self.config.rtsp_transport,
        };
        let backend = self.factory.source(&spec)?;
        let name = if self.config.shared_source {
            "source".to_string()
        } else {
            self.name("source")
        };
        let mut options = self.options(kind.default_buffer_count());
        if kind.is_network() {
            options = options.with_max_timeout_count(self.config.inactivity_timeout_count);
        }
        let stage = Stage::with_options(name, backend, options);
        if let Some(sync) = sync {
            stage.set_synchronize(sync.clone());
        }
        self.created.push(stage.clone());
        stage.init()?;
        Ok(stage)
    }

    fn run(&mut self, registry: &SourceRegistry) -> Result<Instance> {
        let config = self.config;
        let kind = classify(&config.input)?;
        if !config.has_destination() {
            tracing::info!(
                instance = self.index,
                "no destination configured; output is only reachable through external consumers"
            );
        }
        let sync = config.sync.map(|t| Arc::new(Synchronizer::new(t)));

        let (source, owns_source) = if config.shared_source {
            let (source, built) =
                registry.get_or_try_insert(&config.input, || self.create_source(kind, sync.as_ref()))?;
            if !built && source.state() != StageState::Initialized && source.state() != StageState::Running {
                return Err(Error::InvalidState(format!(
                    "shared source '{}' is {}",
                    source.name(),
                    source.state()
                )));
            }
            (source, built)
        } else {
            (self.create_source(kind, sync.as_ref())?, true)
        };
        let input_para = source.output_image_para()?;

        let mut report = AssemblyReport {
            index: self.index,
            input: config.input.clone(),
            source_kind: kind,
            input_para,
            output_para: input_para,
            decoder: false,
            transform: false,
            encoder: config.encoder,
            display: None,
            file_output: None,
            dump_file: None,
            push: None,
            audio: false,
            shared_source: config.shared_source,
        };

        if let Some(device) = &config.audio_device {
            let backend = self.factory.audio_decoder(device, source.audio_extra_data())?;
            self.add("audio", backend, AUDIO_DECODER_BUFFERS, &source, sync.as_ref())?;
            report.audio = true;
        }

        let mut last = source.clone();
        let mut current = input_para;

        if needs_decode(current.format) || kind.is_container() {
            let backend = self.factory.decoder(&current)?;
            last = self.add("decoder", backend, DECODER_BUFFERS, &last, None)?;
            current = last.output_image_para()?;
            report.decoder = true;
        }

        let target = resolve_target(&current, &config.output_para, config.output_format);
        if let Some(planned) = plan_transform(&current, &target, config.rotation) {
            let backend = self.factory.transform(planned, config.rotation)?;
            last = self.add("transform", backend, TRANSFORM_BUFFERS, &last, None)?;
            current = last.output_image_para()?;
            report.transform = true;
        }
        report.output_para = current;

        if let Some(display) = &config.display {
            let layout = TileLayout::for_count(config.instance_count);
            let window = layout.window(self.index, display.width, display.height, &current);
            let backend = self.factory.display(display, window)?;
            self.add("display", backend, DISPLAY_BUFFERS, &last, sync.as_ref())?;
            report.display = Some(window);
        }

        if let Some(codec) = config.encoder {
            let backend = self.factory.encoder(codec, &current)?;
            last = self.add("encoder", backend, ENCODER_BUFFERS, &last, None)?;
        }

        if let Some(path) = &config.file_output {
            let path = config.instance_path(path, self.index);
            let backend = self
                .factory
                .file_writer(&path, last.video_extra_data(), config.max_frames)?;
            self.add("file-writer", backend, 0, &last, None)?;
            report.file_output = Some(path);
        }

        if let Some(push) = &config.push {
            let path = PushConfig::path(self.index);
            let backend = self.factory.push_server(push, &path)?;
            self.add("server", backend, 0, &last, sync.as_ref())?;
            report.push = Some(format!("{}://<host>:{}{path}", push.protocol, push.port));
        }

        if let (Some(path), true) = (&config.dump_file, owns_source) {
            let path = config.instance_path(path, self.index);
            source.set_output_data_callback(dump_tap(&path)?);
            report.dump_file = Some(path);
        }

        let mut stages = Vec::new();
        if owns_source {
            stages.push(source.clone());
        }
        stages.extend(self.created.iter().filter(|s| **s != source).cloned());

        Ok(Instance {
            index: self.index,
            source,
            owns_source,
            stages,
            last,
            sync,
            report,
        })
    }
}

/// Callback writing the active bytes of every video frame to `path`.
fn dump_tap(path: &Path) -> Result<impl Fn(&Frame) + Send + Sync + 'static> {
    let writer = Mutex::new(BufWriter::new(File::create(path)?));
    let path = path.to_path_buf();
    Ok(move |frame: &Frame| {
        if frame.media_type() != MediaType::Video {
            return;
        }
        let mut writer = writer.lock().unwrap();
        if let Err(error) = writer.write_all(frame.active_data()).and_then(|_| writer.flush()) {
            tracing::warn!(path = %path.display(), error = %error, "dump write failed");
        }
    })
}
