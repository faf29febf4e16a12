use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::image_pipeline::common::error::{ConversionError, Result};
use crate::image_pipeline::conversions::plane::PlaneConverter;
use crate::image_pipeline::conversions::series::{convert_series, plan_series, planned_bytes};
use crate::image_pipeline::conversions::timing::{ConversionStats, ProgressThrottle};
use crate::image_pipeline::conversions::types::{ConversionConfig, SeriesSelection};
use crate::image_pipeline::format::{FormatHandle, FormatOpener, ImageGeometry};
use crate::image_pipeline::sink::{OutputSink, SinkFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One source to destination conversion.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub source: String,
    pub destination: String,
    pub group_files: bool,
    pub series_selection: SeriesSelection,
    /// Arrival order of the request that created the job
    pub sequence: u64,
    /// Known once the source is open
    pub geometry: Option<ImageGeometry>,
    pub status: JobStatus,
}

impl ConversionJob {
    pub fn new(sequence: u64, source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            group_files: true,
            series_selection: SeriesSelection::All,
            sequence,
            geometry: None,
            status: JobStatus::Pending,
        }
    }

    pub fn with_group_files(mut self, group_files: bool) -> Self {
        self.group_files = group_files;
        self
    }

    pub fn with_series_selection(mut self, selection: SeriesSelection) -> Self {
        self.series_selection = selection;
        self
    }
}

/// Closes the source exactly once, on every path out of a job.
struct SourceGuard {
    handle: Box<dyn FormatHandle>,
    closed: bool,
}

impl SourceGuard {
    fn new(handle: Box<dyn FormatHandle>) -> Self {
        Self { handle, closed: false }
    }

    fn handle(&mut self) -> &mut dyn FormatHandle {
        &mut *self.handle
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.handle.close()
    }
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close source: {}", e);
        }
    }
}

/// Finalizes the sink on success and aborts it otherwise, never both.
struct SinkGuard {
    sink: Box<dyn OutputSink>,
    closed: bool,
}

impl SinkGuard {
    fn new(sink: Box<dyn OutputSink>) -> Self {
        Self { sink, closed: false }
    }

    fn handle(&mut self) -> &mut dyn OutputSink {
        &mut *self.sink
    }

    fn finalize(&mut self) -> Result<()> {
        if self.closed {
            return Err(ConversionError::EncodeError("sink already closed".to_string()));
        }
        self.closed = true;
        let result = self.sink.finalize();
        if result.is_err() {
            // A sink that failed to finish still owns a partial file
            if let Err(e) = self.sink.abort() {
                warn!("Failed to discard partial output: {}", e);
            }
        }
        result
    }

    fn abort(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.sink.abort() {
            warn!("Failed to discard partial output: {}", e);
        }
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Runs conversion jobs against the readers and sinks it was built with.
pub struct ConversionEngine {
    formats: Arc<dyn FormatOpener>,
    sinks: Arc<dyn SinkFactory>,
    config: ConversionConfig,
}

impl ConversionEngine {
    pub fn new(formats: Arc<dyn FormatOpener>, sinks: Arc<dyn SinkFactory>, config: ConversionConfig) -> Self {
        Self {
            formats,
            sinks,
            config,
        }
    }

    /// Converts every planned plane of `job`, leaving it `Succeeded` or `Failed`.
    #[instrument(skip_all, fields(sequence = job.sequence))]
    pub fn run(&self, job: &mut ConversionJob, cancel: &CancellationToken) -> Result<ConversionStats> {
        info!(source = %job.source, destination = %job.destination, "Starting conversion");
        job.status = JobStatus::Running;

        let result = self.execute(job, cancel);
        match &result {
            Ok(stats) => {
                job.status = JobStatus::Succeeded;
                info!("[done]");
                stats.log_summary();
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                error!("Conversion failed: {}", e);
            }
        }
        result
    }

    fn execute(&self, job: &mut ConversionJob, cancel: &CancellationToken) -> Result<ConversionStats> {
        let mut stats = ConversionStats::new();

        let handle = {
            let _span = tracing::info_span!("open_source").entered();
            self.formats.open(&job.source, job.group_files)?
        };
        let mut source = SourceGuard::new(handle);

        let converted = self.convert_from(&mut source, job, cancel, &mut stats);
        let closed = source.close();
        converted?;
        closed?;

        stats.finish();
        Ok(stats)
    }

    fn convert_from(
        &self,
        source: &mut SourceGuard,
        job: &mut ConversionJob,
        cancel: &CancellationToken,
        stats: &mut ConversionStats,
    ) -> Result<()> {
        let geometry = source.handle().geometry()?;
        job.geometry = Some(geometry.clone());

        let capabilities = self.sinks.capabilities(&job.destination)?;
        let plans = plan_series(&geometry, job.series_selection, capabilities, self.config.dimension_policy)?;
        let big_format = capabilities.big_format
            && (self.config.force_big_format
                || planned_bytes(&geometry, &plans) >= self.config.big_format_threshold);

        let sink = {
            let _span = tracing::info_span!("create_sink", big_format).entered();
            self.sinks.create(&job.destination, &geometry, big_format)?
        };
        let mut sink = SinkGuard::new(sink);

        info!("[{}] -> {}", source.handle().format_name(), job.destination);
        stats.mark_planes_started();

        let mut throttle = ProgressThrottle::new(self.config.progress_interval);
        let outcome = {
            let mut converter = PlaneConverter::new(source.handle(), sink.handle(), &self.config, cancel);
            convert_series(&mut converter, &geometry, &plans, stats, &mut throttle)
        };

        match outcome {
            Ok(()) => sink.finalize(),
            Err(e) => {
                sink.abort();
                Err(e)
            }
        }
    }
}
