//! Request and response lines exchanged on a connection.
//!
//! A client sends one JSON object terminated by a newline and receives one
//! JSON object back once its conversion has finished:
//!
//! ```text
//! > {"source":"/data/slide.tif","destination":"/data/slide.raw","series":"largest"}
//! < {"status":"succeeded","sequence":3,"planes":12,"elapsed_ms":5310}
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::image_pipeline::{ConversionJob, ConversionStats, SeriesSelection};
use crate::server::error::{Result, ServerError};

/// Longest accepted request line, newline included.
pub const MAX_REQUEST_BYTES: u64 = 64 * 1024;

fn default_group_files() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConversionRequest {
    #[serde(alias = "path")]
    pub source: String,
    /// Defaults to `<source stem>_converted.tif` next to the source
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default = "default_group_files", alias = "group")]
    pub group_files: bool,
    #[serde(default)]
    pub series: SeriesSelection,
    /// Older clients ask for the largest series with this flag
    #[serde(default, alias = "onlyBiggestSerie")]
    pub only_biggest_series: bool,
}

impl ConversionRequest {
    pub fn parse(line: &str) -> Result<Self> {
        let request: Self =
            serde_json::from_str(line.trim()).map_err(|e| ServerError::ParseError(e.to_string()))?;
        if request.source.trim().is_empty() {
            return Err(ServerError::ParseError("source must not be empty".to_string()));
        }
        if matches!(&request.destination, Some(d) if d.trim().is_empty()) {
            return Err(ServerError::ParseError("destination must not be empty".to_string()));
        }
        Ok(request)
    }

    pub fn destination(&self) -> String {
        match &self.destination {
            Some(destination) => destination.clone(),
            None => {
                let source = Path::new(&self.source);
                let stem = source.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
                source
                    .with_file_name(format!("{stem}_converted.tif"))
                    .to_string_lossy()
                    .into_owned()
            }
        }
    }

    pub fn series_selection(&self) -> SeriesSelection {
        if self.only_biggest_series {
            SeriesSelection::Largest
        } else {
            self.series
        }
    }

    pub fn into_job(self, sequence: u64) -> ConversionJob {
        let destination = self.destination();
        let selection = self.series_selection();
        ConversionJob::new(sequence, self.source, destination)
            .with_group_files(self.group_files)
            .with_series_selection(selection)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConversionResponse {
    Succeeded {
        sequence: u64,
        planes: usize,
        elapsed_ms: u64,
    },
    Failed {
        sequence: u64,
        error: String,
    },
}

impl ConversionResponse {
    pub fn succeeded(sequence: u64, stats: &ConversionStats) -> Self {
        Self::Succeeded {
            sequence,
            planes: stats.total_planes,
            elapsed_ms: stats.elapsed().as_millis() as u64,
        }
    }

    pub fn failed(sequence: u64, error: impl ToString) -> Self {
        Self::Failed {
            sequence,
            error: error.to_string(),
        }
    }

    /// The response as a newline-terminated JSON line.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"status\":\"failed\",\"error\":\"unserializable response: {e}\"}}")
        });
        line.push('\n');
        line
    }
}
