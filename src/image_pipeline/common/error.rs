use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("Failed to open source {locator}: {reason}")]
    OpenError { locator: String, reason: String },

    #[error("Failed to create destination {locator}: {reason}")]
    CreateError { locator: String, reason: String },

    #[error("Failed to decode pixels: {0}")]
    DecodeError(String),

    #[error("Failed to encode pixels: {0}")]
    EncodeError(String),

    #[error("Invalid image dimensions: width={0}, height={1}")]
    InvalidDimensions(u32, u32),

    #[error("Series {series} is {width}x{height}, expected {expected_width}x{expected_height}")]
    SeriesDimensionMismatch {
        series: usize,
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },

    #[error("Series {index} requested but source has {count} series")]
    SeriesOutOfRange { index: usize, count: usize },

    #[error("Conversion cancelled before series {series}, plane {plane}")]
    Cancelled { series: usize, plane: usize },

    #[error("Series {series_index}, plane {plane_index}: {cause}")]
    JobError {
        series_index: usize,
        plane_index: usize,
        #[source]
        cause: Box<ConversionError>,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ConversionError {
    pub fn open(locator: impl Into<String>, reason: impl ToString) -> Self {
        Self::OpenError {
            locator: locator.into(),
            reason: reason.to_string(),
        }
    }

    pub fn create(locator: impl Into<String>, reason: impl ToString) -> Self {
        Self::CreateError {
            locator: locator.into(),
            reason: reason.to_string(),
        }
    }

    /// Wraps a plane-level failure with the position it happened at.
    pub fn at_plane(self, series_index: usize, plane_index: usize) -> Self {
        match self {
            // Cancellation already carries its position.
            e @ (Self::Cancelled { .. } | Self::JobError { .. }) => e,
            cause => Self::JobError {
                series_index,
                plane_index,
                cause: Box::new(cause),
            },
        }
    }

    /// The innermost error, looking through `JobError` wrappers.
    pub fn root_cause(&self) -> &ConversionError {
        match self {
            Self::JobError { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConversionError>;
