use crate::image_pipeline::common::error::Result;
use crate::image_pipeline::conversions::tiling::Tile;
use crate::image_pipeline::format::types::{ColorLookupTable, ImageGeometry};

/// An opened source image.
///
/// A handle is owned by exactly one job and is never shared between workers.
pub trait FormatHandle: Send {
    /// Short name of the decoded format, for logging.
    fn format_name(&self) -> &str;

    fn geometry(&self) -> Result<ImageGeometry>;

    /// Raw pixel bytes of `region` in the given plane, rows top to bottom,
    /// in the series' sample layout and byte order.
    fn read_region(&mut self, series: usize, plane: usize, region: Tile) -> Result<Vec<u8>>;

    /// Palette of the given plane, if the plane uses indexed colour.
    fn color_table(&mut self, series: usize, plane: usize) -> Result<Option<ColorLookupTable>>;

    fn close(&mut self) -> Result<()>;
}

/// Opens source locators into handles.
pub trait FormatOpener: Send + Sync {
    fn open(&self, locator: &str, group_files: bool) -> Result<Box<dyn FormatHandle>>;
}
