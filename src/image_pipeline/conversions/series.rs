//! Series and plane iteration for one job.

use std::time::Instant;

use tracing::{debug, info};

use crate::image_pipeline::common::error::{ConversionError, Result};
use crate::image_pipeline::conversions::plane::PlaneConverter;
use crate::image_pipeline::conversions::timing::{ConversionStats, ProgressThrottle};
use crate::image_pipeline::conversions::types::{SeriesDimensionPolicy, SeriesSelection};
use crate::image_pipeline::format::ImageGeometry;
use crate::image_pipeline::sink::SinkCapabilities;

/// Planes `start_plane..end_plane` of one source series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesPlan {
    pub series: usize,
    pub start_plane: usize,
    pub end_plane: usize,
}

impl SeriesPlan {
    pub fn plane_count(&self) -> usize {
        self.end_plane - self.start_plane
    }
}

/// Chooses which series and planes a job converts, in conversion order.
///
/// A sink that cannot hold stacks receives only the first selected series,
/// and only its first plane.
pub fn plan_series(
    geometry: &ImageGeometry,
    selection: SeriesSelection,
    capabilities: SinkCapabilities,
    policy: SeriesDimensionPolicy,
) -> Result<Vec<SeriesPlan>> {
    let count = geometry.series_count();
    if count == 0 {
        return Err(ConversionError::InvalidDimensions(0, 0));
    }

    let mut selected: Vec<usize> = match selection {
        SeriesSelection::All => (0..count).collect(),
        SeriesSelection::Index(index) if index < count => vec![index],
        SeriesSelection::Index(index) => return Err(ConversionError::SeriesOutOfRange { index, count }),
        SeriesSelection::Largest => geometry.largest_series().into_iter().collect(),
    };

    if !capabilities.stacks && selected.len() > 1 {
        debug!("Sink cannot hold stacks, converting series {} only", selected[0]);
        selected.truncate(1);
    }

    let first = &geometry.series[selected[0]];
    let mut plans = Vec::with_capacity(selected.len());
    for series in selected {
        let current = &geometry.series[series];
        if current.width == 0 || current.height == 0 {
            return Err(ConversionError::InvalidDimensions(current.width, current.height));
        }
        if policy == SeriesDimensionPolicy::Uniform
            && (current.width != first.width || current.height != first.height)
        {
            return Err(ConversionError::SeriesDimensionMismatch {
                series,
                width: current.width,
                height: current.height,
                expected_width: first.width,
                expected_height: first.height,
            });
        }

        let end_plane = if capabilities.stacks {
            current.plane_count
        } else {
            current.plane_count.min(1)
        };
        plans.push(SeriesPlan {
            series,
            start_plane: 0,
            end_plane,
        });
    }
    Ok(plans)
}

/// Estimated output size of the planned planes, in bytes.
pub fn planned_bytes(geometry: &ImageGeometry, plans: &[SeriesPlan]) -> u64 {
    plans
        .iter()
        .map(|plan| geometry.series[plan.series].plane_bytes() * plan.plane_count() as u64)
        .sum()
}

/// Walks the planned series and planes in ascending order, handing each
/// plane to the converter and accumulating timings.
pub fn convert_series(
    converter: &mut PlaneConverter<'_>,
    geometry: &ImageGeometry,
    plans: &[SeriesPlan],
    stats: &mut ConversionStats,
    throttle: &mut ProgressThrottle,
) -> Result<()> {
    let multiple_series = plans.len() > 1;

    for plan in plans {
        let series_geometry = &geometry.series[plan.series];
        converter
            .begin_series(plan.series, series_geometry)
            .map_err(|e| e.at_plane(plan.series, plan.start_plane))?;

        let planes = plan.plane_count();
        for (done, plane) in (plan.start_plane..plan.end_plane).enumerate() {
            converter.check_cancelled(plan.series, plane)?;

            let timing = converter
                .convert_plane(plan.series, series_geometry, plane, plane - plan.start_plane)
                .map_err(|e| e.at_plane(plan.series, plane))?;
            stats.record_plane(timing);

            let current = done + 1;
            if throttle.tick(current == planes, Instant::now()) {
                let percent = 100 * current / planes;
                if multiple_series {
                    info!("Series {}: converted {}/{} planes ({}%)", plan.series, current, planes, percent);
                } else {
                    info!("Converted {}/{} planes ({}%)", current, planes, percent);
                }
            }
        }
    }
    Ok(())
}
