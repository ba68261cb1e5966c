//! ESRI ASCII grid decoding.
//!
//! A grid text starts with a short `keyword value` header (`ncols`, `nrows`,
//! `xllcorner`/`xllcenter`, `yllcorner`/`yllcenter`, `cellsize`,
//! `nodata_value`) followed by one text line per row, northernmost row first.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::projection::rd_to_wgs84;

pub const DEFAULT_NO_DATA_VALUE: f64 = -9999.0;
pub const DEFAULT_PROPERTY_NAME: &str = "v";
pub const DEFAULT_CONTOUR_LEVEL_COUNT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Projection {
    Wgs84,
    Rd,
}

impl FromStr for Projection {
    type Err = GridError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "wgs84" | "WGS84" => Ok(Projection::Wgs84),
            "rd" | "RD" => Ok(Projection::Rd),
            other => Err(GridError::UnsupportedProjection(other.to_string())),
        }
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Projection::Wgs84 => f.write_str("wgs84"),
            Projection::Rd => f.write_str("rd"),
        }
    }
}

/// Either a number of evenly spaced levels or an explicit level list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContourLevels {
    Count(usize),
    Explicit(Vec<f64>),
}

impl Default for ContourLevels {
    fn default() -> Self {
        ContourLevels::Count(DEFAULT_CONTOUR_LEVEL_COUNT)
    }
}

/// Caller-side settings that shape how a grid text is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridOptions {
    pub projection: String,
    pub property_name: String,
    pub contour_levels: ContourLevels,
    pub min_threshold: Option<f64>,
    pub max_threshold: Option<f64>,
    /// Cell separator; `None` splits on any whitespace.
    pub separator: Option<char>,
    /// Matrix lines starting with this character are ignored.
    pub comment_character: Option<char>,
    pub skip_first_row: bool,
    pub skip_first_column: bool,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self {
            projection: Projection::Wgs84.to_string(),
            property_name: DEFAULT_PROPERTY_NAME.to_string(),
            contour_levels: ContourLevels::default(),
            min_threshold: None,
            max_threshold: None,
            separator: None,
            comment_character: None,
            skip_first_row: false,
            skip_first_column: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridParameters {
    pub columns: usize,
    pub rows: usize,
    /// Latitude of the center of row 0 (northernmost), column 0.
    pub start_lat: f64,
    pub start_lon: f64,
    /// Negative: rows run north to south.
    pub delta_lat: f64,
    pub delta_lon: f64,
    pub no_data_value: f64,
    pub property_name: String,
    pub contour_levels: ContourLevels,
    pub min_threshold: Option<f64>,
    pub max_threshold: Option<f64>,
    pub projection: Projection,
    /// Number of leading lines consumed by the header.
    pub header_lines: usize,
    pub separator: Option<char>,
    pub comment_character: Option<char>,
    pub skip_first_row: bool,
    pub skip_first_column: bool,
}

impl GridParameters {
    pub fn is_no_data(&self, value: f64) -> bool {
        value == self.no_data_value || value.is_nan()
    }

    /// Latitude of the center of `row`.
    pub fn latitude(&self, row: usize) -> f64 {
        self.start_lat + row as f64 * self.delta_lat
    }

    /// Longitude of the center of `col`.
    pub fn longitude(&self, col: usize) -> f64 {
        self.start_lon + col as f64 * self.delta_lon
    }
}

/// Row-major matrix, row 0 northernmost.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub params: GridParameters,
    pub cells: Vec<Vec<f64>>,
    /// Smallest valid cell, `None` when every cell is no-data.
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Grid {
    pub fn from_cells(params: GridParameters, cells: Vec<Vec<f64>>) -> Self {
        let (min, max) = valid_range(&params, &cells);
        Self {
            params,
            cells,
            min,
            max,
        }
    }

    pub fn rows(&self) -> usize {
        self.cells.len()
    }

    pub fn columns(&self) -> usize {
        self.cells.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0 || self.columns() == 0
    }

    pub fn value(&self, row: usize, col: usize) -> Option<f64> {
        let value = *self.cells.get(row)?.get(col)?;
        (!self.params.is_no_data(value)).then_some(value)
    }

    /// Configured thresholds, falling back to the observed valid range.
    pub fn thresholds(&self) -> (Option<f64>, Option<f64>) {
        (
            self.params.min_threshold.or(self.min),
            self.params.max_threshold.or(self.max),
        )
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum GridError {
    #[error("grid header is missing `{0}`")]
    MissingHeaderKey(&'static str),
    #[error("grid header value for `{key}` is invalid: {value}")]
    InvalidHeaderValue { key: String, value: String },
    #[error("projection `{0}` is not supported")]
    UnsupportedProjection(String),
}

/// Decode the header of `text`.
///
/// The header ends at the first line whose first token is numeric. Unknown
/// keyword lines are skipped but still count as header lines.
pub fn parse_header(text: &str, options: &GridOptions) -> Result<GridParameters, GridError> {
    let projection: Projection = options.projection.parse()?;

    let mut columns = None;
    let mut rows = None;
    let mut x = None;
    let mut y = None;
    let mut cellsize = None;
    let mut no_data_value = DEFAULT_NO_DATA_VALUE;
    let mut is_center = false;
    let mut header_lines = 0;

    for line in text.lines() {
        if options
            .comment_character
            .is_some_and(|comment| line.starts_with(comment))
        {
            break;
        }
        let mut tokens = line.split_whitespace();
        let Some(keyword) = tokens.next() else {
            header_lines += 1;
            continue;
        };
        if starts_numeric(keyword) {
            break;
        }
        header_lines += 1;

        let raw = tokens.next().unwrap_or_default();
        let key = keyword.to_ascii_lowercase();
        let recognised = matches!(
            key.as_str(),
            "ncols" | "nrows" | "xllcorner" | "yllcorner" | "xllcenter" | "yllcenter" | "cellsize"
                | "nodata_value"
        );
        if !recognised {
            tracing::debug!(
                target: "chain_effect::grid",
                keyword,
                "grid.header.skipped_keyword"
            );
            continue;
        }
        let value: f64 = raw.parse().map_err(|_| GridError::InvalidHeaderValue {
            key: key.clone(),
            value: raw.to_string(),
        })?;

        match key.as_str() {
            "ncols" => columns = Some(header_count(&key, value)?),
            "nrows" => rows = Some(header_count(&key, value)?),
            "xllcorner" => x = Some(value),
            "yllcorner" => y = Some(value),
            "xllcenter" => {
                x = Some(value);
                is_center = true;
            }
            "yllcenter" => {
                y = Some(value);
                is_center = true;
            }
            "cellsize" => cellsize = Some(value),
            "nodata_value" => no_data_value = value,
            _ => {}
        }
    }

    let columns = columns.ok_or(GridError::MissingHeaderKey("ncols"))?;
    let rows = rows.ok_or(GridError::MissingHeaderKey("nrows"))?;
    let cellsize = cellsize.ok_or(GridError::MissingHeaderKey("cellsize"))?;
    let x = x.ok_or(GridError::MissingHeaderKey("xllcorner"))?;
    let y = y.ok_or(GridError::MissingHeaderKey("yllcorner"))?;

    let mut delta_lon = cellsize;
    let mut delta_lat = -cellsize;
    let (mut start_lon, mut start_lat) = if is_center {
        (x, y)
    } else {
        (x + delta_lon / 2.0, y - delta_lat / 2.0)
    };

    match projection {
        Projection::Rd => {
            // Linear approximation between the north-west and south-east cell centers.
            let col_span = columns.saturating_sub(1).max(1) as f64;
            let row_span = rows.saturating_sub(1).max(1) as f64;
            let north_west = rd_to_wgs84(start_lon, start_lat - row_span * delta_lat);
            let south_east = rd_to_wgs84(start_lon + col_span * delta_lon, start_lat);
            delta_lon = (south_east.longitude - north_west.longitude) / col_span;
            delta_lat = (south_east.latitude - north_west.latitude) / row_span;
            start_lon = north_west.longitude;
            start_lat = north_west.latitude;
        }
        Projection::Wgs84 => {
            start_lat -= rows.saturating_sub(1) as f64 * delta_lat;
        }
    }

    Ok(GridParameters {
        columns,
        rows,
        start_lat,
        start_lon,
        delta_lat,
        delta_lon,
        no_data_value,
        property_name: if options.property_name.is_empty() {
            DEFAULT_PROPERTY_NAME.to_string()
        } else {
            options.property_name.clone()
        },
        contour_levels: options.contour_levels.clone(),
        min_threshold: options.min_threshold,
        max_threshold: options.max_threshold,
        projection,
        header_lines,
        separator: options.separator,
        comment_character: options.comment_character,
        skip_first_row: options.skip_first_row,
        skip_first_column: options.skip_first_column,
    })
}

fn starts_numeric(token: &str) -> bool {
    token
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.'))
}

fn header_count(key: &str, value: f64) -> Result<usize, GridError> {
    if value.fract() != 0.0 || value < 0.0 {
        return Err(GridError::InvalidHeaderValue {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value as usize)
}

/// Decode the matrix lines of `text` that follow the header.
///
/// Lines with the wrong number of cells or a non-numeric cell are dropped; at
/// most `params.rows` rows are kept.
pub fn parse_grid(text: &str, params: &GridParameters) -> Grid {
    let mut cells: Vec<Vec<f64>> = Vec::with_capacity(params.rows);
    let mut skip_first_row = params.skip_first_row;
    let mut dropped = 0usize;

    for line in text.lines().skip(params.header_lines) {
        if cells.len() >= params.rows {
            break;
        }
        if let Some(comment) = params.comment_character {
            if line.starts_with(comment) {
                continue;
            }
        }
        if line.trim().is_empty() {
            continue;
        }
        if skip_first_row {
            skip_first_row = false;
            continue;
        }

        let tokens: Vec<&str> = match params.separator {
            Some(separator) => line
                .split(separator)
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .collect(),
            None => line.split_whitespace().collect(),
        };
        let tokens = if params.skip_first_column && tokens.len() > 1 {
            &tokens[1..]
        } else {
            &tokens[..]
        };
        if tokens.len() != params.columns {
            dropped += 1;
            continue;
        }
        match tokens
            .iter()
            .map(|token| token.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(row) => cells.push(row),
            Err(_) => dropped += 1,
        }
    }

    if dropped > 0 {
        tracing::warn!(
            target: "chain_effect::grid",
            dropped,
            kept = cells.len(),
            "grid.rows.dropped"
        );
    }

    Grid::from_cells(params.clone(), cells)
}

/// The verbatim header lines of `text`.
pub fn header_lines(text: &str, params: &GridParameters) -> Vec<String> {
    text.lines()
        .take(params.header_lines)
        .map(|line| line.trim_end().to_string())
        .collect()
}

fn valid_range(params: &GridParameters, cells: &[Vec<f64>]) -> (Option<f64>, Option<f64>) {
    cells
        .iter()
        .flatten()
        .copied()
        .filter(|value| !params.is_no_data(*value))
        .fold((None, None), |(min, max), value| {
            (
                Some(min.map_or(value, |m: f64| m.min(value))),
                Some(max.map_or(value, |m: f64| m.max(value))),
            )
        })
}
