//! Vector representations of a relief grid.
//!
//! Two strategies: one square polygon per wet cell, or closed isoline rings at
//! a set of levels traced with marching squares.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    feature::{polygon_feature, FeatureCollection, Position},
    grid::{ContourLevels, Grid},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContourMode {
    #[default]
    CellPolygons,
    Isolines,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Contours {
    pub collection: FeatureCollection,
    pub description: String,
}

impl Contours {
    fn empty(description: impl Into<String>) -> Self {
        Self {
            collection: FeatureCollection::default(),
            description: description.into(),
        }
    }
}

pub fn contours(grid: &Grid, mode: ContourMode) -> Contours {
    match mode {
        ContourMode::CellPolygons => cell_polygons(grid),
        ContourMode::Isolines => isolines(grid),
    }
}

/// Levels for isoline tracing, rounded to one decimal when derived from a count.
pub fn iso_levels(levels: &ContourLevels, min: f64, max: f64) -> Vec<f64> {
    match levels {
        ContourLevels::Explicit(levels) => levels.clone(),
        ContourLevels::Count(0) => Vec::new(),
        ContourLevels::Count(count) => {
            let step = (max - min) / *count as f64;
            (0..*count)
                .map(|k| round_one_decimal(min + step * (k as f64 + 0.5)))
                .collect()
        }
    }
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn level_properties(name: &str, value: f64) -> Map<String, Value> {
    let mut properties = Map::new();
    properties.insert(name.to_string(), Value::from(value));
    properties
}

/// One square polygon per valid cell within the configured thresholds.
///
/// Rows are emitted south to north.
pub fn cell_polygons(grid: &Grid) -> Contours {
    if grid.is_empty() {
        return Contours::empty("grid has no rows or columns");
    }
    let params = &grid.params;
    let in_range = |value: f64| {
        params.min_threshold.map_or(true, |min| value >= min)
            && params.max_threshold.map_or(true, |max| value <= max)
    };

    let mut features = Vec::new();
    for (row, values) in grid.cells.iter().enumerate().rev() {
        let lat = params.latitude(row);
        for (col, value) in values.iter().copied().enumerate() {
            if params.is_no_data(value) || !in_range(value) {
                continue;
            }
            let lon = params.longitude(col);
            let ring = vec![
                vec![lon, lat],
                vec![lon + params.delta_lon, lat],
                vec![lon + params.delta_lon, lat + params.delta_lat],
                vec![lon, lat + params.delta_lat],
                vec![lon, lat],
            ];
            features.push(polygon_feature(
                ring,
                level_properties(&params.property_name, value),
            ));
        }
    }

    let description = format!("{} features above the threshold", features.len());
    Contours {
        collection: FeatureCollection::new(features),
        description,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Edge {
    /// Between `(row, col)` and `(row, col + 1)`.
    Horizontal(isize, isize),
    /// Between `(row, col)` and `(row + 1, col)`.
    Vertical(isize, isize),
}

/// Closed isoline rings, one feature per traced ring, tagged with its level.
///
/// The grid is padded with a border that counts as below every level, and
/// no-data cells count as below too, so every traced chain closes.
pub fn isolines(grid: &Grid) -> Contours {
    if grid.is_empty() {
        return Contours::empty("grid has no rows or columns");
    }
    let (Some(min), Some(max)) = grid.thresholds() else {
        return Contours::empty("grid has no valid cells");
    };
    let levels = iso_levels(&grid.params.contour_levels, min, max);
    tracing::debug!(
        target: "chain_effect::contour",
        count = levels.len(),
        ?levels,
        "contour.isolines.levels"
    );

    let mut features = Vec::new();
    for level in &levels {
        for ring in trace_level(grid, *level) {
            features.push(polygon_feature(
                ring,
                level_properties(&grid.params.property_name, *level),
            ));
        }
    }

    let description = format!(
        "{} isoline features over {} levels",
        features.len(),
        levels.len()
    );
    Contours {
        collection: FeatureCollection::new(features),
        description,
    }
}

struct Tracer<'a> {
    grid: &'a Grid,
    level: f64,
}

impl Tracer<'_> {
    fn value(&self, row: isize, col: isize) -> Option<f64> {
        if row < 0 || col < 0 {
            return None;
        }
        self.grid.value(row as usize, col as usize)
    }

    fn above(&self, row: isize, col: isize) -> bool {
        self.value(row, col).is_some_and(|value| value >= self.level)
    }

    fn position(&self, row: f64, col: f64) -> Position {
        let params = &self.grid.params;
        vec![
            params.start_lon + col * params.delta_lon,
            params.start_lat + row * params.delta_lat,
        ]
    }

    /// Crossing point on `edge`, interpolated when both ends are valid.
    fn crossing(&self, edge: Edge) -> Position {
        let ((r0, c0), (r1, c1)) = match edge {
            Edge::Horizontal(row, col) => ((row, col), (row, col + 1)),
            Edge::Vertical(row, col) => ((row, col), (row + 1, col)),
        };
        let t = match (self.value(r0, c0), self.value(r1, c1)) {
            (Some(a), Some(b)) if a != b => ((self.level - a) / (b - a)).clamp(0.0, 1.0),
            _ => 0.5,
        };
        self.position(
            r0 as f64 + t * (r1 - r0) as f64,
            c0 as f64 + t * (c1 - c0) as f64,
        )
    }

    fn saddle_center_above(&self, row: isize, col: isize) -> bool {
        let corners = [
            self.value(row, col),
            self.value(row, col + 1),
            self.value(row + 1, col + 1),
            self.value(row + 1, col),
        ];
        let valid: Vec<f64> = corners.into_iter().flatten().collect();
        !valid.is_empty() && valid.iter().sum::<f64>() / valid.len() as f64 >= self.level
    }

    fn cell_segments(&self, row: isize, col: isize, out: &mut Vec<(Edge, Edge)>) {
        let top = Edge::Horizontal(row, col);
        let bottom = Edge::Horizontal(row + 1, col);
        let left = Edge::Vertical(row, col);
        let right = Edge::Vertical(row, col + 1);

        let case = (self.above(row, col) as u8) << 3
            | (self.above(row, col + 1) as u8) << 2
            | (self.above(row + 1, col + 1) as u8) << 1
            | self.above(row + 1, col) as u8;

        match case {
            1 | 14 => out.push((left, bottom)),
            2 | 13 => out.push((bottom, right)),
            3 | 12 => out.push((left, right)),
            4 | 11 => out.push((top, right)),
            6 | 9 => out.push((top, bottom)),
            7 | 8 => out.push((top, left)),
            5 => {
                if self.saddle_center_above(row, col) {
                    out.push((left, top));
                    out.push((bottom, right));
                } else {
                    out.push((top, right));
                    out.push((left, bottom));
                }
            }
            10 => {
                if self.saddle_center_above(row, col) {
                    out.push((top, right));
                    out.push((left, bottom));
                } else {
                    out.push((top, left));
                    out.push((bottom, right));
                }
            }
            _ => {}
        }
    }
}

fn trace_level(grid: &Grid, level: f64) -> Vec<Vec<Position>> {
    let tracer = Tracer { grid, level };
    let rows = grid.rows() as isize;
    let columns = grid.columns() as isize;

    let mut segments = Vec::new();
    for row in -1..rows {
        for col in -1..columns {
            tracer.cell_segments(row, col, &mut segments);
        }
    }

    let mut by_edge: HashMap<Edge, Vec<usize>> = HashMap::new();
    for (index, (a, b)) in segments.iter().enumerate() {
        by_edge.entry(*a).or_default().push(index);
        by_edge.entry(*b).or_default().push(index);
    }

    let mut used = vec![false; segments.len()];
    let mut rings = Vec::new();
    for start in 0..segments.len() {
        if used[start] {
            continue;
        }
        used[start] = true;
        let (first, mut current) = segments[start];
        let mut ring = vec![tracer.crossing(first), tracer.crossing(current)];

        while current != first {
            let next = by_edge
                .get(&current)
                .and_then(|candidates| candidates.iter().copied().find(|index| !used[*index]));
            let Some(next) = next else {
                tracing::warn!(
                    target: "chain_effect::contour",
                    level,
                    "contour.isolines.open_chain"
                );
                break;
            };
            used[next] = true;
            let (a, b) = segments[next];
            current = if a == current { b } else { a };
            ring.push(tracer.crossing(current));
        }

        if ring.first() != ring.last() {
            let first_point = ring[0].clone();
            ring.push(first_point);
        }
        rings.push(ring);
    }
    rings
}
