//! Geometric failure determination over infrastructure feature collections.

use std::collections::HashMap;

use geo::{Contains, Intersects, LineString, MultiPolygon, Point, Polygon};
use serde_json::Value;

use crate::{
    feature::{
        ChangeEvent, FailureMode, Feature, FeatureCollection, Geometry, InfrastructureState,
        Position, AFFECTED_AREA_TYPE, FEATURE_TYPE_PROPERTY,
    },
    grid::Grid,
};

pub const POWER_SUPPLY_AREA_PREFIX: &str = "psa_";

/// Water height at a position, `None` outside the grid or on no-data.
pub fn sample(water: &Grid, position: &[f64]) -> Option<f64> {
    let [lon, lat, ..] = position else {
        return None;
    };
    let params = &water.params;
    if params.delta_lon == 0.0 || params.delta_lat == 0.0 {
        return None;
    }
    // offsets measured from the outer corner of cell (0, 0)
    let col = ((lon - (params.start_lon - params.delta_lon / 2.0)) / params.delta_lon).floor();
    let row = ((lat - (params.start_lat - params.delta_lat / 2.0)) / params.delta_lat).floor();
    if !(col.is_finite() && row.is_finite()) || col < 0.0 || row < 0.0 {
        return None;
    }
    water.value(row as usize, col as usize)
}

fn max_level<'a>(water: &Grid, positions: impl Iterator<Item = &'a Position>) -> Option<f64> {
    positions
        .filter_map(|position| sample(water, position))
        .fold(None, |acc: Option<f64>, level| {
            Some(acc.map_or(level, |current| current.max(level)))
        })
}

/// Mark objects standing in water.
///
/// Above their `_dep_water` resistance they fail; any positive water below it
/// stresses them. Failed objects are left untouched.
pub fn flooding(water: &Grid, objects: &mut FeatureCollection) -> Vec<ChangeEvent> {
    let mut changes = Vec::new();
    for feature in objects.features.iter_mut() {
        if feature.is_failed() {
            continue;
        }
        let level = match &feature.geometry {
            Some(Geometry::Point(position)) => sample(water, position),
            Some(Geometry::LineString(positions)) => max_level(water, positions.iter()),
            _ => None,
        };
        let Some(level) = level else {
            continue;
        };
        let resistance = feature.water_resistance();
        let changed = if level > resistance {
            feature.escalate(InfrastructureState::Failed, FailureMode::FLOODED)
        } else if level > 0.0 {
            feature.escalate(InfrastructureState::Stressed, FailureMode::FLOODED)
        } else {
            false
        };
        if changed {
            changes.push(ChangeEvent::update(feature));
        }
    }
    changes
}

/// Add a blackout area for every failed feature that carries a power supply
/// area and does not have one yet. New areas are appended to `all` and to the
/// returned change set.
pub fn update_power_supply_areas(
    mut failed: Vec<ChangeEvent>,
    all: &mut FeatureCollection,
) -> Vec<ChangeEvent> {
    let mut areas = Vec::new();
    for event in &failed {
        let feature = &event.value;
        if feature.state() != InfrastructureState::Failed {
            continue;
        }
        let Some(geometry) = feature.power_supply_area() else {
            continue;
        };
        let area_id = format!("{POWER_SUPPLY_AREA_PREFIX}{}", event.id);
        if all.find(&area_id).is_some() {
            continue;
        }
        let area = Feature::new(area_id, geometry)
            .with_property("Name", "Blackout area")
            .with_property(FEATURE_TYPE_PROPERTY, AFFECTED_AREA_TYPE)
            .with_property("info", "No power");
        all.features.push(area.clone());
        areas.push(ChangeEvent::update(&area));
    }
    if !areas.is_empty() {
        tracing::info!(
            target: "chain_effect::failure",
            added = areas.len(),
            total = all.len(),
            "failure.power_supply_areas.added"
        );
    }
    failed.extend(areas);
    failed
}

fn to_point(position: &[f64]) -> Option<Point<f64>> {
    match position {
        [x, y, ..] => Some(Point::new(*x, *y)),
        _ => None,
    }
}

fn to_line_string(positions: &[Position]) -> LineString<f64> {
    positions
        .iter()
        .filter_map(|position| to_point(position))
        .map(|point| point.0)
        .collect()
}

fn to_polygon(rings: &[Vec<Position>]) -> Option<Polygon<f64>> {
    let (exterior, interiors) = rings.split_first()?;
    Some(Polygon::new(
        to_line_string(exterior),
        interiors.iter().map(|ring| to_line_string(ring)).collect(),
    ))
}

/// Merge every AffectedArea polygon of `layer`; `None` when there is none.
pub fn affected_area(layer: &FeatureCollection) -> Option<MultiPolygon<f64>> {
    let polygons: Vec<Polygon<f64>> = layer
        .features
        .iter()
        .filter(|feature| feature.feature_type_id() == Some(AFFECTED_AREA_TYPE))
        .filter_map(|feature| match &feature.geometry {
            Some(Geometry::Polygon(rings)) => to_polygon(rings),
            _ => None,
        })
        .collect();
    (!polygons.is_empty()).then(|| MultiPolygon::new(polygons))
}

fn inside(area: &MultiPolygon<f64>, geometry: &Geometry) -> bool {
    match geometry {
        Geometry::Point(position) => to_point(position).is_some_and(|point| area.contains(&point)),
        Geometry::LineString(positions) => area.intersects(&to_line_string(positions)),
        Geometry::Polygon(rings) => to_polygon(rings).is_some_and(|polygon| area.intersects(&polygon)),
        Geometry::Other(_) => false,
    }
}

/// Failure predicates that keep a per-layer cache of merged blackout areas.
#[derive(Debug, Default)]
pub struct FailureEngine {
    blackout_areas: HashMap<(String, i64), Option<MultiPolygon<f64>>>,
}

impl FailureEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.blackout_areas.clear();
    }

    pub fn cached_areas(&self) -> usize {
        self.blackout_areas.len()
    }

    /// Fail every object inside a blackout area of `power_layer` with
    /// `NoBackupPower`. The merged area is cached per `(layer_id, time)`.
    pub fn blackout(
        &mut self,
        layer_id: &str,
        power_layer: &FeatureCollection,
        objects: &mut FeatureCollection,
        time: i64,
    ) -> Vec<ChangeEvent> {
        let area = self
            .blackout_areas
            .entry((layer_id.to_string(), time))
            .or_insert_with(|| affected_area(power_layer));
        let Some(area) = area.as_ref() else {
            return Vec::new();
        };

        let mut changes = Vec::new();
        for feature in objects.features.iter_mut() {
            if feature.is_failed() {
                continue;
            }
            let hit = feature
                .geometry
                .as_ref()
                .is_some_and(|geometry| inside(area, geometry));
            if hit && feature.escalate(InfrastructureState::Failed, FailureMode::NO_BACKUP_POWER) {
                changes.push(ChangeEvent::update(feature));
            }
        }
        if !changes.is_empty() {
            tracing::info!(
                target: "chain_effect::failure",
                layer = layer_id,
                time,
                failed = changes.len(),
                "failure.blackout.applied"
            );
        }
        changes
    }
}

/// The features of a change set, in order.
pub fn changed_features(changes: &[ChangeEvent]) -> FeatureCollection {
    FeatureCollection::new(changes.iter().map(|change| change.value.clone()).collect())
}

/// Polygon geometry serialized as JSON text, as stored in `powerSupplyArea`.
pub fn geometry_text(geometry: &Geometry) -> String {
    Value::from(geometry.clone()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{POWER_SUPPLY_AREA_PROPERTY, WATER_RESISTANCE_PROPERTY};
    use crate::grid::{parse_grid, parse_header, GridOptions};

    // cells centred on lon 0.5..2.5, lat 1.5 (north row) and 0.5
    const WATER: &str =
        "ncols 3\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n0 0.5 3\n-9999 0 1\n";

    fn water() -> Grid {
        let params = parse_header(WATER, &GridOptions::default()).expect("header");
        parse_grid(WATER, &params)
    }

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Geometry {
        Geometry::Polygon(vec![vec![
            vec![x0, y0],
            vec![x1, y0],
            vec![x1, y1],
            vec![x0, y1],
            vec![x0, y0],
        ]])
    }

    #[test]
    fn sampling_uses_containing_cell() {
        let water = water();
        assert_eq!(sample(&water, &[2.9, 1.9]), Some(3.0));
        assert_eq!(sample(&water, &[1.2, 1.2]), Some(0.5));
        assert_eq!(sample(&water, &[0.5, 0.5]), None);
        assert_eq!(sample(&water, &[-0.5, 1.5]), None);
        assert_eq!(sample(&water, &[3.5, 1.5]), None);
        assert_eq!(sample(&water, &[1.0]), None);
    }

    #[test]
    fn flooding_fails_or_stresses_by_resistance() {
        let mut objects = FeatureCollection::new(vec![
            Feature::new("deep", Geometry::Point(vec![2.5, 1.5])),
            Feature::new("shallow", Geometry::Point(vec![1.5, 1.5]))
                .with_property(WATER_RESISTANCE_PROPERTY, "1"),
            Feature::new("dry", Geometry::Point(vec![0.5, 1.5])),
            Feature::new("outside", Geometry::Point(vec![9.0, 9.0])),
            Feature::new(
                "cable",
                Geometry::LineString(vec![vec![0.5, 0.5], vec![2.5, 0.5]]),
            )
            .with_property(WATER_RESISTANCE_PROPERTY, 0.5),
        ]);
        let changes = flooding(&water(), &mut objects);
        let ids: Vec<&str> = changes.iter().map(|change| change.id.as_str()).collect();
        assert_eq!(ids, vec!["deep", "shallow", "cable"]);

        let state = |id: &str| objects.find(id).map(Feature::state);
        assert_eq!(state("deep"), Some(InfrastructureState::Failed));
        assert_eq!(state("shallow"), Some(InfrastructureState::Stressed));
        assert_eq!(state("dry"), Some(InfrastructureState::Ok));
        assert_eq!(state("cable"), Some(InfrastructureState::Failed));
    }

    #[test]
    fn failed_objects_never_revert() {
        let mut failed = Feature::new("p", Geometry::Point(vec![1.5, 1.5]));
        failed.set_state(InfrastructureState::Failed, FailureMode::NO_COMMS);
        let mut objects = FeatureCollection::new(vec![failed.clone()]);
        assert!(flooding(&water(), &mut objects).is_empty());
        assert_eq!(objects.features[0], failed);
    }

    #[test]
    fn repeated_flooding_emits_no_second_change() {
        let mut objects =
            FeatureCollection::new(vec![Feature::new("deep", Geometry::Point(vec![2.5, 1.5]))]);
        assert_eq!(flooding(&water(), &mut objects).len(), 1);
        assert!(flooding(&water(), &mut objects).is_empty());
    }

    #[test]
    fn failed_station_gets_one_power_supply_area() {
        let area = square(0.0, 0.0, 1.0, 1.0);
        let mut station = Feature::new("POW_0", Geometry::Point(vec![2.5, 1.5]))
            .with_property(POWER_SUPPLY_AREA_PROPERTY, geometry_text(&area));
        let mut all = FeatureCollection::new(vec![station.clone()]);
        station.set_state(InfrastructureState::Failed, FailureMode::FLOODED);
        let failed = vec![ChangeEvent::update(&station)];

        let changes = update_power_supply_areas(failed.clone(), &mut all);
        assert_eq!(changes.len(), 2);
        let psa = all.find("psa_POW_0").expect("area added");
        assert_eq!(psa.feature_type_id(), Some(AFFECTED_AREA_TYPE));
        assert_eq!(psa.properties["Name"], "Blackout area");
        assert_eq!(psa.properties["info"], "No power");
        assert_eq!(psa.geometry, Some(area));

        let again = update_power_supply_areas(failed, &mut all);
        assert_eq!(again.len(), 1);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn stressed_station_gets_no_power_supply_area() {
        let mut station = Feature::new("POW_1", Geometry::Point(vec![0.0, 0.0]))
            .with_property(POWER_SUPPLY_AREA_PROPERTY, geometry_text(&square(0.0, 0.0, 1.0, 1.0)));
        station.set_state(InfrastructureState::Stressed, FailureMode::FLOODED);
        let mut all = FeatureCollection::new(vec![station.clone()]);
        let changes = update_power_supply_areas(vec![ChangeEvent::update(&station)], &mut all);
        assert_eq!(changes.len(), 1);
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn blackout_fails_objects_inside_area() {
        let power = FeatureCollection::new(vec![Feature::new("psa_POW_0", square(0.0, 0.0, 2.0, 2.0))
            .with_property(FEATURE_TYPE_PROPERTY, AFFECTED_AREA_TYPE)]);
        let mut objects = FeatureCollection::new(vec![
            Feature::new("inside", Geometry::Point(vec![1.0, 1.0])),
            Feature::new("outside", Geometry::Point(vec![5.0, 5.0])),
            Feature::new(
                "crossing",
                Geometry::LineString(vec![vec![1.0, 1.0], vec![5.0, 1.0]]),
            ),
            Feature::new("overlap", square(1.5, 1.5, 3.0, 3.0)),
        ]);
        let mut engine = FailureEngine::new();
        let changes = engine.blackout("power", &power, &mut objects, 3_600_000);
        let ids: Vec<&str> = changes.iter().map(|change| change.id.as_str()).collect();
        assert_eq!(ids, vec!["inside", "crossing", "overlap"]);
        assert!(objects
            .find("inside")
            .is_some_and(|feature| feature.failure_mode().contains(FailureMode::NO_BACKUP_POWER)));
        assert_eq!(engine.cached_areas(), 1);

        let again = engine.blackout("power", &power, &mut objects, 3_600_000);
        assert!(again.is_empty());
        assert_eq!(engine.cached_areas(), 1);
    }

    #[test]
    fn blackout_without_affected_areas_changes_nothing() {
        let power = FeatureCollection::new(vec![Feature::new("POW_0", square(0.0, 0.0, 2.0, 2.0))]);
        let mut objects =
            FeatureCollection::new(vec![Feature::new("inside", Geometry::Point(vec![1.0, 1.0]))]);
        let mut engine = FailureEngine::new();
        assert!(engine.blackout("power", &power, &mut objects, 0).is_empty());
        assert_eq!(objects.features[0].state(), InfrastructureState::Ok);
    }
}
