//! GeoJSON feature model and the infrastructure properties carried on it.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const STATE_PROPERTY: &str = "state";
pub const FAILURE_MODE_PROPERTY: &str = "failureMode";
pub const WATER_RESISTANCE_PROPERTY: &str = "_dep_water";
pub const POWER_SUPPLY_AREA_PROPERTY: &str = "powerSupplyArea";
pub const FEATURE_TYPE_PROPERTY: &str = "featureTypeId";

pub const AFFECTED_AREA_TYPE: &str = "AffectedArea";

pub type Position = Vec<f64>;
pub type Ring = Vec<Position>;

/// Geometry variants the failure engine understands; anything else is kept
/// verbatim in [`Geometry::Other`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Geometry {
    Point(Position),
    LineString(Vec<Position>),
    Polygon(Vec<Ring>),
    Other(Value),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum TypedGeometry {
    Point { coordinates: Position },
    LineString { coordinates: Vec<Position> },
    Polygon { coordinates: Vec<Ring> },
}

impl From<Value> for Geometry {
    fn from(value: Value) -> Self {
        match serde_json::from_value::<TypedGeometry>(value.clone()) {
            Ok(TypedGeometry::Point { coordinates }) => Geometry::Point(coordinates),
            Ok(TypedGeometry::LineString { coordinates }) => Geometry::LineString(coordinates),
            Ok(TypedGeometry::Polygon { coordinates }) => Geometry::Polygon(coordinates),
            Err(_) => Geometry::Other(value),
        }
    }
}

impl From<Geometry> for Value {
    fn from(geometry: Geometry) -> Self {
        let typed = match geometry {
            Geometry::Point(coordinates) => TypedGeometry::Point { coordinates },
            Geometry::LineString(coordinates) => TypedGeometry::LineString { coordinates },
            Geometry::Polygon(coordinates) => TypedGeometry::Polygon { coordinates },
            Geometry::Other(value) => return value,
        };
        serde_json::to_value(typed).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureId {
    Text(String),
    Number(i64),
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureId::Text(text) => f.write_str(text),
            FeatureId::Number(number) => write!(f, "{number}"),
        }
    }
}

impl From<String> for FeatureId {
    fn from(value: String) -> Self {
        FeatureId::Text(value)
    }
}

impl From<&str> for FeatureId {
    fn from(value: &str) -> Self {
        FeatureId::Text(value.to_string())
    }
}

/// Operational state of an infrastructure object. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum InfrastructureState {
    #[default]
    Ok = 0,
    Stressed = 1,
    Failed = 2,
}

impl InfrastructureState {
    pub fn from_code(code: u64) -> Self {
        match code {
            0 => InfrastructureState::Ok,
            1 => InfrastructureState::Stressed,
            _ => InfrastructureState::Failed,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FailureMode: u32 {
        const UNKNOWN = 1;
        const FLOODED = 2;
        const LIMITED_POWER = 4;
        const NO_MAIN_POWER = 8;
        const NO_BACKUP_POWER = 16;
        const NO_COMMS = 32;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "Feature")]
pub struct Feature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FeatureId>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub properties: Map<String, Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Feature {
    pub fn new(id: impl Into<FeatureId>, geometry: Geometry) -> Self {
        Self {
            id: Some(id.into()),
            geometry: Some(geometry),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn id_string(&self) -> Option<String> {
        self.id.as_ref().map(ToString::to_string)
    }

    pub fn state(&self) -> InfrastructureState {
        self.properties
            .get(STATE_PROPERTY)
            .and_then(Value::as_u64)
            .map(InfrastructureState::from_code)
            .unwrap_or_default()
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.properties
            .get(FAILURE_MODE_PROPERTY)
            .and_then(Value::as_u64)
            .map(|bits| FailureMode::from_bits_truncate(bits as u32))
            .unwrap_or_default()
    }

    pub fn is_failed(&self) -> bool {
        self.state() == InfrastructureState::Failed
    }

    /// Water depth (metres) the object tolerates; numeric strings are accepted.
    pub fn water_resistance(&self) -> f64 {
        match self.properties.get(WATER_RESISTANCE_PROPERTY) {
            Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
            Some(Value::String(text)) => text.trim().parse().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// The area this object powers, stored either as GeoJSON text or inline.
    pub fn power_supply_area(&self) -> Option<Geometry> {
        match self.properties.get(POWER_SUPPLY_AREA_PROPERTY)? {
            Value::String(text) => match serde_json::from_str::<Value>(text) {
                Ok(value) => Some(Geometry::from(value)),
                Err(err) => {
                    tracing::warn!(
                        target: "chain_effect::feature",
                        id = ?self.id,
                        error = %err,
                        "feature.power_supply_area.invalid"
                    );
                    None
                }
            },
            value @ Value::Object(_) => Some(Geometry::from(value.clone())),
            _ => None,
        }
    }

    pub fn feature_type_id(&self) -> Option<&str> {
        self.properties.get(FEATURE_TYPE_PROPERTY).and_then(Value::as_str)
    }

    pub fn set_state(&mut self, state: InfrastructureState, mode: FailureMode) {
        self.properties
            .insert(STATE_PROPERTY.to_string(), Value::from(state.code()));
        self.properties
            .insert(FAILURE_MODE_PROPERTY.to_string(), Value::from(mode.bits()));
    }

    /// Raise the state to at least `state` and add `mode` to the failure mode.
    ///
    /// Never lowers a state. Returns whether anything changed.
    pub fn escalate(&mut self, state: InfrastructureState, mode: FailureMode) -> bool {
        let current_state = self.state();
        let current_mode = self.failure_mode();
        let next_state = current_state.max(state);
        let next_mode = if state >= current_state {
            current_mode | mode
        } else {
            current_mode
        };
        if next_state == current_state && next_mode == current_mode {
            return false;
        }
        self.set_state(next_state, next_mode);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename = "FeatureCollection")]
pub struct FeatureCollection {
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn find(&self, id: &str) -> Option<&Feature> {
        self.features
            .iter()
            .find(|feature| feature.id_string().as_deref() == Some(id))
    }

    /// Replace the feature with the same id, or append it.
    pub fn upsert(&mut self, feature: Feature) {
        let id = feature.id_string();
        match self
            .features
            .iter_mut()
            .find(|existing| id.is_some() && existing.id_string() == id)
        {
            Some(existing) => *existing = feature,
            None => self.features.push(feature),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Update,
}

/// A feature whose state changed during one computation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: String,
    pub value: Feature,
    #[serde(rename = "type")]
    pub kind: ChangeType,
}

impl ChangeEvent {
    pub fn update(feature: &Feature) -> Self {
        Self {
            id: feature.id_string().unwrap_or_default(),
            value: feature.clone(),
            kind: ChangeType::Update,
        }
    }
}

/// Closed polygon feature. A ring that is not closed or has fewer than four
/// positions is reported and returned anyway.
pub fn polygon_feature(ring: Ring, properties: Map<String, Value>) -> Feature {
    if let Some(reason) = ring_defect(&ring) {
        tracing::warn!(
            target: "chain_effect::contour",
            positions = ring.len(),
            reason,
            "contour.polygon.invalid_ring"
        );
    }
    Feature {
        id: None,
        geometry: Some(Geometry::Polygon(vec![ring])),
        properties,
    }
}

pub fn ring_defect(ring: &[Position]) -> Option<&'static str> {
    if ring.len() < 4 {
        return Some("too_few_positions");
    }
    if ring.first() != ring.last() {
        return Some("not_closed");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn station() -> Feature {
        Feature::new("POW_0", Geometry::Point(vec![4.5, 52.1]))
    }

    #[test]
    fn geometry_round_trips_known_and_unknown_types() {
        let point: Geometry = serde_json::from_value(json!({
            "type": "Point",
            "coordinates": [4.0, 52.0]
        }))
        .expect("point");
        assert_eq!(point, Geometry::Point(vec![4.0, 52.0]));

        let multi = json!({"type": "MultiPoint", "coordinates": [[1.0, 2.0]]});
        let other: Geometry = serde_json::from_value(multi.clone()).expect("other");
        assert_eq!(other, Geometry::Other(multi.clone()));
        assert_eq!(serde_json::to_value(&other).expect("serialize"), multi);
    }

    #[test]
    fn null_properties_decode_as_empty() {
        let feature: Feature = serde_json::from_value(json!({
            "type": "Feature",
            "geometry": {"type": "Point", "coordinates": [0.0, 0.0]},
            "properties": null
        }))
        .expect("feature");
        assert!(feature.properties.is_empty());
        assert_eq!(feature.state(), InfrastructureState::Ok);
    }

    #[test]
    fn water_resistance_accepts_numeric_strings() {
        assert_eq!(station().water_resistance(), 0.0);
        assert_eq!(
            station()
                .with_property(WATER_RESISTANCE_PROPERTY, "1.5")
                .water_resistance(),
            1.5
        );
        assert_eq!(
            station()
                .with_property(WATER_RESISTANCE_PROPERTY, 0.25)
                .water_resistance(),
            0.25
        );
    }

    #[test]
    fn power_supply_area_parses_text_and_objects() {
        let polygon = json!({"type": "Polygon", "coordinates": [[[0.0,0.0],[1.0,0.0],[1.0,1.0],[0.0,0.0]]]});
        let as_text = station().with_property(POWER_SUPPLY_AREA_PROPERTY, polygon.to_string());
        let as_object = station().with_property(POWER_SUPPLY_AREA_PROPERTY, polygon.clone());
        assert!(matches!(as_text.power_supply_area(), Some(Geometry::Polygon(_))));
        assert_eq!(as_text.power_supply_area(), as_object.power_supply_area());
        assert_eq!(
            station()
                .with_property(POWER_SUPPLY_AREA_PROPERTY, "not json")
                .power_supply_area(),
            None
        );
    }

    #[test]
    fn escalation_is_monotone() {
        let mut feature = station();
        assert!(feature.escalate(InfrastructureState::Stressed, FailureMode::FLOODED));
        assert!(!feature.escalate(InfrastructureState::Stressed, FailureMode::FLOODED));
        assert!(feature.escalate(InfrastructureState::Failed, FailureMode::NO_BACKUP_POWER));
        assert!(!feature.escalate(InfrastructureState::Stressed, FailureMode::NO_COMMS));
        assert!(!feature.escalate(InfrastructureState::Ok, FailureMode::empty()));
        assert_eq!(feature.state(), InfrastructureState::Failed);
        assert_eq!(
            feature.failure_mode(),
            FailureMode::FLOODED | FailureMode::NO_BACKUP_POWER
        );
        assert_eq!(feature.properties[STATE_PROPERTY], json!(2));
        assert_eq!(feature.properties[FAILURE_MODE_PROPERTY], json!(18));
    }

    #[test]
    fn upsert_replaces_by_id() {
        let mut collection = FeatureCollection::new(vec![station()]);
        let mut failed = station();
        failed.set_state(InfrastructureState::Failed, FailureMode::FLOODED);
        collection.upsert(failed);
        assert_eq!(collection.len(), 1);
        assert!(collection.find("POW_0").is_some_and(Feature::is_failed));
    }

    #[test]
    fn collection_serializes_with_type_tags() {
        let collection = FeatureCollection::new(vec![station()]);
        let value = serde_json::to_value(&collection).expect("serialize");
        assert_eq!(value["type"], json!("FeatureCollection"));
        assert_eq!(value["features"][0]["type"], json!("Feature"));
        assert_eq!(value["features"][0]["id"], json!("POW_0"));
        let decoded = FeatureCollection::from_json(&value.to_string()).expect("decode");
        assert_eq!(decoded, collection);
    }

    #[test]
    fn ring_defects_are_detected() {
        let closed = vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![1.0, 1.0], vec![0.0, 0.0]];
        assert_eq!(ring_defect(&closed), None);
        assert_eq!(ring_defect(&closed[..3]), Some("too_few_positions"));
        let open = vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![1.0, 1.0], vec![0.0, 1.0]];
        assert_eq!(ring_defect(&open), Some("not_closed"));
    }
}
