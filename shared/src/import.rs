//! Curated location import records.
//!
//! Source rows arrive as loosely typed JSON objects. The known location
//! columns deserialize into named fields; every other column is kept in
//! `extra` so the accolade mapping table can pick out award columns.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::AccoladeFieldMap;
use crate::ids::LayerId;
use crate::itinerary_diff::FailedOp;
use crate::model::{Accolade, Location};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CuratedLocationRecord {
    pub title: String,
    pub address: Option<String>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub town: Option<String>,
    pub zipcode: Option<String>,
    pub telephone: Option<String>,
    pub website: Option<String>,
    pub instagram: Option<String>,
    pub icon: Option<String>,
    /// Usually a string in source exports, occasionally a bare number.
    pub latitude: Value,
    pub longitude: Value,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingTitle,
    InvalidLatitude,
    InvalidLongitude,
}

impl SkipReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingTitle => "missing title",
            Self::InvalidLatitude => "latitude is not a coordinate",
            Self::InvalidLongitude => "longitude is not a coordinate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRecord {
    /// Position in the submitted batch.
    pub index: usize,
    pub title: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: Vec<SkippedRecord>,
    pub failures: Vec<FailedOp>,
}

impl ImportReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.failures.is_empty()
    }
}

/// Text form of a loosely typed cell. Empty strings and nulls count as absent.
fn cell_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn coordinate(value: &Value, limit: f64) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    (parsed.is_finite() && parsed.abs() <= limit).then_some(parsed)
}

impl CuratedLocationRecord {
    /// Builds the location to add, or explains why the row is unusable.
    pub fn to_location(&self, layer_id: LayerId) -> Result<Location, SkipReason> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(SkipReason::MissingTitle);
        }
        let latitude = coordinate(&self.latitude, 90.0).ok_or(SkipReason::InvalidLatitude)?;
        let longitude = coordinate(&self.longitude, 180.0).ok_or(SkipReason::InvalidLongitude)?;

        Ok(Location {
            id: None,
            title: title.to_string(),
            latitude,
            longitude,
            layer_id: Some(layer_id),
            address: self.address.clone(),
            country: self.country.clone(),
            state: self.state.clone(),
            town: self.town.clone(),
            zip_code: self.zipcode.clone(),
            telephone: self.telephone.clone(),
            website: self.website.clone(),
            instagram: self.instagram.clone(),
            icon: self.icon.clone(),
            google_location_name: None,
            deletable: true,
            accolades: Vec::new(),
        })
    }

    /// Accolades for every mapped column that carries a value, in table order.
    pub fn accolades(&self, fields: &AccoladeFieldMap) -> Vec<Accolade> {
        fields
            .fields()
            .iter()
            .filter_map(|field| {
                let rank = self.extra.get(&field.field).and_then(cell_text)?;
                let year = field
                    .year_field
                    .as_ref()
                    .and_then(|column| self.extra.get(column))
                    .and_then(cell_text);
                Some(Accolade {
                    id: None,
                    title: field.title.clone(),
                    rank,
                    year,
                    location_id: None,
                })
            })
            .collect()
    }
}
