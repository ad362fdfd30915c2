use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    DEFAULT_ASSET_ROOT, DEFAULT_USER_LAYER_TITLE, MAX_IMPORT_RECORDS, MAX_SHARE_TARGETS,
    MAX_STATE_BYTES,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("configuration parse error: {0}")]
    Parse(String),
}

/// One import column that becomes an accolade when present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccoladeField {
    /// Column name in the import record.
    pub field: String,
    /// Accolade title written to the graph.
    pub title: String,
    /// Column holding the year the accolade was first awarded.
    #[serde(default)]
    pub year_field: Option<String>,
}

impl AccoladeField {
    pub fn new(field: &str, title: &str) -> Self {
        Self {
            field: field.to_string(),
            title: title.to_string(),
            year_field: None,
        }
    }

    #[must_use]
    pub fn with_year(mut self, year_field: &str) -> Self {
        self.year_field = Some(year_field.to_string());
        self
    }
}

/// Explicit column → accolade mapping for curated imports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccoladeFieldMap(Vec<AccoladeField>);

impl Default for AccoladeFieldMap {
    fn default() -> Self {
        Self(vec![
            AccoladeField::new("Michelin", "Michelin").with_year("Mich Since"),
            AccoladeField::new("Conde Nast", "Conde Nast"),
            AccoladeField::new("Eater", "Eater"),
            AccoladeField::new("Food & Wine", "Food & Wine"),
            AccoladeField::new("Forbes", "Forbes"),
            AccoladeField::new("James Beard", "James Beard"),
            AccoladeField::new("Travel + Leisure", "Travel + Leisure"),
            AccoladeField::new("Zagat", "Zagat"),
            AccoladeField::new("World's 50 Best", "World's 50 Best"),
        ])
    }
}

impl AccoladeFieldMap {
    pub fn new(fields: Vec<AccoladeField>) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &[AccoladeField] {
        &self.0
    }

    /// Keeps only the named columns, in table order.
    #[must_use]
    pub fn restricted_to(&self, names: &[String]) -> Self {
        Self(
            self.0
                .iter()
                .filter(|f| names.iter().any(|n| n == &f.field))
                .cloned()
                .collect(),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for f in &self.0 {
            if f.field.trim().is_empty() || f.title.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "accolade field and title must be non-empty".into(),
                ));
            }
            if !seen.insert(f.field.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "accolade field '{}' mapped twice",
                    f.field
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Title of the layer that owns top-list locations.
    pub user_layer_title: String,
    /// First path segment for uploaded assets.
    pub asset_root: String,
    pub max_import_records: usize,
    /// Upper bound on itineraries × usernames for one share call.
    pub max_share_targets: usize,
    pub accolade_fields: AccoladeFieldMap,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            user_layer_title: DEFAULT_USER_LAYER_TITLE.to_string(),
            asset_root: DEFAULT_ASSET_ROOT.to_string(),
            max_import_records: MAX_IMPORT_RECORDS,
            max_share_targets: MAX_SHARE_TARGETS,
            accolade_fields: AccoladeFieldMap::default(),
        }
    }
}

impl ReconcilerConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_layer_title.trim().is_empty() {
            return Err(ConfigError::Invalid("user_layer_title must be set".into()));
        }
        if self.asset_root.trim().is_empty()
            || self.asset_root.contains('/')
            || self.asset_root.contains("..")
        {
            return Err(ConfigError::Invalid(
                "asset_root must be a single path segment".into(),
            ));
        }
        if self.max_import_records == 0 {
            return Err(ConfigError::Invalid("max_import_records must be > 0".into()));
        }
        if self.max_share_targets == 0 {
            return Err(ConfigError::Invalid("max_share_targets must be > 0".into()));
        }
        self.accolade_fields.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_state_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_state_bytes: MAX_STATE_BYTES,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_state_bytes < 1024 {
            return Err(ConfigError::Invalid(
                "max_state_bytes should be at least 1024".into(),
            ));
        }
        Ok(())
    }
}
