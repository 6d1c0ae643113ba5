// Data models for the farmer registry

use crate::record::Record;
use eyre::{Result, eyre};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Slot holding every registered farmer
pub const FARMERS_SLOT: &str = "farmers";

/// A registered farmer
///
/// Free text throughout; the store does not validate any field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmerRecord {
    pub name: String,
    pub phone: String,
    pub village: String,
    pub crop: String,
    pub land: String,
    /// Krishi Vigyan Kendra the farmer is attached to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kvk: Option<String>,
    /// Assigned UFI (`ufi` in slots written by older versions)
    #[serde(alias = "ufi")]
    pub id: String,
}

impl FarmerRecord {
    /// Fixed record shown when a profile lookup misses
    pub fn placeholder() -> Self {
        Self {
            name: "Abhi".to_string(),
            phone: "9394959695".to_string(),
            village: "hjjedkedj".to_string(),
            crop: "jhjdkje".to_string(),
            land: "edej".to_string(),
            kvk: Some("eheje".to_string()),
            id: String::new(),
        }
    }
}

impl Record for FarmerRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn slot_name() -> &'static str {
        FARMERS_SLOT
    }

    fn indexed_fields(&self) -> HashMap<String, String> {
        let mut fields = HashMap::new();
        fields.insert("name".to_string(), self.name.clone());
        fields.insert("village".to_string(), self.village.clone());
        fields.insert("crop".to_string(), self.crop.clone());
        if let Some(kvk) = &self.kvk {
            fields.insert("kvk".to_string(), kvk.clone());
        }
        fields
    }
}

/// In-progress registration, before an identifier is assigned
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationForm {
    pub name: String,
    pub phone: String,
    pub village: String,
    pub crop: String,
    pub land: String,
    pub kvk: Option<String>,
}

impl RegistrationForm {
    /// Every required field must be present and non-blank
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("name", &self.name),
            ("phone", &self.phone),
            ("village", &self.village),
            ("crop", &self.crop),
            ("land", &self.land),
        ];

        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(eyre!("Field '{}' is required", field));
            }
        }

        if self.kvk.as_deref().is_some_and(|kvk| kvk.trim().is_empty()) {
            return Err(eyre!("Field 'kvk' cannot be blank when given"));
        }

        Ok(())
    }

    /// Attach the assigned identifier; fields are kept exactly as entered
    pub fn into_record(self, id: String) -> FarmerRecord {
        FarmerRecord {
            name: self.name,
            phone: self.phone,
            village: self.village,
            crop: self.crop,
            land: self.land,
            kvk: self.kvk,
            id,
        }
    }
}
