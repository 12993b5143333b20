use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::CoeditError;
use crate::store::DataStore;

/// Value shape of one editable field. Values travel as strings end to end;
/// the kind determines what [`FieldKind::validate`] will accept on write.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    LongText,
    Bool,
    Integer,
    Choice { choices: Vec<String> },
}

impl FieldKind {
    /// Check a candidate value against this kind. Returns the rejection
    /// reason on failure.
    pub fn validate(&self, value: &str) -> Result<(), String> {
        match self {
            FieldKind::Text | FieldKind::LongText => Ok(()),
            FieldKind::Bool => match value {
                "true" | "false" => Ok(()),
                _ => Err(format!("expected true or false, got {value:?}")),
            },
            FieldKind::Integer => value
                .parse::<i64>()
                .map(|_| ())
                .map_err(|_| format!("expected an integer, got {value:?}")),
            FieldKind::Choice { choices } => {
                if choices.iter().any(|c| c == value) {
                    Ok(())
                } else {
                    Err(format!("{value:?} is not one of {choices:?}"))
                }
            }
        }
    }

    /// Value a freshly created row gets for a field that was not supplied.
    pub fn default_value(&self) -> String {
        match self {
            FieldKind::Text | FieldKind::LongText => String::new(),
            FieldKind::Bool => "false".to_string(),
            FieldKind::Integer => "0".to_string(),
            FieldKind::Choice { choices } => choices.first().cloned().unwrap_or_default(),
        }
    }
}

/// Hand-declared descriptor for one field of an entity kind.
#[derive(Deserialize, Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_editable")]
    pub editable: bool,
}

fn default_editable() -> bool {
    true
}

impl FieldSpec {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Text,
            required: false,
            editable: true,
        }
    }

    pub fn long_text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::LongText,
            required: false,
            editable: true,
        }
    }
}

/// Display/edit configuration for one entity kind, declared once at
/// startup. Stands in for the source system's runtime model reflection.
#[derive(Deserialize, Debug, Clone)]
pub struct EntityConfig {
    pub kind: String,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub title_field: Option<String>,
}

impl EntityConfig {
    pub fn new(kind: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            kind: kind.into(),
            fields,
            title_field: None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_editable(&self, name: &str) -> bool {
        self.field(name).is_some_and(|f| f.editable)
    }

    /// The field shown as the row title: the declared one if set, else the
    /// first conventional candidate, else the first field.
    pub fn title_field(&self) -> Option<&str> {
        if let Some(ref declared) = self.title_field {
            return Some(declared.as_str());
        }
        for candidate in ["name", "title", "label", "subject"] {
            if self.field(candidate).is_some() {
                return Some(candidate);
            }
        }
        self.fields.first().map(|f| f.name.as_str())
    }

    /// Fields shown in the row body (everything but the title field).
    pub fn content_fields(&self) -> Vec<&str> {
        let title = self.title_field();
        self.fields
            .iter()
            .map(|f| f.name.as_str())
            .filter(|name| Some(*name) != title)
            .collect()
    }

    /// The change-notification topic for this entity kind.
    pub fn topic(&self) -> String {
        coedit_protocol::topic_for(&self.kind)
    }
}

/// One registered entity kind: its config plus the store that backs it.
#[derive(Clone)]
pub struct EntityEntry {
    pub config: Arc<EntityConfig>,
    pub store: Arc<dyn DataStore>,
}

/// Kind-to-store registry built once at startup.
#[derive(Default)]
pub struct EntityRegistry {
    entries: HashMap<String, EntityEntry>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, config: Arc<EntityConfig>, store: Arc<dyn DataStore>) {
        self.entries
            .insert(config.kind.clone(), EntityEntry { config, store });
    }

    pub fn get(&self, kind: &str) -> Result<&EntityEntry, CoeditError> {
        self.entries
            .get(kind)
            .ok_or_else(|| CoeditError::EntityNotFound(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card_config() -> EntityConfig {
        EntityConfig::new(
            "card",
            vec![FieldSpec::text("title"), FieldSpec::long_text("content")],
        )
    }

    #[test]
    fn title_field_prefers_conventional_names() {
        let config = card_config();
        assert_eq!(config.title_field(), Some("title"));
        assert_eq!(config.content_fields(), vec!["content"]);
    }

    #[test]
    fn title_field_falls_back_to_first() {
        let config = EntityConfig::new(
            "reading",
            vec![FieldSpec::text("sensor"), FieldSpec::text("unit")],
        );
        assert_eq!(config.title_field(), Some("sensor"));
    }

    #[test]
    fn declared_title_field_wins() {
        let mut config = card_config();
        config.title_field = Some("content".to_string());
        assert_eq!(config.title_field(), Some("content"));
        assert_eq!(config.content_fields(), vec!["title"]);
    }

    #[test]
    fn non_editable_fields_are_reported() {
        let mut config = card_config();
        config.fields.push(FieldSpec {
            name: "created_at".to_string(),
            kind: FieldKind::Text,
            required: false,
            editable: false,
        });
        assert!(config.is_editable("title"));
        assert!(!config.is_editable("created_at"));
        assert!(!config.is_editable("no_such_field"));
    }

    #[test]
    fn kind_validation() {
        assert!(FieldKind::Text.validate("anything").is_ok());
        assert!(FieldKind::Bool.validate("true").is_ok());
        assert!(FieldKind::Bool.validate("yes").is_err());
        assert!(FieldKind::Integer.validate("-42").is_ok());
        assert!(FieldKind::Integer.validate("4.2").is_err());

        let kind = FieldKind::Choice {
            choices: vec!["todo".to_string(), "done".to_string()],
        };
        assert!(kind.validate("done").is_ok());
        assert!(kind.validate("later").is_err());
        assert_eq!(kind.default_value(), "todo");
    }

    #[test]
    fn field_spec_config_shape() {
        let json = r#"{"name":"status","kind":"choice","choices":["open","closed"],"required":true}"#;
        let spec: FieldSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.name, "status");
        assert!(spec.required);
        assert!(spec.editable);
        assert!(matches!(spec.kind, FieldKind::Choice { .. }));
    }

    #[test]
    fn entity_config_shape() {
        let json = r#"{
            "kind": "task",
            "title_field": "summary",
            "fields": [
                {"name": "summary", "kind": "text"},
                {"name": "done", "kind": "bool"}
            ]
        }"#;
        let config: EntityConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind, "task");
        assert_eq!(config.title_field(), Some("summary"));
        assert_eq!(config.topic(), "live:task");
    }
}
