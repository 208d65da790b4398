//! Backend type registry.
//!
//! Each backend implementation registers a [`BackendTypeInfo`] at startup:
//! an id, a settings schema the UI can render, and a constructor that
//! turns a settings table into a live backend object.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::backend::GenerationBackend;

/// Value stored in place of secret settings when they are sent to
/// clients. Starts with a tab so no real user input can collide with it.
pub const SECRET_PLACEHOLDER: &str = "\t<secret>";

/// How a settings field should be rendered and parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Decimal,
    Bool,
    Dropdown,
    List,
}

/// One editable setting on a backend type.
#[derive(Debug, Clone, Serialize)]
pub struct SettingsField {
    pub name: String,
    pub kind: FieldKind,
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub placeholder: String,
    /// Secret fields are masked as [`SECRET_PLACEHOLDER`] on the way out
    /// and a placeholder submitted back means "keep the stored value".
    pub secret: bool,
    /// Choices for dropdown fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
}

impl SettingsField {
    pub fn new(name: &str, kind: FieldKind, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            placeholder: String::new(),
            secret: false,
            values: None,
        }
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    pub fn placeholder(mut self, text: &str) -> Self {
        self.placeholder = text.to_string();
        self
    }
}

/// Builds a live backend from a raw settings table.
pub type BackendConstructor =
    Arc<dyn Fn(&toml::Table) -> anyhow::Result<Arc<dyn GenerationBackend>> + Send + Sync>;

/// Static description of one backend implementation.
pub struct BackendTypeInfo {
    /// Stable machine id, used as the `type` key in the save file.
    pub id: String,
    pub name: String,
    pub description: String,
    /// Fast types init concurrently; slow types go through the
    /// serialized init queue one at a time.
    pub can_load_fast: bool,
    /// Standard types appear in the default add-backend UI list;
    /// internal types (remote children, scaled workers) do not.
    pub is_standard: bool,
    pub settings_schema: Vec<SettingsField>,
    pub constructor: BackendConstructor,
}

impl BackendTypeInfo {
    /// Client-facing description, schema included, constructor excluded.
    pub fn net_description(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "is_standard": self.is_standard,
            "settings": self.settings_schema,
        })
    }

    /// Names of this type's secret settings fields.
    pub fn secret_fields(&self) -> impl Iterator<Item = &str> {
        self.settings_schema
            .iter()
            .filter(|f| f.secret)
            .map(|f| f.name.as_str())
    }
}

impl std::fmt::Debug for BackendTypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendTypeInfo")
            .field("id", &self.id)
            .field("can_load_fast", &self.can_load_fast)
            .field("is_standard", &self.is_standard)
            .finish_non_exhaustive()
    }
}

/// All known backend types. Populated once at startup, then read-only.
#[derive(Debug, Default)]
pub struct BackendTypeRegistry {
    types: HashMap<String, Arc<BackendTypeInfo>>,
}

impl BackendTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, info: BackendTypeInfo) -> Arc<BackendTypeInfo> {
        let info = Arc::new(info);
        self.types.insert(info.id.clone(), Arc::clone(&info));
        info
    }

    pub fn get(&self, id: &str) -> Option<Arc<BackendTypeInfo>> {
        self.types.get(id).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BackendTypeInfo>> {
        self.types.values()
    }
}
