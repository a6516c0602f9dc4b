//! Provider adapters: request building and record extraction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::conflict::{RecordData, RecordType};
use crate::error::{SyncError, SyncResult};
use crate::gateway::GatewayRequest;
use crate::provider::SisProvider;

/// A record as the SIS reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRecord {
    pub external_id: String,
    pub record_type: RecordType,
    pub data: RecordData,
}

/// One page of a roster listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPage {
    pub records: Vec<ExternalRecord>,
    /// Cursor for the next page, when the provider reports one.
    pub next_page: Option<String>,
}

/// Translates between the gateway and a provider's roster API.
pub trait ProviderAdapter: Send + Sync + std::fmt::Debug {
    fn provider(&self) -> SisProvider;

    /// Builds the listing request for a record type and optional page cursor.
    fn fetch_request(&self, record_type: RecordType, page: Option<&str>) -> GatewayRequest;

    /// Extracts records from a listing reply.
    fn parse_records(&self, record_type: RecordType, body: &Value) -> SyncResult<RecordPage>;
}

/// Adapter for providers exposing plain JSON listings.
///
/// Accepts either a bare array or an object holding the array under
/// `records_key`. Items without an id are skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRosterAdapter {
    pub provider: SisProvider,
    #[serde(default = "default_paths")]
    pub paths: HashMap<RecordType, String>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_records_key")]
    pub records_key: String,
    #[serde(default = "default_next_page_key")]
    pub next_page_key: String,
    #[serde(default = "default_page_param")]
    pub page_param: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_paths() -> HashMap<RecordType, String> {
    HashMap::from([
        (RecordType::Student, "students".to_string()),
        (RecordType::Enrollment, "enrollments".to_string()),
    ])
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_records_key() -> String {
    "data".to_string()
}

fn default_next_page_key() -> String {
    "next_page".to_string()
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_page_size() -> u32 {
    100
}

impl JsonRosterAdapter {
    #[must_use]
    pub fn new(provider: SisProvider) -> Self {
        Self {
            provider,
            paths: default_paths(),
            id_field: default_id_field(),
            records_key: default_records_key(),
            next_page_key: default_next_page_key(),
            page_param: default_page_param(),
            page_size: default_page_size(),
        }
    }

    #[must_use]
    pub fn with_path(mut self, record_type: RecordType, path: impl Into<String>) -> Self {
        self.paths.insert(record_type, path.into());
        self
    }

    #[must_use]
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    fn path_for(&self, record_type: RecordType) -> String {
        self.paths
            .get(&record_type)
            .cloned()
            .unwrap_or_else(|| format!("{record_type}s"))
    }
}

impl ProviderAdapter for JsonRosterAdapter {
    fn provider(&self) -> SisProvider {
        self.provider
    }

    fn fetch_request(&self, record_type: RecordType, page: Option<&str>) -> GatewayRequest {
        let mut request = GatewayRequest::get(self.provider, self.path_for(record_type))
            .with_param("limit", self.page_size.to_string());
        if let Some(page) = page {
            request = request.with_param(self.page_param.clone(), page);
        }
        request
    }

    fn parse_records(&self, record_type: RecordType, body: &Value) -> SyncResult<RecordPage> {
        let (items, next_page) = match body {
            Value::Array(items) => (items, None),
            Value::Object(map) => {
                let items = map
                    .get(&self.records_key)
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        SyncError::Config(format!(
                            "{} reply has no '{}' array",
                            self.provider, self.records_key
                        ))
                    })?;
                (items, map.get(&self.next_page_key).and_then(scalar_string))
            }
            _ => {
                return Err(SyncError::Config(format!(
                    "{} reply is not a JSON listing",
                    self.provider
                )))
            }
        };

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let Some(data) = item.as_object() else {
                warn!(provider = %self.provider, "Skipping non-object roster item");
                continue;
            };
            let Some(external_id) = data.get(&self.id_field).and_then(scalar_string) else {
                warn!(
                    provider = %self.provider,
                    id_field = %self.id_field,
                    "Skipping roster item without an id"
                );
                continue;
            };
            records.push(ExternalRecord {
                external_id,
                record_type,
                data: data.clone(),
            });
        }

        Ok(RecordPage { records, next_page })
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
