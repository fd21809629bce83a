//! Spoolman REST client.

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use spooltag_parsers::inventory::object_id;
use spooltag_parsers::{Inventory, InventoryError, Result};
use spooltag_protocol::defaults::HTTP_TIMEOUT_SECS;
use std::time::Duration;
use tracing::debug;

/// Spoolman inventory over HTTP.
pub struct SpoolmanClient {
    base_url: String,
    http_client: Client,
}

impl SpoolmanClient {
    pub fn new(url: &str) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| InventoryError::Request(e.to_string()))?;
        Ok(Self {
            base_url: url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    fn send(&self, request: RequestBuilder) -> Result<Value> {
        let response = request
            .send()
            .map_err(|e| InventoryError::Request(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| InventoryError::Request(e.to_string()))?;
        if !status.is_success() {
            return Err(InventoryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }

    fn get_list(&self, request: RequestBuilder) -> Result<Vec<Value>> {
        match self.send(request)? {
            Value::Array(items) => Ok(items),
            other => Err(InventoryError::InvalidResponse(format!(
                "expected a list, got {}",
                other
            ))),
        }
    }

    fn post(&self, path: &str, data: &Value) -> Result<u64> {
        debug!(path, %data, "creating inventory object");
        let created = self.send(self.http_client.post(self.url(path)).json(data))?;
        object_id(&created).ok_or_else(|| {
            InventoryError::InvalidResponse(format!("created {} has no id", path))
        })
    }
}

fn name_matches(object: &Value, name: &str) -> bool {
    object.get("name").and_then(Value::as_str) == Some(name)
}

impl Inventory for SpoolmanClient {
    fn spools(&self) -> Result<Vec<Value>> {
        self.get_list(self.http_client.get(self.url("spool")))
    }

    fn spool(&self, id: u64) -> Result<Value> {
        match self.send(self.http_client.get(self.url(&format!("spool/{}", id)))) {
            Err(InventoryError::Status { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Err(InventoryError::SpoolNotFound(id))
            }
            other => other,
        }
    }

    fn update_spool_extra(&self, id: u64, extra: Map<String, Value>) -> Result<()> {
        self.send(
            self.http_client
                .patch(self.url(&format!("spool/{}", id)))
                .json(&json!({ "extra": extra })),
        )?;
        Ok(())
    }

    fn find_vendor_by_name(&self, name: &str) -> Result<Option<u64>> {
        // The name filter is a substring match
        let vendors = self.get_list(self.http_client.get(self.url("vendor")).query(&[("name", name)]))?;
        Ok(vendors
            .iter()
            .find(|vendor| name_matches(vendor, name))
            .and_then(object_id))
    }

    fn create_vendor(&self, name: &str, empty_spool_weight: Option<f64>) -> Result<u64> {
        let mut data = json!({ "name": name });
        if let Some(weight) = empty_spool_weight {
            data["empty_spool_weight"] = json!(weight);
        }
        self.post("vendor", &data)
    }

    fn find_filament(&self, vendor_id: u64, material: &str, name: &str) -> Result<Option<u64>> {
        let vendor = vendor_id.to_string();
        let filaments = self.get_list(self.http_client.get(self.url("filament")).query(&[
            ("vendor.id", vendor.as_str()),
            ("material", material),
            ("name", name),
        ]))?;
        Ok(filaments
            .iter()
            .find(|filament| name_matches(filament, name))
            .and_then(object_id))
    }

    fn create_filament(&self, data: Map<String, Value>) -> Result<u64> {
        self.post("filament", &Value::Object(data))
    }

    fn create_spool(&self, data: Map<String, Value>) -> Result<u64> {
        self.post("spool", &Value::Object(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_trimmed() {
        let client = SpoolmanClient::new("http://spoolman.local:7912/").unwrap();
        assert_eq!(client.url("spool/4"), "http://spoolman.local:7912/api/v1/spool/4");
    }

    #[test]
    fn test_unreachable_service_is_transient() {
        // Nothing listens on port 1
        let client = SpoolmanClient::new("http://127.0.0.1:1").unwrap();
        let err = client.spools().unwrap_err();
        assert!(matches!(err, InventoryError::Request(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_name_matches_exactly() {
        let vendor = json!({"id": 1, "name": "Prusament"});
        assert!(name_matches(&vendor, "Prusament"));
        assert!(!name_matches(&vendor, "Prusa"));
    }
}
