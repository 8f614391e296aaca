//! Export/import of per-controller session state.
//!
//! Each controller serialises itself to an opaque JSON value. The session wraps every value
//! in an `ImportedData` record keyed by controller id and content hash; storing the records
//! is somebody else's job.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::ImportError;

/// A controller whose state survives a session
pub trait Importable: Send + Sync {
    /// Stable identifier of the controller in exported data
    fn importer_id(&self) -> &'static str;

    /// Current state, or `None` if there is nothing worth saving
    fn export(&self) -> Option<serde_json::Value>;

    /// Replace current state with `data`
    fn import(&self, data: serde_json::Value) -> Result<(), serde_json::Error>;
}

/// One exported controller state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedData {
    pub controller: String,
    pub hash: String,
    pub data: String,
}

impl ImportedData {
    pub fn new(controller: &str, value: &serde_json::Value) -> Self {
        let data = value.to_string();
        Self {
            controller: controller.to_string(),
            hash: content_hash(&data),
            data,
        }
    }

    pub fn is_intact(&self) -> bool {
        content_hash(&self.data) == self.hash
    }
}

/// SHA-256 of `data`, hex encoded
pub fn content_hash(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Remembers the last export so unchanged state is not saved twice
#[derive(Debug, Default)]
pub struct ExportLedger {
    last_hash: Option<String>,
}

impl ExportLedger {
    /// True (and remembered) if `records` differ from the previous export
    pub fn is_actual(&mut self, records: &[ImportedData]) -> bool {
        let combined = content_hash(
            &records
                .iter()
                .map(|r| r.hash.as_str())
                .collect::<Vec<_>>()
                .join(";"),
        );
        if self.last_hash.as_deref() == Some(combined.as_str()) {
            return false;
        }
        self.last_hash = Some(combined);
        true
    }
}

/// Collect records from every controller with something to export
pub fn export_all(controllers: &[&dyn Importable]) -> Vec<ImportedData> {
    controllers
        .iter()
        .filter_map(|c| c.export().map(|value| ImportedData::new(c.importer_id(), &value)))
        .collect()
}

/// Dispatch records to their controllers.
///
/// Every record is attempted; the first failure is returned after all were tried.
pub fn import_all(
    controllers: &[&dyn Importable],
    records: &[ImportedData],
) -> Result<(), ImportError> {
    let mut first_error = None;
    for record in records {
        let result = import_one(controllers, record);
        if let Err(err) = result {
            warn!(controller = %record.controller, error = %err, "failed to import session data");
            first_error.get_or_insert(err);
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn import_one(controllers: &[&dyn Importable], record: &ImportedData) -> Result<(), ImportError> {
    let controller = controllers
        .iter()
        .find(|c| c.importer_id() == record.controller)
        .ok_or_else(|| ImportError::UnknownController(record.controller.clone()))?;
    if !record.is_intact() {
        return Err(ImportError::HashMismatch {
            controller: record.controller.clone(),
        });
    }
    let malformed = |source| ImportError::Malformed {
        controller: record.controller.clone(),
        source,
    };
    let value = serde_json::from_str(&record.data).map_err(malformed)?;
    controller.import(value).map_err(malformed)
}
