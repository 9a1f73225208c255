//! Client documents
//!
//! The HTTP layer reads and writes a client's `emailTesting` sub-document
//! through `ClientStore`. Writes are best-effort single-document updates.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use crate::analysis::AIAnalysisResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EmailTestingConfig {
    pub enabled: bool,
    pub ai_analysis_enabled: bool,
    pub default_parallel_limit: usize,
    pub default_retry_attempts: u32,
}

impl Default for EmailTestingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ai_analysis_enabled: true,
            default_parallel_limit: 3,
            default_retry_attempts: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub expected_extraction: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultRecord {
    pub test_result_id: String,
    pub test_case_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_extraction: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_extraction: Option<Map<String, Value>>,
    #[serde(default)]
    pub analyses: Vec<AIAnalysisResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionHistoryEntry {
    pub queue_id: String,
    pub test_case_count: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EmailTesting {
    pub config: EmailTestingConfig,
    pub test_cases: Vec<TestCase>,
    pub test_results: Vec<TestResultRecord>,
    pub execution_history: Vec<ExecutionHistoryEntry>,
}

impl EmailTesting {
    pub fn find_result(&self, test_result_id: &str) -> Option<&TestResultRecord> {
        self.test_results.iter().find(|r| r.test_result_id == test_result_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub client_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email_testing: EmailTesting,
}

pub trait ClientStore: Send + Sync {
    fn get(&self, client_id: &str) -> Result<Option<Client>>;

    /// Apply `apply` to the client's email-testing document. Returns false if
    /// the client does not exist.
    fn update_email_testing(&self, client_id: &str, apply: &mut dyn FnMut(&mut EmailTesting)) -> Result<bool>;
}

#[derive(Default)]
pub struct MemoryClientStore {
    clients: Mutex<HashMap<String, Client>>,
}

impl MemoryClientStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clients(clients: Vec<Client>) -> Self {
        let store = Self::new();
        for client in clients {
            store.insert(client);
        }
        store
    }

    /// Seed from a JSON array of client documents.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read client seed file {:?}", path))?;
        let clients: Vec<Client> =
            serde_json::from_str(&content).with_context(|| format!("Invalid client seed file {:?}", path))?;
        tracing::info!("Loaded {} clients from {:?}", clients.len(), path);
        Ok(Self::with_clients(clients))
    }

    pub fn insert(&self, client: Client) {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client.client_id.clone(), client);
    }
}

impl ClientStore for MemoryClientStore {
    fn get(&self, client_id: &str) -> Result<Option<Client>> {
        Ok(self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .cloned())
    }

    fn update_email_testing(&self, client_id: &str, apply: &mut dyn FnMut(&mut EmailTesting)) -> Result<bool> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        match clients.get_mut(client_id) {
            Some(client) => {
                apply(&mut client.email_testing);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_seed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clients.json");
        fs::write(
            &path,
            r#"[{"clientId": "c-1", "name": "Acme Finance",
                 "emailTesting": {"testResults": [{"testResultId": "tr-1", "testCaseId": "tc-1"}]}}]"#,
        )
        .unwrap();

        let store = MemoryClientStore::load(&path).unwrap();
        let client = store.get("c-1").unwrap().unwrap();
        assert_eq!(client.name, "Acme Finance");
        assert!(client.email_testing.config.enabled);
        assert!(client.email_testing.find_result("tr-1").is_some());
        assert!(store.get("c-2").unwrap().is_none());
    }

    #[test]
    fn test_update_email_testing() {
        let store = MemoryClientStore::with_clients(vec![Client {
            client_id: "c-1".to_string(),
            name: String::new(),
            email_testing: EmailTesting::default(),
        }]);

        let updated = store
            .update_email_testing("c-1", &mut |et| {
                et.execution_history.push(ExecutionHistoryEntry {
                    queue_id: "q-1".to_string(),
                    test_case_count: 2,
                    started_at: Utc::now(),
                })
            })
            .unwrap();
        assert!(updated);
        assert_eq!(store.get("c-1").unwrap().unwrap().email_testing.execution_history.len(), 1);
        assert!(!store.update_email_testing("c-9", &mut |_| {}).unwrap());
    }
}
