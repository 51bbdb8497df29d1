//! In-memory port doubles shared by the application unit tests.

use crate::domain::entities::{Instance, InstanceRecord, NewInstance};
use crate::domain::errors::{StoreError, UpstreamError};
use crate::domain::ports::{ChunkStream, InstanceRepository, UpstreamClient};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub fn record(id: i64, model: &str, url: &str) -> InstanceRecord {
    InstanceRecord {
        id,
        provider_id: 1,
        provider_name: "openai".to_string(),
        model_name: model.to_string(),
        url: url.to_string(),
        api_key: "sk-test".to_string(),
        weight: 10,
        active: true,
    }
}

#[derive(Default)]
pub struct MockInstanceRepository {
    rows: Mutex<Vec<InstanceRecord>>,
    providers: Mutex<Vec<(i64, String)>>,
    failing: AtomicBool,
    find_calls: AtomicUsize,
}

impl MockInstanceRepository {
    pub fn with_rows(rows: Vec<InstanceRecord>) -> Self {
        Self {
            rows: Mutex::new(rows),
            ..Default::default()
        }
    }

    pub fn push(&self, row: InstanceRecord) {
        self.rows.lock().push(row);
    }

    pub fn clear(&self) {
        self.rows.lock().clear();
    }

    pub fn set_active(&self, id: i64, active: bool) {
        for row in self.rows.lock().iter_mut().filter(|r| r.id == id) {
            row.active = active;
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn provider_count(&self) -> usize {
        self.providers.lock().len()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("store unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceRepository for MockInstanceRepository {
    async fn find_by_model(&self, model: &str) -> Result<Vec<InstanceRecord>, StoreError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.rows.lock().iter().filter(|r| r.model_name == model).cloned().collect())
    }

    async fn find_all(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        self.check()?;
        Ok(self.rows.lock().clone())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<InstanceRecord>, StoreError> {
        self.check()?;
        Ok(self.rows.lock().iter().find(|r| r.id == id).cloned())
    }

    async fn insert(&self, instance: &NewInstance) -> Result<i64, StoreError> {
        self.check()?;
        let provider_name = self
            .providers
            .lock()
            .iter()
            .find(|(id, _)| *id == instance.provider_id)
            .map(|(_, name)| name.clone())
            .unwrap_or_default();

        let mut rows = self.rows.lock();
        if rows.iter().any(|r| r.url == instance.url) {
            return Err(StoreError::DuplicateKey(instance.url.clone()));
        }
        let id = rows.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        rows.push(InstanceRecord {
            id,
            provider_id: instance.provider_id,
            provider_name,
            model_name: instance.model_name.clone(),
            url: instance.url.clone(),
            api_key: instance.api_key.clone(),
            weight: instance.weight,
            active: instance.active,
        });
        Ok(id)
    }

    async fn update_active(&self, id: i64, active: bool) -> Result<bool, StoreError> {
        self.check()?;
        let mut rows = self.rows.lock();
        match rows.iter_mut().find(|r| r.id == id) {
            Some(row) => {
                row.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_weight(&self, id: i64, weight: u32) -> Result<bool, StoreError> {
        self.check()?;
        let mut rows = self.rows.lock();
        match rows.iter_mut().find(|r| r.id == id) {
            Some(row) => {
                row.weight = weight;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_provider_id_by_name(&self, name: &str) -> Result<Option<i64>, StoreError> {
        self.check()?;
        Ok(self.providers.lock().iter().find(|(_, n)| n == name).map(|(id, _)| *id))
    }

    async fn insert_provider(&self, name: &str) -> Result<i64, StoreError> {
        self.check()?;
        let mut providers = self.providers.lock();
        let id = providers.len() as i64 + 1;
        providers.push((id, name.to_string()));
        Ok(id)
    }
}

/// Scripted backend behaviour.
#[derive(Debug, Clone)]
pub enum Script {
    /// Stream these chunks then end cleanly
    Stream(Vec<&'static str>),
    /// Reject with this status before any chunk
    Status(u16),
    /// Stream these chunks then break the connection
    BreakAfter(Vec<&'static str>),
    /// Never produce anything
    Hang,
}

/// Sets the flag when dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct MockUpstream {
    default: Script,
    overrides: Mutex<HashMap<String, Script>>,
    probe_status: Mutex<HashMap<String, u16>>,
    calls: Mutex<Vec<String>>,
    probes: Mutex<Vec<String>>,
    dropped: Arc<AtomicBool>,
}

impl MockUpstream {
    pub fn new(default: Script) -> Self {
        Self {
            default,
            overrides: Mutex::new(HashMap::new()),
            probe_status: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            probes: Mutex::new(Vec::new()),
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn script(&self, url: &str, script: Script) {
        self.overrides.lock().insert(url.to_string(), script);
    }

    pub fn probe_status(&self, url: &str, status: u16) {
        self.probe_status.lock().insert(url.to_string(), status);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn probes(&self) -> Vec<String> {
        self.probes.lock().clone()
    }

    /// Whether a hanging stream was dropped by its consumer.
    pub fn hang_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    async fn stream_chat(&self, instance: &Instance, _body: &str) -> Result<ChunkStream, UpstreamError> {
        self.calls.lock().push(instance.url.clone());
        let script = self
            .overrides
            .lock()
            .get(&instance.url)
            .cloned()
            .unwrap_or_else(|| self.default.clone());

        match script {
            Script::Stream(chunks) => {
                Ok(stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes())))).boxed())
            }
            Script::Status(status) => Err(UpstreamError::Status {
                status,
                body: "mock failure".into(),
            }),
            Script::BreakAfter(chunks) => {
                let items = chunks
                    .into_iter()
                    .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                    .chain(std::iter::once(Err(UpstreamError::Stream("connection reset".into()))));
                Ok(stream::iter(items).boxed())
            }
            Script::Hang => {
                let flag = DropFlag(self.dropped.clone());
                Ok(stream::pending::<Result<Bytes, UpstreamError>>()
                    .map(move |item| {
                        let _keep = &flag;
                        item
                    })
                    .boxed())
            }
        }
    }

    async fn probe(&self, instance: &Instance, _body: &str) -> Result<u16, UpstreamError> {
        self.probes.lock().push(instance.url.clone());
        let status = self.probe_status.lock().get(&instance.url).copied().unwrap_or(200);
        if status == 0 {
            return Err(UpstreamError::Request("connection refused".into()));
        }
        Ok(status)
    }
}
