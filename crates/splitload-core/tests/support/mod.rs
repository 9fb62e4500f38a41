//! In-memory primary/replica computer service
//!
//! Writes land on the primary immediately and become visible to reads after
//! `replica_delay`. Uses tokio time so paused-clock tests stay deterministic.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use splitload_core::http::{ApiClient, ApiRequest, ApiResponse, Method};
use splitload_core::TransportError;
use tokio::time::Instant;

/// How the primary treats a second insert of the same name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// 409 Conflict
    Reject,
    /// 201 every time, a broken unique index
    AcceptAll,
    /// 200 with no new record
    Ignore,
}

struct Record {
    id: u64,
    name: String,
    created_at: String,
    gpu: String,
    ram_gb: u64,
    written_at: Instant,
}

pub struct FakeService {
    replica_delay: Duration,
    latency: Duration,
    duplicates: DuplicatePolicy,
    next_id: AtomicU64,
    records: Mutex<Vec<Record>>,
    requests: AtomicU64,
}

impl FakeService {
    pub fn new(replica_delay: Duration) -> Self {
        Self {
            replica_delay,
            latency: Duration::ZERO,
            duplicates: DuplicatePolicy::Reject,
            next_id: AtomicU64::new(1),
            records: Mutex::new(Vec::new()),
            requests: AtomicU64::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_duplicates(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicates = policy;
        self
    }

    /// Insert a record that the replica already sees
    pub fn seed(&self, count: usize) {
        let now = Instant::now() - self.replica_delay;
        let mut records = self.records.lock();
        for _ in 0..count {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            records.push(Record {
                id,
                name: format!("SEED-{id}"),
                created_at: timestamp(id),
                gpu: "GeForce RTX 4070".into(),
                ram_gb: 32,
                written_at: now,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    fn visible(&self, record: &Record) -> bool {
        record.written_at + self.replica_delay <= Instant::now()
    }

    fn create(&self, body: Option<&Value>) -> ApiResponse {
        let Some(body) = body else {
            return ApiResponse::new(400, r#"{"error":"missing body"}"#);
        };
        let name = body["name"].as_str().unwrap_or_default().to_string();
        let mut records = self.records.lock();
        if records.iter().any(|r| r.name == name) {
            match self.duplicates {
                DuplicatePolicy::Reject => {
                    return ApiResponse::new(409, r#"{"error":"duplicate name"}"#)
                }
                DuplicatePolicy::Ignore => return ApiResponse::new(200, "{}"),
                DuplicatePolicy::AcceptAll => {}
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        records.push(Record {
            id,
            name,
            created_at: timestamp(id),
            gpu: body["placa_video"]["modelo"].as_str().unwrap_or_default().to_string(),
            ram_gb: body["memoria_ram"]["capacidade_total_gb"].as_u64().unwrap_or(0),
            written_at: Instant::now(),
        });
        ApiResponse::new(201, json!({ "id": id }).to_string())
    }

    fn page(&self, request: &ApiRequest) -> ApiResponse {
        let limit: usize = request
            .query_value("limit")
            .and_then(|l| l.parse().ok())
            .unwrap_or(50);
        let after = match (request.query_value("createdAt"), request.query_value("id")) {
            (Some(ts), Some(id)) => Some((ts.to_string(), id.parse::<u64>().unwrap_or(0))),
            _ => None,
        };
        let records = self.records.lock();
        let mut rows: Vec<&Record> = records
            .iter()
            .filter(|r| self.visible(r))
            .filter(|r| match &after {
                Some((ts, id)) => (r.created_at.as_str(), r.id) > (ts.as_str(), *id),
                None => true,
            })
            .collect();
        rows.sort_by(|a, b| (&a.created_at, a.id).cmp(&(&b.created_at, b.id)));
        let items: Vec<Value> = rows.into_iter().take(limit).map(to_json).collect();
        ApiResponse::new(200, Value::Array(items).to_string())
    }

    fn search(&self, matches: impl Fn(&Record) -> bool) -> ApiResponse {
        let records = self.records.lock();
        let items: Vec<Value> = records
            .iter()
            .filter(|r| self.visible(r) && matches(r))
            .map(to_json)
            .collect();
        ApiResponse::new(200, Value::Array(items).to_string())
    }

    fn delete(&self, name: &str) -> ApiResponse {
        let mut records = self.records.lock();
        match records.iter().position(|r| r.name == name) {
            Some(index) => {
                records.remove(index);
                ApiResponse::new(204, "")
            }
            None => ApiResponse::new(404, r#"{"error":"not found"}"#),
        }
    }
}

fn timestamp(id: u64) -> String {
    format!("2024-01-01T00:00:00.{:09}Z", id)
}

fn to_json(record: &Record) -> Value {
    json!({
        "id": record.id,
        "name": record.name,
        "createdAt": record.created_at,
        "placa_video": { "modelo": record.gpu },
        "memoria_ram": { "capacidade_total_gb": record.ram_gb },
    })
}

#[async_trait]
impl ApiClient for FakeService {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let segments: Vec<&str> = request.segments.iter().map(String::as_str).collect();
        let response = match (request.method, segments.as_slice()) {
            (Method::Post, ["computer"]) => self.create(request.body.as_ref()),
            (Method::Get, ["computer", "pagination"]) => self.page(&request),
            (Method::Get, ["computer", "search", "gpu", term]) => {
                let term = term.to_lowercase();
                self.search(|r| r.gpu.to_lowercase().contains(&term))
            }
            (Method::Get, ["computer", "search", "ram", capacity]) => {
                let capacity: u64 = capacity.parse().unwrap_or(0);
                self.search(|r| r.ram_gb == capacity)
            }
            (Method::Delete, ["computer", name]) => self.delete(name),
            _ => ApiResponse::new(404, ""),
        };
        Ok(response)
    }
}
