#![allow(dead_code)]

use async_trait::async_trait;
use common::model::employee::EmployeeRecord;
use payroll_notifier::delivery::retry::RetryPolicy;
use payroll_notifier::delivery::{AttemptOutcome, DeliveryPayload, SlipDelivery};
use payroll_notifier::job_controller::{BatchCoordinator, BatchSettings, WorkerPool};
use payroll_notifier::render::{RenderError, SlipData, SlipRenderer, SlipTemplate};
use payroll_notifier::store::Store;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 5,
        factor: 2.0,
        max_delay_ms: 20,
        jitter: 0.0,
    }
}

pub fn settings() -> BatchSettings {
    BatchSettings {
        render_retry: fast_retry(3),
        message_content: "Phiếu lương tháng 10".to_string(),
        send_delay: Duration::ZERO,
        subscriber_buffer: 64,
        retained_runs: 16,
    }
}

pub fn template() -> SlipTemplate {
    SlipTemplate::new("slip.fods", "<text:p>{{code}} {{name}}: {{salary_formatted}}</text:p>")
}

/// Imports `names` as a session. Employee `i` gets code `NV00i`.
pub fn seed_session(store: &Store, names: &[&str]) -> (Uuid, Vec<EmployeeRecord>) {
    let session_id = Uuid::new_v4();
    let employees: Vec<EmployeeRecord> = names
        .iter()
        .enumerate()
        .map(|(i, name)| EmployeeRecord {
            id: Uuid::new_v4(),
            session_id,
            row_number: i as u32 + 2,
            code: Some(format!("NV{:03}", i + 1)),
            name: name.to_string(),
            phone: Some(format!("09000000{:02}", i)),
            salary: Some(10_000_000 + i as i64 * 500_000),
            fields: BTreeMap::new(),
            last_sent_at: None,
            delivery_status: None,
        })
        .collect();
    store
        .create_session(session_id, "luong_t10.csv", "Danh sách NV", &employees)
        .unwrap();
    let stored = store.employees(session_id).unwrap();
    (session_id, stored)
}

pub fn coordinator(
    store: &Store,
    renderer: Arc<FakeRenderer>,
    delivery: Option<Arc<FakeDelivery>>,
    workers: usize,
) -> BatchCoordinator {
    coordinator_with(store, renderer, delivery, workers, settings())
}

pub fn coordinator_with(
    store: &Store,
    renderer: Arc<FakeRenderer>,
    delivery: Option<Arc<FakeDelivery>>,
    workers: usize,
    settings: BatchSettings,
) -> BatchCoordinator {
    BatchCoordinator::new(
        store.clone(),
        template(),
        renderer,
        delivery.map(|d| d as Arc<dyn SlipDelivery>),
        WorkerPool::new(workers),
        settings,
    )
}

/// Tracks how many calls run at once.
#[derive(Default)]
pub struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

pub struct InFlight<'a>(&'a Concurrency);

impl Concurrency {
    pub fn enter(&self) -> InFlight<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Renderer double. Output is a pure function of the data; failures and
/// blocking can be scripted per employee name.
#[derive(Default)]
pub struct FakeRenderer {
    pub delay: Duration,
    failures: Mutex<HashMap<String, VecDeque<RenderError>>>,
    gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    per_name: Mutex<HashMap<String, usize>>,
    pub stats: Concurrency,
}

impl FakeRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// The next renders of `name` fail with these errors, in order.
    pub fn fail(&self, name: &str, errors: Vec<RenderError>) {
        self.failures
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .extend(errors);
    }

    /// Renders of `name` block until `open` is called.
    pub fn hold(&self, name: &str) {
        self.gates
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub fn open(&self, name: &str) {
        if let Some(gate) = self.gates.lock().unwrap().get(name) {
            gate.add_permits(1_000);
        }
    }

    pub fn calls(&self) -> usize {
        self.stats.calls()
    }

    pub fn calls_for(&self, name: &str) -> usize {
        self.per_name.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SlipRenderer for FakeRenderer {
    async fn render(&self, template: &SlipTemplate, data: &SlipData) -> Result<Vec<u8>, RenderError> {
        let filled = template.fill(data)?;
        let name = data.get("name").cloned().unwrap_or_default();
        *self.per_name.lock().unwrap().entry(name.clone()).or_default() += 1;
        let _in_flight = self.stats.enter();

        let gate = self.gates.lock().unwrap().get(&name).cloned();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&name)
            .and_then(|q| q.pop_front());
        match failure {
            Some(err) => Err(err),
            None => Ok(format!("PNG:{}", filled).into_bytes()),
        }
    }
}

/// Webhook double scripted per phone number; unscripted calls are confirmed.
pub struct FakeDelivery {
    pub delay: Duration,
    policy: RetryPolicy,
    script: Mutex<HashMap<String, VecDeque<AttemptOutcome>>>,
    pub sent: Mutex<Vec<DeliveryPayload>>,
    pub stats: Concurrency,
}

impl FakeDelivery {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            policy: fast_retry(3),
            script: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            stats: Concurrency::default(),
        }
    }

    pub fn script(&self, phone: &str, outcomes: Vec<AttemptOutcome>) {
        self.script
            .lock()
            .unwrap()
            .entry(phone.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn calls(&self) -> usize {
        self.stats.calls()
    }
}

#[async_trait]
impl SlipDelivery for FakeDelivery {
    async fn attempt(&self, payload: &DeliveryPayload) -> AttemptOutcome {
        let _in_flight = self.stats.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.sent.lock().unwrap().push(payload.clone());
        self.script
            .lock()
            .unwrap()
            .get_mut(&payload.phone)
            .and_then(|q| q.pop_front())
            .unwrap_or(AttemptOutcome::Confirmed {
                message: Some("queued".to_string()),
            })
    }

    fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
