//! Test fixtures shared by the scheduler's unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use buildlane_config::{AgentConfig, SchedulerConfig};
use buildlane_core::{
    AgentEvent, BuildAgent, BuildAgentInformation, BuildConfig, BuildExecutor, BuildJob,
    BuildJobRequest, BuildOutcome, BuildStatus, DockerRunConfig, Error, JobId, RepositoryInfo,
    Result, StateStore,
};
use buildlane_db::MemoryBuildJobRepo;
use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentLifecycle, AgentRegistry};
use crate::completion::JobCompletion;
use crate::control::SchedulerControl;
use crate::dispatch::DispatchLoop;
use crate::notify::{AgentNotifier, Outbox};
use crate::pool::ExecutionPool;
use crate::store::MemoryStateStore;

/// Poll `$cond` until it holds, failing the test after five seconds.
macro_rules! wait_until {
    ($cond:expr) => {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if $cond {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect(concat!("timed out waiting for ", stringify!($cond)))
    };
}

pub const TEST_AGENT: &str = "agent-1";

pub fn request(name: &str, priority: i32) -> BuildJobRequest {
    BuildJobRequest {
        name: name.to_string(),
        participation_id: 42,
        course_id: 7,
        exercise_id: 3,
        priority,
        repository_info: RepositoryInfo {
            repository_name: format!("{}-repo", name),
            repository_uri: format!("https://git.example.org/{}.git", name),
            test_repository_uri: None,
            commit_hash: Some("0123abcd".to_string()),
            branch: "main".to_string(),
            triggered_by_push_to: Some("user".to_string()),
        },
        build_config: BuildConfig {
            docker_image: "ghcr.io/example/builder:latest".to_string(),
            build_script: "make test".to_string(),
            timeout_seconds: 60,
            docker_run_config: DockerRunConfig::default(),
        },
    }
}

pub fn job(name: &str, priority: i32, submitted: DateTime<Utc>) -> BuildJob {
    BuildJob::queued(request(name, priority), 60, submitted)
}

pub fn test_agent(name: &str) -> BuildAgent {
    BuildAgent::new(name, name, format!("Agent {}", name))
}

pub fn agent_config(name: &str, max_concurrent_builds: usize) -> AgentConfig {
    AgentConfig {
        short_name: name.to_string(),
        display_name: format!("Agent {}", name),
        address: name.to_string(),
        max_concurrent_builds,
        pause_after_consecutive_failures: 0,
        recent_build_jobs: 20,
    }
}

pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(20),
        shutdown_grace_period: Duration::from_millis(100),
        ..SchedulerConfig::default()
    }
}

/// Notifier that remembers what it was told.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<AgentEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentNotifier for RecordingNotifier {
    async fn notify(&self, event: &AgentEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum MockBehavior {
    Status(BuildStatus),
    Fail(String),
    /// Never finishes on its own.
    Hang,
}

/// Executor scripted per job name.
pub struct MockExecutor {
    behaviors: Mutex<HashMap<String, MockBehavior>>,
    default: Mutex<MockBehavior>,
    holding: AtomicBool,
    gate: Semaphore,
    started: Mutex<Vec<String>>,
    interrupted: Mutex<Vec<JobId>>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            default: Mutex::new(MockBehavior::Status(BuildStatus::Successful)),
            holding: AtomicBool::new(false),
            gate: Semaphore::new(0),
            started: Mutex::new(Vec::new()),
            interrupted: Mutex::new(Vec::new()),
        }
    }
}

impl MockExecutor {
    pub fn set_behavior(&self, name: &str, behavior: MockBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(name.to_string(), behavior);
    }

    pub fn set_default(&self, behavior: MockBehavior) {
        *self.default.lock().unwrap() = behavior;
    }

    /// Block every build until [`MockExecutor::release`] lets it through.
    pub fn hold(&self) {
        self.holding.store(true, Ordering::SeqCst);
    }

    pub fn release(&self, builds: usize) {
        self.gate.add_permits(builds);
    }

    /// Names of started builds, in start order.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn interrupted(&self) -> Vec<JobId> {
        self.interrupted.lock().unwrap().clone()
    }

    fn behavior(&self, name: &str) -> MockBehavior {
        let scripted = self.behaviors.lock().unwrap().get(name).cloned();
        scripted.unwrap_or_else(|| self.default.lock().unwrap().clone())
    }
}

#[async_trait]
impl BuildExecutor for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn run(&self, job: &BuildJob) -> Result<BuildOutcome> {
        self.started.lock().unwrap().push(job.name.clone());
        if self.holding.load(Ordering::SeqCst) {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| Error::Internal("gate closed".to_string()))?;
            permit.forget();
        }
        match self.behavior(&job.name) {
            MockBehavior::Status(BuildStatus::Successful) => Ok(BuildOutcome::successful()),
            MockBehavior::Status(BuildStatus::Failed) => {
                Ok(BuildOutcome::failed(Some(1), "tests failed"))
            }
            MockBehavior::Status(status) => Ok(BuildOutcome::with_status(status)),
            MockBehavior::Fail(message) => Err(Error::ExecutionFailed(message)),
            MockBehavior::Hang => std::future::pending().await,
        }
    }

    async fn interrupt(&self, job_id: JobId) -> Result<()> {
        self.interrupted.lock().unwrap().push(job_id);
        Ok(())
    }
}

/// One agent wired up against in-memory collaborators.
pub struct Harness {
    pub store: Arc<MemoryStateStore>,
    pub repo: Arc<MemoryBuildJobRepo>,
    pub executor: Arc<MockExecutor>,
    pub pool: Arc<ExecutionPool>,
    pub completion: Arc<JobCompletion>,
    pub lifecycle: Arc<AgentLifecycle>,
    pub registry: AgentRegistry,
    pub config: SchedulerConfig,
    events: Mutex<mpsc::UnboundedReceiver<AgentEvent>>,
}

impl Harness {
    pub async fn new(capacity: usize) -> Self {
        Self::with_threshold(capacity, 0).await
    }

    /// Harness whose agent pauses itself after `threshold` failures.
    pub async fn with_threshold(capacity: usize, threshold: u32) -> Self {
        let store = Arc::new(MemoryStateStore::new());
        let repo = Arc::new(MemoryBuildJobRepo::new());
        let executor = Arc::new(MockExecutor::default());
        let (outbox, events) = Outbox::new();
        let registry = AgentRegistry::new(store.clone(), outbox);

        let mut config = agent_config(TEST_AGENT, capacity);
        config.pause_after_consecutive_failures = threshold;
        let lifecycle = Arc::new(AgentLifecycle::new(registry.clone(), &config));
        lifecycle.register(Utc::now()).await.unwrap();

        let pool = Arc::new(ExecutionPool::new(executor.clone(), capacity));
        let completion = Arc::new(JobCompletion::new(
            store.clone(),
            repo.clone(),
            lifecycle.clone(),
        ));

        Self {
            store,
            repo,
            executor,
            pool,
            completion,
            lifecycle,
            registry,
            config: scheduler_config(),
            events: Mutex::new(events),
        }
    }

    pub async fn enqueue(&self, name: &str, priority: i32) -> JobId {
        let job = job(name, priority, Utc::now());
        let id = job.id;
        self.store.enqueue(job).await.unwrap();
        id
    }

    /// Enqueue a job and claim it for the local agent.
    pub async fn claim(&self, name: &str, priority: i32) -> BuildJob {
        self.enqueue(name, priority).await;
        let job = self
            .store
            .claim_next(self.lifecycle.agent(), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert!(self.lifecycle.record_claim(&job).await.unwrap());
        job
    }

    pub fn dispatch_loop(&self) -> DispatchLoop {
        DispatchLoop::new(
            self.store.clone(),
            self.lifecycle.clone(),
            self.pool.clone(),
            self.completion.clone(),
            &self.config,
        )
    }

    pub fn start_dispatch(&self) -> (CancellationToken, JoinHandle<Result<()>>) {
        let shutdown = CancellationToken::new();
        let dispatch = self.dispatch_loop();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { dispatch.run(token).await });
        (shutdown, handle)
    }

    pub fn control(&self) -> SchedulerControl {
        SchedulerControl::new(
            self.repo.clone(),
            self.registry.clone(),
            self.config.default_estimated_duration,
        )
    }

    pub async fn agent_info(&self) -> BuildAgentInformation {
        self.store.get_agent(TEST_AGENT).await.unwrap().unwrap()
    }

    pub fn drain_events(&self) -> Vec<AgentEvent> {
        let mut rx = self.events.lock().unwrap();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}
