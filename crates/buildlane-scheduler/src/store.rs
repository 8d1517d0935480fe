//! In-process cluster state store.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use buildlane_core::{BuildAgent, BuildAgentInformation, BuildJob, JobId, Result, StateStore};
use chrono::{DateTime, Utc};
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct State {
    /// Kept sorted in dispatch order.
    queue: Vec<BuildJob>,
    processing: HashMap<JobId, BuildJob>,
    agents: HashMap<String, BuildAgentInformation>,
    cancellations: BTreeSet<JobId>,
}

/// State store for a single process, guarded by one mutex.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<State>,
    queue_changed: Notify,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A wakeup for the next enqueue, armed before the caller looks at the
    /// queue so an enqueue in between is not missed.
    fn queue_listener(&self) -> Pin<Box<Notified<'_>>> {
        let mut listener = Box::pin(self.queue_changed.notified());
        listener.as_mut().enable();
        listener
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn enqueue(&self, job: BuildJob) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let pos = state
                .queue
                .partition_point(|queued| queued.dispatch_order(&job) != Ordering::Greater);
            state.queue.insert(pos, job);
        }
        self.queue_changed.notify_waiters();
        Ok(())
    }

    async fn peek_all(&self) -> Result<Vec<BuildJob>> {
        Ok(self.state.lock().await.queue.clone())
    }

    async fn remove_queued(&self, id: JobId) -> Result<Option<BuildJob>> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.queue.iter().position(|j| j.id == id) else {
            return Ok(None);
        };
        Ok(Some(state.queue.remove(pos)))
    }

    async fn claim_next(&self, agent: &BuildAgent, now: DateTime<Utc>) -> Result<Option<BuildJob>> {
        let mut state = self.state.lock().await;
        if state.queue.is_empty() {
            return Ok(None);
        }
        let claimed = state.queue.remove(0).claimed_by(agent.clone(), now);
        state.processing.insert(claimed.id, claimed.clone());
        Ok(Some(claimed))
    }

    async fn wait_for_queue(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.queue_changed.notified()).await;
    }

    async fn dequeue_blocking(
        &self,
        agent: &BuildAgent,
        timeout: Duration,
    ) -> Result<Option<BuildJob>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let listener = self.queue_listener();
            if let Some(job) = self.claim_next(agent, Utc::now()).await? {
                return Ok(Some(job));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, listener).await;
        }
    }

    async fn processing_jobs(&self) -> Result<Vec<BuildJob>> {
        Ok(self.state.lock().await.processing.values().cloned().collect())
    }

    async fn get_processing(&self, id: JobId) -> Result<Option<BuildJob>> {
        Ok(self.state.lock().await.processing.get(&id).cloned())
    }

    async fn put_processing(&self, job: BuildJob) -> Result<()> {
        self.state.lock().await.processing.insert(job.id, job);
        Ok(())
    }

    async fn put_processing_if_absent(&self, job: BuildJob) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.processing.contains_key(&job.id) {
            return Ok(false);
        }
        state.processing.insert(job.id, job);
        Ok(true)
    }

    async fn remove_processing(&self, id: JobId) -> Result<Option<BuildJob>> {
        Ok(self.state.lock().await.processing.remove(&id))
    }

    async fn remove_processing_if(&self, expected: &BuildJob) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.processing.get(&expected.id) != Some(expected) {
            return Ok(false);
        }
        state.processing.remove(&expected.id);
        Ok(true)
    }

    async fn replace_processing_if(&self, expected: &BuildJob, new: BuildJob) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.processing.get(&expected.id) != Some(expected) {
            return Ok(false);
        }
        state.processing.remove(&expected.id);
        state.processing.insert(new.id, new);
        Ok(true)
    }

    async fn agents(&self) -> Result<Vec<BuildAgentInformation>> {
        let state = self.state.lock().await;
        let mut agents: Vec<_> = state.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.agent.member_address.cmp(&b.agent.member_address));
        Ok(agents)
    }

    async fn get_agent(&self, member_address: &str) -> Result<Option<BuildAgentInformation>> {
        Ok(self.state.lock().await.agents.get(member_address).cloned())
    }

    async fn put_agent(&self, info: BuildAgentInformation) -> Result<()> {
        self.state
            .lock()
            .await
            .agents
            .insert(info.agent.member_address.clone(), info);
        Ok(())
    }

    async fn put_agent_if_absent(&self, info: BuildAgentInformation) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.agents.contains_key(&info.agent.member_address) {
            return Ok(false);
        }
        state.agents.insert(info.agent.member_address.clone(), info);
        Ok(true)
    }

    async fn remove_agent(&self, member_address: &str) -> Result<Option<BuildAgentInformation>> {
        Ok(self.state.lock().await.agents.remove(member_address))
    }

    async fn replace_agent_if(
        &self,
        expected: &BuildAgentInformation,
        new: BuildAgentInformation,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = &expected.agent.member_address;
        if state.agents.get(key) != Some(expected) {
            return Ok(false);
        }
        state.agents.insert(key.clone(), new);
        Ok(true)
    }

    async fn request_cancellation(&self, id: JobId) -> Result<()> {
        self.state.lock().await.cancellations.insert(id);
        Ok(())
    }

    async fn cancellation_requests(&self) -> Result<Vec<JobId>> {
        Ok(self.state.lock().await.cancellations.iter().copied().collect())
    }

    async fn clear_cancellation(&self, id: JobId) -> Result<()> {
        self.state.lock().await.cancellations.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{job, test_agent};
    use buildlane_core::{
        BuildStatus, PRIORITY_EXAM_CONDUCTION, PRIORITY_NORMAL, PRIORITY_OPTIONAL_EXERCISE,
    };
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_queue_orders_by_priority_then_submission() {
        let store = MemoryStateStore::new();
        let now = Utc::now();
        let optional = job("optional", PRIORITY_OPTIONAL_EXERCISE, now);
        let normal_late = job("normal-late", PRIORITY_NORMAL, now + ChronoDuration::seconds(2));
        let normal_early = job("normal-early", PRIORITY_NORMAL, now);
        let exam = job("exam", PRIORITY_EXAM_CONDUCTION, now + ChronoDuration::seconds(5));

        for j in [&optional, &normal_late, &normal_early, &exam] {
            store.enqueue(j.clone()).await.unwrap();
        }

        let names: Vec<_> = store
            .peek_all()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.name)
            .collect();
        assert_eq!(names, ["exam", "normal-early", "normal-late", "optional"]);
    }

    #[tokio::test]
    async fn test_claim_moves_job_to_processing() {
        let store = MemoryStateStore::new();
        let agent = test_agent("agent-1");
        let queued = job("a", PRIORITY_NORMAL, Utc::now());
        store.enqueue(queued.clone()).await.unwrap();

        let claimed = store.claim_next(&agent, Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.id, queued.id);
        assert_eq!(claimed.status, BuildStatus::Building);
        assert_eq!(claimed.agent.as_ref(), Some(&agent));
        assert!(store.peek_all().await.unwrap().is_empty());
        assert_eq!(store.get_processing(queued.id).await.unwrap(), Some(claimed));
    }

    #[tokio::test]
    async fn test_concurrent_claimers_get_one_job_once() {
        let store = Arc::new(MemoryStateStore::new());
        store
            .enqueue(job("only", PRIORITY_NORMAL, Utc::now()))
            .await
            .unwrap();

        let claims = (0..16).map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                let agent = test_agent(&format!("agent-{}", i));
                store.claim_next(&agent, Utc::now()).await.unwrap()
            })
        });
        let results = futures::future::join_all(claims).await;
        let winners = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(Option::is_some)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(store.processing_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conditional_processing_writes() {
        let store = MemoryStateStore::new();
        let agent = test_agent("agent-1");
        store
            .enqueue(job("a", PRIORITY_NORMAL, Utc::now()))
            .await
            .unwrap();
        let claimed = store.claim_next(&agent, Utc::now()).await.unwrap().unwrap();

        let mut changed = claimed.clone();
        changed.retry_count = 9;
        assert!(!store.remove_processing_if(&changed).await.unwrap());
        assert!(store.replace_processing_if(&claimed, changed.clone()).await.unwrap());
        assert!(!store.remove_processing_if(&claimed).await.unwrap());
        assert!(store.remove_processing_if(&changed).await.unwrap());
        assert!(store.get_processing(claimed.id).await.unwrap().is_none());
        assert!(store.put_processing_if_absent(claimed.clone()).await.unwrap());
        assert!(!store.put_processing_if_absent(claimed).await.unwrap());
    }

    #[tokio::test]
    async fn test_dequeue_blocking_wakes_on_enqueue() {
        let store = Arc::new(MemoryStateStore::new());
        let agent = test_agent("agent-1");

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .dequeue_blocking(&agent, std::time::Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        store
            .enqueue(job("late", PRIORITY_NORMAL, Utc::now()))
            .await
            .unwrap();

        let claimed = waiter.await.unwrap();
        assert_eq!(claimed.map(|j| j.name), Some("late".to_string()));
    }

    #[tokio::test]
    async fn test_enqueue_before_wait_still_wakes_listener() {
        let store = MemoryStateStore::new();
        let listener = store.queue_listener();
        store
            .enqueue(job("early", PRIORITY_NORMAL, Utc::now()))
            .await
            .unwrap();
        let woke = tokio::time::timeout(std::time::Duration::from_millis(100), listener).await;
        assert!(woke.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_blocking_claims_without_waiting_out_timeout() {
        let store = Arc::new(MemoryStateStore::new());
        let agent = test_agent("agent-1");
        let started = tokio::time::Instant::now();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .dequeue_blocking(&agent, std::time::Duration::from_secs(10))
                    .await
                    .unwrap()
            })
        };
        tokio::task::yield_now().await;
        store
            .enqueue(job("prompt", PRIORITY_NORMAL, Utc::now()))
            .await
            .unwrap();

        let claimed = waiter.await.unwrap();
        assert_eq!(claimed.map(|j| j.name), Some("prompt".to_string()));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_dequeue_blocking_times_out_empty() {
        let store = MemoryStateStore::new();
        let agent = test_agent("agent-1");
        let claimed = store
            .dequeue_blocking(&agent, std::time::Duration::from_millis(20))
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_requests_are_a_set() {
        let store = MemoryStateStore::new();
        let id = JobId::new();
        store.request_cancellation(id).await.unwrap();
        store.request_cancellation(id).await.unwrap();
        assert_eq!(store.cancellation_requests().await.unwrap(), vec![id]);
        store.clear_cancellation(id).await.unwrap();
        assert!(store.cancellation_requests().await.unwrap().is_empty());
    }
}
