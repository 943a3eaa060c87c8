//! Per-job event bus
//!
//! Each job owns a channel holding its full log history plus a broadcast
//! sender for live fan-out. Appends and broadcasts happen under one per-job
//! lock, and `subscribe` snapshots history under the same lock, so a
//! subscriber's replay and its live tail never overlap or leave a gap.

use quay_core::{JobEvent, JobId, JobStatus, LogEntry, LogLevel};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::warn;

/// Buffered live events per subscriber before lagging ones drop entries
const CHANNEL_CAPACITY: usize = 1024;

struct Channel {
    entries: Vec<LogEntry>,
    status: JobStatus,
    sender: broadcast::Sender<JobEvent>,
}

/// Everything a new viewer needs: the backlog, the status at attach time,
/// and a live receiver whose first event follows the backlog directly
pub struct Subscription {
    pub backlog: Vec<LogEntry>,
    pub status: JobStatus,
    pub receiver: broadcast::Receiver<JobEvent>,
}

/// Publish/subscribe hub for all jobs of one engine instance
pub struct EventBus {
    channels: RwLock<HashMap<JobId, Arc<Mutex<Channel>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Create the channel for a job. Idempotent; an existing channel keeps
    /// its history.
    pub async fn register(&self, job_id: JobId) {
        let mut channels = self.channels.write().await;
        channels.entry(job_id).or_insert_with(|| {
            let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
            Arc::new(Mutex::new(Channel {
                entries: Vec::new(),
                status: JobStatus::Idle,
                sender,
            }))
        });
    }

    async fn channel(&self, job_id: &JobId) -> Option<Arc<Mutex<Channel>>> {
        self.channels.read().await.get(job_id).cloned()
    }

    /// Append a log entry to the job's history and broadcast it live
    pub async fn append_log(&self, job_id: JobId, message: impl Into<String>, level: LogLevel) {
        let Some(channel) = self.channel(&job_id).await else {
            warn!(job_id = %job_id, "append_log for unregistered job");
            return;
        };
        let entry = LogEntry::new(message, level);
        let event = JobEvent::from(&entry);
        let mut chan = channel.lock().await;
        chan.entries.push(entry);
        let _ = chan.sender.send(event);
    }

    /// Record the job's current status and broadcast the change live
    pub async fn update_status(&self, job_id: JobId, status: JobStatus) {
        let Some(channel) = self.channel(&job_id).await else {
            warn!(job_id = %job_id, "update_status for unregistered job");
            return;
        };
        let mut chan = channel.lock().await;
        chan.status = status;
        let _ = chan.sender.send(JobEvent::status(status));
    }

    /// Attach a viewer. Returns `None` for unknown (or evicted) jobs.
    pub async fn subscribe(&self, job_id: JobId) -> Option<Subscription> {
        let channel = self.channel(&job_id).await?;
        let chan = channel.lock().await;
        Some(Subscription {
            backlog: chan.entries.clone(),
            status: chan.status,
            receiver: chan.sender.subscribe(),
        })
    }

    /// Live subscribers for a job; zero for unknown ids
    pub async fn subscriber_count(&self, job_id: &JobId) -> usize {
        match self.channel(job_id).await {
            Some(channel) => channel.lock().await.sender.receiver_count(),
            None => 0,
        }
    }

    /// Drop a job's channel and its retained history
    pub async fn remove(&self, job_id: &JobId) {
        self.channels.write().await.remove(job_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backlog_replayed_to_late_subscriber() {
        let bus = EventBus::new();
        let job_id = JobId::new();
        bus.register(job_id).await;

        bus.append_log(job_id, "first", LogLevel::Info).await;
        bus.append_log(job_id, "second", LogLevel::Warning).await;

        let sub = bus.subscribe(job_id).await.unwrap();
        assert_eq!(sub.backlog.len(), 2);
        assert_eq!(sub.backlog[0].message, "first");
        assert_eq!(sub.backlog[1].message, "second");
        assert_eq!(sub.backlog[1].level, LogLevel::Warning);
        assert_eq!(sub.status, JobStatus::Idle);
    }

    #[tokio::test]
    async fn test_live_events_arrive_in_append_order() {
        let bus = EventBus::new();
        let job_id = JobId::new();
        bus.register(job_id).await;

        let mut sub = bus.subscribe(job_id).await.unwrap();
        bus.append_log(job_id, "one", LogLevel::Info).await;
        bus.update_status(job_id, JobStatus::Building).await;
        bus.append_log(job_id, "two", LogLevel::Info).await;

        assert_eq!(
            sub.receiver.recv().await.unwrap(),
            JobEvent::log("one", LogLevel::Info)
        );
        assert_eq!(
            sub.receiver.recv().await.unwrap(),
            JobEvent::status(JobStatus::Building)
        );
        assert_eq!(
            sub.receiver.recv().await.unwrap(),
            JobEvent::log("two", LogLevel::Info)
        );
    }

    #[tokio::test]
    async fn test_all_subscribers_observe_the_same_sequence() {
        let bus = EventBus::new();
        let job_id = JobId::new();
        bus.register(job_id).await;

        bus.append_log(job_id, "e1", LogLevel::Info).await;
        let mut early = bus.subscribe(job_id).await.unwrap();
        bus.append_log(job_id, "e2", LogLevel::Info).await;
        let mut late = bus.subscribe(job_id).await.unwrap();
        bus.append_log(job_id, "e3", LogLevel::Info).await;

        let mut early_seen: Vec<String> =
            early.backlog.iter().map(|e| e.message.clone()).collect();
        while early_seen.len() < 3 {
            if let JobEvent::Log { message, .. } = early.receiver.recv().await.unwrap() {
                early_seen.push(message);
            }
        }

        let mut late_seen: Vec<String> = late.backlog.iter().map(|e| e.message.clone()).collect();
        while late_seen.len() < 3 {
            if let JobEvent::Log { message, .. } = late.receiver.recv().await.unwrap() {
                late_seen.push(message);
            }
        }

        assert_eq!(early_seen, vec!["e1", "e2", "e3"]);
        assert_eq!(late_seen, early_seen);
    }

    #[tokio::test]
    async fn test_subscription_carries_current_status() {
        let bus = EventBus::new();
        let job_id = JobId::new();
        bus.register(job_id).await;

        bus.update_status(job_id, JobStatus::Deploying).await;
        let sub = bus.subscribe(job_id).await.unwrap();
        assert_eq!(sub.status, JobStatus::Deploying);
    }

    #[tokio::test]
    async fn test_history_retained_after_subscriber_drops() {
        let bus = EventBus::new();
        let job_id = JobId::new();
        bus.register(job_id).await;

        bus.append_log(job_id, "kept", LogLevel::Info).await;
        {
            let _sub = bus.subscribe(job_id).await.unwrap();
        }
        assert_eq!(bus.subscriber_count(&job_id).await, 0);

        let sub = bus.subscribe(job_id).await.unwrap();
        assert_eq!(sub.backlog.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_drops_channel() {
        let bus = EventBus::new();
        let job_id = JobId::new();
        bus.register(job_id).await;
        bus.append_log(job_id, "gone", LogLevel::Info).await;

        bus.remove(&job_id).await;
        assert!(bus.subscribe(job_id).await.is_none());
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let bus = EventBus::new();
        let job_id = JobId::new();
        bus.register(job_id).await;
        bus.append_log(job_id, "survives", LogLevel::Info).await;
        bus.register(job_id).await;

        let sub = bus.subscribe(job_id).await.unwrap();
        assert_eq!(sub.backlog.len(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_job_append_is_dropped() {
        let bus = EventBus::new();
        bus.append_log(JobId::new(), "nowhere", LogLevel::Info).await;
        assert!(bus.subscribe(JobId::new()).await.is_none());
    }
}
