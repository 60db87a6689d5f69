//! Redis pub/sub-backed notification bus (optional).
//!
//! Redis pub/sub is not durable: a subscriber that is disconnected misses
//! messages. That is acceptable here, because waiters re-read the job store on
//! every poll interval and only use notifications to wake up early.
//!
//! Each bus keeps a single Redis subscription, started on first `subscribe()`,
//! and fans messages out to its local subscribers in memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use redis::Commands;
use thiserror::Error;
use tracing::{debug, info, warn};

use asyncjob_events::{EventBus, InMemoryEventBus, JOB_STATE_TOPIC, JobNotification, Subscription};

/// How often the forwarder checks whether its bus is still alive.
const FORWARDER_POLL: Duration = Duration::from_secs(1);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(String),
    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Redis pub/sub bus for job notifications.
#[derive(Debug, Clone)]
pub struct RedisPubSubBus {
    client: redis::Client,
    channel: String,
    local: Arc<InMemoryEventBus<JobNotification>>,
    forwarding: Arc<AtomicBool>,
}

impl RedisPubSubBus {
    /// Bus on the default channel, named after the job-state topic.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisBusError> {
        Self::with_channel(redis_url, JOB_STATE_TOPIC)
    }

    pub fn with_channel(
        redis_url: impl AsRef<str>,
        channel: impl Into<String>,
    ) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            channel: channel.into(),
            local: Arc::new(InMemoryEventBus::new()),
            forwarding: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn ensure_forwarder(&self) {
        if self
            .forwarding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let client = self.client.clone();
        let channel = self.channel.clone();
        let local = Arc::downgrade(&self.local);
        let spawned = thread::Builder::new()
            .name(format!("redis-sub-{channel}"))
            .spawn(move || forward(&client, &channel, &local));
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn redis subscriber thread");
            self.forwarding.store(false, Ordering::Release);
        }
    }
}

impl EventBus<JobNotification> for RedisPubSubBus {
    type Error = RedisBusError;

    fn publish(&self, message: JobNotification) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message)
            .map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let _: i64 = conn
            .publish(&self.channel, payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        Ok(())
    }

    fn subscribe(&self) -> Subscription<JobNotification> {
        let subscription = self.local.subscribe();
        self.ensure_forwarder();
        subscription
    }
}

/// Forwarder thread body. Reconnects on failure and exits once every clone of
/// the bus is gone.
fn forward(client: &redis::Client, channel: &str, local: &Weak<InMemoryEventBus<JobNotification>>) {
    while local.strong_count() > 0 {
        match pump(client, channel, local) {
            Ok(()) => break,
            Err(e) => {
                warn!(channel = %channel, error = %e, "redis subscription lost, reconnecting");
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }
    debug!(channel = %channel, "redis forwarder stopped");
}

fn pump(
    client: &redis::Client,
    channel: &str,
    local: &Weak<InMemoryEventBus<JobNotification>>,
) -> redis::RedisResult<()> {
    let mut conn = client.get_connection()?;
    let mut pubsub = conn.as_pubsub();
    pubsub.subscribe(channel)?;
    pubsub.set_read_timeout(Some(FORWARDER_POLL))?;
    info!(channel = %channel, "subscribed to redis channel");

    loop {
        let msg = match pubsub.get_message() {
            Ok(m) => m,
            Err(e) if e.is_timeout() => {
                if local.strong_count() == 0 {
                    return Ok(());
                }
                continue;
            }
            Err(e) => return Err(e),
        };
        let Some(bus) = local.upgrade() else {
            return Ok(());
        };
        if let Ok(payload) = msg.get_payload::<String>() {
            deliver(&bus, channel, &payload);
        }
    }
}

fn deliver(bus: &InMemoryEventBus<JobNotification>, channel: &str, payload: &str) {
    match serde_json::from_str::<JobNotification>(payload) {
        Ok(notification) => {
            if let Err(e) = bus.publish(notification) {
                warn!(channel = %channel, error = %e, "local fan-out failed");
            }
        }
        Err(e) => debug!(channel = %channel, error = %e, "ignoring malformed notification"),
    }
}

#[cfg(test)]
mod tests {
    use asyncjob_core::{JobId, JobStatus};

    use super::*;

    #[test]
    fn rejects_malformed_url() {
        assert!(matches!(
            RedisPubSubBus::new("not a url"),
            Err(RedisBusError::Redis(_))
        ));
    }

    #[test]
    fn defaults_to_job_state_channel() {
        let bus = RedisPubSubBus::new("redis://127.0.0.1:6379").unwrap();
        assert_eq!(bus.channel(), JOB_STATE_TOPIC);
    }

    #[test]
    fn subscriptions_share_one_forwarder() {
        // Nothing listens on port 1; the forwarder just keeps retrying.
        let bus = RedisPubSubBus::new("redis://127.0.0.1:1").unwrap();
        let first = bus.subscribe();
        let second = bus.clone().subscribe();

        assert!(bus.forwarding.load(Ordering::Acquire));
        assert_eq!(bus.local.subscriber_count(), 2);
        assert!(first.try_recv().is_err());
        assert!(second.try_recv().is_err());
    }

    #[test]
    fn delivered_payloads_fan_out_locally() {
        let bus = InMemoryEventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        let note = JobNotification::job_state(JobId::new(7), JobStatus::Succeeded);

        deliver(&bus, "jobs", "not json");
        deliver(&bus, "jobs", &serde_json::to_string(&note).unwrap());

        assert_eq!(a.try_recv().unwrap(), note);
        assert_eq!(b.try_recv().unwrap(), note);
        assert!(a.try_recv().is_err());
    }
}
