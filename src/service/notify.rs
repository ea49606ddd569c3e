//! Change notification hub
//!
//! Every committed mutation is broadcast once; subscribers filter by the
//! session or student they care about.

use crate::attendance::TrustScore;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

const HUB_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    SessionStarted,
    SessionEnded,
    CheckedIn,
    PeerVerified,
    BiometricRecorded,
    OverrideSet,
    OverrideCleared,
    Recomputed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub session_id: String,
    pub student_id: Option<String>,
    pub trust_score: Option<TrustScore>,
    pub at: DateTime<Utc>,
}

/// What a subscriber listens to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Session(String),
    Student(String),
}

impl Topic {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            Topic::Session(id) => &event.session_id == id,
            Topic::Student(id) => event.student_id.as_deref() == Some(id.as_str()),
        }
    }
}

#[derive(Clone)]
pub struct ChangeHub {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        Subscription {
            topic,
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Wait for the next matching event; `None` once the hub is gone
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.topic.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscriber for {:?} lagged, {} events dropped", self.topic, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already buffered, without waiting
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.topic.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Subscriber for {:?} lagged, {} events dropped", self.topic, skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain every matching event currently buffered
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: ChangeKind, session: &str, student: Option<&str>) -> ChangeEvent {
        ChangeEvent {
            kind,
            session_id: session.into(),
            student_id: student.map(str::to_string),
            trust_score: None,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_topic_filtering() {
        let hub = ChangeHub::new();
        let mut by_session = hub.subscribe(Topic::Session("s1".into()));
        let mut by_student = hub.subscribe(Topic::Student("alice".into()));

        hub.publish(event(ChangeKind::SessionStarted, "s1", None));
        hub.publish(event(ChangeKind::CheckedIn, "s1", Some("alice")));
        hub.publish(event(ChangeKind::CheckedIn, "s2", Some("alice")));
        hub.publish(event(ChangeKind::CheckedIn, "s2", Some("bob")));

        assert_eq!(by_session.drain().len(), 2);
        let alice = by_student.drain();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|e| e.kind == ChangeKind::CheckedIn));
    }

    #[tokio::test]
    async fn test_async_recv() {
        let hub = ChangeHub::new();
        let mut sub = hub.subscribe(Topic::Session("s1".into()));
        let publisher = hub.clone();
        tokio::spawn(async move {
            publisher.publish(event(ChangeKind::SessionEnded, "s1", None));
        });
        let got = sub.recv().await.unwrap();
        assert_eq!(got.kind, ChangeKind::SessionEnded);
    }
}
