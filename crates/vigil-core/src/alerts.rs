use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Bound on retained alert history. Older alerts are evicted, not archived.
pub const MAX_RECENT_ALERTS: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: u64,
    pub camera_id: String,
    pub camera_name: String,
    pub threat_class: String,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
}

type Observer = Box<dyn Fn(&Alert) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct CoordinatorState {
    next_id: u64,
    ledger: HashMap<String, Instant>,
    history: VecDeque<Alert>,
}

/// Serializes alert decisions across every camera loop. Identifier
/// assignment, the cooldown ledger and the history ring share one lock, so
/// concurrent threats can never race into duplicate ids or a torn history.
pub struct AlertCoordinator {
    cooldown: Duration,
    state: Mutex<CoordinatorState>,
    observers: RwLock<Vec<Observer>>,
}

impl AlertCoordinator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            state: Mutex::new(CoordinatorState::default()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register a fan-out callback. Setup-time only; there is no removal.
    pub async fn register_observer<F>(&self, observer: F)
    where
        F: Fn(&Alert) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.observers.write().await.push(Box::new(observer));
    }

    /// Accept or suppress a threat observation. At most one alert per
    /// camera per cooldown window; only the first qualifying threat in the
    /// window is reported, whatever its class.
    pub async fn check_and_alert(
        &self,
        camera_id: &str,
        camera_name: &str,
        threat_class: &str,
        confidence: f32,
    ) -> Option<Alert> {
        self.check_and_alert_at(
            camera_id,
            camera_name,
            threat_class,
            confidence,
            Instant::now(),
            Utc::now(),
        )
        .await
    }

    async fn check_and_alert_at(
        &self,
        camera_id: &str,
        camera_name: &str,
        threat_class: &str,
        confidence: f32,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Option<Alert> {
        let alert = {
            let mut state = self.state.lock().await;

            if let Some(last) = state.ledger.get(camera_id) {
                if now.duration_since(*last) < self.cooldown {
                    debug!(camera = %camera_id, threat = %threat_class, "alert suppressed by cooldown");
                    return None;
                }
            }

            state.next_id += 1;
            let alert = Alert {
                id: state.next_id,
                camera_id: camera_id.to_string(),
                camera_name: camera_name.to_string(),
                threat_class: threat_class.to_string(),
                confidence,
                created_at: wall,
                acknowledged: false,
            };
            state.history.push_back(alert.clone());
            if state.history.len() > MAX_RECENT_ALERTS {
                state.history.pop_front();
            }
            state.ledger.insert(camera_id.to_string(), now);
            alert
        };

        info!(
            alert_id = alert.id,
            camera = %alert.camera_id,
            threat = %alert.threat_class,
            confidence = alert.confidence,
            "alert raised"
        );

        // Fan-out happens outside the state lock; observers may query the
        // coordinator. A failing observer never affects the others.
        let observers = self.observers.read().await;
        for observer in observers.iter() {
            if let Err(err) = observer(&alert) {
                warn!(alert_id = alert.id, error = %err, "alert observer failed");
            }
        }

        Some(alert)
    }

    /// Up to `count` most recent alerts, most recent first.
    pub async fn recent_alerts(&self, count: usize) -> Vec<Alert> {
        let state = self.state.lock().await;
        state.history.iter().rev().take(count).cloned().collect()
    }

    /// Idempotent. Returns false for ids that are unknown or already
    /// evicted from the history ring.
    pub async fn acknowledge(&self, id: u64) -> bool {
        let mut state = self.state.lock().await;
        match state.history.iter_mut().find(|alert| alert.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub async fn active_alert_count(&self) -> usize {
        let state = self.state.lock().await;
        state.history.iter().filter(|alert| !alert.acknowledged).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const COOLDOWN: Duration = Duration::from_secs(10);

    fn coordinator() -> AlertCoordinator {
        AlertCoordinator::new(COOLDOWN)
    }

    async fn alert_at(
        coordinator: &AlertCoordinator,
        camera: &str,
        threat: &str,
        confidence: f32,
        now: Instant,
    ) -> Option<Alert> {
        coordinator
            .check_and_alert_at(camera, "Test Camera", threat, confidence, now, Utc::now())
            .await
    }

    #[tokio::test]
    async fn cooldown_accepts_only_first_threat_in_window() {
        let coordinator = coordinator();
        let base = Instant::now();

        let first = alert_at(&coordinator, "cam-a", "knife", 0.8, base).await;
        assert!(first.is_some());

        let within = alert_at(&coordinator, "cam-a", "knife", 0.6, base + Duration::from_secs(5)).await;
        assert!(within.is_none());

        let recent = coordinator.recent_alerts(1).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].confidence, 0.8);

        let after = alert_at(&coordinator, "cam-a", "knife", 0.7, base + Duration::from_secs(11)).await;
        let after = after.expect("window elapsed");
        assert_eq!(after.id, 2);

        // Ledger moved to t=11: t=12 is inside the new window.
        let again = alert_at(&coordinator, "cam-a", "knife", 0.9, base + Duration::from_secs(12)).await;
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn different_threat_class_is_still_suppressed() {
        let coordinator = coordinator();
        let base = Instant::now();

        assert!(alert_at(&coordinator, "cam-a", "knife", 0.8, base).await.is_some());
        assert!(alert_at(&coordinator, "cam-a", "scissors", 0.9, base + Duration::from_secs(1))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn spacing_beyond_cooldown_accepts_every_observation() {
        let coordinator = coordinator();
        let base = Instant::now();

        for step in 0..3_u64 {
            let at = base + Duration::from_secs(step * 11);
            assert!(alert_at(&coordinator, "cam-a", "knife", 0.8, at).await.is_some());
        }
        assert_eq!(coordinator.recent_alerts(10).await.len(), 3);
    }

    #[tokio::test]
    async fn cameras_do_not_share_cooldown_windows() {
        let coordinator = coordinator();
        let base = Instant::now();

        assert!(alert_at(&coordinator, "cam-a", "knife", 0.8, base).await.is_some());
        assert!(alert_at(&coordinator, "cam-b", "knife", 0.8, base).await.is_some());
    }

    #[tokio::test]
    async fn concurrent_alerts_get_distinct_increasing_ids() {
        let coordinator = Arc::new(coordinator());

        let mut tasks = Vec::new();
        for n in 0..16 {
            let coordinator = coordinator.clone();
            tasks.push(tokio::spawn(async move {
                coordinator
                    .check_and_alert(&format!("cam-{n}"), "Test Camera", "knife", 0.8)
                    .await
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            let alert = task.await.expect("join").expect("accepted");
            ids.push(alert.id);
        }

        ids.sort_unstable();
        let expected: Vec<u64> = (1..=16).collect();
        assert_eq!(ids, expected, "no collisions, no gaps");
    }

    #[tokio::test]
    async fn history_keeps_only_most_recent_hundred() {
        let coordinator = coordinator();
        let base = Instant::now();

        for n in 1..=120_u64 {
            // Distinct cameras sidestep the cooldown.
            let accepted = alert_at(&coordinator, &format!("cam-{n}"), "knife", 0.8, base).await;
            assert!(accepted.is_some());
        }

        let recent = coordinator.recent_alerts(200).await;
        assert_eq!(recent.len(), MAX_RECENT_ALERTS);
        assert_eq!(recent[0].id, 120);
        assert_eq!(recent[99].id, 21);

        let top_five: Vec<u64> = coordinator.recent_alerts(5).await.iter().map(|a| a.id).collect();
        assert_eq!(top_five, vec![120, 119, 118, 117, 116]);

        // Evicted alerts are unrecoverable, including for acknowledgment.
        assert!(!coordinator.acknowledge(1).await);
    }

    #[tokio::test]
    async fn acknowledge_is_idempotent_and_strict_about_ids() {
        let coordinator = coordinator();
        let base = Instant::now();

        let alert = alert_at(&coordinator, "cam-a", "knife", 0.8, base)
            .await
            .expect("accepted");

        assert!(!coordinator.acknowledge(alert.id + 100).await);
        assert_eq!(coordinator.active_alert_count().await, 1);

        assert!(coordinator.acknowledge(alert.id).await);
        assert!(coordinator.acknowledge(alert.id).await);

        let recent = coordinator.recent_alerts(1).await;
        assert!(recent[0].acknowledged);
        assert_eq!(coordinator.active_alert_count().await, 0);
    }

    #[tokio::test]
    async fn failing_observer_does_not_abort_acceptance_or_peers() {
        let coordinator = coordinator();
        let called = Arc::new(AtomicUsize::new(0));

        coordinator
            .register_observer(|_alert| Err(anyhow::anyhow!("sink offline")))
            .await;
        {
            let called = called.clone();
            coordinator
                .register_observer(move |_alert| {
                    called.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
        }

        let accepted = coordinator
            .check_and_alert("cam-a", "Test Camera", "knife", 0.8)
            .await;
        assert!(accepted.is_some());
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }
}
