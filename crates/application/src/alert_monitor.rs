//! §4.10 AlertMonitor: subscribes to the same ingestion topics, evaluates
//! each row's numeric fields against the configured thresholds, and
//! publishes one [`domain::alert::AlertNotice`] per violating row to the
//! alert topic at QoS 1.

use domain::alert::{check_thresholds, AlertNotice};
use domain::envelope::{extract_device_id, to_row};
use domain::{AlertConfig, BrokerConn, Snapshot};
use infrastructure::{BrokerHub, Handler};
use rumqttc::QoS;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct AlertMonitor {
    broker_hub: Arc<BrokerHub>,
}

impl AlertMonitor {
    pub fn new(broker_hub: Arc<BrokerHub>) -> Self {
        Self { broker_hub }
    }

    /// Tears down existing alert subscriptions and reinstalls them from
    /// `snapshot.alerts`. A no-op (after clearing) when alerting is disabled
    /// or no thresholds are configured.
    pub async fn rebuild(&self, snapshot: &Arc<Snapshot>) {
        self.broker_hub.clear_all().await;

        let alerts = &snapshot.alerts;
        if !alerts.enabled || alerts.thresholds.is_empty() {
            info!("alert monitor disabled or has no configured thresholds; no subscriptions installed");
            return;
        }

        let Some(conn) = snapshot.mqtt_servers.get(&alerts.mqtt_server).cloned() else {
            error!(mqtt_server = %alerts.mqtt_server, "alert monitor's mqtt_server is not configured; skipping");
            return;
        };

        let mut installed_filters = std::collections::BTreeSet::new();
        for threshold in &alerts.thresholds {
            if !installed_filters.insert(threshold.topic_filter.clone()) {
                continue;
            }
            if let Err(e) = self.install_filter(&conn, &threshold.topic_filter, alerts).await {
                error!(topic_filter = %threshold.topic_filter, error = %e, "failed to install alert subscription; skipping");
            }
        }
    }

    async fn install_filter(&self, conn: &BrokerConn, topic_filter: &str, alerts: &AlertConfig) -> anyhow::Result<()> {
        let thresholds = alerts.thresholds.clone();
        let alert_topic = alerts.alert_topic.clone();
        let publish_conn = conn.clone();
        let broker_hub = self.broker_hub.clone();

        let handler: Handler = Arc::new(move |topic, payload| {
            let thresholds = thresholds.clone();
            let alert_topic = alert_topic.clone();
            let publish_conn = publish_conn.clone();
            let broker_hub = broker_hub.clone();
            Box::pin(async move {
                let row = to_row(&topic, &payload);
                let relevant: Vec<_> =
                    thresholds.iter().filter(|t| domain::topic_matches(&t.topic_filter, &topic)).cloned().collect();
                if relevant.is_empty() {
                    return;
                }

                let violations = check_thresholds(&row, &relevant);
                if violations.is_empty() {
                    return;
                }

                let device_id = extract_device_id(&payload).unwrap_or_default();
                let notice = AlertNotice { timestamp: chrono::Utc::now(), topic: topic.clone(), device_id, violations };

                let body = match serde_json::to_vec(&notice) {
                    Ok(b) => b,
                    Err(e) => {
                        error!(error = %e, "failed to serialize alert notice");
                        return;
                    }
                };
                if let Err(e) = broker_hub.publish(&publish_conn, &alert_topic, QoS::AtLeastOnce, body).await {
                    error!(error = %e, topic = %topic, "failed to publish alert notice");
                } else {
                    warn!(topic = %topic, violation_count = notice.violations.len(), "alert published");
                }
            })
        });

        self.broker_hub.add_sub(conn, topic_filter, None, handler, QoS::AtLeastOnce).await
    }
}
