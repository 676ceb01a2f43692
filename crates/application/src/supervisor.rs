//! §4.9 Supervisor: wires ConfigSource snapshots to BrokerHub subscriptions,
//! rebuilding them from scratch on every config change. Per-route failures
//! are logged and do not prevent the remaining routes from installing,
//! mirroring `ConfigManager::handle_reload`'s isolate-and-continue loop.

use crate::router::Router;
use domain::envelope::extract_device_id;
use domain::{Route, Rule, Snapshot};
use infrastructure::messaging::Handler;
use infrastructure::BrokerHub;
use rumqttc::QoS;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct Supervisor {
    broker_hub: Arc<BrokerHub>,
    router: Arc<Router>,
}

impl Supervisor {
    pub fn new(broker_hub: Arc<BrokerHub>, router: Arc<Router>) -> Self {
        Self { broker_hub, router }
    }

    /// Tears down every existing subscription and reinstalls one per route
    /// (and per device rule within it) from `snapshot`. Called once at
    /// startup and again on every successful config reload.
    pub async fn rebuild(&self, snapshot: &Arc<Snapshot>) {
        self.broker_hub.clear_all().await;

        for route in &snapshot.routes {
            if let Err(e) = self.install_route(route, snapshot).await {
                error!(topic = %route.topic, mqtt_server = %route.mqtt_server, error = %e, "failed to install route; skipping");
                continue;
            }
            info!(topic = %route.topic, mqtt_server = %route.mqtt_server, "route installed");
        }
    }

    /// A reload callback suitable for [`infrastructure::ConfigSource::subscribe`].
    pub fn reload_callback(self: &Arc<Self>) -> infrastructure::ReloadCallback {
        let supervisor = self.clone();
        Box::new(move |snapshot: Arc<Snapshot>| {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.rebuild(&snapshot).await });
        })
    }

    async fn install_route(&self, route: &Route, snapshot: &Arc<Snapshot>) -> anyhow::Result<()> {
        let conn = snapshot
            .mqtt_servers
            .get(&route.mqtt_server)
            .ok_or_else(|| anyhow::anyhow!("unknown mqtt_server '{}'", route.mqtt_server))?
            .clone();

        if route.device_ids.is_empty() {
            self.install_handler(&conn, route, None, snapshot).await?;
            return Ok(());
        }

        for rule in &route.device_ids {
            self.install_handler(&conn, route, Some(rule), snapshot).await?;
        }
        Ok(())
    }

    /// Installs one subscription at `route.topic`, bound to `rule`'s device
    /// pattern (or the wildcard, for `rule: None` / `rule.pattern == "*"`).
    /// The handler re-checks the device binding against the decoded payload
    /// before routing, so two handlers sharing a topic filter (one specific,
    /// one wildcard) never both act on the same message — BrokerHub's
    /// specific-suppresses-wildcard rule already drops the wildcard
    /// candidate whenever a specific one is also registered for that topic.
    async fn install_handler(
        &self,
        conn: &domain::BrokerConn,
        route: &Route,
        rule: Option<&Rule>,
        snapshot: &Arc<Snapshot>,
    ) -> anyhow::Result<()> {
        let device_binding = rule.map(|r| r.pattern.clone()).filter(|p| p != "*");
        let router = self.router.clone();
        let rule_owned: Option<Rule> = rule.cloned();
        let patterns = snapshot.patterns.clone();
        let topic = route.topic.clone();

        let handler: Handler = Arc::new(move |msg_topic, payload| {
            let router = router.clone();
            let rule_owned = rule_owned.clone();
            let patterns = patterns.clone();
            Box::pin(async move {
                if let Some(rule) = &rule_owned {
                    if rule.pattern != "*" {
                        let device_id = extract_device_id(&payload);
                        if device_id.as_deref() != Some(rule.pattern.as_str()) {
                            return;
                        }
                    }
                }
                match router.route(&msg_topic, &payload, rule_owned.as_ref(), &patterns).await {
                    Ok(outcome) => {
                        tracing::debug!(topic = %msg_topic, table = %outcome.table, pattern = %outcome.pattern_name, baseline = outcome.baseline, "message routed");
                    }
                    Err(e) => {
                        warn!(topic = %msg_topic, error = %e, "routing failed for message");
                    }
                }
            })
        });

        self.broker_hub.add_sub(conn, &topic, device_binding.as_deref(), handler, QoS::AtLeastOnce).await
    }
}
