//! Alert checking on top of the query service
//!
//! An alert is a stored SQL query against a user connection. It is met
//! when its query returns at least one row. Scheduling the sweep and
//! formatting notifications are left to the caller; delivery goes through
//! an [`AlertNotifier`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::descriptor::ConnectionDescriptor;
use crate::error::DatabaseError;
use crate::service::QueryService;
use crate::types::Row;

/// A stored condition to re-check against a live database
#[derive(Debug, Clone, Deserialize)]
pub struct Alert {
    pub id: String,
    /// Natural-language question the SQL was generated from
    pub prompt: String,
    pub sql_query: String,
    pub connection: ConnectionDescriptor,
    #[serde(default)]
    pub notification_emails: Vec<String>,
    /// No checks happen at or after this instant
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date.is_some_and(|expires| now >= expires)
    }
}

/// Delivery of met alerts
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &Alert, rows: &[Row]) -> anyhow::Result<()>;
}

/// Counters of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertSweep {
    /// Alerts whose query ran
    pub checked: usize,
    /// Alerts met and notified
    pub triggered: usize,
    /// Expired alerts
    pub skipped: usize,
    /// Alerts whose query or notification failed
    pub failed: usize,
}

/// Runs alert queries and notifies on met conditions
pub struct AlertChecker<N> {
    service: QueryService,
    notifier: N,
}

impl<N: AlertNotifier> AlertChecker<N> {
    pub fn new(service: QueryService, notifier: N) -> Self {
        Self { service, notifier }
    }

    /// Run the alert's query; `Some(rows)` when the condition is met
    pub async fn check(&self, alert: &Alert) -> Result<Option<Vec<Row>>, DatabaseError> {
        let result = self.service.run(&alert.connection, &alert.sql_query).await?;
        let rows = result.rows();
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows.to_vec()))
        }
    }

    /// Check every alert in order; a failing alert is logged and counted
    pub async fn check_all(&self, alerts: &[Alert], now: DateTime<Utc>) -> AlertSweep {
        let mut sweep = AlertSweep::default();

        for alert in alerts {
            if alert.is_expired(now) {
                log::debug!("Skipping expired alert {}", alert.id);
                sweep.skipped += 1;
                continue;
            }

            let rows = match self.check(alert).await {
                Ok(rows) => rows,
                Err(e) => {
                    log::warn!("Alert {} check failed: {}", alert.id, e.public_message());
                    sweep.failed += 1;
                    continue;
                }
            };
            sweep.checked += 1;

            let Some(rows) = rows else {
                continue;
            };

            match self.notifier.notify(alert, &rows).await {
                Ok(()) => {
                    log::info!(
                        "Alert {} met with {} rows; notified {} recipients",
                        alert.id,
                        rows.len(),
                        alert.notification_emails.len()
                    );
                    sweep.triggered += 1;
                }
                Err(e) => {
                    log::warn!("Alert {} notification failed: {:#}", alert.id, e);
                    sweep.failed += 1;
                }
            }
        }

        sweep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionSettings, PoolSettings};
    use crate::connection::{ConnectionResolver, PoolCache};
    use crate::engine::EngineRegistry;
    use crate::engine::testing::FakeDriver;
    use crate::types::{DatabaseType, QueryResult, SchemaDescription};
    use chrono::Duration;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingNotifier {
        notified: Mutex<Vec<(String, usize)>>,
        fail_for: Option<String>,
    }

    #[async_trait]
    impl AlertNotifier for Arc<RecordingNotifier> {
        async fn notify(&self, alert: &Alert, rows: &[Row]) -> anyhow::Result<()> {
            if self.fail_for.as_deref() == Some(alert.id.as_str()) {
                anyhow::bail!("smtp unavailable");
            }
            self.notified
                .lock()
                .unwrap()
                .push((alert.id.clone(), rows.len()));
            Ok(())
        }
    }

    /// Queries mentioning `low_stock` return one row, `broken` fails, the rest are empty
    fn service() -> QueryService {
        let driver = FakeDriver::with_responder(
            DatabaseType::Postgres,
            SchemaDescription::default(),
            |sql| {
                if sql.contains("broken") {
                    Err(DatabaseError::QueryError("syntax error".to_string()))
                } else if sql.contains("low_stock") {
                    let mut row = Row::new();
                    row.insert("name".to_string(), serde_json::json!("widget"));
                    Ok(QueryResult::Rows(vec![row]))
                } else {
                    Ok(QueryResult::Rows(vec![]))
                }
            },
        );
        let mut registry = EngineRegistry::new();
        registry.register(Arc::new(driver));
        QueryService::new(ConnectionResolver::new(
            Arc::new(PoolCache::new()),
            Arc::new(registry),
            PoolSettings::default(),
            ExecutionSettings::default(),
        ))
    }

    fn alert(id: &str, sql: &str, expiration_date: Option<DateTime<Utc>>) -> Alert {
        Alert {
            id: id.to_string(),
            prompt: "Which products are running low?".to_string(),
            sql_query: sql.to_string(),
            connection: ConnectionDescriptor::new(
                DatabaseType::Postgres,
                "localhost",
                5432,
                "postgres",
                "secret",
                "test_db",
            ),
            notification_emails: vec!["ops@example.com".to_string()],
            expiration_date,
        }
    }

    #[tokio::test]
    async fn sweep_counts_each_outcome() {
        let now = Utc::now();
        let notifier = Arc::new(RecordingNotifier::default());
        let checker = AlertChecker::new(service(), notifier.clone());

        let alerts = vec![
            alert("met", "SELECT * FROM low_stock", None),
            alert("quiet", "SELECT * FROM products WHERE stock < 0", None),
            alert("expired", "SELECT * FROM low_stock", Some(now - Duration::hours(1))),
            alert("bad", "SELECT broken", Some(now + Duration::hours(1))),
        ];

        let sweep = checker.check_all(&alerts, now).await;
        assert_eq!(
            sweep,
            AlertSweep {
                checked: 2,
                triggered: 1,
                skipped: 1,
                failed: 1,
            }
        );
        assert_eq!(
            *notifier.notified.lock().unwrap(),
            vec![("met".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn notifier_failure_does_not_stop_the_sweep() {
        let notifier = Arc::new(RecordingNotifier {
            fail_for: Some("first".to_string()),
            ..RecordingNotifier::default()
        });
        let checker = AlertChecker::new(service(), notifier.clone());

        let alerts = vec![
            alert("first", "SELECT * FROM low_stock", None),
            alert("second", "```sql\nSELECT * FROM low_stock\n```", None),
        ];

        let sweep = checker.check_all(&alerts, Utc::now()).await;
        assert_eq!(sweep.failed, 1);
        assert_eq!(sweep.triggered, 1);
        assert_eq!(
            *notifier.notified.lock().unwrap(),
            vec![("second".to_string(), 1)]
        );
    }

    #[test]
    fn expiry_is_inclusive() {
        let now = Utc::now();
        assert!(alert("a", "SELECT 1", Some(now)).is_expired(now));
        assert!(!alert("a", "SELECT 1", None).is_expired(now));
    }

    #[test]
    fn deserializes_stored_alert() {
        let alert: Alert = serde_json::from_value(serde_json::json!({
            "id": "665f1c",
            "prompt": "Orders over 1000 today",
            "sql_query": "SELECT * FROM orders WHERE total > 1000",
            "connection": {
                "db_type": "postgresql",
                "username": "app",
                "password": "pw",
                "host": "db",
                "port": 5432,
                "database_name": "sales"
            },
            "expiration_date": "2030-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(alert.notification_emails.is_empty());
        assert!(!alert.is_expired(Utc::now()));
    }
}
