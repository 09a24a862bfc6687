//! Health check contract.
//!
//! `unhealthy` when the store cannot be queried, `degraded` when it holds no
//! items yet, `healthy` otherwise. Served by `fh health` and `GET /health`.

use serde::Serialize;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::store::ItemStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthChecks {
    pub database: CheckResult,
    pub items: CheckResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: &'static str,
    pub item_count: i64,
    pub failure_count: i64,
    pub checks: HealthChecks,
}

impl HealthReport {
    fn unreachable(error: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            version: env!("CARGO_PKG_VERSION"),
            item_count: 0,
            failure_count: 0,
            checks: HealthChecks {
                database: CheckResult {
                    ok: false,
                    detail: Some(error),
                },
                items: CheckResult {
                    ok: false,
                    detail: None,
                },
            },
        }
    }
}

pub async fn check_health(pool: &SqlitePool) -> HealthReport {
    let stats = match ItemStore::new(pool.clone()).stats().await {
        Ok(stats) => stats,
        Err(e) => return HealthReport::unreachable(e.to_string()),
    };

    let has_items = stats.total_items > 0;
    HealthReport {
        status: if has_items {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        },
        version: env!("CARGO_PKG_VERSION"),
        item_count: stats.total_items,
        failure_count: stats.total_failures(),
        checks: HealthChecks {
            database: CheckResult {
                ok: true,
                detail: None,
            },
            items: CheckResult {
                ok: has_items,
                detail: (!has_items).then(|| "store holds no items".to_string()),
            },
        },
    }
}

/// CLI entry point for `fh health`. Returns `false` when unhealthy.
pub async fn run_health(config: &Config) -> anyhow::Result<bool> {
    let report = match db::connect(config).await {
        Ok(pool) => {
            let report = check_health(&pool).await;
            pool.close().await;
            report
        }
        Err(e) => HealthReport::unreachable(e.to_string()),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.status != HealthStatus::Unhealthy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use crate::models::NewItem;
    use chrono::Utc;

    #[tokio::test]
    async fn empty_store_is_degraded_then_healthy() {
        let pool = db::connect_in_memory().await.unwrap();
        migrate::apply(&pool).await.unwrap();

        let report = check_health(&pool).await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.checks.database.ok);

        ItemStore::new(pool.clone())
            .insert(&NewItem {
                url: "https://example.com/a".into(),
                title: "A".into(),
                source_name: "Example".into(),
                origin_url: None,
                published: None,
                downloaded: Utc::now(),
                content_source: "page".into(),
                body: "body".into(),
            })
            .await
            .unwrap();

        let report = check_health(&pool).await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.item_count, 1);
    }

    #[tokio::test]
    async fn missing_schema_is_unhealthy() {
        let pool = db::connect_in_memory().await.unwrap();
        let report = check_health(&pool).await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(!report.checks.database.ok);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "unhealthy");
    }
}
