//! Deployment registry
//!
//! Persisted record of every deployment and the resources that belong to it.
//! The orchestrator flushes the whole [`Deployment`] after every step, so the
//! registry is always an accurate inventory for rollback, destroy and status,
//! even after a crash in the middle of provisioning.

mod tracked;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    FromRow, Pool, Sqlite,
};
use tracing::{debug, instrument};

use crate::error::{AppError, AppResult};
use crate::models::{
    AttachmentRecord, BridgeRecord, ClusterHandle, ClusterRecord, Deployment, DeploymentState,
    GatewayRecord, GatewayState, TopologyConfig,
};
use crate::network::Subnet;

pub use tracked::TrackedDeployment;

pub type DbPool = Pool<Sqlite>;

#[derive(Clone)]
pub struct Registry {
    pool: DbPool,
}

#[derive(FromRow)]
struct DeploymentRow {
    name: String,
    status: String,
    topology: String,
    gateway_container: String,
    gateway_image: String,
    gateway_status: String,
    message: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(FromRow)]
struct BridgeRow {
    name: String,
    subnet: String,
    status: String,
}

#[derive(FromRow)]
struct ClusterRow {
    name: String,
    bridge: String,
    status: String,
    handle_name: Option<String>,
    handle_context: Option<String>,
    message: Option<String>,
}

#[derive(FromRow)]
struct AttachmentRow {
    bridge: String,
    interface: Option<String>,
    address: Option<String>,
    status: String,
    message: Option<String>,
    routes: String,
    routes_message: Option<String>,
}

#[derive(FromRow)]
struct RuleRow {
    source: String,
    target: String,
    params: String,
    status: String,
    message: Option<String>,
}

/// A subnet held by some deployment
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub subnet: Subnet,
    pub deployment: String,
    pub cluster: String,
}

#[derive(FromRow)]
struct ReservationRow {
    subnet: String,
    deployment: String,
    cluster: String,
}

fn decode<E>(e: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::Decode(Box::new(e))
}

fn parse_enum<T>(value: &str) -> Result<T, sqlx::Error>
where
    T: FromStr<Err = strum::ParseError>,
{
    value.parse::<T>().map_err(decode)
}

impl Registry {
    pub async fn new(database_url: &str) -> AppResult<Self> {
        let in_memory = database_url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to an in-memory database is a distinct database
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };

        Ok(Self { pool })
    }

    /// Open the registry and bring the schema up to date
    pub async fn open(database_url: &str) -> AppResult<Self> {
        let registry = Self::new(database_url).await?;
        registry.run_migrations().await?;
        Ok(registry)
    }

    pub async fn run_migrations(&self) -> AppResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Persist the full deployment record in one transaction
    #[instrument(skip(self, deployment), fields(deployment = %deployment.name, status = %deployment.status))]
    pub async fn save(&self, deployment: &Deployment) -> AppResult<()> {
        let topology = serde_json::to_string(&deployment.topology).map_err(decode)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO deployments (name, status, topology, gateway_container, gateway_image, gateway_status, message, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                status = excluded.status,
                topology = excluded.topology,
                gateway_container = excluded.gateway_container,
                gateway_image = excluded.gateway_image,
                gateway_status = excluded.gateway_status,
                message = excluded.message,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&deployment.name)
        .bind(deployment.status.to_string())
        .bind(&topology)
        .bind(&deployment.gateway.container)
        .bind(&deployment.gateway.image)
        .bind(deployment.gateway.status.to_string())
        .bind(&deployment.message)
        .bind(deployment.created_at.to_rfc3339())
        .bind(deployment.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for table in ["bridges", "clusters", "gateway_attachments", "link_rules"] {
            sqlx::query(&format!("DELETE FROM {} WHERE deployment = ?", table))
                .bind(&deployment.name)
                .execute(&mut *tx)
                .await?;
        }

        for (position, bridge) in deployment.bridges.iter().enumerate() {
            sqlx::query(
                "INSERT INTO bridges (deployment, position, name, subnet, status) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&deployment.name)
            .bind(position as i64)
            .bind(&bridge.name)
            .bind(bridge.subnet.to_string())
            .bind(bridge.status.to_string())
            .execute(&mut *tx)
            .await?;
        }

        for (position, cluster) in deployment.clusters.iter().enumerate() {
            sqlx::query(
                "INSERT INTO clusters (deployment, position, name, bridge, status, handle_name, handle_context, message)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&deployment.name)
            .bind(position as i64)
            .bind(&cluster.name)
            .bind(&cluster.bridge)
            .bind(cluster.status.to_string())
            .bind(cluster.handle.as_ref().map(|h| h.name.as_str()))
            .bind(cluster.handle.as_ref().map(|h| h.context.as_str()))
            .bind(&cluster.message)
            .execute(&mut *tx)
            .await?;
        }

        for (position, attachment) in deployment.gateway.attachments.iter().enumerate() {
            sqlx::query(
                "INSERT INTO gateway_attachments
                 (deployment, position, bridge, interface, address, status, message, routes, routes_message)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&deployment.name)
            .bind(position as i64)
            .bind(&attachment.bridge)
            .bind(&attachment.interface)
            .bind(&attachment.address)
            .bind(attachment.status.to_string())
            .bind(&attachment.message)
            .bind(attachment.routes.to_string())
            .bind(&attachment.routes_message)
            .execute(&mut *tx)
            .await?;
        }

        for (position, rule) in deployment.gateway.rules.iter().enumerate() {
            let params = serde_json::to_string(&rule.params).map_err(decode)?;
            sqlx::query(
                "INSERT INTO link_rules (deployment, position, source, target, params, status, message)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&deployment.name)
            .bind(position as i64)
            .bind(&rule.from)
            .bind(&rule.to)
            .bind(&params)
            .bind(rule.status.to_string())
            .bind(&rule.message)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Deployment record flushed");
        Ok(())
    }

    /// Atomically take `name` for a new provisioning run.
    ///
    /// Inserts a Pending row, or takes over an existing row that is Failed or
    /// Destroyed. Returns false when an active deployment holds the name.
    #[instrument(skip(self, topology, gateway_container, gateway_image))]
    pub async fn claim(
        &self,
        name: &str,
        topology: &TopologyConfig,
        gateway_container: &str,
        gateway_image: &str,
    ) -> AppResult<bool> {
        let topology = serde_json::to_string(topology).map_err(decode)?;
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            INSERT INTO deployments (name, status, topology, gateway_container, gateway_image, gateway_status, message, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                status = excluded.status,
                topology = excluded.topology,
                gateway_container = excluded.gateway_container,
                gateway_image = excluded.gateway_image,
                gateway_status = excluded.gateway_status,
                message = NULL,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            WHERE deployments.status IN (?, ?)
            "#,
        )
        .bind(name)
        .bind(DeploymentState::Pending.to_string())
        .bind(&topology)
        .bind(gateway_container)
        .bind(gateway_image)
        .bind(GatewayState::Absent.to_string())
        .bind(&now)
        .bind(&now)
        .bind(DeploymentState::Failed.to_string())
        .bind(DeploymentState::Destroyed.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Load a deployment record by name
    pub async fn load(&self, name: &str) -> AppResult<Option<Deployment>> {
        let row: Option<DeploymentRow> = sqlx::query_as(
            "SELECT name, status, topology, gateway_container, gateway_image, gateway_status, message, created_at, updated_at
             FROM deployments WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let bridges: Vec<BridgeRow> = sqlx::query_as(
            "SELECT name, subnet, status FROM bridges WHERE deployment = ? ORDER BY position",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        let clusters: Vec<ClusterRow> = sqlx::query_as(
            "SELECT name, bridge, status, handle_name, handle_context, message
             FROM clusters WHERE deployment = ? ORDER BY position",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        let attachments: Vec<AttachmentRow> = sqlx::query_as(
            "SELECT bridge, interface, address, status, message, routes, routes_message
             FROM gateway_attachments WHERE deployment = ? ORDER BY position",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        let rules: Vec<RuleRow> = sqlx::query_as(
            "SELECT source, target, params, status, message
             FROM link_rules WHERE deployment = ? ORDER BY position",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Self::rows_to_deployment(
            row,
            bridges,
            clusters,
            attachments,
            rules,
        )?))
    }

    /// Every recorded deployment, oldest first
    pub async fn list(&self) -> AppResult<Vec<Deployment>> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT name FROM deployments ORDER BY created_at, name")
                .fetch_all(&self.pool)
                .await?;

        let mut deployments = Vec::with_capacity(names.len());
        for name in names {
            if let Some(d) = self.load(&name).await? {
                deployments.push(d);
            }
        }
        Ok(deployments)
    }

    /// Remove a deployment and everything it owns
    pub async fn delete(&self, name: &str) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "bridges",
            "clusters",
            "gateway_attachments",
            "link_rules",
            "subnet_reservations",
        ] {
            sqlx::query(&format!("DELETE FROM {} WHERE deployment = ?", table))
                .bind(name)
                .execute(&mut *tx)
                .await?;
        }
        let result = sqlx::query("DELETE FROM deployments WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(result.rows_affected() > 0)
    }

    // ==================== Subnet reservations ====================

    /// Claim `subnet` for a cluster. Returns false when any existing
    /// reservation overlaps it, whatever its prefix length.
    ///
    /// The overlap check and the insert are one statement, so two writers
    /// can never both claim intersecting ranges.
    pub async fn reserve_subnet(
        &self,
        deployment: &str,
        cluster: &str,
        subnet: &Subnet,
    ) -> AppResult<bool> {
        let (start, end) = subnet.range();
        let result = sqlx::query(
            "INSERT INTO subnet_reservations (subnet, deployment, cluster, range_start, range_end, created_at)
             SELECT ?, ?, ?, ?, ?, ?
             WHERE NOT EXISTS (
                 SELECT 1 FROM subnet_reservations WHERE range_start <= ? AND range_end >= ?
             )",
        )
        .bind(subnet.to_string())
        .bind(deployment)
        .bind(cluster)
        .bind(i64::from(start))
        .bind(i64::from(end))
        .bind(Utc::now().to_rfc3339())
        .bind(i64::from(end))
        .bind(i64::from(start))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn reservations(&self) -> AppResult<Vec<Reservation>> {
        let rows: Vec<ReservationRow> = sqlx::query_as(
            "SELECT subnet, deployment, cluster FROM subnet_reservations ORDER BY subnet",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(Reservation {
                    subnet: r.subnet.parse().map_err(decode)?,
                    deployment: r.deployment,
                    cluster: r.cluster,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(AppError::from)
    }

    pub async fn release_subnet(&self, deployment: &str, subnet: &Subnet) -> AppResult<()> {
        sqlx::query("DELETE FROM subnet_reservations WHERE deployment = ? AND subnet = ?")
            .bind(deployment)
            .bind(subnet.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn release_subnets(&self, deployment: &str) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM subnet_reservations WHERE deployment = ?")
            .bind(deployment)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn rows_to_deployment(
        row: DeploymentRow,
        bridges: Vec<BridgeRow>,
        clusters: Vec<ClusterRow>,
        attachments: Vec<AttachmentRow>,
        rules: Vec<RuleRow>,
    ) -> Result<Deployment, sqlx::Error> {
        let bridges = bridges
            .into_iter()
            .map(|b| {
                Ok(BridgeRecord {
                    subnet: b.subnet.parse().map_err(decode)?,
                    status: parse_enum(&b.status)?,
                    name: b.name,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let clusters = clusters
            .into_iter()
            .map(|c| {
                let handle = match (c.handle_name, c.handle_context) {
                    (Some(name), Some(context)) => Some(ClusterHandle { name, context }),
                    _ => None,
                };
                Ok(ClusterRecord {
                    status: parse_enum(&c.status)?,
                    name: c.name,
                    bridge: c.bridge,
                    handle,
                    message: c.message,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let attachments = attachments
            .into_iter()
            .map(|a| {
                Ok(AttachmentRecord {
                    status: parse_enum(&a.status)?,
                    routes: parse_enum(&a.routes)?,
                    bridge: a.bridge,
                    interface: a.interface,
                    address: a.address,
                    message: a.message,
                    routes_message: a.routes_message,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let rules = rules
            .into_iter()
            .map(|r| {
                Ok(crate::models::RuleRecord {
                    params: serde_json::from_str(&r.params).map_err(decode)?,
                    status: parse_enum(&r.status)?,
                    from: r.source,
                    to: r.target,
                    message: r.message,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(Deployment {
            status: parse_enum::<DeploymentState>(&row.status)?,
            topology: serde_json::from_str(&row.topology).map_err(decode)?,
            clusters,
            bridges,
            gateway: GatewayRecord {
                container: row.gateway_container,
                image: row.gateway_image,
                status: parse_enum(&row.gateway_status)?,
                attachments,
                rules,
            },
            message: row.message,
            created_at: row
                .created_at
                .parse::<DateTime<Utc>>()
                .map_err(decode)?,
            updated_at: row
                .updated_at
                .parse::<DateTime<Utc>>()
                .map_err(decode)?,
            name: row.name,
        })
    }
}
