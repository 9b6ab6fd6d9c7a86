//! Store adapter (spec §4.5): typed calls over the spatial relational
//! store. The schema (`devices`/`locations`/`alerts`/`commands`) is
//! deliberately out of scope for the core's business logic, but a complete
//! runnable crate needs a concrete adapter, so this implements one over
//! `sqlx`+Postgres/PostGIS, grounded on the `ST_SetSRID(ST_MakePoint(..),
//! 4326)` pattern used for vehicle tracker locations in the wider GPS
//! tracking pack.

use crate::domain::{AlertEvent, Command, CommandStatus, Device, LocationEvent};
use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default)]
pub struct CommandStatusFields {
    pub response: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NearbyDevice {
    pub device_id: i64,
    pub imei: String,
    pub distance_km: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SystemStats {
    pub total_devices: i64,
    pub online_devices: i64,
    pub locations_last_24h: i64,
    pub open_alerts: i64,
}

/// The spec §4.5 store contract. Behind a trait so the registry and
/// dispatcher can be exercised in tests against an in-memory fake instead
/// of a live Postgres instance.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_device_by_imei(&self, imei: &str) -> Result<Option<Device>, AppError>;
    async fn save_location(&self, loc: &LocationEvent) -> Result<(), AppError>;
    async fn save_alert(&self, alert: &AlertEvent) -> Result<(), AppError>;
    async fn create_command(&self, device_id: i64, kind: &str, payload: serde_json::Value) -> Result<Command, AppError>;
    async fn update_command_status(
        &self,
        id: &str,
        status: CommandStatus,
        fields: CommandStatusFields,
    ) -> Result<(), AppError>;
    async fn set_online(&self, imei: &str, online: bool) -> Result<(), AppError>;
    async fn touch_heartbeat(&self, imei: &str) -> Result<(), AppError>;
    async fn touch_login(&self, imei: &str) -> Result<(), AppError>;
    async fn get_last_location(&self, device_id: i64) -> Result<Option<LocationEvent>, AppError>;
    async fn get_location_history(&self, device_id: i64, limit: i64) -> Result<Vec<LocationEvent>, AppError>;
    async fn get_nearby(&self, lat: f64, lon: f64, radius_km: f64) -> Result<Vec<NearbyDevice>, AppError>;
    async fn get_system_stats(&self) -> Result<SystemStats, AppError>;
}

pub struct PgStore {
    pool: sqlx::PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(PgStore { pool })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_device_by_imei(&self, imei: &str) -> Result<Option<Device>, AppError> {
        let device = sqlx::query_as::<_, Device>(
            "SELECT id, imei, company_id, active, online, last_seen, last_heartbeat, last_login \
             FROM devices WHERE imei = $1",
        )
        .bind(imei)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    async fn save_location(&self, loc: &LocationEvent) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO locations \
             (device_id, latitude, longitude, speed, course, altitude, recorded_at, \
              satellites, hdop, battery_level, signal_strength, raw, geom) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12, \
                     ST_SetSRID(ST_MakePoint($3,$2), 4326))",
        )
        .bind(loc.device_id)
        .bind(loc.latitude)
        .bind(loc.longitude)
        .bind(loc.speed)
        .bind(loc.course)
        .bind(loc.altitude)
        .bind(loc.recorded_at)
        .bind(loc.satellites as i16)
        .bind(loc.hdop)
        .bind(loc.battery_level.map(|b| b as i16))
        .bind(loc.signal_strength.map(|s| s as i16))
        .bind(&loc.raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_alert(&self, alert: &AlertEvent) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO alerts \
             (device_id, alert_kind, message, latitude, longitude, triggered_at, raw, resolved, geom) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8, ST_SetSRID(ST_MakePoint($5,$4), 4326))",
        )
        .bind(alert.device_id)
        .bind(serde_json::to_string(&alert.alert_kind).unwrap_or_default())
        .bind(&alert.message)
        .bind(alert.latitude)
        .bind(alert.longitude)
        .bind(alert.triggered_at)
        .bind(&alert.raw)
        .bind(alert.resolved)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_command(&self, device_id: i64, kind: &str, payload: serde_json::Value) -> Result<Command, AppError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now: DateTime<Utc> = Utc::now();
        sqlx::query(
            "INSERT INTO commands (id, device_id, kind, payload, status, created_at) \
             VALUES ($1,$2,$3,$4,'pending',$5)",
        )
        .bind(&id)
        .bind(device_id)
        .bind(kind)
        .bind(&payload)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(Command {
            id,
            device_id,
            kind: kind.to_string(),
            payload,
            status: "pending".to_string(),
            created_at: now,
            sent_at: None,
            ack_at: None,
            failed_at: None,
            response: None,
            error: None,
        })
    }

    async fn update_command_status(
        &self,
        id: &str,
        status: CommandStatus,
        fields: CommandStatusFields,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let status_str = match status {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Acknowledged => "acknowledged",
            CommandStatus::Failed => "failed",
        };
        let (sent_at, ack_at, failed_at) = match status {
            CommandStatus::Sent => (Some(now), None, None),
            CommandStatus::Acknowledged => (None, Some(now), None),
            CommandStatus::Failed => (None, None, Some(now)),
            CommandStatus::Pending => (None, None, None),
        };
        sqlx::query(
            "UPDATE commands SET status=$1, \
             sent_at = COALESCE($2, sent_at), \
             ack_at = COALESCE($3, ack_at), \
             failed_at = COALESCE($4, failed_at), \
             response = COALESCE($5, response), \
             error = COALESCE($6, error) \
             WHERE id = $7 AND status NOT IN ('acknowledged', 'failed')",
        )
        .bind(status_str)
        .bind(sent_at)
        .bind(ack_at)
        .bind(failed_at)
        .bind(&fields.response)
        .bind(&fields.error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_online(&self, imei: &str, online: bool) -> Result<(), AppError> {
        sqlx::query("UPDATE devices SET online=$1 WHERE imei=$2")
            .bind(online)
            .bind(imei)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_heartbeat(&self, imei: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE devices SET online=true, last_heartbeat=now(), last_seen=now() WHERE imei=$1")
            .bind(imei)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_login(&self, imei: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE devices SET online=true, last_login=now(), last_seen=now() WHERE imei=$1")
            .bind(imei)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_last_location(&self, device_id: i64) -> Result<Option<LocationEvent>, AppError> {
        let row = sqlx::query_as::<_, LocationRow>(
            "SELECT device_id, latitude, longitude, speed, course, altitude, recorded_at, \
             satellites, hdop, battery_level, signal_strength, raw \
             FROM locations WHERE device_id=$1 ORDER BY recorded_at DESC LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn get_location_history(&self, device_id: i64, limit: i64) -> Result<Vec<LocationEvent>, AppError> {
        let rows = sqlx::query_as::<_, LocationRow>(
            "SELECT device_id, latitude, longitude, speed, course, altitude, recorded_at, \
             satellites, hdop, battery_level, signal_strength, raw \
             FROM locations WHERE device_id=$1 ORDER BY recorded_at DESC LIMIT $2",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_nearby(&self, lat: f64, lon: f64, radius_km: f64) -> Result<Vec<NearbyDevice>, AppError> {
        let rows = sqlx::query_as::<_, (i64, String, f64)>(
            "SELECT d.id, d.imei, \
             ST_Distance(l.geom::geography, ST_SetSRID(ST_MakePoint($1,$2),4326)::geography) / 1000.0 AS distance_km \
             FROM devices d \
             JOIN LATERAL ( \
               SELECT geom FROM locations WHERE device_id = d.id ORDER BY recorded_at DESC LIMIT 1 \
             ) l ON true \
             WHERE ST_DWithin(l.geom::geography, ST_SetSRID(ST_MakePoint($1,$2),4326)::geography, $3 * 1000.0)",
        )
        .bind(lon)
        .bind(lat)
        .bind(radius_km)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(device_id, imei, distance_km)| NearbyDevice { device_id, imei, distance_km })
            .collect())
    }

    async fn get_system_stats(&self) -> Result<SystemStats, AppError> {
        let row: (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT \
               (SELECT count(*) FROM devices), \
               (SELECT count(*) FROM devices WHERE online), \
               (SELECT count(*) FROM locations WHERE recorded_at > now() - interval '24 hours'), \
               (SELECT count(*) FROM alerts WHERE NOT resolved)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(SystemStats {
            total_devices: row.0,
            online_devices: row.1,
            locations_last_24h: row.2,
            open_alerts: row.3,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LocationRow {
    device_id: i64,
    latitude: f64,
    longitude: f64,
    speed: f64,
    course: f64,
    altitude: f64,
    recorded_at: DateTime<Utc>,
    satellites: i16,
    hdop: f64,
    battery_level: Option<i16>,
    signal_strength: Option<i16>,
    raw: Vec<u8>,
}

impl From<LocationRow> for LocationEvent {
    fn from(r: LocationRow) -> Self {
        LocationEvent {
            device_id: r.device_id,
            latitude: r.latitude,
            longitude: r.longitude,
            speed: r.speed,
            course: r.course,
            altitude: r.altitude,
            recorded_at: r.recorded_at,
            satellites: r.satellites as u8,
            hdop: r.hdop,
            battery_level: r.battery_level.map(|b| b as u8),
            signal_strength: r.signal_strength.map(|s| s as u8),
            raw: r.raw,
        }
    }
}

pub mod test_support {
    //! An in-memory `Store` fake for unit tests (registry/dispatcher tests
    //! run against this instead of a live Postgres instance).
    use super::*;
    use dashmap::DashMap;
    use std::sync::Mutex;

    pub struct FakeStore {
        devices: DashMap<String, Device>,
        locations: Mutex<Vec<LocationEvent>>,
        alerts: Mutex<Vec<AlertEvent>>,
        commands: DashMap<String, Command>,
    }

    impl FakeStore {
        pub fn with_active_device(id: i64, imei: &str) -> Self {
            let store = FakeStore {
                devices: DashMap::new(),
                locations: Mutex::new(Vec::new()),
                alerts: Mutex::new(Vec::new()),
                commands: DashMap::new(),
            };
            store.devices.insert(
                imei.to_string(),
                Device {
                    id,
                    imei: imei.to_string(),
                    company_id: 1,
                    active: true,
                    online: false,
                    last_seen: None,
                    last_heartbeat: None,
                    last_login: None,
                },
            );
            store
        }

        pub fn locations(&self) -> Vec<LocationEvent> {
            self.locations.lock().unwrap().clone()
        }

        pub fn alerts(&self) -> Vec<AlertEvent> {
            self.alerts.lock().unwrap().clone()
        }

        pub fn command_status(&self, id: &str) -> Option<String> {
            self.commands.get(id).map(|c| c.status.clone())
        }
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn get_device_by_imei(&self, imei: &str) -> Result<Option<Device>, AppError> {
            Ok(self.devices.get(imei).map(|d| d.clone()))
        }

        async fn save_location(&self, loc: &LocationEvent) -> Result<(), AppError> {
            self.locations.lock().unwrap().push(loc.clone());
            Ok(())
        }

        async fn save_alert(&self, alert: &AlertEvent) -> Result<(), AppError> {
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }

        async fn create_command(&self, device_id: i64, kind: &str, payload: serde_json::Value) -> Result<Command, AppError> {
            let id = uuid::Uuid::new_v4().to_string();
            let cmd = Command {
                id: id.clone(),
                device_id,
                kind: kind.to_string(),
                payload,
                status: "pending".to_string(),
                created_at: Utc::now(),
                sent_at: None,
                ack_at: None,
                failed_at: None,
                response: None,
                error: None,
            };
            self.commands.insert(id, cmd.clone());
            Ok(cmd)
        }

        async fn update_command_status(
            &self,
            id: &str,
            status: CommandStatus,
            fields: CommandStatusFields,
        ) -> Result<(), AppError> {
            if let Some(mut cmd) = self.commands.get_mut(id) {
                let current = match cmd.status.as_str() {
                    "pending" => CommandStatus::Pending,
                    "sent" => CommandStatus::Sent,
                    "acknowledged" => CommandStatus::Acknowledged,
                    "failed" => CommandStatus::Failed,
                    _ => CommandStatus::Pending,
                };
                if !current.can_transition_to(status) {
                    return Ok(());
                }
                cmd.status = match status {
                    CommandStatus::Pending => "pending",
                    CommandStatus::Sent => "sent",
                    CommandStatus::Acknowledged => "acknowledged",
                    CommandStatus::Failed => "failed",
                }
                .to_string();
                if let Some(r) = fields.response {
                    cmd.response = Some(r);
                }
                if let Some(e) = fields.error {
                    cmd.error = Some(e);
                }
            }
            Ok(())
        }

        async fn set_online(&self, imei: &str, online: bool) -> Result<(), AppError> {
            if let Some(mut d) = self.devices.get_mut(imei) {
                d.online = online;
            }
            Ok(())
        }

        async fn touch_heartbeat(&self, imei: &str) -> Result<(), AppError> {
            if let Some(mut d) = self.devices.get_mut(imei) {
                d.last_heartbeat = Some(Utc::now());
                d.online = true;
            }
            Ok(())
        }

        async fn touch_login(&self, imei: &str) -> Result<(), AppError> {
            if let Some(mut d) = self.devices.get_mut(imei) {
                d.last_login = Some(Utc::now());
                d.online = true;
            }
            Ok(())
        }

        async fn get_last_location(&self, device_id: i64) -> Result<Option<LocationEvent>, AppError> {
            Ok(self.locations.lock().unwrap().iter().rev().find(|l| l.device_id == device_id).cloned())
        }

        async fn get_location_history(&self, device_id: i64, limit: i64) -> Result<Vec<LocationEvent>, AppError> {
            Ok(self
                .locations
                .lock()
                .unwrap()
                .iter()
                .rev()
                .filter(|l| l.device_id == device_id)
                .take(limit as usize)
                .cloned()
                .collect())
        }

        async fn get_nearby(&self, _lat: f64, _lon: f64, _radius_km: f64) -> Result<Vec<NearbyDevice>, AppError> {
            Ok(Vec::new())
        }

        async fn get_system_stats(&self) -> Result<SystemStats, AppError> {
            Ok(SystemStats {
                total_devices: self.devices.len() as i64,
                online_devices: self.devices.iter().filter(|d| d.online).count() as i64,
                locations_last_24h: self.locations.lock().unwrap().len() as i64,
                open_alerts: self.alerts.lock().unwrap().iter().filter(|a| !a.resolved).count() as i64,
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::domain::CommandStatus;

        /// Spec invariant 6: a redelivered/stale delivery must not drive a
        /// terminal command status backwards (`acknowledged`/`failed` stay put).
        #[tokio::test]
        async fn update_command_status_does_not_regress_from_terminal_state() {
            let store = FakeStore::with_active_device(1, "123456789012345");
            let cmd = store.create_command(1, "locate", serde_json::json!({})).await.unwrap();

            store.update_command_status(&cmd.id, CommandStatus::Acknowledged, CommandStatusFields::default()).await.unwrap();
            assert_eq!(store.command_status(&cmd.id).as_deref(), Some("acknowledged"));

            // A stale "sent" write (e.g. a replayed delivery) must not regress it.
            store.update_command_status(&cmd.id, CommandStatus::Sent, CommandStatusFields::default()).await.unwrap();
            assert_eq!(store.command_status(&cmd.id).as_deref(), Some("acknowledged"));

            let failed_fields = CommandStatusFields { response: None, error: Some("timeout".to_string()) };
            store.update_command_status(&cmd.id, CommandStatus::Failed, failed_fields).await.unwrap();
            assert_eq!(store.command_status(&cmd.id).as_deref(), Some("acknowledged"));
        }
    }
}
