//! Per-connection session (spec §4.1): one task per socket, owning its
//! inbound buffer and the write half; concurrency lives only between
//! sessions and between a session and the dispatcher, never inside one.

use crate::bus::{Bus, QUEUE_DEVICE_ALERTS, QUEUE_LOCATION_UPDATES, QUEUE_TRACKER_MESSAGES};
use crate::codec::{Codec, DecodeResult, EventKind};
use crate::domain::{AlertEvent, CommandStatus, Fingerprint, LocationEvent};
use crate::metrics::Metrics;
use crate::registry::{next_session_id, Registry, SessionHandle};
use crate::store::{CommandStatusFields, Store};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

const AUTH_DEADLINE: Duration = Duration::from_secs(30);
const UNPARSEABLE_TAIL_CAP: usize = 1024;

pub struct SessionContext {
    pub registry: Arc<Registry>,
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn Bus>,
    pub metrics: Arc<Metrics>,
    pub codec: Arc<Codec>,
}

pub struct Session {
    ctx: Arc<SessionContext>,
    session_id: u64,
    buffer: Vec<u8>,
    authenticated: bool,
    imei: Option<String>,
    device_id: Option<i64>,
    fingerprint: Option<Fingerprint>,
    closing: bool,
}

impl Session {
    pub fn spawn(ctx: Arc<SessionContext>, stream: TcpStream, peer: std::net::SocketAddr, shutdown: watch::Receiver<bool>) {
        let session_id = next_session_id();
        tokio::spawn(async move {
            let (mut reader, writer) = stream.into_split();
            let handle = SessionHandle { writer: Arc::new(Mutex::new(writer)) };
            let mut session = Session {
                ctx,
                session_id,
                buffer: Vec::new(),
                authenticated: false,
                imei: None,
                device_id: None,
                fingerprint: None,
                closing: false,
            };
            session.run(&mut reader, handle, peer, shutdown).await;
        });
    }

    async fn run(
        &mut self,
        reader: &mut tokio::net::tcp::OwnedReadHalf,
        handle: SessionHandle,
        peer: std::net::SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let deadline = tokio::time::Instant::now() + AUTH_DEADLINE;
        let mut read_buf = [0u8; 4096];

        loop {
            let read_result = if self.authenticated {
                tokio::select! {
                    res = reader.read(&mut read_buf) => res,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::debug!(peer = %peer, "session_draining_for_shutdown");
                            break;
                        }
                        continue;
                    }
                }
            } else {
                tokio::select! {
                    res = reader.read(&mut read_buf) => res,
                    _ = tokio::time::sleep_until(deadline) => {
                        tracing::info!(peer = %peer, "auth_deadline_expired");
                        Metrics::inc(&self.ctx.metrics.auth_timeout);
                        return;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            tracing::debug!(peer = %peer, "session_draining_for_shutdown");
                            break;
                        }
                        continue;
                    }
                }
            };

            match read_result {
                Ok(0) => break,
                Ok(n) => {
                    self.buffer.extend_from_slice(&read_buf[..n]);
                    self.drain(&handle).await;
                    if self.closing {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "session_read_error");
                    break;
                }
            }
        }

        handle.shutdown().await;
        if let Some(imei) = &self.imei {
            self.ctx.registry.mark_offline(imei, self.session_id).await;
        }
    }

    async fn drain(&mut self, handle: &SessionHandle) {
        loop {
            let (fingerprint, result) = match self.fingerprint {
                Some(fp) => (fp, self.ctx.codec.by_fingerprint(fp).decode(&self.buffer)),
                None => self.ctx.codec.decode_unfixed(&self.buffer),
            };

            match result {
                DecodeResult::NeedMore => {
                    if self.buffer.len() > UNPARSEABLE_TAIL_CAP {
                        tracing::warn!(buffered = self.buffer.len(), "unparseable_tail_overflow");
                        self.buffer.clear();
                    }
                    break;
                }
                DecodeResult::Reject => {
                    Metrics::inc(&self.ctx.metrics.frames_corrupt);
                    tracing::warn!("frame_rejected_clearing_buffer");
                    self.buffer.clear();
                    break;
                }
                DecodeResult::Success { event, consumed } => {
                    self.buffer.drain(..consumed);
                    if self.fingerprint.is_none() && fingerprint != Fingerprint::Generic {
                        self.fingerprint = Some(fingerprint);
                        self.bump_frame_metric(fingerprint);
                    } else if self.fingerprint.is_none() {
                        self.bump_frame_metric(fingerprint);
                    }
                    self.dispatch(fingerprint, event.imei, event.kind, handle).await;
                    if self.closing {
                        break;
                    }
                }
            }
        }
    }

    fn bump_frame_metric(&self, fp: Fingerprint) {
        let counter = match fp {
            Fingerprint::Gt06 => &self.ctx.metrics.frames_gt06,
            Fingerprint::Gps303 => &self.ctx.metrics.frames_gps303,
            Fingerprint::Tk103 => &self.ctx.metrics.frames_tk103,
            Fingerprint::H02 => &self.ctx.metrics.frames_h02,
            Fingerprint::Generic => &self.ctx.metrics.frames_unknown,
        };
        Metrics::inc(counter);
    }

    /// Spec §4.1 dispatch rules.
    async fn dispatch(
        &mut self,
        fingerprint: Fingerprint,
        event_imei: Option<String>,
        kind: EventKind,
        handle: &SessionHandle,
    ) {
        if !self.authenticated {
            if let Some(imei) = event_imei.clone() {
                match self.ctx.registry.authenticate(self.session_id, &imei, handle.clone()).await {
                    Ok(outcome) => {
                        self.authenticated = true;
                        self.imei = Some(imei.clone());
                        self.device_id = Some(outcome.device_id);
                        self.ctx.registry.set_fingerprint(&imei, fingerprint);
                        Metrics::inc(&self.ctx.metrics.auth_ok);
                    }
                    Err(e) => {
                        tracing::info!(imei = %imei, error = %e, "auth_failed_closing_socket");
                        Metrics::inc(&self.ctx.metrics.auth_failed);
                        handle.shutdown().await;
                        self.buffer.clear();
                        self.closing = true;
                        return;
                    }
                }
            } else if matches!(kind, EventKind::Login) && fingerprint == Fingerprint::Gps303 {
                // GPS303's bare "##" login carries no IMEI; reply LOAD and
                // stay unauthenticated until a position frame supplies one.
                if let Some(bytes) = self.ctx.codec.by_fingerprint(fingerprint).encode_login_ack(true) {
                    let _ = handle.write_all(&bytes).await;
                }
                return;
            } else {
                return;
            }
        }

        let imei = match &self.imei {
            Some(imei) => imei.clone(),
            None => return,
        };
        let device_id = match self.device_id {
            Some(id) => id,
            None => return,
        };
        let sub = self.ctx.codec.by_fingerprint(fingerprint);

        match kind {
            EventKind::Login => {
                if let Err(e) = self.ctx.registry.touch_login(&imei).await {
                    tracing::warn!(imei = %imei, error = %e, "touch_login_store_error");
                }
                if let Some(bytes) = sub.encode_login_ack(true) {
                    let _ = handle.write_all(&bytes).await;
                }
            }
            EventKind::Location(loc) => {
                let event = LocationEvent {
                    device_id,
                    latitude: loc.latitude,
                    longitude: loc.longitude,
                    speed: loc.speed,
                    course: loc.course,
                    altitude: loc.altitude,
                    recorded_at: loc.recorded_at.unwrap_or_else(Utc::now),
                    satellites: loc.satellites,
                    hdop: loc.hdop,
                    battery_level: loc.battery_level,
                    signal_strength: loc.signal_strength,
                    raw: loc.raw,
                };
                if let Err(e) = self.ctx.store.save_location(&event).await {
                    tracing::warn!(imei = %imei, error = %e, "save_location_error");
                } else {
                    Metrics::inc(&self.ctx.metrics.locations_saved);
                }
                if let Ok(payload) = serde_json::to_value(&event) {
                    if let Err(e) = self.ctx.bus.publish(QUEUE_LOCATION_UPDATES, &payload).await {
                        Metrics::inc(&self.ctx.metrics.bus_publish_errors);
                        tracing::warn!(imei = %imei, error = %e, "publish_location_error");
                    }
                }
                self.ctx.registry.touch_activity(&imei);
                if let Some(bytes) = sub.encode_location_ack(0) {
                    let _ = handle.write_all(&bytes).await;
                }
            }
            EventKind::Heartbeat => {
                if let Err(e) = self.ctx.registry.touch_heartbeat(&imei).await {
                    tracing::warn!(imei = %imei, error = %e, "touch_heartbeat_store_error");
                }
                if let Some(bytes) = sub.encode_heartbeat_ack() {
                    let _ = handle.write_all(&bytes).await;
                }
            }
            EventKind::Alarm(alert) => {
                let event = AlertEvent {
                    device_id,
                    alert_kind: alert.alert_kind,
                    message: alert.message,
                    latitude: alert.latitude,
                    longitude: alert.longitude,
                    triggered_at: alert.triggered_at.unwrap_or_else(Utc::now),
                    raw: alert.raw,
                    resolved: false,
                };
                if let Err(e) = self.ctx.store.save_alert(&event).await {
                    tracing::warn!(imei = %imei, error = %e, "save_alert_error");
                } else {
                    Metrics::inc(&self.ctx.metrics.alerts_saved);
                }
                if let Ok(payload) = serde_json::to_value(&event) {
                    if let Err(e) = self.ctx.bus.publish(QUEUE_DEVICE_ALERTS, &payload).await {
                        Metrics::inc(&self.ctx.metrics.bus_publish_errors);
                        tracing::warn!(imei = %imei, error = %e, "publish_alert_error");
                    }
                }
                self.ctx.registry.touch_activity(&imei);
                // No ack: the codec contract has no `encode_alarm_ack`.
            }
            EventKind::CommandResponse { command_id, raw } => {
                let resolved_id = command_id.or_else(|| self.ctx.registry.take_pending_ack(&imei));
                if let Some(id) = resolved_id {
                    let fields = CommandStatusFields { response: Some(String::from_utf8_lossy(&raw).to_string()), error: None };
                    if let Err(e) = self.ctx.store.update_command_status(&id, CommandStatus::Acknowledged, fields).await {
                        tracing::warn!(imei = %imei, command_id = %id, error = %e, "command_ack_store_error");
                    } else {
                        Metrics::inc(&self.ctx.metrics.commands_acknowledged);
                    }
                } else {
                    tracing::debug!(imei = %imei, "command_response_with_no_pending_command");
                }
                self.ctx.registry.touch_activity(&imei);
            }
            EventKind::Unknown { hex, ascii, length } => {
                let payload = serde_json::json!({
                    "imei": imei,
                    "device_id": device_id,
                    "hex": hex,
                    "ascii": ascii,
                    "length": length,
                });
                if let Err(e) = self.ctx.bus.publish(QUEUE_TRACKER_MESSAGES, &payload).await {
                    Metrics::inc(&self.ctx.metrics.bus_publish_errors);
                    tracing::warn!(imei = %imei, error = %e, "publish_unknown_error");
                }
                self.ctx.registry.touch_activity(&imei);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::test_support::FakeBus;
    use crate::store::test_support::FakeStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_test_session() -> (Arc<SessionContext>, tokio::net::TcpStream) {
        let store = Arc::new(FakeStore::with_active_device(1, "0359710045490084"));
        let ctx = Arc::new(SessionContext {
            registry: Registry::new(store.clone(), Arc::new(Metrics::new())),
            store,
            bus: Arc::new(FakeBus::new()),
            metrics: Arc::new(Metrics::new()),
            codec: Arc::new(Codec::new()),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let (_tx, rx) = tokio::sync::watch::channel(false);
        Session::spawn(ctx.clone(), server, peer, rx);
        (ctx, client)
    }

    /// Builds a valid GT06 login frame for IMEI `0359710045490084`, the way
    /// spec §8 S1's test vector is shaped: 8 BCD bytes + 2-byte type,
    /// checksummed per §4.2.
    fn gt06_login_frame() -> Vec<u8> {
        let imei_bytes: [u8; 8] = [0x03, 0x59, 0x71, 0x00, 0x45, 0x49, 0x00, 0x84];
        let mut body = vec![0x01u8]; // proto: login
        body.extend_from_slice(&imei_bytes);
        body.extend_from_slice(&[0x00, 0x01]); // type
        let len_byte = (body.len() + 2) as u8;
        let mut crc: u16 = len_byte as u16;
        for &b in &body {
            crc = crc.wrapping_add(b as u16);
        }
        let mut frame = vec![0x78, 0x78, len_byte];
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.extend_from_slice(&[0x0D, 0x0A]);
        frame
    }

    /// Spec §8 S1: a GT06 login frame authenticates the session and the
    /// device shows online in the store, with a GT06 login-ack on the wire.
    #[tokio::test]
    async fn s1_gt06_login_authenticates_and_acks() {
        let (ctx, mut client) = spawn_test_session().await;
        let frame = gt06_login_frame();
        client.write_all(&frame).await.unwrap();

        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..2], &[0x78, 0x78]);
        assert_eq!(&buf[3..5], &[0x01, 0x01]);
        assert_eq!(&buf[n - 2..n], &[0x0D, 0x0A]);

        let device = ctx.store.get_device_by_imei("0359710045490084").await.unwrap().unwrap();
        assert!(device.online);
        assert!(ctx.registry.lookup("0359710045490084").is_some());
    }

    /// Spec §8 S2: GPS303's two-step auth — bare `##` login gets `LOAD`,
    /// then a position line with the IMEI authenticates and is persisted.
    #[tokio::test]
    async fn s2_gps303_two_step_auth_and_location() {
        let (ctx, mut client) = spawn_test_session().await;
        client.write_all(b"##,imei:0359710045490084,A;").await.unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"LOAD");

        client
            .write_all(b"imei:0359710045490084,tracker,250101120000,,F,120000.000,A,2230.0000,S,04310.0000,W,42.5,;")
            .await
            .unwrap();
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ON");

        assert!(ctx.registry.lookup("0359710045490084").is_some());
        let saved = ctx.store.get_last_location(1).await.unwrap().unwrap();
        assert!((saved.latitude - (-22.5)).abs() < 1e-6);
        assert_eq!(saved.speed, 42.5);
    }

    /// Spec §8 S5: a second connection authenticating as the same IMEI
    /// displaces the first, whose socket is then closed.
    #[tokio::test]
    async fn s5_duplicate_imei_displaces_older_session() {
        let store = Arc::new(FakeStore::with_active_device(1, "0359710045490084"));
        let ctx = Arc::new(SessionContext {
            registry: Registry::new(store.clone(), Arc::new(Metrics::new())),
            store,
            bus: Arc::new(FakeBus::new()),
            metrics: Arc::new(Metrics::new()),
            codec: Arc::new(Codec::new()),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client_a = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server_a, peer_a) = listener.accept().await.unwrap();
        let (_tx_a, rx_a) = tokio::sync::watch::channel(false);
        Session::spawn(ctx.clone(), server_a, peer_a, rx_a);

        let mut client_a = client_a;
        client_a.write_all(b"##,imei:0359710045490084,A;").await.unwrap();
        let mut buf = [0u8; 16];
        let _ = client_a.read(&mut buf).await.unwrap();
        client_a
            .write_all(b"imei:0359710045490084,tracker,250101120000,,F,120000.000,A,2230.0000,S,04310.0000,W,42.5,;")
            .await
            .unwrap();
        let _ = client_a.read(&mut buf).await.unwrap();
        assert!(ctx.registry.lookup("0359710045490084").is_some());

        let mut client_b = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server_b, peer_b) = listener.accept().await.unwrap();
        let (_tx_b, rx_b) = tokio::sync::watch::channel(false);
        Session::spawn(ctx.clone(), server_b, peer_b, rx_b);
        client_b.write_all(b"##,imei:0359710045490084,A;").await.unwrap();
        let _ = client_b.read(&mut buf).await.unwrap();
        client_b
            .write_all(b"imei:0359710045490084,tracker,250101120000,,F,120000.000,A,2230.0000,S,04310.0000,W,42.5,;")
            .await
            .unwrap();
        let _ = client_b.read(&mut buf).await.unwrap();

        // client_a's socket should have been closed by the displacement.
        let mut probe = [0u8; 8];
        let read = client_a.read(&mut probe).await.unwrap();
        assert_eq!(read, 0, "displaced session's socket should be closed");

        let device = ctx.store.get_device_by_imei("0359710045490084").await.unwrap().unwrap();
        assert!(device.online);
    }
}
