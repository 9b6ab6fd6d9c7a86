// =============================================================================
// devicesim — GT06/GPS303/TK103 traffic generator
// =============================================================================
// Opens `--devices` concurrent TCP connections against a running
// gps-gateway and drives each one through login -> location -> heartbeat
// at `--rate` messages/sec, for manual soak testing and load testing.
// =============================================================================

use byteorder::{BigEndian, ByteOrder};
use clap::{Parser, ValueEnum};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Clone, Copy, ValueEnum)]
enum Protocol {
    Gt06,
    Gps303,
    Tk103,
}

#[derive(Parser)]
#[command(name = "devicesim")]
#[command(about = "Generates GT06/GPS303/TK103 device traffic against gps-gateway")]
struct Args {
    /// Gateway host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Gateway port
    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Protocol dialect to simulate
    #[arg(long, value_enum, default_value_t = Protocol::Gt06)]
    protocol: Protocol,

    /// Simulated devices (concurrent connections)
    #[arg(long, default_value_t = 10)]
    devices: usize,

    /// Location reports per device per minute
    #[arg(long, default_value_t = 6)]
    rate: u32,

    /// Duration in seconds
    #[arg(long, default_value_t = 60)]
    duration: u64,

    /// Center latitude
    #[arg(long, default_value_t = 41.0)]
    lat: f64,

    /// Center longitude
    #[arg(long, default_value_t = 29.0)]
    lon: f64,
}

struct Counters {
    connected: AtomicU64,
    frames_sent: AtomicU64,
    acks_received: AtomicU64,
    connect_errors: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Counters {
            connected: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            connect_errors: AtomicU64::new(0),
        }
    }
}

fn random_imei(rng: &mut impl Rng) -> String {
    (0..15).map(|_| std::char::from_digit(rng.gen_range(0..10), 10).unwrap()).collect()
}

mod gt06 {
    use super::*;

    const START: [u8; 2] = [0x78, 0x78];
    const STOP: [u8; 2] = [0x0D, 0x0A];

    fn checksum(len_byte: u8, body: &[u8]) -> u16 {
        let mut sum: u16 = len_byte as u16;
        for &b in body {
            sum = sum.wrapping_add(b as u16);
        }
        sum
    }

    fn frame(proto: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![proto];
        body.extend_from_slice(payload);
        let len_byte = (body.len() + 2) as u8;
        let crc = checksum(len_byte, &body);
        let mut out = Vec::with_capacity(2 + 1 + body.len() + 2 + 2);
        out.extend_from_slice(&START);
        out.push(len_byte);
        out.extend_from_slice(&body);
        let mut crc_bytes = [0u8; 2];
        BigEndian::write_u16(&mut crc_bytes, crc);
        out.extend_from_slice(&crc_bytes);
        out.extend_from_slice(&STOP);
        out
    }

    pub fn login_frame(imei: &str) -> Vec<u8> {
        let imei_bytes: Vec<u8> =
            (0..8).map(|i| u8::from_str_radix(&imei[i * 2..i * 2 + 2], 16).unwrap_or(0)).collect();
        let mut payload = imei_bytes;
        payload.extend_from_slice(&[0x00, 0x01]);
        frame(0x01, &payload)
    }

    pub fn heartbeat_frame() -> Vec<u8> {
        frame(0x13, &[0x01, 0x64, 0x00, 0x01])
    }

    pub fn location_frame(lat: f64, lon: f64, speed: u8) -> Vec<u8> {
        let now = chrono::Utc::now();
        let mut payload = vec![
            (now.format("%y").to_string().parse::<u8>().unwrap_or(24)),
            now.format("%m").to_string().parse().unwrap_or(1),
            now.format("%d").to_string().parse().unwrap_or(1),
            now.format("%H").to_string().parse().unwrap_or(0),
            now.format("%M").to_string().parse().unwrap_or(0),
            now.format("%S").to_string().parse().unwrap_or(0),
        ];
        payload.push(0x0C); // 12 satellites
        let raw_lat = (lat.abs() * 1_800_000.0) as u32;
        let raw_lon = (lon.abs() * 1_800_000.0) as u32;
        payload.extend_from_slice(&raw_lat.to_be_bytes());
        payload.extend_from_slice(&raw_lon.to_be_bytes());
        payload.push(speed);
        let mut course_status: u16 = 0;
        if lat < 0.0 {
            course_status |= 0x1000;
        }
        if lon < 0.0 {
            course_status |= 0x0800;
        }
        payload.extend_from_slice(&course_status.to_be_bytes());
        frame(0x12, &payload)
    }
}

mod gps303 {
    /// Bare `##` login: carries no IMEI, per the gateway's gps303 pre-auth
    /// special case.
    pub fn login_frame() -> Vec<u8> {
        b"##;".to_vec()
    }

    pub fn position_frame(imei: &str, lat: f64, lon: f64, speed: f64) -> Vec<u8> {
        let now = chrono::Utc::now();
        let datetime = now.format("%y%m%d%H%M%S").to_string();
        // Inverse of the gateway's `int(x/100) + (x mod 100)/60` decode.
        let lat_raw = (lat.abs().trunc() * 100.0) + (lat.abs().fract() * 60.0);
        let lon_raw = (lon.abs().trunc() * 100.0) + (lon.abs().fract() * 60.0);
        format!(
            "imei:{},tracker,{},,F,000000.000,A,{:09.4},{},{:010.4},{},{:.1},;",
            imei,
            datetime,
            lat_raw,
            if lat >= 0.0 { "N" } else { "S" },
            lon_raw,
            if lon >= 0.0 { "E" } else { "W" },
            speed,
        )
        .into_bytes()
    }
}

mod tk103 {
    pub fn login_frame(imei: &str) -> Vec<u8> {
        format!("##,imei:{},A;", imei).into_bytes()
    }
}

async fn run_device(
    args: Arc<Args>,
    counters: Arc<Counters>,
    index: usize,
    deadline: Instant,
) -> std::io::Result<()> {
    let imei = random_imei(&mut rand::thread_rng());
    let addr = format!("{}:{}", args.host, args.port);
    let mut stream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(e) => {
            counters.connect_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }
    };
    counters.connected.fetch_add(1, Ordering::Relaxed);

    let login = match args.protocol {
        Protocol::Gt06 => gt06::login_frame(&imei),
        Protocol::Gps303 => gps303::login_frame(),
        Protocol::Tk103 => tk103::login_frame(&imei),
    };
    stream.write_all(&login).await?;
    counters.frames_sent.fetch_add(1, Ordering::Relaxed);
    drain_ack(&mut stream, &counters).await;

    if matches!(args.protocol, Protocol::Gps303) {
        // GPS303 only becomes authenticated once a position frame supplies
        // the IMEI; send one immediately after the bare login.
        let position = gps303::position_frame(&imei, args.lat, args.lon, 0.0);
        stream.write_all(&position).await?;
        counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        drain_ack(&mut stream, &counters).await;
    }

    let interval = Duration::from_secs_f64(60.0 / args.rate.max(1) as f64);
    let mut tick: u64 = 0;
    while Instant::now() < deadline {
        tokio::time::sleep(interval).await;
        let (jitter_lat, jitter_lon, speed_u8, speed_f64) = {
            let mut rng = rand::thread_rng();
            (
                args.lat + rng.gen_range(-0.01..0.01) + (index as f64) * 0.0001,
                args.lon + rng.gen_range(-0.01..0.01),
                rng.gen_range(0..80u8),
                rng.gen_range(0.0..80.0f64),
            )
        };
        let frame = match args.protocol {
            Protocol::Gt06 => gt06::location_frame(jitter_lat, jitter_lon, speed_u8),
            Protocol::Gps303 => gps303::position_frame(&imei, jitter_lat, jitter_lon, speed_f64),
            Protocol::Tk103 => tk103::login_frame(&imei),
        };
        stream.write_all(&frame).await?;
        counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        drain_ack(&mut stream, &counters).await;

        if tick.is_multiple_of(10) {
            let heartbeat = match args.protocol {
                Protocol::Gt06 => gt06::heartbeat_frame(),
                _ => Vec::new(),
            };
            if !heartbeat.is_empty() {
                stream.write_all(&heartbeat).await?;
                counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                drain_ack(&mut stream, &counters).await;
            }
        }
        tick += 1;
    }
    Ok(())
}

async fn drain_ack(stream: &mut TcpStream, counters: &Counters) {
    let mut buf = [0u8; 256];
    match tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            counters.acks_received.fetch_add(1, Ordering::Relaxed);
        }
        _ => {}
    }
}

#[tokio::main]
async fn main() {
    let args = Arc::new(Args::parse());
    let counters = Arc::new(Counters::new());

    println!("=== devicesim ===");
    println!("Target:   {}:{}", args.host, args.port);
    println!("Protocol: {}", match args.protocol {
        Protocol::Gt06 => "gt06",
        Protocol::Gps303 => "gps303",
        Protocol::Tk103 => "tk103",
    });
    println!("Devices:  {}", args.devices);
    println!("Rate:     {} reports/min/device", args.rate);
    println!("Duration: {}s", args.duration);
    println!();

    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let mut handles = Vec::new();
    for i in 0..args.devices {
        let args = args.clone();
        let counters = counters.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_device(args, counters.clone(), i, deadline).await {
                eprintln!("device {i} error: {e}");
            }
        }));
    }

    let progress_counters = counters.clone();
    let progress = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            println!(
                "connected={} sent={} acked={} connect_errors={}",
                progress_counters.connected.load(Ordering::Relaxed),
                progress_counters.frames_sent.load(Ordering::Relaxed),
                progress_counters.acks_received.load(Ordering::Relaxed),
                progress_counters.connect_errors.load(Ordering::Relaxed),
            );
        }
    });

    for h in handles {
        let _ = h.await;
    }
    progress.abort();

    println!("\n=== Results ===");
    println!("Connected:      {}", counters.connected.load(Ordering::Relaxed));
    println!("Frames sent:    {}", counters.frames_sent.load(Ordering::Relaxed));
    println!("Acks received:  {}", counters.acks_received.load(Ordering::Relaxed));
    println!("Connect errors: {}", counters.connect_errors.load(Ordering::Relaxed));
}
