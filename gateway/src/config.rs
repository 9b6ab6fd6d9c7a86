//! Environment configuration (spec §6). Read once at startup with the
//! same `env::var(..).ok().and_then(..).unwrap_or(..)` idiom the teacher
//! uses for its own `PORT` lookup.

#[derive(Debug, Clone)]
pub struct Config {
    pub tcp_host: String,
    pub tcp_port: u16,
    pub log_level: String,
    pub database_url: String,
    pub rabbitmq_url: String,
    pub queue_name: String,
    pub queue_ttl_ms: Option<u64>,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            tcp_host: std::env::var("TCP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            tcp_port: std::env::var("TCP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5000),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/gps_gateway".to_string()),
            rabbitmq_url: std::env::var("RABBITMQ_URL")
                .unwrap_or_else(|_| "amqp://127.0.0.1:5672/%2f".to_string()),
            queue_name: std::env::var("QUEUE_NAME").unwrap_or_else(|_| "device_commands".to_string()),
            queue_ttl_ms: std::env::var("QUEUE_TTL").ok().and_then(|p| p.parse().ok()),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.tcp_host, self.tcp_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addr_formats_host_and_port() {
        let c = Config {
            tcp_host: "0.0.0.0".into(),
            tcp_port: 5000,
            log_level: "info".into(),
            database_url: String::new(),
            rabbitmq_url: String::new(),
            queue_name: "device_commands".into(),
            queue_ttl_ms: None,
        };
        assert_eq!(c.bind_addr(), "0.0.0.0:5000");
    }
}
