//! NUT (Network UPS Tools) client.
//!
//! Speaks the line-oriented `upsd` protocol: a `LIST VAR <ups>` request
//! answered by `VAR <ups> <name> "<value>"` lines between `BEGIN LIST VAR`
//! and `END LIST VAR`. Only the variables the monitor consumes are kept.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use gridguard_core::monitor::{MonitorError, UpsClient, UpsSample};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

/// Async NUT client for one UPS unit.
pub struct NutClient {
    host: String,
    port: u16,
    ups_name: String,
    conn: Option<BufReader<TcpStream>>,
}

impl NutClient {
    /// Creates a client for `ups_name` on `host:port`.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, ups_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            ups_name: ups_name.into(),
            conn: None,
        }
    }

    async fn list_vars(&mut self, deadline: Instant) -> Result<HashMap<String, String>, MonitorError> {
        let conn = self.conn.as_mut().ok_or(MonitorError::NotConnected)?;

        let request = format!("LIST VAR {}\n", self.ups_name);
        conn.get_mut()
            .write_all(request.as_bytes())
            .await
            .map_err(|e| MonitorError::Transport(e.to_string()))?;

        let mut vars = HashMap::new();
        let mut line = String::new();
        loop {
            line.clear();
            let read = tokio::time::timeout_at(deadline, conn.read_line(&mut line))
                .await
                .map_err(|_| MonitorError::Timeout)?
                .map_err(|e| MonitorError::Transport(e.to_string()))?;
            if read == 0 {
                return Err(MonitorError::Transport("connection closed".to_string()));
            }

            let line = line.trim_end();
            if line.starts_with("BEGIN LIST VAR") {
                continue;
            }
            if line.starts_with("END LIST VAR") {
                break;
            }
            if let Some(err) = line.strip_prefix("ERR ") {
                return Err(MonitorError::Protocol(err.to_string()));
            }
            if let Some((name, value)) = parse_var_line(line, &self.ups_name) {
                vars.insert(name, value);
            }
        }
        Ok(vars)
    }
}

/// Parses one `VAR <ups> <name> "<value>"` line.
fn parse_var_line(line: &str, ups_name: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("VAR ")?;
    let rest = rest.strip_prefix(ups_name)?.strip_prefix(' ')?;
    let (name, value) = rest.split_once(' ')?;
    Some((name.to_string(), value.trim_matches('"').to_string()))
}

#[async_trait]
impl UpsClient for NutClient {
    async fn connect(&mut self) -> Result<(), MonitorError> {
        debug!(host = %self.host, port = self.port, "connecting to NUT server");
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| MonitorError::Transport(format!("connecting to NUT server: {e}")))?;
        self.conn = Some(BufReader::new(stream));
        Ok(())
    }

    async fn get_status(&mut self, deadline: Instant) -> Result<UpsSample, MonitorError> {
        let vars = self.list_vars(deadline).await?;

        Ok(UpsSample {
            name: self.ups_name.clone(),
            status: vars.get("ups.status").cloned().unwrap_or_default(),
            battery_charge: vars
                .get("battery.charge")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            runtime_secs: vars
                .get("battery.runtime")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            load: vars.get("ups.load").and_then(|v| v.parse().ok()).unwrap_or(0),
            timestamp: Utc::now(),
        })
    }

    async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.get_mut().shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn test_parse_var_line() {
        assert_eq!(
            parse_var_line(r#"VAR rack-ups ups.status "OB LB""#, "rack-ups"),
            Some(("ups.status".to_string(), "OB LB".to_string()))
        );
        assert_eq!(
            parse_var_line(r#"VAR rack-ups battery.charge "42""#, "rack-ups"),
            Some(("battery.charge".to_string(), "42".to_string()))
        );
        // Wrong unit name is ignored.
        assert_eq!(parse_var_line(r#"VAR other ups.load "10""#, "rack-ups"), None);
        assert_eq!(parse_var_line("garbage", "rack-ups"), None);
    }

    /// One-shot fake upsd that answers a single LIST VAR request.
    async fn fake_upsd(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 128];
            let _ = socket.read(&mut request).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_get_status_parses_sample() {
        let port = fake_upsd(concat!(
            "BEGIN LIST VAR rack-ups\n",
            "VAR rack-ups ups.status \"OB\"\n",
            "VAR rack-ups battery.charge \"55\"\n",
            "VAR rack-ups battery.runtime \"720\"\n",
            "VAR rack-ups ups.load \"38\"\n",
            "END LIST VAR rack-ups\n",
        ))
        .await;

        let mut client = NutClient::new("127.0.0.1", port, "rack-ups");
        client.connect().await.unwrap();
        let sample = client
            .get_status(Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();
        client.close().await;

        assert!(sample.is_on_battery());
        assert_eq!(sample.battery_charge, 55);
        assert_eq!(sample.runtime_secs, 720);
        assert_eq!(sample.load, 38);
    }

    #[tokio::test]
    async fn test_protocol_error_is_surfaced() {
        let port = fake_upsd("ERR UNKNOWN-UPS\n").await;

        let mut client = NutClient::new("127.0.0.1", port, "rack-ups");
        client.connect().await.unwrap();
        let err = client
            .get_status(Instant::now() + Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_status_read_without_connect_fails() {
        let mut client = NutClient::new("127.0.0.1", 3493, "rack-ups");
        let err = client
            .get_status(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::NotConnected));
    }
}
