//! `pme diagnose`: connectivity checks against the discovery API and the feed host.

use std::fmt;
use std::time::{Duration, Instant};

use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

use crate::config::AppConfig;
use crate::error::{AppError, Result};

const TCP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub ok: bool,
    pub detail: String,
    pub elapsed_ms: u128,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = if self.ok { "OK  " } else { "FAIL" };
        write!(f, "[{mark}] {:<28} {:>6}ms  {}", self.name, self.elapsed_ms, self.detail)
    }
}

#[derive(Debug, Default)]
pub struct Report {
    pub checks: Vec<Check>,
}

impl Report {
    pub fn ok(&self) -> bool {
        self.checks.iter().all(|c| c.ok)
    }

    fn record(&mut self, name: impl Into<String>, started: Instant, result: Result<String>) {
        let (ok, detail) = match result {
            Ok(detail) => (true, detail),
            Err(e) => (false, e.to_string()),
        };
        self.checks.push(Check { name: name.into(), ok, detail, elapsed_ms: started.elapsed().as_millis() });
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for check in &self.checks {
            writeln!(f, "{check}")?;
        }
        let failed = self.checks.iter().filter(|c| !c.ok).count();
        write!(f, "{} checks, {failed} failed", self.checks.len())
    }
}

/// `(host, port)` from an http(s)/ws(s) URL; the port defaults by scheme.
pub fn host_port(url: &str) -> Result<(String, u16)> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| AppError::Config(format!("`{url}` is not an absolute URL")))?;
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
    if authority.is_empty() {
        return Err(AppError::Config(format!("`{url}` has no host")));
    }
    let default_port = match scheme.to_ascii_lowercase().as_str() {
        "https" | "wss" => 443,
        "http" | "ws" => 80,
        other => return Err(AppError::Config(format!("unsupported scheme `{other}`"))),
    };
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| AppError::Config(format!("invalid port in `{url}`")))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

async fn resolve(host: &str, port: u16) -> Result<String> {
    let addrs: Vec<_> = lookup_host((host, port)).await?.collect();
    match addrs.first() {
        Some(first) => Ok(format!("{} address(es), first {}", addrs.len(), first.ip())),
        None => Err(AppError::Config(format!("{host} resolved to no addresses"))),
    }
}

async fn gamma_probe(cfg: &AppConfig) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.gamma.timeout_sec))
        .build()?;
    let url = format!("{}/markets", cfg.gamma.base_url.trim_end_matches('/'));
    let resp = client.get(&url).query(&[("limit", "1")]).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(AppError::Catalog(format!("GET {url}?limit=1 returned HTTP {status}")));
    }
    let body: serde_json::Value = resp.json().await?;
    let count = body.as_array().map_or(0, Vec::len);
    Ok(format!("HTTP {status}, {count} market(s)"))
}

async fn tcp_probe(host: &str, port: u16) -> Result<String> {
    let stream = timeout(TCP_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| AppError::Timeout(format!("TCP connect to {host}:{port}")))??;
    let peer = stream.peer_addr()?;
    Ok(format!("connected to {peer}"))
}

/// Runs every check; individual failures are reported, never returned.
pub async fn run(cfg: &AppConfig) -> Report {
    let mut report = Report::default();

    let gamma = host_port(&cfg.gamma.base_url);
    let feed = host_port(&cfg.clob.ws_url);

    for (label, target) in [("gamma", &gamma), ("feed", &feed)] {
        let started = Instant::now();
        let result = match target {
            Ok((host, port)) => resolve(host, *port).await,
            Err(e) => Err(AppError::Config(e.to_string())),
        };
        report.record(format!("dns {label}"), started, result);
    }

    let started = Instant::now();
    report.record("gamma /markets?limit=1", started, gamma_probe(cfg).await);

    let started = Instant::now();
    let result = match &feed {
        Ok((host, _)) => tcp_probe(host, 443).await,
        Err(e) => Err(AppError::Config(e.to_string())),
    };
    report.record("tcp feed:443", started, result);

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_defaults_by_scheme() {
        assert_eq!(
            host_port("wss://ws-subscriptions-clob.polymarket.com/ws/market").unwrap(),
            ("ws-subscriptions-clob.polymarket.com".to_string(), 443)
        );
        assert_eq!(host_port("https://gamma-api.polymarket.com").unwrap().1, 443);
        assert_eq!(host_port("http://localhost:8080/x?y=1").unwrap(), ("localhost".to_string(), 8080));
        assert_eq!(host_port("ws://user@127.0.0.1/feed").unwrap(), ("127.0.0.1".to_string(), 80));
        assert!(host_port("gamma-api.polymarket.com").is_err());
        assert!(host_port("ftp://host").is_err());
        assert!(host_port("https:///path").is_err());
    }

    #[test]
    fn report_fails_if_any_check_fails() {
        let mut report = Report::default();
        report.record("a", Instant::now(), Ok("fine".into()));
        assert!(report.ok());
        report.record("b", Instant::now(), Err(AppError::Timeout("slow".into())));
        assert!(!report.ok());
        let text = report.to_string();
        assert!(text.contains("[FAIL] b"));
        assert!(text.ends_with("2 checks, 1 failed"));
    }

    #[tokio::test]
    async fn tcp_probe_reports_refused_connections() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(tcp_probe("127.0.0.1", port).await.is_ok());
        drop(listener);
        assert!(tcp_probe("127.0.0.1", port).await.is_err());
    }
}
