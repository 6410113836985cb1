//! Prometheus instant-query source.
//!
//! Each snapshot issues one instant query per signal against
//! `{base}/api/v1/query`. CPU is mandatory; memory and pending pods are
//! standard node-exporter / kube-state-metrics series; queue depth and
//! interruption notices come from optional, operator-supplied queries.

use std::time::Duration;

use nodefleet_core::MetricsConfig;
use nodefleet_core::http::get_json;
use nodefleet_state::MetricSnapshot;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::{MetricsError, MetricsResult};
use crate::source::{MetricSource, SnapshotFuture};

pub const CPU_QUERY: &str = r#"avg(rate(node_cpu_seconds_total{mode!="idle"}[5m])) * 100"#;
pub const MEMORY_QUERY: &str =
    "(1 - avg(node_memory_MemAvailable_bytes / node_memory_MemTotal_bytes)) * 100";
pub const PENDING_QUERY: &str = r#"sum(kube_pod_status_phase{phase="Pending"})"#;

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<VectorSample>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    /// `[unix_time, "value"]`
    value: (f64, String),
}

#[derive(Debug, Clone)]
pub struct PrometheusSource {
    base_url: String,
    timeout: Duration,
    queue_depth_query: Option<String>,
    interruption_query: Option<String>,
}

impl PrometheusSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            queue_depth_query: None,
            interruption_query: None,
        }
    }

    pub fn from_config(config: &MetricsConfig) -> MetricsResult<Self> {
        let url = config
            .prometheus_url
            .as_deref()
            .ok_or_else(|| MetricsError::NotConfigured("[metrics] prometheus_url".to_string()))?;
        let mut source = Self::new(url, config.query_timeout.as_duration());
        source.queue_depth_query = config.queue_depth_query.clone();
        source.interruption_query = config.interruption_query.clone();
        Ok(source)
    }

    pub fn with_queue_depth_query(mut self, query: impl Into<String>) -> Self {
        self.queue_depth_query = Some(query.into());
        self
    }

    pub fn with_interruption_query(mut self, query: impl Into<String>) -> Self {
        self.interruption_query = Some(query.into());
        self
    }

    fn query_url(&self, query: &str) -> MetricsResult<Url> {
        let endpoint = format!("{}/api/v1/query", self.base_url);
        Ok(Url::parse_with_params(&endpoint, &[("query", query)])?)
    }

    /// Run an instant query and return the first sample's value, or `None`
    /// when the result vector is empty.
    pub async fn query(&self, query: &str) -> MetricsResult<Option<f64>> {
        let uri = self.query_url(query)?;
        let response: QueryResponse = get_json(uri.as_str(), self.timeout).await?;
        if response.status != "success" {
            return Err(MetricsError::Query {
                query: query.to_string(),
                reason: response.error.unwrap_or(response.status),
            });
        }
        let data = response.data.ok_or_else(|| MetricsError::Query {
            query: query.to_string(),
            reason: "missing data".to_string(),
        })?;
        if data.result_type != "vector" {
            return Err(MetricsError::Query {
                query: query.to_string(),
                reason: format!("expected a vector result, got {}", data.result_type),
            });
        }
        let Some(sample) = data.result.first() else {
            return Ok(None);
        };
        let value: f64 = sample.value.1.parse().map_err(|_| MetricsError::Query {
            query: query.to_string(),
            reason: format!("unparseable value {:?}", sample.value.1),
        })?;
        Ok(Some(value))
    }

    async fn optional(&self, query: Option<&str>) -> MetricsResult<Option<f64>> {
        match query {
            Some(q) => self.query(q).await,
            None => Ok(None),
        }
    }

    async fn collect(&self, cluster_id: &str, now: u64) -> MetricsResult<MetricSnapshot> {
        let (cpu, memory, pending, queue, interruption) = tokio::join!(
            self.query(CPU_QUERY),
            self.query(MEMORY_QUERY),
            self.query(PENDING_QUERY),
            self.optional(self.queue_depth_query.as_deref()),
            self.optional(self.interruption_query.as_deref()),
        );

        let cpu = cpu?.ok_or_else(|| MetricsError::Empty(CPU_QUERY.to_string()))?;
        let mut snapshot = MetricSnapshot::new(cluster_id, now, cpu, as_count(pending?));

        match memory {
            Ok(Some(memory)) => snapshot = snapshot.with_memory(memory),
            Ok(None) => {}
            Err(e) => warn!(%cluster_id, error = %e, "memory query failed; continuing without it"),
        }
        if let Some(depth) = queue? {
            snapshot = snapshot.with_queue_depth(as_count(Some(depth)));
        }
        if interruption?.is_some_and(|v| v > 0.0) {
            snapshot = snapshot.with_interruption(true);
        }

        debug!(
            %cluster_id,
            cpu = snapshot.avg_cpu_utilization,
            memory = ?snapshot.avg_memory_utilization,
            pending = snapshot.pending_workload_count,
            queue_depth = ?snapshot.queue_depth,
            interruption = snapshot.external_interruption_signal,
            "prometheus snapshot"
        );
        Ok(snapshot)
    }
}

/// Non-negative whole count from a query value; empty or non-finite is zero.
fn as_count(value: Option<f64>) -> u64 {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => v.round() as u64,
        _ => 0,
    }
}

impl MetricSource for PrometheusSource {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    fn snapshot<'a>(&'a self, cluster_id: &'a str, now: u64) -> SnapshotFuture<'a> {
        Box::pin(self.collect(cluster_id, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn vector(value: &str) -> String {
        format!(
            r#"{{"status":"success","data":{{"resultType":"vector","result":[{{"metric":{{}},"value":[1700000000.123,"{value}"]}}]}}}}"#
        )
    }

    const EMPTY: &str = r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;

    /// Fake Prometheus: answers each query by matching a marker in the
    /// request line.
    async fn fake_prometheus(routes: Vec<(&'static str, String)>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]).to_string();
                    let line = request.lines().next().unwrap_or_default().to_string();
                    let body = routes
                        .iter()
                        .find(|(marker, _)| line.contains(marker))
                        .map(|(_, body)| body.clone())
                        .unwrap_or_else(|| EMPTY.to_string());
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(resp.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn snapshot_combines_queries() {
        let base = fake_prometheus(vec![
            ("node_cpu_seconds_total", vector("72.5")),
            ("node_memory_MemAvailable_bytes", vector("61.0")),
            ("kube_pod_status_phase", vector("3")),
            ("work_queue_depth", vector("1200")),
            ("node_interruption", vector("1")),
        ])
        .await;
        let source = PrometheusSource::new(base, Duration::from_secs(5))
            .with_queue_depth_query("max(work_queue_depth)")
            .with_interruption_query("max(node_interruption)");

        let snap = source.snapshot("c", 1_000).await.unwrap();
        assert_eq!(snap.timestamp, 1_000);
        assert_eq!(snap.avg_cpu_utilization, 72.5);
        assert_eq!(snap.avg_memory_utilization, Some(61.0));
        assert_eq!(snap.pending_workload_count, 3);
        assert_eq!(snap.queue_depth, Some(1200));
        assert!(snap.external_interruption_signal);
    }

    #[tokio::test]
    async fn missing_cpu_is_an_error() {
        let base = fake_prometheus(vec![("kube_pod_status_phase", vector("0"))]).await;
        let source = PrometheusSource::new(base, Duration::from_secs(5));
        let err = source.snapshot("c", 1).await.unwrap_err();
        assert!(matches!(err, MetricsError::Empty(_)));
    }

    #[tokio::test]
    async fn empty_pending_reads_as_zero() {
        let base = fake_prometheus(vec![("node_cpu_seconds_total", vector("12"))]).await;
        let source = PrometheusSource::new(base, Duration::from_secs(5));
        let snap = source.snapshot("c", 1).await.unwrap();
        assert_eq!(snap.pending_workload_count, 0);
        assert_eq!(snap.avg_memory_utilization, None);
        assert!(!snap.external_interruption_signal);
    }

    #[tokio::test]
    async fn error_status_is_query_error() {
        let base = fake_prometheus(vec![(
            "node_cpu_seconds_total",
            r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#.to_string(),
        )])
        .await;
        let source = PrometheusSource::new(base, Duration::from_secs(5));
        let err = source.query(CPU_QUERY).await.unwrap_err();
        match err {
            MetricsError::Query { reason, .. } => assert_eq!(reason, "parse error"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unreachable_server_is_http_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let source = PrometheusSource::new(format!("http://{addr}"), Duration::from_secs(2));
        let err = source.snapshot("c", 1).await.unwrap_err();
        assert!(matches!(err, MetricsError::Http(_)));
    }

    #[test]
    fn from_config_requires_url() {
        let config = MetricsConfig::default();
        assert!(matches!(
            PrometheusSource::from_config(&config),
            Err(MetricsError::NotConfigured(_))
        ));

        let config = MetricsConfig {
            prometheus_url: Some("http://prometheus:9090/".to_string()),
            ..MetricsConfig::default()
        };
        let source = PrometheusSource::from_config(&config).unwrap();
        assert_eq!(source.base_url, "http://prometheus:9090");
    }

    #[test]
    fn query_is_form_encoded() {
        let source = PrometheusSource::new("http://prometheus:9090/", Duration::from_secs(1));
        let url = source.query_url(r#"sum(up{job="node"}) by (zone)"#).unwrap();
        assert_eq!(
            url.as_str(),
            "http://prometheus:9090/api/v1/query?query=sum%28up%7Bjob%3D%22node%22%7D%29+by+%28zone%29"
        );

        let broken = PrometheusSource::new("not a url", Duration::from_secs(1));
        assert!(matches!(broken.query_url("up"), Err(MetricsError::Url(_))));
    }

    #[test]
    fn counts_round_and_floor_at_zero() {
        assert_eq!(as_count(Some(2.6)), 3);
        assert_eq!(as_count(Some(-1.0)), 0);
        assert_eq!(as_count(Some(f64::NAN)), 0);
        assert_eq!(as_count(None), 0);
    }
}
