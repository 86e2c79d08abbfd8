//! Prometheus metrics adapter (`/api/v1/query_range`).
//!
//! Besides raw PromQL, exposes canned cpu/memory/latency helpers so the
//! agent gets useful series without writing queries.

use chrono::DateTime;
use serde_json::Value;

use fl_domain::{Error, Result};

use crate::adapter::{
    http_client, status_err, transport_err, Credentials, MetricPoint, MetricSeries,
    MetricsAdapter, TimeRange,
};

pub struct PrometheusAdapter {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl PrometheusAdapter {
    pub fn new(creds: &Credentials) -> Result<Self> {
        Ok(Self {
            base_url: creds.require_base_url()?.trim_end_matches('/').to_string(),
            token: creds.token.clone(),
            client: http_client()?,
        })
    }

    async fn query_range(
        &self,
        expr: &str,
        range: &TimeRange,
        step_secs: u64,
    ) -> Result<Vec<MetricSeries>> {
        let url = format!("{}/api/v1/query_range", self.base_url);
        let mut req = self.client.get(&url).query(&[
            ("query", expr.to_string()),
            ("start", range.start.timestamp().to_string()),
            ("end", range.end.timestamp().to_string()),
            ("step", step_secs.max(1).to_string()),
        ]);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| transport_err("prometheus", e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| transport_err("prometheus", e))?;
        if !status.is_success() {
            return Err(status_err("prometheus", status, &body));
        }

        let v: Value = serde_json::from_str(&body)?;
        parse_matrix(&v)
    }
}

fn parse_matrix(v: &Value) -> Result<Vec<MetricSeries>> {
    let results = v
        .pointer("/data/result")
        .and_then(|r| r.as_array())
        .ok_or_else(|| Error::Http("prometheus: unexpected response shape".into()))?;

    let mut series = Vec::new();
    for entry in results {
        let labels = entry
            .get("metric")
            .map(|m| m.to_string())
            .unwrap_or_else(|| "{}".into());
        let values = entry
            .get("values")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let points = values
            .iter()
            .filter_map(|pair| {
                let ts = pair.get(0)?.as_f64()?;
                let val: f64 = pair.get(1)?.as_str()?.parse().ok()?;
                Some(MetricPoint {
                    timestamp: DateTime::from_timestamp(ts as i64, 0)?,
                    value: val,
                })
            })
            .collect();
        series.push(MetricSeries { labels, points });
    }
    Ok(series)
}

#[async_trait::async_trait]
impl MetricsAdapter for PrometheusAdapter {
    async fn query(
        &self,
        expr: &str,
        range: &TimeRange,
        step_secs: u64,
    ) -> Result<Vec<MetricSeries>> {
        self.query_range(expr, range, step_secs).await
    }

    async fn cpu(&self, service: &str, range: &TimeRange) -> Result<Vec<MetricSeries>> {
        let expr = format!(
            r#"sum(rate(container_cpu_usage_seconds_total{{pod=~"{service}.*"}}[5m]))"#
        );
        self.query_range(&expr, range, 60).await
    }

    async fn memory(&self, service: &str, range: &TimeRange) -> Result<Vec<MetricSeries>> {
        let expr = format!(
            r#"sum(container_memory_working_set_bytes{{pod=~"{service}.*"}})"#
        );
        self.query_range(&expr, range, 60).await
    }

    async fn latency(&self, service: &str, range: &TimeRange) -> Result<Vec<MetricSeries>> {
        let expr = format!(
            r#"histogram_quantile(0.99, sum(rate(http_request_duration_seconds_bucket{{service="{service}"}}[5m])) by (le))"#
        );
        self.query_range(&expr, range, 60).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_matrix_values() {
        let body = serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [{
                    "metric": {"service": "api-gw"},
                    "values": [[1722470400.0, "0.93"], [1722470460.0, "2.14"]]
                }]
            }
        });
        let series = parse_matrix(&body).unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].points.len(), 2);
        assert!((series[0].points[1].value - 2.14).abs() < f64::EPSILON);
        assert!(series[0].labels.contains("api-gw"));
    }

    #[test]
    fn skips_unparsable_points() {
        let body = serde_json::json!({
            "data": {"result": [{"metric": {}, "values": [[1722470400.0, "NaN-ish?"]]}]}
        });
        let series = parse_matrix(&body).unwrap();
        assert!(series[0].points.is_empty());
    }
}
