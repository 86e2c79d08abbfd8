//! Datadog adapter: log search (v2) and metric queries (v1).
//!
//! One integration row serves both the logs and metrics capability
//! groups; the registry hands out a fresh handle per call either way.

use chrono::DateTime;
use serde_json::Value;

use fl_domain::{Error, Result};

use crate::adapter::{
    http_client, status_err, transport_err, Credentials, LogEntry, LogsAdapter, MetricPoint,
    MetricSeries, MetricsAdapter, TimeRange,
};

const DEFAULT_BASE: &str = "https://api.datadoghq.com";

pub struct DatadogAdapter {
    base_url: String,
    api_key: String,
    app_key: String,
    client: reqwest::Client,
}

impl DatadogAdapter {
    pub fn new(creds: &Credentials) -> Result<Self> {
        let api_key = creds
            .token
            .clone()
            .ok_or_else(|| Error::Config("datadog credentials missing api key".into()))?;
        let app_key = creds
            .app_key
            .clone()
            .ok_or_else(|| Error::Config("datadog credentials missing app key".into()))?;
        Ok(Self {
            base_url: creds
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            app_key,
            client: http_client()?,
        })
    }

    fn keyed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("DD-API-KEY", &self.api_key)
            .header("DD-APPLICATION-KEY", &self.app_key)
    }

    async fn search_logs(
        &self,
        query: &str,
        range: &TimeRange,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let url = format!("{}/api/v2/logs/events/search", self.base_url);
        let body = serde_json::json!({
            "filter": {
                "query": query,
                "from": range.start.to_rfc3339(),
                "to": range.end.to_rfc3339(),
            },
            "sort": "-timestamp",
            "page": { "limit": limit.clamp(1, 1000) },
        });

        let resp = self
            .keyed(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_err("datadog", e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| transport_err("datadog", e))?;
        if !status.is_success() {
            return Err(status_err("datadog", status, &text));
        }

        let v: Value = serde_json::from_str(&text)?;
        parse_log_events(&v)
    }
}

fn parse_log_events(v: &Value) -> Result<Vec<LogEntry>> {
    let items = v
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::Http("datadog: unexpected logs response shape".into()))?;

    Ok(items
        .iter()
        .filter_map(|item| {
            let attrs = item.get("attributes")?;
            let timestamp = attrs
                .get("timestamp")
                .and_then(|t| t.as_str())
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())?
                .with_timezone(&chrono::Utc);
            let line = attrs
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string();
            Some(LogEntry {
                timestamp,
                line,
                labels: attrs.get("attributes").cloned().unwrap_or(Value::Null),
            })
        })
        .collect())
}

fn parse_metric_series(v: &Value) -> Result<Vec<MetricSeries>> {
    let series = v
        .get("series")
        .and_then(|s| s.as_array())
        .ok_or_else(|| Error::Http("datadog: unexpected metrics response shape".into()))?;

    Ok(series
        .iter()
        .map(|entry| {
            let labels = entry
                .get("scope")
                .and_then(|s| s.as_str())
                .unwrap_or("*")
                .to_string();
            let points = entry
                .get("pointlist")
                .and_then(|p| p.as_array())
                .map(|points| {
                    points
                        .iter()
                        .filter_map(|pair| {
                            let ts_ms = pair.get(0)?.as_f64()?;
                            let value = pair.get(1)?.as_f64()?;
                            Some(MetricPoint {
                                timestamp: DateTime::from_timestamp_millis(ts_ms as i64)?,
                                value,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            MetricSeries { labels, points }
        })
        .collect())
}

#[async_trait::async_trait]
impl LogsAdapter for DatadogAdapter {
    async fn search(
        &self,
        query: &str,
        range: &TimeRange,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        self.search_logs(query, range, limit).await
    }

    async fn errors(&self, service: &str, range: &TimeRange) -> Result<Vec<LogEntry>> {
        let query = format!("service:{service} status:error");
        self.search_logs(&query, range, 200).await
    }
}

#[async_trait::async_trait]
impl MetricsAdapter for DatadogAdapter {
    async fn query(
        &self,
        expr: &str,
        range: &TimeRange,
        _step_secs: u64,
    ) -> Result<Vec<MetricSeries>> {
        let url = format!("{}/api/v1/query", self.base_url);
        let resp = self
            .keyed(self.client.get(&url).query(&[
                ("from", range.start.timestamp().to_string()),
                ("to", range.end.timestamp().to_string()),
                ("query", expr.to_string()),
            ]))
            .send()
            .await
            .map_err(|e| transport_err("datadog", e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| transport_err("datadog", e))?;
        if !status.is_success() {
            return Err(status_err("datadog", status, &text));
        }
        let v: Value = serde_json::from_str(&text)?;
        parse_metric_series(&v)
    }

    async fn cpu(&self, service: &str, range: &TimeRange) -> Result<Vec<MetricSeries>> {
        let expr = format!("avg:system.cpu.user{{service:{service}}}");
        self.query(&expr, range, 60).await
    }

    async fn memory(&self, service: &str, range: &TimeRange) -> Result<Vec<MetricSeries>> {
        let expr = format!("avg:system.mem.used{{service:{service}}}");
        self.query(&expr, range, 60).await
    }

    async fn latency(&self, service: &str, range: &TimeRange) -> Result<Vec<MetricSeries>> {
        let expr = format!("p99:trace.http.request.duration{{service:{service}}}");
        self.query(&expr, range, 60).await
    }
}
