//! Grafana Loki logs adapter (`/loki/api/v1/query_range`).

use chrono::{DateTime, Utc};
use serde_json::Value;

use fl_domain::{Error, Result};

use crate::adapter::{
    http_client, status_err, transport_err, Credentials, LogEntry, LogsAdapter, TimeRange,
};

pub struct LokiAdapter {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl LokiAdapter {
    pub fn new(creds: &Credentials) -> Result<Self> {
        Ok(Self {
            base_url: creds.require_base_url()?.trim_end_matches('/').to_string(),
            token: creds.token.clone(),
            client: http_client()?,
        })
    }

    async fn query_range(
        &self,
        logql: &str,
        range: &TimeRange,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let url = format!("{}/loki/api/v1/query_range", self.base_url);
        let mut req = self.client.get(&url).query(&[
            ("query", logql.to_string()),
            ("start", nanos(range.start)),
            ("end", nanos(range.end)),
            ("limit", limit.to_string()),
            ("direction", "backward".to_string()),
        ]);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| transport_err("loki", e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| transport_err("loki", e))?;
        if !status.is_success() {
            return Err(status_err("loki", status, &body));
        }

        let v: Value = serde_json::from_str(&body)?;
        parse_streams(&v)
    }
}

fn nanos(t: DateTime<Utc>) -> String {
    format!("{}", t.timestamp_nanos_opt().unwrap_or(0))
}

fn parse_streams(v: &Value) -> Result<Vec<LogEntry>> {
    let results = v
        .pointer("/data/result")
        .and_then(|r| r.as_array())
        .ok_or_else(|| Error::Http("loki: unexpected response shape".into()))?;

    let mut entries = Vec::new();
    for stream in results {
        let labels = stream.get("stream").cloned().unwrap_or(Value::Null);
        let values = stream
            .get("values")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for pair in values {
            let ts_nanos: i64 = pair
                .get(0)
                .and_then(|t| t.as_str())
                .and_then(|t| t.parse().ok())
                .unwrap_or(0);
            let line = pair
                .get(1)
                .and_then(|l| l.as_str())
                .unwrap_or_default()
                .to_string();
            entries.push(LogEntry {
                timestamp: DateTime::from_timestamp_nanos(ts_nanos),
                line,
                labels: labels.clone(),
            });
        }
    }
    // Newest first across streams.
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(entries)
}

#[async_trait::async_trait]
impl LogsAdapter for LokiAdapter {
    async fn search(
        &self,
        query: &str,
        range: &TimeRange,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        self.query_range(query, range, limit.clamp(1, 1000)).await
    }

    async fn errors(&self, service: &str, range: &TimeRange) -> Result<Vec<LogEntry>> {
        let logql = format!(r#"{{service="{service}"}} |~ "(?i)(error|exception|fatal)""#);
        self.query_range(&logql, range, 200).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stream_values() {
        let body = serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "streams",
                "result": [{
                    "stream": {"service": "api-gw", "level": "error"},
                    "values": [
                        ["1722470400000000000", "connection refused to db-primary"],
                        ["1722470300000000000", "timeout waiting for pool"]
                    ]
                }]
            }
        });
        let entries = parse_streams(&body).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].timestamp > entries[1].timestamp);
        assert_eq!(entries[0].line, "connection refused to db-primary");
        assert_eq!(entries[0].labels["service"], "api-gw");
    }

    #[test]
    fn bad_shape_is_an_error() {
        assert!(parse_streams(&serde_json::json!({"data": {}})).is_err());
    }

    #[test]
    fn requires_base_url() {
        let creds = Credentials::from_json("{}").unwrap();
        assert!(LokiAdapter::new(&creds).is_err());
    }
}
