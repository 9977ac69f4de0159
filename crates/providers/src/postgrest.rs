//! Minimal PostgREST (Supabase) table client: idempotent upsert and exact counts.

use crate::ProviderError;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;

#[derive(Clone)]
pub struct PostgrestConfig {
    /// REST root, e.g. `https://<project>.supabase.co/rest/v1`.
    pub url: String,
    pub table: String,
    pub api_key: Option<String>,
    /// Conflict target used for upserts.
    pub key_column: String,
}

#[derive(Clone)]
pub struct PostgrestClient {
    client: Client,
    cfg: PostgrestConfig,
}

impl PostgrestClient {
    pub fn new(cfg: PostgrestConfig) -> Self {
        Self {
            client: Client::new(),
            cfg,
        }
    }

    fn table_url(&self) -> String {
        format!("{}/{}", self.cfg.url.trim_end_matches('/'), self.cfg.table)
    }

    fn authorize(&self, mut builder: RequestBuilder) -> RequestBuilder {
        if let Some(key) = &self.cfg.api_key {
            builder = builder.header("apikey", key).bearer_auth(key);
        }
        builder
    }

    /// Inserts or merges `rows` by the key column. Only `columns` are written,
    /// so columns absent from the list keep their remote values on conflict.
    pub async fn upsert<T: Serialize + Sync>(
        &self,
        rows: &[T],
        columns: &[&str],
    ) -> Result<(), ProviderError> {
        if rows.is_empty() {
            return Ok(());
        }
        let query = [
            ("on_conflict", self.cfg.key_column.clone()),
            ("columns", columns.join(",")),
        ];
        let builder = self
            .client
            .post(self.table_url())
            .query(&query)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows);
        let resp = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.bytes().await.unwrap_or(Bytes::from_static(b""));
            return Err(ProviderError::from_status(
                status.as_u16(),
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }
        Ok(())
    }

    /// Exact row count matching PostgREST filters such as
    /// `("usage_count", "gte.1000")`.
    pub async fn count(&self, filters: &[(&str, String)]) -> Result<u64, ProviderError> {
        let mut query: Vec<(&str, String)> = vec![("select", self.cfg.key_column.clone())];
        query.extend(filters.iter().cloned());
        let builder = self
            .client
            .head(self.table_url())
            .query(&query)
            .header("Prefer", "count=exact");
        let resp = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ProviderError::from_status(
                resp.status().as_u16(),
                String::new(),
            ));
        }
        let header = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ProviderError::Malformed("missing Content-Range header".into()))?;
        parse_content_range(header)
            .ok_or_else(|| ProviderError::Malformed(format!("bad Content-Range: {}", header)))
    }

    pub async fn ping(&self) -> Result<(), ProviderError> {
        let builder = self
            .client
            .get(self.table_url())
            .query(&[("select", self.cfg.key_column.as_str()), ("limit", "1")]);
        let resp = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| ProviderError::RequestFailed(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }
        Ok(())
    }
}

/// `0-24/3573` or `*/0` → total.
pub fn parse_content_range(header: &str) -> Option<u64> {
    let (_, total) = header.trim().rsplit_once('/')?;
    total.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total() {
        assert_eq!(parse_content_range("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range("0-24/*"), None);
        assert_eq!(parse_content_range("garbage"), None);
    }
}
