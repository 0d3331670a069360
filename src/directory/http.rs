// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! HTTP directory client.
//!
//! Issues `GET {base}/search/node?q={query}` and expects
//! `{"rows": [NodeRecord, ...]}`.

use serde::Deserialize;
use url::Url;

use super::{DirectoryError, DirectoryResult, NodeDirectory};
use crate::models::NodeRecord;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    rows: Vec<NodeRecord>,
}

/// Node directory backed by a remote search endpoint.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: reqwest::Client,
    search_url: Url,
}

impl HttpDirectory {
    pub fn new(base_url: &str) -> DirectoryResult<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            search_url: search_url(base_url)?,
        })
    }

    pub fn search_url(&self) -> &Url {
        &self.search_url
    }
}

/// Resolve the search endpoint relative to `base_url`.
fn search_url(base_url: &str) -> DirectoryResult<Url> {
    let mut base =
        Url::parse(base_url).map_err(|e| DirectoryError::InvalidUrl(format!("{base_url}: {e}")))?;
    // Url::join drops the last segment unless the base ends in '/'.
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("search/node")
        .map_err(|e| DirectoryError::InvalidUrl(format!("{base_url}: {e}")))
}

impl NodeDirectory for HttpDirectory {
    async fn search(&self, query: &str) -> DirectoryResult<Vec<NodeRecord>> {
        let response = self
            .client
            .get(self.search_url.clone())
            .query(&[("q", query)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DirectoryError::Status(status.as_u16()));
        }

        let body: SearchResponse = response.json().await?;
        Ok(body.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_url_appends_path() {
        let d = HttpDirectory::new("https://directory.internal/api").unwrap();
        assert_eq!(
            d.search_url().as_str(),
            "https://directory.internal/api/search/node"
        );
        let d = HttpDirectory::new("https://directory.internal/").unwrap();
        assert_eq!(d.search_url().as_str(), "https://directory.internal/search/node");
    }

    #[test]
    fn invalid_url_rejected() {
        assert!(matches!(
            HttpDirectory::new("not a url"),
            Err(DirectoryError::InvalidUrl(_))
        ));
    }

    #[test]
    fn response_rows_parse() {
        let body: SearchResponse = serde_json::from_str(
            r#"{"rows":[{"name":"db1","ipaddress":"10.0.0.5","keymaster":{"uuid":"u1"}}],"total":1}"#,
        )
        .unwrap();
        assert_eq!(body.rows.len(), 1);
        assert_eq!(body.rows[0].preferred_address(), Some("10.0.0.5"));
    }
}
