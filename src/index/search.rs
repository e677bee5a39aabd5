//! Elasticsearch-backed full-text index.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{debug, info};

use super::{check_status, IndexResult, SearchDocument, SearchIndex};
use crate::config::SearchConfig;

const BACKEND: &str = "elasticsearch";

pub struct ElasticsearchIndex {
    client: Client,
    config: SearchConfig,
}

impl ElasticsearchIndex {
    pub fn new(config: SearchConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}{}", self.config.url.trim_end_matches('/'), self.config.index, path)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.username {
            Some(user) => builder.basic_auth(user, self.config.password.as_deref()),
            None => builder,
        }
    }

    /// Create the index with its mapping unless it already exists
    pub async fn ensure_index(&self) -> IndexResult<()> {
        let response = self
            .request(reqwest::Method::HEAD, self.url(""))
            .send()
            .await?;
        if response.status() != StatusCode::NOT_FOUND {
            check_status(BACKEND, response).await?;
            debug!("Search index {} exists", self.config.index);
            return Ok(());
        }

        let mapping = json!({
            "mappings": {
                "properties": {
                    "title": { "type": "text" },
                    "content": { "type": "text" },
                    "projectId": { "type": "keyword" },
                    "uid": { "type": "keyword" },
                    "updatedAt": { "type": "date" }
                }
            }
        });
        let response = self
            .request(reqwest::Method::PUT, self.url(""))
            .json(&mapping)
            .send()
            .await?;
        check_status(BACKEND, response).await?;

        info!("Created search index {}", self.config.index);
        Ok(())
    }
}

/// Partial-update body that creates the entry when missing
pub(crate) fn upsert_body(document: &SearchDocument) -> serde_json::Value {
    json!({
        "doc": document,
        "doc_as_upsert": true
    })
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    async fn upsert(&self, document: &SearchDocument) -> IndexResult<()> {
        let url = self.url(&format!("/_update/{}", document.id));
        let response = self
            .request(reqwest::Method::POST, url)
            .json(&upsert_body(document))
            .send()
            .await?;
        check_status(BACKEND, response).await?;
        Ok(())
    }
}

/// Accepts every upsert without doing anything
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledSearchIndex;

#[async_trait]
impl SearchIndex for DisabledSearchIndex {
    async fn upsert(&self, document: &SearchDocument) -> IndexResult<()> {
        debug!("Search indexing disabled, skipping {}", document.id);
        Ok(())
    }
}
