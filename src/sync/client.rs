use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::wire::{
    ClientLogEntry, CompactRequest, CompactResponse, EmbeddingsResponse, QueryEmbeddingResponse,
    SaveAck, SaveDocJsonRequest, SnapshotRequest, SnapshotResponse, TreeOpKind, UserInfo,
};
use crate::error::HttpError;
use crate::store::{ArticleIndexRow, CachedArticle};

/// A fetched upload body.
#[derive(Debug, Clone)]
pub struct MediaFetch {
    pub bytes: Bytes,
    pub mime: Option<String>,
}

/// The wire contract the engine expects of the server. Tests drive the
/// engine through a scripted implementation.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn get_me(&self) -> Result<UserInfo, HttpError>;
    async fn list_articles(&self) -> Result<Vec<ArticleIndexRow>, HttpError>;
    async fn get_article(&self, id: &str) -> Result<CachedArticle, HttpError>;
    async fn get_inbox(&self) -> Result<CachedArticle, HttpError>;
    async fn save_doc_json(
        &self,
        id: &str,
        req: &SaveDocJsonRequest,
    ) -> Result<SaveAck, HttpError>;
    async fn sync_compact(
        &self,
        id: &str,
        req: &CompactRequest,
    ) -> Result<CompactResponse, HttpError>;
    async fn structure_snapshot(
        &self,
        id: &str,
        req: &SnapshotRequest,
    ) -> Result<SnapshotResponse, HttpError>;
    async fn create_article(&self, payload: &Value) -> Result<Value, HttpError>;
    async fn tree_op(&self, id: &str, op: TreeOpKind, payload: &Value) -> Result<(), HttpError>;
    async fn get_embeddings(
        &self,
        id: &str,
        section_ids: Option<&[String]>,
    ) -> Result<EmbeddingsResponse, HttpError>;
    async fn query_embedding(&self, query: &str) -> Result<Vec<f32>, HttpError>;
    async fn fetch_upload(&self, path: &str) -> Result<MediaFetch, HttpError>;
    async fn post_client_log(&self, entries: &[ClientLogEntry]) -> Result<(), HttpError>;
}

/// Credentialed JSON client against the notes server.
pub struct HttpClient {
    base: Url,
    http: reqwest::Client,
}

impl HttpClient {
    pub fn new(base: Url) -> Result<Self, HttpError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(HttpError::from)?;
        Ok(Self { base, http })
    }

    fn url(&self, path: &str) -> Result<Url, HttpError> {
        self.base.join(path).map_err(|e| HttpError::Retryable {
            status: None,
            message: format!("bad url {path}: {e}"),
        })
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&(impl Serialize + ?Sized)>,
    ) -> Result<T, HttpError> {
        let mut req = self.http.request(method, self.url(path)?);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(HttpError::from)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HttpError::from_status(status.as_u16()));
        }
        resp.json::<T>().await.map_err(|e| HttpError::Retryable {
            status: Some(status.as_u16()),
            message: format!("invalid response body: {e}"),
        })
    }
}

#[async_trait]
impl ApiTransport for HttpClient {
    async fn get_me(&self) -> Result<UserInfo, HttpError> {
        self.request_json(Method::GET, "/api/auth/me", None::<&()>)
            .await
    }

    async fn list_articles(&self) -> Result<Vec<ArticleIndexRow>, HttpError> {
        self.request_json(Method::GET, "/api/articles", None::<&()>)
            .await
    }

    async fn get_article(&self, id: &str) -> Result<CachedArticle, HttpError> {
        self.request_json(Method::GET, &format!("/api/articles/{id}"), None::<&()>)
            .await
    }

    async fn get_inbox(&self) -> Result<CachedArticle, HttpError> {
        self.request_json(
            Method::GET,
            "/api/articles/inbox?include_history=0",
            None::<&()>,
        )
        .await
    }

    async fn save_doc_json(
        &self,
        id: &str,
        req: &SaveDocJsonRequest,
    ) -> Result<SaveAck, HttpError> {
        self.request_json(
            Method::PUT,
            &format!("/api/articles/{id}/doc-json/save"),
            Some(req),
        )
        .await
    }

    async fn sync_compact(
        &self,
        id: &str,
        req: &CompactRequest,
    ) -> Result<CompactResponse, HttpError> {
        self.request_json(
            Method::PUT,
            &format!("/api/articles/{id}/sync/compact"),
            Some(req),
        )
        .await
    }

    async fn structure_snapshot(
        &self,
        id: &str,
        req: &SnapshotRequest,
    ) -> Result<SnapshotResponse, HttpError> {
        self.request_json(
            Method::PUT,
            &format!("/api/articles/{id}/structure/snapshot"),
            Some(req),
        )
        .await
    }

    async fn create_article(&self, payload: &Value) -> Result<Value, HttpError> {
        self.request_json(Method::POST, "/api/articles", Some(payload))
            .await
    }

    async fn tree_op(&self, id: &str, op: TreeOpKind, payload: &Value) -> Result<(), HttpError> {
        let path = format!("/api/articles/{id}/{}", op.path_segment());
        let resp = self
            .http
            .request(Method::POST, self.url(&path)?)
            .json(payload)
            .send()
            .await
            .map_err(HttpError::from)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HttpError::from_status(status.as_u16()));
        }
        Ok(())
    }

    async fn get_embeddings(
        &self,
        id: &str,
        section_ids: Option<&[String]>,
    ) -> Result<EmbeddingsResponse, HttpError> {
        let path = match section_ids {
            Some(ids) if !ids.is_empty() => {
                format!("/api/articles/{id}/embeddings?ids={}", ids.join(","))
            }
            _ => format!("/api/articles/{id}/embeddings"),
        };
        self.request_json(Method::GET, &path, None::<&()>).await
    }

    async fn query_embedding(&self, query: &str) -> Result<Vec<f32>, HttpError> {
        let mut url = self.url("/api/search/semantic/query-embedding")?;
        url.query_pairs_mut().append_pair("q", query);
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(HttpError::from)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HttpError::from_status(status.as_u16()));
        }
        let body: QueryEmbeddingResponse =
            resp.json().await.map_err(|e| HttpError::Retryable {
                status: Some(status.as_u16()),
                message: format!("invalid response body: {e}"),
            })?;
        Ok(body.embedding)
    }

    /// Same-origin upload fetch used by the media prefetch loop.
    async fn fetch_upload(&self, path: &str) -> Result<MediaFetch, HttpError> {
        let resp = self
            .http
            .get(self.url(path)?)
            .send()
            .await
            .map_err(HttpError::from)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HttpError::from_status(status.as_u16()));
        }
        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await.map_err(HttpError::from)?;
        Ok(MediaFetch { bytes, mime })
    }

    async fn post_client_log(&self, entries: &[ClientLogEntry]) -> Result<(), HttpError> {
        let resp = self
            .http
            .post(self.url("/api/client/log")?)
            .json(entries)
            .send()
            .await
            .map_err(HttpError::from)?;
        let status = resp.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "client log rejected");
            return Err(HttpError::from_status(status.as_u16()));
        }
        Ok(())
    }
}
