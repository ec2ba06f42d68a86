//! reqwest implementation of [`RemoteApi`]

use crate::error::{ClientError, ClientResult};
use crate::remote::{IndexFetch, RemoteApi};
use crate::wire::{
    AtomRequest, IndexResponse, MjolnirResponse, MultiMjolnirRequest, MultiMjolnirResponse,
    OpenChangeSets,
};
use async_trait::async_trait;
use atomsync_common::config::RemoteConfig;
use atomsync_common::{ChangeSetId, WorkspaceId};
use parking_lot::RwLock;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// HTTP client for the index and mjolnir endpoints
pub struct HttpRemote {
    base_url: String,
    http_client: reqwest::Client,
    bearers: RwLock<HashMap<WorkspaceId, String>>,
}

impl HttpRemote {
    pub fn new(config: &RemoteConfig) -> ClientResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ClientError::Configuration(e.to_string()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http_client,
            bearers: RwLock::new(HashMap::new()),
        })
    }

    fn workspace_url(&self, workspace: &WorkspaceId, rest: &str) -> String {
        format!("{}/v2/workspaces/{}/{}", self.base_url, workspace, rest)
    }

    fn change_set_url(
        &self,
        workspace: &WorkspaceId,
        change_set: &ChangeSetId,
        rest: &str,
    ) -> String {
        self.workspace_url(workspace, &format!("change-sets/{change_set}/{rest}"))
    }

    fn authorize(&self, workspace: &WorkspaceId, builder: RequestBuilder) -> RequestBuilder {
        match self.bearers.read().get(workspace) {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> ClientResult<Response> {
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Transport(format!("timeout: {e}"))
            } else {
                ClientError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::from_status(status.as_u16(), body));
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
        response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn fetch_index(&self, workspace: &WorkspaceId, url: String) -> ClientResult<IndexFetch> {
        debug!(url = %url, "fetching index");
        let response = self
            .send(self.authorize(workspace, self.http_client.get(&url)))
            .await?;
        if response.status() == StatusCode::ACCEPTED {
            return Ok(IndexFetch::NotReady);
        }
        let index: IndexResponse = Self::decode(response).await?;
        Ok(IndexFetch::Ready(index))
    }

    async fn post_multi(
        &self,
        workspace: &WorkspaceId,
        url: String,
        requests: &[AtomRequest],
    ) -> ClientResult<MultiMjolnirResponse> {
        if requests.is_empty() {
            return Ok(MultiMjolnirResponse::default());
        }
        debug!(url = %url, count = requests.len(), "multi mjolnir");
        let builder = self
            .http_client
            .post(&url)
            .json(&MultiMjolnirRequest { requests });
        let response = self.send(self.authorize(workspace, builder)).await?;
        Self::decode(response).await
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn fetch_change_set_index(
        &self,
        workspace: &WorkspaceId,
        change_set: &ChangeSetId,
    ) -> ClientResult<IndexFetch> {
        let url = self.change_set_url(workspace, change_set, "index");
        self.fetch_index(workspace, url).await
    }

    async fn fetch_atom(
        &self,
        workspace: &WorkspaceId,
        change_set: &ChangeSetId,
        request: &AtomRequest,
    ) -> ClientResult<MjolnirResponse> {
        let mut params = vec![
            ("changeSetId", change_set.as_str()),
            ("kind", request.kind.as_str()),
            ("id", request.id.as_str()),
        ];
        if let Some(checksum) = &request.checksum {
            params.push(("checksum", checksum.as_str()));
        }
        let url = Url::parse_with_params(
            &self.change_set_url(workspace, change_set, "index/mjolnir"),
            &params,
        )
        .map_err(|e| ClientError::Configuration(e.to_string()))?;

        let response = self
            .send(self.authorize(workspace, self.http_client.get(url)))
            .await?;
        Self::decode(response).await
    }

    async fn fetch_atoms(
        &self,
        workspace: &WorkspaceId,
        change_set: &ChangeSetId,
        requests: &[AtomRequest],
    ) -> ClientResult<MultiMjolnirResponse> {
        let url = self.change_set_url(workspace, change_set, "index/multi_mjolnir");
        self.post_multi(workspace, url, requests).await
    }

    async fn fetch_deployment_index(&self, workspace: &WorkspaceId) -> ClientResult<IndexFetch> {
        let url = self.workspace_url(workspace, "deployment_index");
        self.fetch_index(workspace, url).await
    }

    async fn fetch_global_atoms(
        &self,
        workspace: &WorkspaceId,
        requests: &[AtomRequest],
    ) -> ClientResult<MultiMjolnirResponse> {
        let url = self.workspace_url(workspace, "multi_mjolnir");
        self.post_multi(workspace, url, requests).await
    }

    async fn list_open_change_sets(&self, workspace: &WorkspaceId) -> ClientResult<OpenChangeSets> {
        let url = self.workspace_url(workspace, "change-sets");
        let response = self
            .send(self.authorize(workspace, self.http_client.get(&url)))
            .await?;
        Self::decode(response).await
    }

    fn set_bearer(&self, workspace: &WorkspaceId, token: String) {
        self.bearers.write().insert(workspace.clone(), token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> HttpRemote {
        HttpRemote::new(&RemoteConfig {
            base_url: "http://localhost:8080/api/".into(),
            timeout_ms: 1000,
        })
        .unwrap()
    }

    #[test]
    fn test_urls() {
        let remote = remote();
        let ws = WorkspaceId::new("ws1");
        let cs = ChangeSetId::new("cs1");
        assert_eq!(
            remote.change_set_url(&ws, &cs, "index"),
            "http://localhost:8080/api/v2/workspaces/ws1/change-sets/cs1/index"
        );
        assert_eq!(
            remote.workspace_url(&ws, "change-sets"),
            "http://localhost:8080/api/v2/workspaces/ws1/change-sets"
        );
    }

    #[test]
    fn test_set_bearer_is_per_workspace() {
        let remote = remote();
        remote.set_bearer(&WorkspaceId::new("ws1"), "token-1".into());
        let bearers = remote.bearers.read();
        assert_eq!(bearers.get(&WorkspaceId::new("ws1")).map(String::as_str), Some("token-1"));
        assert!(!bearers.contains_key(&WorkspaceId::new("ws2")));
    }

    #[tokio::test]
    async fn test_empty_multi_fetch_skips_network() {
        let remote = HttpRemote::new(&RemoteConfig {
            base_url: "http://127.0.0.1:9".into(),
            timeout_ms: 500,
        })
        .unwrap();
        let response = remote
            .fetch_atoms(&WorkspaceId::new("ws"), &ChangeSetId::new("cs"), &[])
            .await
            .unwrap();
        assert!(response.successful.is_empty());
    }
}
