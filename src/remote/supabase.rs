// SPDX-License-Identifier: MPL-2.0

//! Remote surfaces backed by a Supabase (PostgREST) project.
//!
//! Tables: `favorites(user_id, resource_id)`, `votes(voter_id, resource_id,
//! direction, updated_at)`, `scores(resource_id, upvotes, downvotes,
//! initial_score)`. Vote writes go through the `cast_vote` RPC after the
//! `check_vote_rate_limit` RPC allows them.

use super::{
    FavoritesService, RateDecision, RateLimitOracle, RemoteError, RemoteResult, VotingService,
};
use crate::config::{DEFAULT_RATE_LIMIT_COOLDOWN_SECS, SupabaseConfig};
use crate::model::{FavoriteSet, ResourceId, ResourceScore, VoteDirection, VoteResult};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;
use url::Url;

/// Shared HTTP client for all backend traffic
static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .timeout(std::time::Duration::from_secs(15))
        .connect_timeout(std::time::Duration::from_secs(5))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

#[derive(Debug, Deserialize)]
struct FavoriteRow {
    resource_id: ResourceId,
}

#[derive(Debug, Serialize)]
struct NewFavorite<'a> {
    user_id: &'a str,
    resource_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ScoreRow {
    resource_id: ResourceId,
    #[serde(default)]
    upvotes: u32,
    #[serde(default)]
    downvotes: u32,
    #[serde(default)]
    initial_score: i64,
}

#[derive(Debug, Deserialize)]
struct VoteRow {
    resource_id: ResourceId,
    direction: VoteDirection,
}

#[derive(Debug, Deserialize)]
struct CastVoteResponse {
    my_vote: Option<VoteDirection>,
    upvotes: u32,
    downvotes: u32,
    #[serde(default)]
    initial_score: i64,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    allowed: bool,
    #[serde(default)]
    cooldown_seconds: Option<u64>,
}

pub struct SupabaseBackend {
    config: SupabaseConfig,
    access_token: RwLock<Option<String>>,
}

impl SupabaseBackend {
    pub fn new(config: SupabaseConfig) -> Self {
        Self {
            config,
            access_token: RwLock::new(None),
        }
    }

    /// Swap the bearer token used for row-level security. `None` falls back to the anon key.
    pub fn set_access_token(&self, token: Option<String>) {
        let mut guard = self
            .access_token
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = token;
    }

    fn bearer(&self) -> String {
        let guard = self
            .access_token
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard
            .clone()
            .unwrap_or_else(|| self.config.supabase_anon_key.clone())
    }

    fn endpoint(&self, path: &str) -> RemoteResult<Url> {
        let raw = format!("{}/rest/v1/{path}", self.config.supabase_url);
        Url::parse(&raw).map_err(|e| RemoteError::Transient(format!("invalid url {raw}: {e}")))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        HTTP_CLIENT
            .request(method, url)
            .header("apikey", &self.config.supabase_anon_key)
            .header("Authorization", format!("Bearer {}", self.bearer()))
    }

    async fn send(&self, request: RequestBuilder) -> RemoteResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after.as_deref(), &body))
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> RemoteResult<T> {
        let response = self.send(request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| {
            RemoteError::Transient(format!("failed to parse response: {e}. Body: {body}"))
        })
    }

    async fn insert_favorites(&self, user_id: &str, ids: &[&str]) -> RemoteResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut url = self.endpoint("favorites")?;
        url.query_pairs_mut()
            .append_pair("on_conflict", "user_id,resource_id");
        let rows: Vec<NewFavorite> = ids
            .iter()
            .map(|&resource_id| NewFavorite {
                user_id,
                resource_id,
            })
            .collect();
        self.send(
            self.request(Method::POST, url)
                .header("Prefer", "resolution=ignore-duplicates,return=minimal")
                .json(&rows),
        )
        .await?;
        Ok(())
    }
}

/// Map a non-success HTTP status to the engine's error taxonomy.
pub fn classify_status(status: StatusCode, retry_after: Option<&str>, body: &str) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::NotAuthenticated,
        StatusCode::CONFLICT => RemoteError::Conflict(body.to_string()),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited {
            cooldown_seconds: retry_after
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_RATE_LIMIT_COOLDOWN_SECS),
        },
        other => RemoteError::Transient(format!("request failed with status {other}: {body}")),
    }
}

/// PostgREST `in.(...)` filter with every ID quoted.
pub fn in_filter(ids: &[ResourceId]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

#[async_trait]
impl FavoritesService for SupabaseBackend {
    async fn get_favorites(&self, user_id: &str) -> RemoteResult<FavoriteSet> {
        let mut url = self.endpoint("favorites")?;
        url.query_pairs_mut()
            .append_pair("select", "resource_id")
            .append_pair("user_id", &format!("eq.{user_id}"));
        let rows: Vec<FavoriteRow> = self.send_json(self.request(Method::GET, url)).await?;
        Ok(rows.into_iter().map(|row| row.resource_id).collect())
    }

    async fn add_favorite(&self, user_id: &str, resource_id: &str) -> RemoteResult<bool> {
        self.insert_favorites(user_id, &[resource_id]).await?;
        Ok(true)
    }

    async fn remove_favorite(&self, user_id: &str, resource_id: &str) -> RemoteResult<bool> {
        let mut url = self.endpoint("favorites")?;
        url.query_pairs_mut()
            .append_pair("user_id", &format!("eq.{user_id}"))
            .append_pair("resource_id", &format!("eq.{resource_id}"));
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(false)
    }

    async fn clear_favorites(&self, user_id: &str) -> RemoteResult<()> {
        let mut url = self.endpoint("favorites")?;
        url.query_pairs_mut()
            .append_pair("user_id", &format!("eq.{user_id}"));
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    // One bulk upsert instead of an insert per missing ID
    async fn merge_with_local(
        &self,
        user_id: &str,
        local: &FavoriteSet,
    ) -> RemoteResult<FavoriteSet> {
        let ids: Vec<&str> = local.iter().map(String::as_str).collect();
        self.insert_favorites(user_id, &ids).await?;
        let remote = self.get_favorites(user_id).await?;
        debug!(local = local.len(), merged = remote.len(), "merged favorites");
        Ok(remote.union(local))
    }
}

#[async_trait]
impl RateLimitOracle for SupabaseBackend {
    async fn can_actor_mutate_now(&self, actor_id: &str) -> RemoteResult<RateDecision> {
        let url = self.endpoint("rpc/check_vote_rate_limit")?;
        let response: RateLimitResponse = self
            .send_json(
                self.request(Method::POST, url)
                    .json(&json!({ "p_user_id": actor_id })),
            )
            .await?;
        if response.allowed {
            Ok(RateDecision::Allowed)
        } else {
            Ok(RateDecision::CoolDown {
                seconds: response
                    .cooldown_seconds
                    .unwrap_or(DEFAULT_RATE_LIMIT_COOLDOWN_SECS),
            })
        }
    }
}

#[async_trait]
impl VotingService for SupabaseBackend {
    async fn cast_vote(
        &self,
        voter_id: &str,
        resource_id: &str,
        direction: VoteDirection,
    ) -> RemoteResult<VoteResult> {
        if let RateDecision::CoolDown { seconds } = self.can_actor_mutate_now(voter_id).await? {
            return Err(RemoteError::RateLimited {
                cooldown_seconds: seconds,
            });
        }

        let url = self.endpoint("rpc/cast_vote")?;
        let response: CastVoteResponse = self
            .send_json(self.request(Method::POST, url).json(&json!({
                "p_resource_id": resource_id,
                "p_direction": direction.as_str(),
            })))
            .await?;
        Ok(VoteResult {
            my_vote: response.my_vote,
            score: ResourceScore::new(
                response.upvotes,
                response.downvotes,
                response.initial_score,
            ),
        })
    }

    async fn get_scores(&self, ids: &[ResourceId]) -> RemoteResult<HashMap<ResourceId, ResourceScore>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut url = self.endpoint("scores")?;
        url.query_pairs_mut()
            .append_pair("select", "resource_id,upvotes,downvotes,initial_score")
            .append_pair("resource_id", &in_filter(ids));
        let rows: Vec<ScoreRow> = self.send_json(self.request(Method::GET, url)).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.resource_id,
                    ResourceScore::new(row.upvotes, row.downvotes, row.initial_score),
                )
            })
            .collect())
    }

    async fn get_user_votes(
        &self,
        voter_id: &str,
        ids: &[ResourceId],
    ) -> RemoteResult<HashMap<ResourceId, VoteDirection>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut url = self.endpoint("votes")?;
        url.query_pairs_mut()
            .append_pair("select", "resource_id,direction")
            .append_pair("voter_id", &format!("eq.{voter_id}"))
            .append_pair("resource_id", &in_filter(ids));
        let rows: Vec<VoteRow> = self.send_json(self.request(Method::GET, url)).await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.resource_id, row.direction))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> SupabaseBackend {
        SupabaseBackend::new(SupabaseConfig {
            supabase_url: "https://example.supabase.co".into(),
            supabase_anon_key: "anon".into(),
        })
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, None, ""),
            RemoteError::NotAuthenticated
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, None, ""),
            RemoteError::NotAuthenticated
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some("42"), ""),
            RemoteError::RateLimited { cooldown_seconds: 42 }
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, None, ""),
            RemoteError::RateLimited {
                cooldown_seconds: DEFAULT_RATE_LIMIT_COOLDOWN_SECS
            }
        );
        assert!(matches!(
            classify_status(StatusCode::CONFLICT, None, "duplicate key"),
            RemoteError::Conflict(body) if body == "duplicate key"
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            RemoteError::Transient(_)
        ));
    }

    #[test]
    fn in_filter_quotes_ids() {
        let ids = vec!["a".to_string(), "b,c".to_string(), "d\"e".to_string()];
        assert_eq!(in_filter(&ids), r#"in.("a","b,c","d\"e")"#);
    }

    #[test]
    fn endpoint_encodes_filters() {
        let backend = backend();
        let mut url = backend.endpoint("scores").expect("url");
        url.query_pairs_mut()
            .append_pair("resource_id", &in_filter(&["x y".to_string()]));
        assert_eq!(url.path(), "/rest/v1/scores");
        let (_, value) = url.query_pairs().next().expect("pair");
        assert_eq!(value, r#"in.("x y")"#);
    }

    #[test]
    fn bearer_prefers_access_token() {
        let backend = backend();
        assert_eq!(backend.bearer(), "anon");
        backend.set_access_token(Some("jwt".into()));
        assert_eq!(backend.bearer(), "jwt");
        backend.set_access_token(None);
        assert_eq!(backend.bearer(), "anon");
    }
}
