//! Consul Lease
//!
//! Uses a Consul session (TTL plus lock delay) and a KV lock on a single key.
//! The key's value is the holder's [`PrimaryInfo`] as JSON so replicas can
//! find the primary.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::{Lease, Leaser, PrimaryInfo};
use crate::config::ConsulConfig;
use crate::error::{Error, Result};

/// Session creation request body
#[derive(Debug, Serialize)]
struct SessionRequest<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "LockDelay")]
    lock_delay: String,
    #[serde(rename = "Behavior")]
    behavior: &'static str,
}

/// Session creation response body
#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(rename = "ID")]
    id: String,
}

pub struct ConsulLeaser {
    client: reqwest::Client,
    url: String,
    key: String,
    ttl: Duration,
    lock_delay: Duration,
    info: PrimaryInfo,
}

fn unavailable(e: reqwest::Error) -> Error {
    Error::LeaseUnavailable(e.to_string())
}

/// Whole seconds for Consul, rounded up so its TTL never undercuts ours
fn consul_duration(d: Duration) -> String {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    format!("{}s", secs.max(1))
}

impl ConsulLeaser {
    pub fn new(config: &ConsulConfig, node_id: &str, advertise_addr: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.ttl() / 2)
            .build()?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            key: config.key.trim_matches('/').to_string(),
            ttl: config.ttl(),
            lock_delay: config.lock_delay(),
            info: PrimaryInfo {
                hostname: config.hostname.clone().unwrap_or_else(|| node_id.to_string()),
                advertise_addr: config
                    .advertise_address
                    .clone()
                    .unwrap_or_else(|| advertise_addr.to_string()),
            },
        })
    }

    fn kv_url(&self) -> String {
        format!("{}/v1/kv/{}", self.url, self.key)
    }

    async fn create_session(&self) -> Result<String> {
        let request = SessionRequest {
            name: &self.info.hostname,
            ttl: consul_duration(self.ttl),
            lock_delay: consul_duration(self.lock_delay),
            behavior: "delete",
        };

        let response = self
            .client
            .put(format!("{}/v1/session/create", self.url))
            .json(&request)
            .send()
            .await
            .map_err(unavailable)?;

        if !response.status().is_success() {
            return Err(Error::LeaseUnavailable(format!(
                "session create returned {}",
                response.status()
            )));
        }

        let session: SessionResponse = response.json().await.map_err(unavailable)?;
        Ok(session.id)
    }

    async fn destroy_session(&self, session: &str) -> Result<()> {
        let response = self
            .client
            .put(format!("{}/v1/session/destroy/{}", self.url, session))
            .send()
            .await
            .map_err(unavailable)?;

        if !response.status().is_success() {
            return Err(Error::LeaseUnavailable(format!(
                "session destroy returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Leaser for ConsulLeaser {
    fn kind(&self) -> &'static str {
        "consul"
    }

    fn advertise_addr(&self) -> &str {
        &self.info.advertise_addr
    }

    async fn acquire(&self) -> Result<Lease> {
        // Taken before any request so the local deadline is never late
        let started = Instant::now();
        let session = self.create_session().await?;

        let response = self
            .client
            .put(self.kv_url())
            .query(&[("acquire", session.as_str())])
            .json(&self.info)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        let acquired = if status.is_success() {
            response.json::<bool>().await.map_err(unavailable)?
        } else {
            false
        };

        if acquired {
            tracing::debug!("Acquired consul lock {} with session {}", self.key, session);
            return Ok(Lease::new(
                self.info.hostname.clone(),
                self.info.advertise_addr.clone(),
                Some(self.ttl),
                Some(session),
                started,
            ));
        }

        if let Err(e) = self.destroy_session(&session).await {
            tracing::warn!("Failed to destroy unused consul session {}: {}", session, e);
        }

        if !status.is_success() {
            return Err(Error::LeaseUnavailable(format!(
                "lock acquire returned {}",
                status
            )));
        }

        let holder = match self.primary_info().await {
            Ok(Some(info)) => info.hostname,
            _ => "unknown".to_string(),
        };
        Err(Error::LeaseHeld { holder })
    }

    async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let session = lease.session.as_deref().ok_or(Error::LeaseLost)?;
        let started = Instant::now();

        let response = self
            .client
            .put(format!("{}/v1/session/renew/{}", self.url, session))
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            status if status.is_success() => Ok(lease.renewed(started)),
            StatusCode::NOT_FOUND => Err(Error::LeaseLost),
            status => Err(Error::LeaseUnavailable(format!(
                "session renew returned {}",
                status
            ))),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let Some(session) = lease.session.as_deref() else {
            return Ok(());
        };

        // Releasing with an empty body clears the published primary
        let response = self
            .client
            .put(self.kv_url())
            .query(&[("release", session)])
            .send()
            .await
            .map_err(unavailable)?;

        if !response.status().is_success() {
            tracing::warn!("Consul lock release returned {}", response.status());
        }

        self.destroy_session(session).await
    }

    async fn primary_info(&self) -> Result<Option<PrimaryInfo>> {
        let response = self
            .client
            .get(self.kv_url())
            .query(&[("raw", "")])
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response.bytes().await.map_err(unavailable)?;
                if body.is_empty() {
                    return Ok(None);
                }
                Ok(Some(serde_json::from_slice(&body)?))
            }
            status => Err(Error::LeaseUnavailable(format!(
                "lock lookup returned {}",
                status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Bytes,
        extract::{Path, Query, State},
        http::StatusCode as AxumStatus,
        response::IntoResponse,
        routing::put,
        Json, Router,
    };
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    /// Just enough of the Consul session and KV API
    #[derive(Default)]
    struct MockConsul {
        sessions: HashSet<String>,
        holder: Option<String>,
        value: Option<Vec<u8>>,
    }

    type Shared = Arc<Mutex<MockConsul>>;

    async fn session_create(State(state): State<Shared>) -> impl IntoResponse {
        let id = uuid::Uuid::new_v4().to_string();
        state.lock().unwrap().sessions.insert(id.clone());
        Json(serde_json::json!({ "ID": id }))
    }

    async fn session_renew(State(state): State<Shared>, Path(id): Path<String>) -> impl IntoResponse {
        if state.lock().unwrap().sessions.contains(&id) {
            (AxumStatus::OK, "[]").into_response()
        } else {
            AxumStatus::NOT_FOUND.into_response()
        }
    }

    async fn session_destroy(State(state): State<Shared>, Path(id): Path<String>) -> impl IntoResponse {
        let mut consul = state.lock().unwrap();
        consul.sessions.remove(&id);
        if consul.holder.as_deref() == Some(id.as_str()) {
            consul.holder = None;
            consul.value = None;
        }
        Json(true)
    }

    async fn kv_put(
        State(state): State<Shared>,
        Query(query): Query<HashMap<String, String>>,
        body: Bytes,
    ) -> impl IntoResponse {
        let mut consul = state.lock().unwrap();
        if let Some(session) = query.get("acquire") {
            let free = consul.holder.is_none() || consul.holder.as_ref() == Some(session);
            if !consul.sessions.contains(session) || !free {
                return Json(false);
            }
            consul.holder = Some(session.clone());
            consul.value = Some(body.to_vec());
            return Json(true);
        }
        if let Some(session) = query.get("release") {
            if consul.holder.as_ref() != Some(session) {
                return Json(false);
            }
            consul.holder = None;
            consul.value = Some(body.to_vec());
            return Json(true);
        }
        consul.value = Some(body.to_vec());
        Json(true)
    }

    async fn kv_get(State(state): State<Shared>) -> impl IntoResponse {
        match state.lock().unwrap().value.clone() {
            Some(value) => (AxumStatus::OK, value).into_response(),
            None => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn spawn_mock() -> (String, Shared) {
        let state: Shared = Arc::default();
        let app = Router::new()
            .route("/v1/session/create", put(session_create))
            .route("/v1/session/renew/:id", put(session_renew))
            .route("/v1/session/destroy/:id", put(session_destroy))
            .route("/v1/kv/*key", put(kv_put).get(kv_get))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), state)
    }

    fn leaser(url: &str, node: &str) -> ConsulLeaser {
        let config = ConsulConfig {
            url: url.to_string(),
            hostname: None,
            advertise_address: None,
            key: "wolflite/primary".to_string(),
            ttl_secs: 10,
            lock_delay_secs: 5,
        };
        ConsulLeaser::new(&config, node, &format!("{}:20202", node)).unwrap()
    }

    #[test]
    fn test_consul_duration_rounds_up() {
        assert_eq!(consul_duration(Duration::from_secs(10)), "10s");
        assert_eq!(consul_duration(Duration::from_millis(1500)), "2s");
        assert_eq!(consul_duration(Duration::from_millis(200)), "1s");
        assert_eq!(consul_duration(Duration::ZERO), "1s");
    }

    #[tokio::test]
    async fn test_consul_acquire_and_handover() {
        let (url, _state) = spawn_mock().await;
        let a = leaser(&url, "node-a");
        let b = leaser(&url, "node-b");

        assert!(a.primary_info().await.unwrap().is_none());

        let lease = a.acquire().await.unwrap();
        assert_eq!(lease.owner, "node-a");
        assert!(lease.session.is_some());

        match b.acquire().await {
            Err(Error::LeaseHeld { holder }) => assert_eq!(holder, "node-a"),
            other => panic!("expected lease held, got {:?}", other),
        }

        let info = b.primary_info().await.unwrap().unwrap();
        assert_eq!(info.advertise_addr, "node-a:20202");

        let renewed = a.renew(&lease).await.unwrap();
        assert!(renewed.renewed_at >= lease.renewed_at);

        a.release(&renewed).await.unwrap();
        assert!(b.primary_info().await.unwrap().is_none());

        let lease_b = b.acquire().await.unwrap();
        assert_eq!(lease_b.owner, "node-b");
    }

    #[tokio::test]
    async fn test_consul_renew_after_expiry_is_lost() {
        let (url, state) = spawn_mock().await;
        let a = leaser(&url, "node-a");

        let lease = a.acquire().await.unwrap();
        state.lock().unwrap().sessions.clear();

        assert!(matches!(a.renew(&lease).await, Err(Error::LeaseLost)));
    }

    #[tokio::test]
    async fn test_consul_unreachable_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let a = leaser(&format!("http://{}", addr), "node-a");
        let err = a.acquire().await.unwrap_err();
        assert!(matches!(err, Error::LeaseUnavailable(_)));
        assert!(err.is_retryable());
    }
}
