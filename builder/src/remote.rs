use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use common::{ErrorResponse, ExecutionError, RemoteExecutor, ReplicaRef, ShardRequest, ShardResponse};

pub const EXECUTE_PATH: &str = "/api/v1/shards/execute";

/// Canal remoto sobre HTTP: POST del `ShardRequest` al worker.
/// Errores de transporte y respuestas no-2xx se devuelven como `Remote`,
/// así el failover prueba la siguiente réplica.
#[derive(Clone)]
pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteExecutor for HttpExecutor {
    async fn execute(&self, host: &ReplicaRef, req: &ShardRequest) -> Result<ShardResponse, ExecutionError> {
        let url = format!("{}{}", host.addr.trim_end_matches('/'), EXECUTE_PATH);
        let remote = |message: String| ExecutionError::Remote {
            host: host.id.clone(),
            message,
        };

        debug!("POST {} ({})", url, req.shard);
        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| remote(format!("error HTTP: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            return Err(remote(format!("status {}: {}", status, message)));
        }

        resp.json::<ShardResponse>()
            .await
            .map_err(|e| remote(format!("respuesta inválida: {}", e)))
    }
}
