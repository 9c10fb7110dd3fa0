use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::error::ExecutionError;
use crate::mapreduce::{AbsentReason, MapReduceJob, ShardId, ShardResult, TaskKind};
use crate::replication::{ReplicaRef, ReplicationScheme};
use crate::stage::StageContext;
use crate::worker::{run_shard_request, ShardRequest, ShardResponse};

/// Canal de ejecución remota: corre un pedido en una réplica concreta.
/// Un error acá es recuperable: el llamador prueba la siguiente réplica.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, host: &ReplicaRef, req: &ShardRequest) -> Result<ShardResponse, ExecutionError>;
}

/// Ejecuta en el mismo proceso (modo local, sin workers).
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor {
    ctx: StageContext,
}

impl LocalExecutor {
    pub fn new(ctx: StageContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn execute(&self, host: &ReplicaRef, req: &ShardRequest) -> Result<ShardResponse, ExecutionError> {
        let ctx = self.ctx.clone();
        let req = req.clone();

        let handle = tokio::task::spawn_blocking(move || run_shard_request(&ctx, &req));

        match handle.await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(ExecutionError::Remote {
                host: host.id.clone(),
                message: e.to_string(),
            }),
            Err(e) => Err(ExecutionError::Remote {
                host: host.id.clone(),
                message: format!("panic o join error: {}", e),
            }),
        }
    }
}

/// Prueba las réplicas en orden, de a una. La primera que responde bien gana
/// y las demás no se tocan. Si fallan todas, devuelve `Exhausted` con todos
/// los mensajes.
pub async fn execute_with_failover(
    remote: &dyn RemoteExecutor,
    replicas: &[ReplicaRef],
    req: &ShardRequest,
) -> Result<(ReplicaRef, ShardResponse), ExecutionError> {
    if replicas.is_empty() {
        return Err(ExecutionError::NoReplicas {
            task: req.shard.clone(),
        });
    }

    let mut errors: Vec<String> = Vec::new();

    for host in replicas {
        debug!("shard {} -> réplica {}", req.shard, host);

        match remote.execute(host, req).await {
            Ok(resp) => {
                if !errors.is_empty() {
                    info!(
                        "shard {} resuelto por {} tras {} fallo(s)",
                        req.shard,
                        host,
                        errors.len()
                    );
                }
                return Ok((host.clone(), resp));
            }
            Err(e) => {
                warn!("shard {} falló en {}: {}", req.shard, host, e);
                // los errores remotos ya traen el host
                if matches!(e, ExecutionError::Remote { .. }) {
                    errors.push(e.to_string());
                } else {
                    errors.push(format!("{}: {}", host.id, e));
                }
            }
        }
    }

    let err = ExecutionError::Exhausted {
        task: req.shard.clone(),
        errors,
    };
    error!("{}", err);
    Err(err)
}

/// Política de ejecución de un shard dentro de una pasada.
pub struct ShardExecutor {
    replication: Arc<dyn ReplicationScheme>,
    remote: Arc<dyn RemoteExecutor>,
    settle_secs: u64,
}

impl ShardExecutor {
    pub fn new(
        replication: Arc<dyn ReplicationScheme>,
        remote: Arc<dyn RemoteExecutor>,
        settle_secs: u64,
    ) -> Self {
        Self {
            replication,
            remote,
            settle_secs,
        }
    }

    /// Ejecuta `shard` con sus entradas ya resueltas.
    ///
    /// - tabla externa: el archivo si existe, si no ausente
    /// - stage con sink ya publicado: se reutiliza sin llamar a nadie
    /// - stage con rango abierto o sin entradas: ausente (se reintenta en otra pasada)
    /// - resto: failover sobre las réplicas de su clave de partición
    pub async fn execute(
        &self,
        job: &MapReduceJob,
        shard: ShardId,
        inputs: Vec<String>,
        now_micros: u64,
    ) -> Result<ShardResult, ExecutionError> {
        let task = job.owner(shard);

        let report = match &task.kind {
            TaskKind::TableScan { path } => {
                return Ok(if Path::new(path).is_file() {
                    ShardResult::Existing {
                        location: path.clone(),
                    }
                } else {
                    ShardResult::Absent {
                        reason: AbsentReason::Missing,
                    }
                });
            }
            TaskKind::Report(report) => report,
        };

        let stage = &report.stage;
        let label = job.label(shard);

        if stage.is_published() {
            debug!("{} ya publicado, se reutiliza", label);
            return Ok(ShardResult::Existing {
                location: stage.sink.clone(),
            });
        }

        if !stage.range.is_closed(now_micros, self.settle_secs) {
            debug!("{} todavía abierto ({}), se difiere", label, stage.range);
            return Ok(ShardResult::Absent {
                reason: AbsentReason::Open,
            });
        }

        if inputs.is_empty() {
            debug!("{} sin entradas, nada que construir", label);
            return Ok(ShardResult::Absent {
                reason: AbsentReason::NoInputs,
            });
        }

        let req = ShardRequest {
            shard: label,
            stage: stage.clone(),
            inputs,
            destination: stage.sink.clone(),
        };
        let replicas = self.replication.replicas_for(report.partition_key);

        let (host, resp) = execute_with_failover(self.remote.as_ref(), &replicas, &req).await?;
        info!(
            "{} construido en {} ({} filas) -> {}",
            req.shard, host, resp.rows, resp.location
        );

        Ok(ShardResult::Built {
            location: resp.location,
            rows: resp.rows,
            host: host.id,
        })
    }
}
