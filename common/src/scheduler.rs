use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use tokio::task::{self, JoinSet};
use tracing::{debug, error, warn};

use crate::error::ExecutionError;
use crate::executor::ShardExecutor;
use crate::mapreduce::{resolve_inputs, MapReduceJob, ShardId, ShardResult};

/// Resultados publicados de la pasada: shard -> ubicación (o ausente).
/// Cada entrada se escribe una sola vez.
#[derive(Debug, Default)]
pub struct ResultStore {
    inner: RwLock<HashMap<ShardId, Option<String>>>,
}

impl ResultStore {
    /// Publica el resultado de `shard`. Devuelve `false` si ya estaba publicado
    /// (el valor anterior se conserva).
    pub fn publish(&self, shard: ShardId, location: Option<String>) -> bool {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&shard) {
            return false;
        }
        map.insert(shard, location);
        true
    }

    /// Ubicación publicada por `shard`; `None` si es ausente o todavía no terminó.
    pub fn location(&self, shard: ShardId) -> Option<String> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(&shard).cloned().flatten()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Estado final de cada shard en una pasada.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardOutcome {
    Done(ShardResult),
    Failed(ExecutionError),
    /// No corrió porque una dependencia (directa o transitiva) falló.
    Blocked { by: ShardId },
}

/// Ejecuta los shards de un job en orden de dependencias, con hasta
/// `max_concurrency` shards en vuelo.
pub struct Scheduler {
    executor: Arc<ShardExecutor>,
    max_concurrency: usize,
}

impl Scheduler {
    pub fn new(executor: Arc<ShardExecutor>, max_concurrency: usize) -> Self {
        Self {
            executor,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Corre todo el job y devuelve el estado final de cada shard.
    /// Un shard sólo arranca cuando todas sus dependencias terminaron
    /// (con resultado o ausentes). Si un shard falla, sus dependientes quedan
    /// bloqueados pero el resto sigue.
    pub async fn run(&self, job: Arc<MapReduceJob>, now_micros: u64) -> BTreeMap<ShardId, ShardOutcome> {
        let total = job.shards().len();
        let store = Arc::new(ResultStore::default());
        let mut outcomes: BTreeMap<ShardId, ShardOutcome> = BTreeMap::new();

        // 1) grafo inverso y dependencias pendientes
        let mut pending: Vec<usize> = vec![0; total];
        let mut dependents: Vec<Vec<ShardId>> = vec![Vec::new(); total];
        for shard in job.shards() {
            pending[shard.id] = shard.dependencies.len();
            for dep in &shard.dependencies {
                dependents[*dep].push(shard.id);
            }
        }

        let mut ready: VecDeque<ShardId> = (0..total).filter(|id| pending[*id] == 0).collect();
        let mut join_set: JoinSet<(ShardId, Result<ShardResult, ExecutionError>)> = JoinSet::new();
        // tarea de tokio -> shard, para no perder el id si la tarea entra en pánico
        let mut running: HashMap<task::Id, ShardId> = HashMap::new();

        loop {
            // 2) lanzar mientras haya lugar
            while join_set.len() < self.max_concurrency {
                let Some(id) = ready.pop_front() else {
                    break;
                };
                if outcomes.contains_key(&id) {
                    continue;
                }

                let inputs = resolve_inputs(job.shard(id), |dep| store.location(dep));
                let executor = self.executor.clone();
                let job = job.clone();
                let store = store.clone();

                let handle = join_set.spawn(async move {
                    let res = executor.execute(&job, id, inputs, now_micros).await;
                    if let Ok(r) = &res {
                        store.publish(id, r.location().map(str::to_string));
                    }
                    (id, res)
                });
                running.insert(handle.id(), id);
            }

            // 3) esperar al próximo que termine
            let Some(joined) = join_set.join_next().await else {
                break;
            };

            let (id, res) = match joined {
                Ok((id, res)) => {
                    running.retain(|_, shard| *shard != id);
                    (id, res)
                }
                Err(e) => {
                    let Some(id) = running.remove(&e.id()) else {
                        error!("tarea del scheduler abortada: {}", e);
                        continue;
                    };
                    error!("{} abortado: {}", job.label(id), e);
                    (
                        id,
                        Err(ExecutionError::Internal(format!("{} abortado: {}", job.label(id), e))),
                    )
                }
            };

            match res {
                Ok(result) => {
                    debug!("{} terminado: {:?}", job.label(id), result);
                    outcomes.insert(id, ShardOutcome::Done(result));
                    for d in &dependents[id] {
                        pending[*d] -= 1;
                        if pending[*d] == 0 {
                            ready.push_back(*d);
                        }
                    }
                }
                Err(e) => {
                    outcomes.insert(id, ShardOutcome::Failed(e));
                    let blocked = block_dependents(id, &dependents, &mut outcomes);
                    if blocked > 0 {
                        warn!("{} falló: {} shard(s) dependientes bloqueados", job.label(id), blocked);
                    }
                }
            }
        }

        // shards que no llegaron a un estado final (tarea abortada)
        for id in 0..total {
            outcomes.entry(id).or_insert_with(|| {
                ShardOutcome::Failed(ExecutionError::Internal(format!(
                    "{} no terminó",
                    job.label(id)
                )))
            });
        }

        outcomes
    }
}

/// Marca como bloqueados todos los dependientes transitivos de `failed`
/// que todavía no tienen estado. Devuelve cuántos marcó.
fn block_dependents(
    failed: ShardId,
    dependents: &[Vec<ShardId>],
    outcomes: &mut BTreeMap<ShardId, ShardOutcome>,
) -> usize {
    let mut count = 0;
    let mut stack: Vec<ShardId> = dependents[failed].clone();

    while let Some(id) = stack.pop() {
        if outcomes.contains_key(&id) {
            continue;
        }
        outcomes.insert(id, ShardOutcome::Blocked { by: failed });
        count += 1;
        stack.extend(dependents[id].iter().copied());
    }

    count
}
