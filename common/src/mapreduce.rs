use serde::{Deserialize, Serialize};

use crate::replication::PartitionKey;
use crate::stage::Stage;

/// Índices dentro de la arena del job. Son estables durante toda la pasada.
pub type TaskId = usize;
pub type ShardId = usize;

/// Qué produce una tarea.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Tabla externa (ej: joined queries): su resultado es el archivo si existe.
    TableScan { path: String },
    /// Un stage del plan, ejecutado en alguna réplica.
    Report(ReportTask),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTask {
    pub stage: Stage,
    pub partition_key: PartitionKey,
}

impl ReportTask {
    pub fn new(stage: Stage) -> Self {
        let partition_key = PartitionKey::for_key(&stage.sink);
        Self {
            stage,
            partition_key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    /// Tareas de las que depende (sólo lectura).
    pub sources: Vec<TaskId>,
    /// Shards propios de esta tarea.
    pub shards: Vec<ShardId>,
}

impl Task {
    /// Nombre corto para logs y reportes.
    pub fn name(&self) -> String {
        match &self.kind {
            TaskKind::TableScan { path } => path.clone(),
            TaskKind::Report(r) => r.stage.name(),
        }
    }
}

/// Unidad de trabajo: una tarea + la lista de shards de los que depende.
/// La lista se fija al crear el shard y no cambia.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub task: TaskId,
    pub dependencies: Vec<ShardId>,
}

/// Resultado de un shard terminado sin error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ShardResult {
    /// Se escribió una salida nueva en esta pasada.
    Built {
        location: String,
        rows: u64,
        host: String,
    },
    /// La salida ya existía (tabla externa o sink publicado antes).
    Existing { location: String },
    /// Nada que reportar. No es un error: los consumidores lo saltean.
    Absent { reason: AbsentReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsentReason {
    /// La tabla externa no existe (bucket vacío o todavía no volcado).
    Missing,
    /// El rango del stage todavía no cerró: se difiere a una pasada posterior.
    Open,
    /// Ninguna de las entradas tiene resultado.
    NoInputs,
}

impl ShardResult {
    pub fn location(&self) -> Option<&str> {
        match self {
            ShardResult::Built { location, .. } | ShardResult::Existing { location } => Some(location),
            ShardResult::Absent { .. } => None,
        }
    }
}

/// Arena de tareas y shards de una pasada.
#[derive(Debug, Clone, Default)]
pub struct MapReduceJob {
    tasks: Vec<Task>,
    shards: Vec<Shard>,
}

impl MapReduceJob {
    pub fn new() -> Self {
        Self::default()
    }

    /// Agrega una tarea con sus fuentes y le crea su shard.
    /// Las fuentes tienen que haberse agregado antes.
    pub fn add_task(&mut self, kind: TaskKind, sources: Vec<TaskId>) -> TaskId {
        let id = self.tasks.len();
        self.tasks.push(Task {
            id,
            kind,
            sources,
            shards: Vec::new(),
        });
        self.create_shard(id);
        id
    }

    /// Crea un shard para `task` que depende de la unión de los shards de
    /// todas sus fuentes (lista plana, sin repetidos).
    pub fn create_shard(&mut self, task: TaskId) -> ShardId {
        let mut dependencies: Vec<ShardId> = Vec::new();
        for source in &self.tasks[task].sources {
            for shard in &self.tasks[*source].shards {
                if !dependencies.contains(shard) {
                    dependencies.push(*shard);
                }
            }
        }

        let id = self.shards.len();
        self.shards.push(Shard {
            id,
            task,
            dependencies,
        });
        self.tasks[task].shards.push(id);
        id
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id]
    }

    pub fn shard(&self, id: ShardId) -> &Shard {
        &self.shards[id]
    }

    /// Tarea dueña de un shard.
    pub fn owner(&self, shard: ShardId) -> &Task {
        self.task(self.shards[shard].task)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Etiqueta "<tarea>#<shard>" para logs y pedidos remotos.
    pub fn label(&self, shard: ShardId) -> String {
        format!("{}#{}", self.owner(shard).name(), shard)
    }
}

/// Ubicaciones de entrada de un shard: las dependencias sin resultado se
/// omiten (no es error) y la lista se ordena lexicográficamente.
pub fn resolve_inputs<F>(shard: &Shard, mut location_of: F) -> Vec<String>
where
    F: FnMut(ShardId) -> Option<String>,
{
    let mut inputs: Vec<String> = shard
        .dependencies
        .iter()
        .filter_map(|dep| location_of(*dep))
        .collect();
    inputs.sort();
    inputs
}
