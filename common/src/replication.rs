use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
};

use serde::{Deserialize, Serialize};

/// Clave de partición: decide qué conjunto de réplicas es dueño de un trabajo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey(pub u64);

impl PartitionKey {
    /// Hash estable (dentro del proceso) de una clave de texto, ej: la ruta del sink.
    pub fn for_key(key: &str) -> Self {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        PartitionKey(h.finish())
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Una réplica candidata: dirección de red + id lógico del host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaRef {
    pub id: String,
    pub addr: String,
}

impl ReplicaRef {
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
        }
    }
}

impl fmt::Display for ReplicaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id == self.addr {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{} ({})", self.id, self.addr)
        }
    }
}

/// Mapea una clave de partición a la lista ordenada de réplicas (preferida primero).
/// Para una misma clave el orden tiene que ser siempre el mismo.
pub trait ReplicationScheme: Send + Sync {
    fn replicas_for(&self, key: PartitionKey) -> Vec<ReplicaRef>;
}

/// Réplicas fijas ordenadas por rendezvous hashing: cada host recibe un puntaje
/// hash(clave, host) y se ordenan de mayor a menor. Agregar o quitar un host
/// sólo mueve las claves de ese host.
#[derive(Debug, Clone)]
pub struct StaticReplicationScheme {
    hosts: Vec<ReplicaRef>,
    replication_factor: usize,
}

impl StaticReplicationScheme {
    /// `replication_factor` = 0 significa "todas las réplicas".
    pub fn new(hosts: Vec<ReplicaRef>, replication_factor: usize) -> Self {
        Self {
            hosts,
            replication_factor,
        }
    }

    pub fn from_addrs<I, S>(addrs: I, replication_factor: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let hosts = addrs
            .into_iter()
            .map(|a| {
                let a = a.into();
                ReplicaRef::new(a.clone(), a)
            })
            .collect();
        Self::new(hosts, replication_factor)
    }

    pub fn hosts(&self) -> &[ReplicaRef] {
        &self.hosts
    }

    fn score(key: PartitionKey, host: &ReplicaRef) -> u64 {
        let mut h = DefaultHasher::new();
        key.0.hash(&mut h);
        host.id.hash(&mut h);
        h.finish()
    }
}

impl ReplicationScheme for StaticReplicationScheme {
    fn replicas_for(&self, key: PartitionKey) -> Vec<ReplicaRef> {
        let mut scored: Vec<(u64, &ReplicaRef)> =
            self.hosts.iter().map(|h| (Self::score(key, h), h)).collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));

        let n = if self.replication_factor == 0 {
            scored.len()
        } else {
            self.replication_factor.min(scored.len())
        };

        scored.into_iter().take(n).map(|(_, h)| h.clone()).collect()
    }
}

/// Una sola réplica para todo: modo local (sin workers remotos).
#[derive(Debug, Clone)]
pub struct SingleHostScheme {
    host: ReplicaRef,
}

impl SingleHostScheme {
    pub fn new(host: ReplicaRef) -> Self {
        Self { host }
    }

    pub fn local() -> Self {
        Self::new(ReplicaRef::new("local", "local"))
    }
}

impl ReplicationScheme for SingleHostScheme {
    fn replicas_for(&self, _key: PartitionKey) -> Vec<ReplicaRef> {
        vec![self.host.clone()]
    }
}
