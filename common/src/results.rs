use serde::{Deserialize, Serialize};

/// Artefactos publicados en el directorio de salida del builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactList {
    /// Directorio base de artefactos
    pub dir: String,
    /// Nombres de archivo dentro de `dir`, ordenados
    pub files: Vec<String>,
}
