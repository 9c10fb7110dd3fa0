use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fs,
    io,
    path::Path,
};

use serde_json::Value;

use crate::error::TableError;
use crate::table::read_json_lines;

pub const STOPWORDS_FILE: &str = "stopwords.txt";
pub const ITEMS_FILE: &str = "items.jsonl";

/// Normaliza texto de búsqueda en términos.
///
/// Limpia cada palabra (sólo alfanumérico y '_', en minúscula) y descarta las
/// stopwords configuradas.
#[derive(Debug, Clone, Default)]
pub struct Analyzer {
    stopwords: HashSet<String>,
}

impl Analyzer {
    pub fn new<I, S>(stopwords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let stopwords = stopwords
            .into_iter()
            .map(|s| clean_token(s.as_ref()))
            .filter(|s| !s.is_empty())
            .collect();
        Self { stopwords }
    }

    /// Carga `<conf_dir>/stopwords.txt` (una palabra por línea). Si no existe,
    /// el analyzer queda sin stopwords.
    pub fn load(conf_dir: impl AsRef<Path>) -> io::Result<Self> {
        let path = conf_dir.as_ref().join(STOPWORDS_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Self::new(content.lines())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Términos de `text` en orden de aparición (con repetidos).
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        text.split_whitespace()
            .map(clean_token)
            .filter(|t| !t.is_empty() && !self.stopwords.contains(t))
            .collect()
    }

    /// Conjunto ordenado de términos distintos.
    pub fn terms(&self, text: &str) -> BTreeSet<String> {
        self.tokenize(text).into_iter().collect()
    }

    /// Forma canónica de una búsqueda: términos distintos ordenados, separados por espacio.
    pub fn normalize(&self, text: &str) -> String {
        self.terms(text).into_iter().collect::<Vec<_>>().join(" ")
    }
}

fn clean_token(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_lowercase()
}

/// Índice de items: item_id -> campos (ej: "category1").
#[derive(Debug, Clone, Default)]
pub struct ItemIndex {
    items: HashMap<String, serde_json::Map<String, Value>>,
}

impl ItemIndex {
    /// Abre `<index_dir>/items.jsonl`. Cada línea es un objeto con `item_id`.
    /// Si el archivo no existe, el índice queda vacío.
    pub fn open(index_dir: impl AsRef<Path>) -> Result<Self, TableError> {
        let path = index_dir.as_ref().join(ITEMS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let mut items = HashMap::new();
        for rec in read_json_lines::<Value>(&path)? {
            let Value::Object(obj) = rec? else {
                continue;
            };
            let Some(id) = obj.get("item_id").and_then(item_id_str) else {
                continue;
            };
            items.insert(id, obj);
        }

        Ok(Self { items })
    }

    pub fn insert(&mut self, item_id: impl Into<String>, fields: serde_json::Map<String, Value>) {
        self.items.insert(item_id.into(), fields);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Valor de `field` para `item_id` como string (acepta números).
    pub fn field(&self, item_id: &str, field: &str) -> Option<String> {
        self.items
            .get(item_id)
            .and_then(|obj| obj.get(field))
            .and_then(item_id_str)
    }
}

fn item_id_str(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
