use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Lines, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::TableError;
use crate::generation::TimeRange;

/// Fila de una tabla: clave + valor JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub key: String,
    pub value: Value,
}

/* =========================
   TableSink: escritura
   ========================= */

/// Escribe una tabla inmutable:
///   - primera línea: encabezado con el rango `{"start":..,"end":..}`
///   - luego una fila JSON por línea, con claves estrictamente crecientes.
///
/// Se escribe a un archivo temporal en el mismo directorio y recién en
/// `finish()` se renombra al destino, así nadie lee una tabla a medias.
pub struct TableWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    writer: Option<BufWriter<File>>,
    last_key: Option<String>,
    rows: u64,
    published: bool,
}

impl TableWriter {
    pub fn create(path: impl AsRef<Path>, range: TimeRange) -> Result<Self, TableError> {
        let path = path.as_ref().to_path_buf();
        let display = path.to_string_lossy().to_string();

        // Crear carpeta de salida si hace falta
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| TableError::io(&display, e))?;
            }
        }

        let file_name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "table".to_string());
        let tmp_path = path.with_file_name(format!(
            ".{}.tmp-{}",
            file_name,
            uuid::Uuid::new_v4()
        ));

        let file = File::create(&tmp_path).map_err(|e| TableError::io(&display, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &range).map_err(|e| TableError::json(&display, e))?;
        writer
            .write_all(b"\n")
            .map_err(|e| TableError::io(&display, e))?;

        Ok(Self {
            path,
            tmp_path,
            writer: Some(writer),
            last_key: None,
            rows: 0,
            published: false,
        })
    }

    fn display(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    /// Agrega una fila. La clave tiene que ser mayor que la anterior.
    pub fn write<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), TableError> {
        if let Some(prev) = &self.last_key {
            if key <= prev.as_str() {
                return Err(TableError::Unsorted {
                    path: self.display(),
                    prev: prev.clone(),
                    key: key.to_string(),
                });
            }
        }

        let value = serde_json::to_value(value).map_err(|e| TableError::json(self.display(), e))?;
        let row = Row {
            key: key.to_string(),
            value,
        };

        let display = self.display();
        let Some(writer) = self.writer.as_mut() else {
            return Err(TableError::io(
                display,
                std::io::Error::new(std::io::ErrorKind::Other, "writer cerrado"),
            ));
        };
        serde_json::to_writer(&mut *writer, &row).map_err(|e| TableError::json(&display, e))?;
        writer
            .write_all(b"\n")
            .map_err(|e| TableError::io(&display, e))?;

        self.last_key = Some(row.key);
        self.rows += 1;
        Ok(())
    }

    /// Cierra la tabla y la publica en su ruta final. Devuelve la cantidad de filas.
    pub fn finish(mut self) -> Result<u64, TableError> {
        let display = self.display();
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| TableError::io(&display, e))?;
            let file = writer
                .into_inner()
                .map_err(|e| TableError::io(&display, e.into_error()))?;
            file.sync_all().map_err(|e| TableError::io(&display, e))?;
        }

        // si el rename falla, Drop borra el temporal
        fs::rename(&self.tmp_path, &self.path).map_err(|e| TableError::io(&display, e))?;
        self.published = true;
        Ok(self.rows)
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        // el temporal sólo sobrevive si quedó publicado en su ruta final
        drop(self.writer.take());
        if !self.published {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/* =========================
   TableSource: lectura
   ========================= */

/// Lector perezoso de una tabla.
pub struct TableReader {
    path: String,
    range: TimeRange,
    lines: Lines<BufReader<File>>,
}

impl TableReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let display = path.as_ref().to_string_lossy().to_string();
        let file = File::open(path.as_ref()).map_err(|e| TableError::io(&display, e))?;
        let mut lines = BufReader::new(file).lines();

        let header = match lines.next() {
            Some(l) => l.map_err(|e| TableError::io(&display, e))?,
            None => return Err(TableError::MissingHeader(display)),
        };
        let range: TimeRange =
            serde_json::from_str(&header).map_err(|e| TableError::json(&display, e))?;

        Ok(Self {
            path: display,
            range,
            lines,
        })
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Iterator for TableReader {
    type Item = Result<Row, TableError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(l) => l,
                Err(e) => return Some(Err(TableError::io(&self.path, e))),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(|e| TableError::json(&self.path, e)));
        }
    }
}

/// Merge perezoso de varias tablas en orden creciente de clave.
///
/// Claves iguales de distintas fuentes salen contiguas, en el orden de `paths`.
pub struct TableSource {
    readers: Vec<TableReader>,
    heads: Vec<Option<Row>>,
    heap: BinaryHeap<Reverse<(String, usize)>>,
    failed: Option<TableError>,
}

impl TableSource {
    pub fn open<P: AsRef<Path>>(paths: &[P]) -> Result<Self, TableError> {
        let mut readers = Vec::with_capacity(paths.len());
        let mut heads = Vec::with_capacity(paths.len());
        let mut heap = BinaryHeap::new();

        for (idx, p) in paths.iter().enumerate() {
            let mut reader = TableReader::open(p)?;
            match reader.next() {
                Some(Ok(row)) => {
                    heap.push(Reverse((row.key.clone(), idx)));
                    heads.push(Some(row));
                }
                Some(Err(e)) => return Err(e),
                None => heads.push(None),
            }
            readers.push(reader);
        }

        Ok(Self {
            readers,
            heads,
            heap,
            failed: None,
        })
    }

    /// Recorre el merge agrupando los valores de cada clave.
    pub fn for_each_key<F, E>(self, mut f: F) -> Result<(), E>
    where
        F: FnMut(String, Vec<Value>) -> Result<(), E>,
        E: From<TableError>,
    {
        let mut current: Option<(String, Vec<Value>)> = None;

        for row in self {
            let row = row?;
            match current.as_mut() {
                Some((key, values)) if *key == row.key => values.push(row.value),
                _ => {
                    if let Some((key, values)) = current.take() {
                        f(key, values)?;
                    }
                    current = Some((row.key, vec![row.value]));
                }
            }
        }

        if let Some((key, values)) = current {
            f(key, values)?;
        }
        Ok(())
    }
}

impl Iterator for TableSource {
    type Item = Result<Row, TableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.failed.take() {
            return Some(Err(e));
        }

        let Reverse((_, idx)) = self.heap.pop()?;
        let row = self.heads[idx].take()?;

        match self.readers[idx].next() {
            Some(Ok(next)) => {
                self.heap.push(Reverse((next.key.clone(), idx)));
                self.heads[idx] = Some(next);
            }
            Some(Err(e)) => self.failed = Some(e),
            None => {}
        }

        Some(Ok(row))
    }
}

/* =========================
   JSON lines sin encabezado (logs crudos)
   ========================= */

/// Lector perezoso de un archivo JSONL: un objeto `T` por línea, ignora líneas vacías.
pub struct JsonLines<T> {
    path: String,
    lines: Lines<BufReader<File>>,
    _marker: PhantomData<T>,
}

pub fn read_json_lines<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<JsonLines<T>, TableError> {
    let display = path.as_ref().to_string_lossy().to_string();
    let file = File::open(path.as_ref()).map_err(|e| TableError::io(&display, e))?;
    Ok(JsonLines {
        path: display,
        lines: BufReader::new(file).lines(),
        _marker: PhantomData,
    })
}

impl<T: DeserializeOwned> Iterator for JsonLines<T> {
    type Item = Result<T, TableError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(l) => l,
                Err(e) => return Some(Err(TableError::io(&self.path, e))),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(|e| TableError::json(&self.path, e)));
        }
    }
}
