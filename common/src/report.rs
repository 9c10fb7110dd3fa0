use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::analyzer::{Analyzer, ItemIndex};
use crate::error::StageError;
use crate::generation::TimeRange;
use crate::table::{read_json_lines, TableSource, TableWriter};

/* --------- Registros de entrada --------- */

/// Una búsqueda ya unida con sus impresiones y clicks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedQuery {
    /// Timestamp en microsegundos
    pub time: u64,
    pub query: String,
    #[serde(default)]
    pub items: Vec<JoinedItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedItem {
    pub item_id: String,
    pub position: u32,
    #[serde(default)]
    pub clicked: bool,
}

/* --------- Valores de las tablas --------- */

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtrCounter {
    pub views: u64,
    pub clicks: u64,
}

impl CtrCounter {
    pub fn add(&mut self, views: u64, clicks: u64) {
        self.views += views;
        self.clicks += clicks;
    }

    pub fn merge(&mut self, other: &CtrCounter) {
        self.add(other.views, other.clicks);
    }

    pub fn ctr(&self) -> f64 {
        if self.views == 0 {
            0.0
        } else {
            self.clicks as f64 / self.views as f64
        }
    }
}

/// Contadores de un término más los términos que aparecen junto a él
/// (peso = vistas compartidas).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermInfo {
    pub views: u64,
    pub clicks: u64,
    #[serde(default)]
    pub related: BTreeMap<String, u64>,
}

impl TermInfo {
    pub fn merge(&mut self, other: &TermInfo) {
        self.views += other.views;
        self.clicks += other.clicks;
        for (term, weight) in &other.related {
            *self.related.entry(term.clone()).or_insert(0) += weight;
        }
    }

    /// Deja sólo los `limit` términos relacionados de mayor peso
    /// (desempate alfabético).
    pub fn trim(&mut self, limit: usize) {
        if self.related.len() <= limit {
            return;
        }
        let mut entries: Vec<(String, u64)> = std::mem::take(&mut self.related).into_iter().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(limit);
        self.related = entries.into_iter().collect();
    }
}

/* =========================
   Reportes hoja (desde joined queries)
   ========================= */

/// Recorre las joined queries de `inputs` que caen en `range` y acumula
/// contadores por clave con `f`.
fn count_joined_queries<F>(
    inputs: &[String],
    range: TimeRange,
    mut f: F,
) -> Result<BTreeMap<String, CtrCounter>, StageError>
where
    F: FnMut(&JoinedQuery, &mut BTreeMap<String, CtrCounter>),
{
    let mut acc = BTreeMap::new();

    for input in inputs {
        for q in read_json_lines::<JoinedQuery>(input)? {
            let q = q?;
            if !range.contains(q.time) {
                continue;
            }
            f(&q, &mut acc);
        }
    }

    Ok(acc)
}

fn write_sorted<T: Serialize>(
    dest: &str,
    range: TimeRange,
    entries: BTreeMap<String, T>,
) -> Result<u64, StageError> {
    let mut writer = TableWriter::create(dest, range)?;
    for (key, value) in &entries {
        writer.write(key, value)?;
    }
    Ok(writer.finish()?)
}

/// CTR por posición en la página de resultados. Clave: posición con 3 dígitos.
pub fn ctr_by_position(inputs: &[String], dest: &str, range: TimeRange) -> Result<u64, StageError> {
    let acc = count_joined_queries(inputs, range, |q, acc| {
        for item in &q.items {
            acc.entry(format!("{:03}", item.position))
                .or_default()
                .add(1, item.clicked as u64);
        }
    })?;
    write_sorted(dest, range, acc)
}

/// CTR global: a nivel búsqueda ("queries") y a nivel impresión ("items").
pub fn ctr_stats(inputs: &[String], dest: &str, range: TimeRange) -> Result<u64, StageError> {
    let acc = count_joined_queries(inputs, range, |q, acc| {
        let clicks = q.items.iter().filter(|i| i.clicked).count() as u64;
        acc.entry("queries".to_string())
            .or_default()
            .add(1, (clicks > 0) as u64);
        acc.entry("items".to_string())
            .or_default()
            .add(q.items.len() as u64, clicks);
    })?;
    write_sorted(dest, range, acc)
}

/// CTR por búsqueda normalizada.
pub fn ctr_by_search_query(
    inputs: &[String],
    dest: &str,
    range: TimeRange,
    analyzer: &Analyzer,
) -> Result<u64, StageError> {
    let acc = count_joined_queries(inputs, range, |q, acc| {
        let key = analyzer.normalize(&q.query);
        if key.is_empty() {
            return;
        }
        let clicked = q.items.iter().any(|i| i.clicked);
        acc.entry(key).or_default().add(1, clicked as u64);
    })?;
    write_sorted(dest, range, acc)
}

/// CTR por término cruzado con el valor de `field` de cada item ("term~categoria").
pub fn ctr_by_search_term_cross_category(
    inputs: &[String],
    dest: &str,
    range: TimeRange,
    field: &str,
    analyzer: &Analyzer,
    index: &ItemIndex,
) -> Result<u64, StageError> {
    let acc = count_joined_queries(inputs, range, |q, acc| {
        let terms = analyzer.terms(&q.query);
        if terms.is_empty() {
            return;
        }
        for item in &q.items {
            let Some(category) = index.field(&item.item_id, field) else {
                continue;
            };
            for term in &terms {
                acc.entry(format!("{}~{}", term, category))
                    .or_default()
                    .add(1, item.clicked as u64);
            }
        }
    })?;
    write_sorted(dest, range, acc)
}

/* =========================
   Rollups (desde otras tablas)
   ========================= */

fn parse_value<T: DeserializeOwned>(dest: &str, key: &str, value: Value) -> Result<T, StageError> {
    serde_json::from_value(value).map_err(|e| StageError::InvalidValue {
        path: dest.to_string(),
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Suma los contadores de cada clave de todas las entradas.
pub fn ctr_counter_merge(inputs: &[String], dest: &str, range: TimeRange) -> Result<u64, StageError> {
    let mut writer = TableWriter::create(dest, range)?;

    TableSource::open(inputs)?.for_each_key(|key, values| {
        let mut total = CtrCounter::default();
        for v in values {
            let c: CtrCounter = parse_value(dest, &key, v)?;
            total.merge(&c);
        }
        writer.write(&key, &total)?;
        Ok::<(), StageError>(())
    })?;

    Ok(writer.finish()?)
}

/// Términos relacionados a partir de tablas de CTR por búsqueda:
/// cada término suma las vistas/clicks de las búsquedas donde aparece y
/// acumula como relacionados a los otros términos de esas búsquedas.
pub fn related_terms(
    inputs: &[String],
    dest: &str,
    range: TimeRange,
    limit: usize,
) -> Result<u64, StageError> {
    let mut acc: BTreeMap<String, TermInfo> = BTreeMap::new();

    for row in TableSource::open(inputs)? {
        let row = row?;
        let counter: CtrCounter = parse_value(dest, &row.key, row.value)?;
        let terms: Vec<&str> = row.key.split_whitespace().collect();

        for term in &terms {
            let info = acc.entry(term.to_string()).or_default();
            info.views += counter.views;
            info.clicks += counter.clicks;
            for other in &terms {
                if other != term {
                    *info.related.entry(other.to_string()).or_insert(0) += counter.views;
                }
            }
        }
    }

    for info in acc.values_mut() {
        info.trim(limit);
    }
    write_sorted(dest, range, acc)
}

/// Rollup de tablas de términos relacionados.
pub fn term_info_merge(
    inputs: &[String],
    dest: &str,
    range: TimeRange,
    limit: usize,
) -> Result<u64, StageError> {
    let mut writer = TableWriter::create(dest, range)?;

    TableSource::open(inputs)?.for_each_key(|key, values| {
        let mut total = TermInfo::default();
        for v in values {
            let info: TermInfo = parse_value(dest, &key, v)?;
            total.merge(&info);
        }
        total.trim(limit);
        writer.write(&key, &total)?;
        Ok::<(), StageError>(())
    })?;

    Ok(writer.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableReader;
    use serde_json::json;
    use std::{env, fs, io::Write, path::PathBuf};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("report_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn s(p: &PathBuf) -> String {
        p.to_string_lossy().to_string()
    }

    fn write_queries(path: &PathBuf, queries: &[JoinedQuery]) {
        let mut f = fs::File::create(path).unwrap();
        for q in queries {
            writeln!(f, "{}", serde_json::to_string(q).unwrap()).unwrap();
        }
    }

    fn q(time: u64, query: &str, items: &[(&str, u32, bool)]) -> JoinedQuery {
        JoinedQuery {
            time,
            query: query.to_string(),
            items: items
                .iter()
                .map(|(id, pos, clicked)| JoinedItem {
                    item_id: id.to_string(),
                    position: *pos,
                    clicked: *clicked,
                })
                .collect(),
        }
    }

    fn rows(path: &PathBuf) -> Vec<(String, Value)> {
        TableReader::open(path)
            .unwrap()
            .map(|r| r.unwrap())
            .map(|r| (r.key, r.value))
            .collect()
    }

    fn sample(dir: &PathBuf) -> PathBuf {
        let input = dir.join("jq.jsonl");
        write_queries(
            &input,
            &[
                q(10, "Funda Móvil", &[("i1", 1, true), ("i2", 2, false)]),
                q(11, "funda", &[("i1", 1, false)]),
                q(500, "fuera de rango", &[("i9", 1, true)]),
            ],
        );
        input
    }

    const RANGE: TimeRange = TimeRange { start: 0, end: 100 };

    #[test]
    fn ctr_by_position_cuenta_por_posicion() {
        let tmp = temp_dir("by_position");
        let input = sample(&tmp);
        let out = tmp.join("out.jsonl");

        let n = ctr_by_position(&[s(&input)], &s(&out), RANGE).unwrap();
        assert_eq!(n, 2);
        assert_eq!(
            rows(&out),
            vec![
                ("001".to_string(), json!({"views": 2, "clicks": 1})),
                ("002".to_string(), json!({"views": 1, "clicks": 0})),
            ]
        );
        assert_eq!(TableReader::open(&out).unwrap().range(), RANGE);
    }

    #[test]
    fn ctr_stats_cuenta_busquedas_e_items() {
        let tmp = temp_dir("stats");
        let input = sample(&tmp);
        let out = tmp.join("out.jsonl");

        ctr_stats(&[s(&input)], &s(&out), RANGE).unwrap();
        assert_eq!(
            rows(&out),
            vec![
                ("items".to_string(), json!({"views": 3, "clicks": 1})),
                ("queries".to_string(), json!({"views": 2, "clicks": 1})),
            ]
        );
    }

    #[test]
    fn ctr_by_search_query_usa_la_forma_normalizada() {
        let tmp = temp_dir("by_query");
        let input = sample(&tmp);
        let out = tmp.join("out.jsonl");

        ctr_by_search_query(&[s(&input)], &s(&out), RANGE, &Analyzer::default()).unwrap();
        assert_eq!(
            rows(&out),
            vec![
                ("funda".to_string(), json!({"views": 1, "clicks": 0})),
                ("funda móvil".to_string(), json!({"views": 1, "clicks": 1})),
            ]
        );
    }

    #[test]
    fn ctr_by_search_term_cross_category_cruza_con_el_indice() {
        let tmp = temp_dir("cross");
        let input = sample(&tmp);
        let out = tmp.join("out.jsonl");

        let mut index = ItemIndex::default();
        let mut fields = serde_json::Map::new();
        fields.insert("category1".to_string(), json!("fundas"));
        index.insert("i1", fields);

        ctr_by_search_term_cross_category(
            &[s(&input)],
            &s(&out),
            RANGE,
            "category1",
            &Analyzer::default(),
            &index,
        )
        .unwrap();

        // i2 no está en el índice: no cuenta
        assert_eq!(
            rows(&out),
            vec![
                ("funda~fundas".to_string(), json!({"views": 2, "clicks": 1})),
                ("móvil~fundas".to_string(), json!({"views": 1, "clicks": 1})),
            ]
        );
    }

    #[test]
    fn ctr_counter_merge_suma_entre_tablas() {
        let tmp = temp_dir("merge");
        let a = tmp.join("a.jsonl");
        let b = tmp.join("b.jsonl");
        let out = tmp.join("out.jsonl");

        let mut w = TableWriter::create(&a, TimeRange::new(0, 50)).unwrap();
        w.write("x", &CtrCounter { views: 2, clicks: 1 }).unwrap();
        w.write("y", &CtrCounter { views: 1, clicks: 0 }).unwrap();
        w.finish().unwrap();

        let mut w = TableWriter::create(&b, TimeRange::new(50, 100)).unwrap();
        w.write("x", &CtrCounter { views: 3, clicks: 3 }).unwrap();
        w.finish().unwrap();

        ctr_counter_merge(&[s(&a), s(&b)], &s(&out), RANGE).unwrap();
        assert_eq!(
            rows(&out),
            vec![
                ("x".to_string(), json!({"views": 5, "clicks": 4})),
                ("y".to_string(), json!({"views": 1, "clicks": 0})),
            ]
        );
    }

    #[test]
    fn ctr_counter_merge_rechaza_valores_invalidos() {
        let tmp = temp_dir("merge_invalid");
        let a = tmp.join("a.jsonl");
        let out = tmp.join("out.jsonl");

        let mut w = TableWriter::create(&a, RANGE).unwrap();
        w.write("x", &json!("no soy un contador")).unwrap();
        w.finish().unwrap();

        let err = ctr_counter_merge(&[s(&a)], &s(&out), RANGE).unwrap_err();
        assert!(matches!(err, StageError::InvalidValue { .. }));
        assert!(!out.exists());
    }

    #[test]
    fn related_terms_y_term_info_merge() {
        let tmp = temp_dir("related");
        let by_query = tmp.join("q.jsonl");
        let day1 = tmp.join("d1.jsonl");
        let day2 = tmp.join("d2.jsonl");
        let out = tmp.join("30d.jsonl");

        let mut w = TableWriter::create(&by_query, RANGE).unwrap();
        w.write("funda", &CtrCounter { views: 1, clicks: 0 }).unwrap();
        w.write("funda móvil", &CtrCounter { views: 4, clicks: 2 }).unwrap();
        w.write("funda tablet", &CtrCounter { views: 2, clicks: 1 }).unwrap();
        w.finish().unwrap();

        related_terms(&[s(&by_query)], &s(&day1), RANGE, 10).unwrap();
        let r = rows(&day1);
        assert_eq!(r[0].0, "funda");
        assert_eq!(
            r[0].1,
            json!({"views": 7, "clicks": 3, "related": {"móvil": 4, "tablet": 2}})
        );

        // límite 1: se queda con el más pesado
        related_terms(&[s(&by_query)], &s(&day2), RANGE, 1).unwrap();
        assert_eq!(
            rows(&day2)[0].1,
            json!({"views": 7, "clicks": 3, "related": {"móvil": 4}})
        );

        term_info_merge(&[s(&day1), s(&day2)], &s(&out), RANGE, 10).unwrap();
        let merged = rows(&out);
        assert_eq!(merged.len(), 3);
        assert_eq!(
            merged[0].1,
            json!({"views": 14, "clicks": 6, "related": {"móvil": 8, "tablet": 2}})
        );
    }

    #[test]
    fn term_info_trim_desempata_alfabeticamente() {
        let mut info = TermInfo::default();
        info.related.insert("b".to_string(), 1);
        info.related.insert("a".to_string(), 1);
        info.related.insert("c".to_string(), 5);

        info.trim(2);
        assert_eq!(info.related.keys().cloned().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn leaf_sin_archivo_de_entrada_falla() {
        let tmp = temp_dir("missing");
        let out = tmp.join("out.jsonl");
        let res = ctr_stats(&[s(&tmp.join("no_existe.jsonl"))], &s(&out), RANGE);
        assert!(res.is_err());
        assert!(!out.exists());
    }
}
