use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use common::table::{Row, TableReader};
use common::{generations, ArtifactList, BuildReport, PlanConfig, ReportPlan, TimeRange, WorkerStatus};
use reqwest::Client;
use serde_json::Value;
use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

/// Igual que en el builder:
/// - En Docker: BUILDER_URL=http://builder:8080
/// - Local: default http://localhost:8080
fn builder_base_url() -> String {
    env::var("BUILDER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para inspeccionar generaciones, planes, tablas y el estado del builder")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lista las generaciones de una ventana dentro de un rango
    Generations {
        /// Ventana en segundos
        #[arg(long, default_value_t = 4 * 3600)]
        window: u64,
        /// Rango hacia atrás en segundos
        #[arg(long, default_value_t = 60 * 86400)]
        range: u64,
        /// Instante de referencia (segundos unix); default = ahora
        #[arg(long)]
        at: Option<u64>,
    },
    /// Muestra los stages del plan y si ya están publicados
    Plan {
        #[arg(long)]
        artifacts: PathBuf,
        /// Directorio con reportbuild.json
        #[arg(long, default_value = "./conf")]
        conf: PathBuf,
        #[arg(long)]
        customer: Option<String>,
        #[arg(long)]
        at: Option<u64>,
        /// Sólo los stages que faltan
        #[arg(long)]
        pending: bool,
    },
    /// Vuelca una tabla (JSON lines o CSV)
    Cat {
        #[arg(value_name = "TABLA")]
        path: PathBuf,
        #[arg(long)]
        csv: bool,
    },
    /// Reporte de la última pasada del builder
    Status,
    /// Lista los artefactos publicados por el builder
    Artifacts,
    /// Estado de un worker
    Worker {
        #[arg(value_name = "URL")]
        url: String,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = builder_base_url();

    match cli.command {
        Commands::Generations { window, range, at } => {
            let gens = generations(window, range, at);
            println!("{} generaciones (ventana={}s, rango={}s):", gens.len(), window, range);
            for g in gens {
                println!("  {:>10}  {}", g, TimeRange::bucket(g, window));
            }
        }

        Commands::Plan {
            artifacts,
            conf,
            customer,
            at,
            pending,
        } => {
            let mut config = load_plan_config(&conf)?;
            if let Some(c) = customer {
                config.customer = c;
            }

            let plan = ReportPlan::new(&artifacts, config)?;
            let stages = plan.stages_at(at)?;
            let published = stages.iter().filter(|s| s.is_published()).count();

            println!(
                "{} stages ({} publicados, {} pendientes)",
                stages.len(),
                published,
                stages.len() - published
            );
            for s in &stages {
                let done = s.is_published();
                if pending && done {
                    continue;
                }
                println!(
                    "  [{}] {:<50} {}  ({} fuentes)",
                    if done { "x" } else { " " },
                    s.name(),
                    s.range,
                    s.sources.len()
                );
            }
        }

        Commands::Cat { path, csv } => {
            let reader = TableReader::open(&path)?;
            eprintln!("# {} {}", path.display(), reader.range());
            let rows = reader.collect::<Result<Vec<Row>, _>>()?;

            if csv {
                write_csv(&rows, io::stdout())?;
            } else {
                for row in rows {
                    println!("{}", serde_json::to_string(&row)?);
                }
            }
        }

        Commands::Status => {
            let url = format!("{}/api/v1/passes/last", base_url);
            let resp = client.get(&url).send().await?;

            if resp.status().is_success() {
                let report: BuildReport = resp.json().await?;
                println!("Pasada {}:", report.id);
                println!("  estado: {:?}", report.status);
                println!("  referencia: {}", report.reference_time);
                println!("  iniciada: {}", report.started_at);
                if let Some(done) = report.finished_at {
                    let ago = (Utc::now() - done).num_seconds();
                    println!("  finalizada: {} (hace {} s)", done, ago);
                }
                println!(
                    "  stages: total={}, construidos={}, al día={}, ausentes={}, fallidos={}, bloqueados={}",
                    report.total_stages,
                    report.built.len(),
                    report.up_to_date,
                    report.absent,
                    report.failures.len(),
                    report.blocked.len()
                );
                println!("  filas escritas: {}", report.rows_written);
                for f in &report.failures {
                    println!("  FALLO {}: {}", f.stage, f.error);
                }
            } else {
                println!("Sin pasadas todavía (status {})", resp.status());
            }
        }

        Commands::Artifacts => {
            let url = format!("{}/api/v1/artifacts", base_url);
            let resp = client.get(&url).send().await?;

            if resp.status().is_success() {
                let list: ArtifactList = resp.json().await?;
                println!("Artefactos en {}:", list.dir);
                if list.files.is_empty() {
                    println!("  (sin artefactos)");
                }
                for f in list.files {
                    println!("    - {}", f);
                }
            } else {
                println!("Error consultando /api/v1/artifacts (status {})", resp.status());
            }
        }

        Commands::Worker { url } => {
            let url = format!("{}/api/v1/health", url.trim_end_matches('/'));
            let resp = client.get(&url).send().await?;

            if resp.status().is_success() {
                let w: WorkerStatus = resp.json().await?;
                println!("Worker {}", w.hostname);
                println!("  concurrency    : max={} activos={}", w.max_concurrency, w.active_shards);
                println!("  shards         : ok={}, failed={}", w.shards_executed, w.shards_failed);
                match w.avg_shard_ms {
                    Some(avg) => println!("  avg_shard_ms   : {:.1}", avg),
                    None => println!("  avg_shard_ms   : (sin datos)"),
                }
                match w.cpu_percent {
                    Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
                    None => println!("  cpu_percent    : (sin datos)"),
                }
                match w.mem_bytes {
                    Some(mem) => println!("  mem_bytes      : {}", mem),
                    None => println!("  mem_bytes      : (sin datos)"),
                }
            } else {
                println!("Error consultando {} (status {})", url, resp.status());
            }
        }
    }

    Ok(())
}

/// Los campos del plan viven en `<conf>/reportbuild.json` (el resto se ignora).
fn load_plan_config(conf: &Path) -> Result<PlanConfig> {
    let path = conf.join("reportbuild.json");
    match fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str(&content).with_context(|| format!("config inválida en {}", path.display())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PlanConfig::default()),
        Err(e) => Err(e).with_context(|| format!("no se pudo leer {}", path.display())),
    }
}

/// CSV con una columna por campo escalar de los valores (si son objetos);
/// cualquier otro valor va entero en la columna "value".
fn write_csv<W: io::Write>(rows: &[Row], out: W) -> Result<()> {
    let mut fields: Vec<String> = Vec::new();
    for row in rows {
        if let Value::Object(obj) = &row.value {
            for (k, v) in obj {
                if !v.is_object() && !v.is_array() && !fields.contains(k) {
                    fields.push(k.clone());
                }
            }
        }
    }

    let mut w = csv::Writer::from_writer(out);
    let mut header = vec!["key".to_string()];
    if fields.is_empty() {
        header.push("value".to_string());
    } else {
        header.extend(fields.iter().cloned());
    }
    w.write_record(&header)?;

    for row in rows {
        let mut record = vec![row.key.clone()];
        if fields.is_empty() {
            record.push(row.value.to_string());
        } else {
            for f in &fields {
                let cell = match row.value.get(f) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(v) => v.to_string(),
                };
                record.push(cell);
            }
        }
        w.write_record(&record)?;
    }

    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(key: &str, value: Value) -> Row {
        Row {
            key: key.to_string(),
            value,
        }
    }

    fn render(rows: &[Row]) -> String {
        let mut buf = Vec::new();
        write_csv(rows, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn csv_una_columna_por_campo_escalar() {
        let out = render(&[
            row("funda", json!({"views": 7, "clicks": 3, "related": {"movil": 4}})),
            row("movil", json!({"views": 4, "clicks": 2})),
        ]);
        // serde_json ordena las claves
        assert_eq!(out, "key,clicks,views\nfunda,3,7\nmovil,2,4\n");
    }

    #[test]
    fn csv_valores_no_objeto_van_en_value() {
        let out = render(&[row("a", json!(1)), row("b", json!("x"))]);
        assert_eq!(out, "key,value\na,1\nb,\"\"\"x\"\"\"\n");
    }
}
