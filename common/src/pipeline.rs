use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use crate::error::{BuildError, ConfigError, StageFailure};
use crate::executor::{RemoteExecutor, ShardExecutor};
use crate::generation::{now_micros, MICROS_PER_SECOND};
use crate::job::BuildReport;
use crate::mapreduce::{MapReduceJob, ReportTask, ShardResult, TaskId, TaskKind};
use crate::plan::{ReportPlan, DEFAULT_SETTLE_SECS};
use crate::replication::ReplicationScheme;
use crate::scheduler::{Scheduler, ShardOutcome};
use crate::stage::Stage;

/// Fuente de los stages de una pasada. Se re-evalúa en cada pasada,
/// así que el conjunto puede crecer a medida que avanza el reloj.
pub trait StageProvider: Send + Sync {
    fn stages_at(&self, now_secs: Option<u64>) -> Result<Vec<Stage>, ConfigError>;
}

impl StageProvider for ReportPlan {
    fn stages_at(&self, now_secs: Option<u64>) -> Result<Vec<Stage>, ConfigError> {
        ReportPlan::stages_at(self, now_secs)
    }
}

/// Conjunto fijo de stages.
impl StageProvider for Vec<Stage> {
    fn stages_at(&self, _now_secs: Option<u64>) -> Result<Vec<Stage>, ConfigError> {
        Ok(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct BuilderOptions {
    /// Shards en vuelo a la vez
    pub max_concurrency: usize,
    /// Margen tras el cierre de un rango antes de construirlo
    pub settle_secs: u64,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            settle_secs: DEFAULT_SETTLE_SECS,
        }
    }
}

/// Ritmo del modo loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopOptions {
    /// Tiempo entre el inicio de dos pasadas consecutivas
    pub interval: Duration,
    /// Idem, pero después de una pasada fallida
    pub retry_interval: Duration,
}

/// Job de una pasada más las tareas que corresponden a stages (en orden).
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub job: MapReduceJob,
    pub reports: Vec<TaskId>,
}

/// Ordena los stages de forma que cada productor quede antes que sus
/// consumidores (arista sink -> source).
pub fn order_stages(stages: &[Stage]) -> Result<Vec<usize>, ConfigError> {
    let mut by_sink: HashMap<&str, usize> = HashMap::new();
    for (i, stage) in stages.iter().enumerate() {
        if by_sink.insert(stage.sink.as_str(), i).is_some() {
            return Err(ConfigError::DuplicateSink(stage.sink.clone()));
        }
    }

    // 0 = sin visitar, 1 = en curso, 2 = listo
    let mut state = vec![0u8; stages.len()];
    let mut order = Vec::with_capacity(stages.len());

    for i in 0..stages.len() {
        visit(i, stages, &by_sink, &mut state, &mut order)?;
    }

    Ok(order)
}

fn visit(
    i: usize,
    stages: &[Stage],
    by_sink: &HashMap<&str, usize>,
    state: &mut [u8],
    order: &mut Vec<usize>,
) -> Result<(), ConfigError> {
    match state[i] {
        2 => return Ok(()),
        1 => return Err(ConfigError::Cycle(stages[i].sink.clone())),
        _ => {}
    }

    state[i] = 1;
    for source in &stages[i].sources {
        if let Some(&producer) = by_sink.get(source.as_str()) {
            visit(producer, stages, by_sink, state, order)?;
        }
    }
    state[i] = 2;
    order.push(i);

    Ok(())
}

/// Arma el job de la pasada: una tarea `Report` por stage y una `TableScan`
/// por cada fuente que ningún stage produce.
pub fn plan_job(stages: &[Stage]) -> Result<JobPlan, ConfigError> {
    let order = order_stages(stages)?;

    let mut job = MapReduceJob::new();
    let mut produced: HashMap<String, TaskId> = HashMap::new();
    let mut scans: HashMap<String, TaskId> = HashMap::new();
    let mut reports = Vec::with_capacity(order.len());

    for i in order {
        let stage = &stages[i];

        let mut sources = Vec::with_capacity(stage.sources.len());
        for source in &stage.sources {
            let task = match produced.get(source).or_else(|| scans.get(source)) {
                Some(t) => *t,
                None => {
                    let t = job.add_task(
                        TaskKind::TableScan {
                            path: source.clone(),
                        },
                        vec![],
                    );
                    scans.insert(source.clone(), t);
                    t
                }
            };
            sources.push(task);
        }

        let task = job.add_task(TaskKind::Report(ReportTask::new(stage.clone())), sources);
        produced.insert(stage.sink.clone(), task);
        reports.push(task);
    }

    Ok(JobPlan { job, reports })
}

/// Construye los reportes: una pasada (`build_all`) o para siempre (`build_loop`).
pub struct ReportBuilder<P> {
    provider: P,
    scheduler: Scheduler,
}

impl<P: StageProvider> ReportBuilder<P> {
    pub fn new(
        provider: P,
        replication: Arc<dyn ReplicationScheme>,
        remote: Arc<dyn RemoteExecutor>,
        options: BuilderOptions,
    ) -> Self {
        let executor = ShardExecutor::new(replication, remote, options.settle_secs);
        Self {
            provider,
            scheduler: Scheduler::new(Arc::new(executor), options.max_concurrency),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Una pasada completa. Sólo devuelve error si el plan es inválido;
    /// los fallos de stages quedan en el reporte.
    pub async fn build_pass(&self, now_secs: Option<u64>) -> Result<BuildReport, ConfigError> {
        // el reloj se lee una sola vez por pasada
        let now = match now_secs {
            Some(s) if s > 0 => s.saturating_mul(MICROS_PER_SECOND),
            _ => now_micros(),
        };

        let stages = self.provider.stages_at(Some(now / MICROS_PER_SECOND))?;
        let plan = plan_job(&stages)?;

        let mut report = BuildReport::new(now);
        report.total_stages = plan.reports.len() as u32;
        info!(
            "pasada {}: {} stages, referencia {}",
            report.id, report.total_stages, report.reference_time
        );

        let job = Arc::new(plan.job);
        let outcomes = self.scheduler.run(job.clone(), now).await;

        for t in &plan.reports {
            let task = job.task(*t);
            for shard in &task.shards {
                match outcomes.get(shard) {
                    Some(ShardOutcome::Done(ShardResult::Built { location, rows, .. })) => {
                        report.built.push(location.clone());
                        report.rows_written += rows;
                    }
                    Some(ShardOutcome::Done(ShardResult::Existing { .. })) => report.up_to_date += 1,
                    Some(ShardOutcome::Done(ShardResult::Absent { .. })) => report.absent += 1,
                    Some(ShardOutcome::Failed(e)) => report.failures.push(StageFailure {
                        stage: task.name(),
                        error: e.to_string(),
                    }),
                    Some(ShardOutcome::Blocked { .. }) => report.blocked.push(task.name()),
                    None => {}
                }
            }
        }

        report.finish();
        info!(
            "pasada {} {:?}: construidos={}, al día={}, ausentes={}, fallidos={}, bloqueados={} ({} ms)",
            report.id,
            report.status,
            report.built.len(),
            report.up_to_date,
            report.absent,
            report.failures.len(),
            report.blocked.len(),
            report.elapsed_ms().unwrap_or(0)
        );

        Ok(report)
    }

    /// Una pasada; si algún stage falló devuelve `PassFailed` con todos los fallos.
    pub async fn build_all(&self, now_secs: Option<u64>) -> Result<BuildReport, BuildError> {
        let report = self.build_pass(now_secs).await?;
        if !report.failures.is_empty() {
            return Err(BuildError::PassFailed {
                failures: report.failures,
            });
        }
        Ok(report)
    }

    /// Repite pasadas contra el reloj de pared hasta que `shutdown` pase a
    /// `true` (o se cierre). La señal se mira sólo entre pasadas: un shard
    /// en vuelo siempre termina.
    pub async fn build_loop<F>(
        &self,
        options: LoopOptions,
        mut shutdown: watch::Receiver<bool>,
        mut on_pass: F,
    ) -> Result<(), BuildError>
    where
        F: FnMut(&BuildReport),
    {
        loop {
            if *shutdown.borrow() {
                info!("build loop: señal de salida recibida");
                break;
            }

            let started = Instant::now();
            let report = self.build_pass(None).await?;
            on_pass(&report);

            let wait = if report.is_success() {
                options.interval
            } else {
                warn!(
                    "pasada {} con {} fallo(s), reintento en {:?}",
                    report.id,
                    report.failures.len(),
                    options.retry_interval
                );
                options.retry_interval
            };

            tokio::select! {
                _ = sleep_until(started + wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        error!("build loop: canal de apagado cerrado, saliendo");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LocalExecutor;
    use crate::generation::{TimeRange, SECONDS_PER_DAY, SECONDS_PER_HOUR};
    use crate::job::PassStatus;
    use crate::plan::{PlanConfig, CTR_STATS, CTR_STATS_DAILY, JOINED_QUERIES};
    use crate::replication::SingleHostScheme;
    use crate::report::{CtrCounter, JoinedItem, JoinedQuery};
    use crate::stage::{StageContext, StageKind};
    use crate::table::TableReader;
    use serde_json::json;
    use std::{env, fs, io::Write, path::PathBuf};

    const DAY: u64 = 20_000;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("pipeline_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn local_builder<P: StageProvider>(provider: P) -> ReportBuilder<P> {
        ReportBuilder::new(
            provider,
            Arc::new(SingleHostScheme::local()),
            Arc::new(LocalExecutor::new(StageContext::default())),
            BuilderOptions {
                settle_secs: 0,
                ..Default::default()
            },
        )
    }

    fn write_queries(path: &str, queries: &[JoinedQuery]) {
        let mut f = fs::File::create(path).unwrap();
        for q in queries {
            writeln!(f, "{}", serde_json::to_string(q).unwrap()).unwrap();
        }
    }

    fn query(time: u64, clicked: bool) -> JoinedQuery {
        JoinedQuery {
            time,
            query: "funda movil".to_string(),
            items: vec![JoinedItem {
                item_id: "i1".to_string(),
                position: 1,
                clicked,
            }],
        }
    }

    fn stage(kind: StageKind, sources: Vec<String>, sink: &str) -> Stage {
        Stage::new(kind, sources, sink, TimeRange::bucket(1, SECONDS_PER_HOUR), SECONDS_PER_HOUR).unwrap()
    }

    #[test]
    fn order_stages_pone_productores_primero() {
        let stages = vec![
            stage(StageKind::CtrCounterMerge, vec!["b".into(), "a".into()], "daily"),
            stage(StageKind::CtrStats, vec!["raw".into()], "a"),
            stage(StageKind::CtrStats, vec!["raw".into()], "b"),
        ];

        let order = order_stages(&stages).unwrap();
        let pos = |i: usize| order.iter().position(|x| *x == i).unwrap();
        assert!(pos(1) < pos(0));
        assert!(pos(2) < pos(0));
    }

    #[test]
    fn order_stages_rechaza_ciclos_y_sinks_duplicados() {
        let cycle = vec![
            stage(StageKind::CtrCounterMerge, vec!["b".into()], "a"),
            stage(StageKind::CtrCounterMerge, vec!["a".into()], "b"),
        ];
        assert!(matches!(order_stages(&cycle), Err(ConfigError::Cycle(_))));

        let dup = vec![
            stage(StageKind::CtrStats, vec![], "a"),
            stage(StageKind::CtrStats, vec![], "a"),
        ];
        assert_eq!(
            order_stages(&dup).unwrap_err(),
            ConfigError::DuplicateSink("a".to_string())
        );
    }

    #[test]
    fn plan_job_crea_table_scans_para_fuentes_externas() {
        let stages = vec![
            stage(StageKind::CtrCounterMerge, vec!["a".into(), "b".into()], "daily"),
            stage(StageKind::CtrStats, vec!["raw".into()], "a"),
            stage(StageKind::CtrStats, vec!["raw".into()], "b"),
        ];

        let plan = plan_job(&stages).unwrap();
        // raw (una sola vez) + 3 stages
        assert_eq!(plan.job.tasks().len(), 4);
        assert_eq!(plan.reports.len(), 3);

        let scans = plan
            .job
            .tasks()
            .iter()
            .filter(|t| matches!(t.kind, TaskKind::TableScan { .. }))
            .count();
        assert_eq!(scans, 1);

        // el rollup depende de los shards de a y b
        let daily = plan.job.task(*plan.reports.last().unwrap());
        assert_eq!(daily.name(), "daily");
        assert_eq!(plan.job.shard(daily.shards[0]).dependencies.len(), 2);
    }

    #[tokio::test]
    async fn build_all_construye_hojas_y_el_rollup_del_dia() {
        let tmp = temp_dir("end_to_end");
        let config = PlanConfig {
            customer: "acme".to_string(),
            lookback_secs: SECONDS_PER_DAY,
            ..Default::default()
        };
        let plan = ReportPlan::new(&tmp, config).unwrap();
        let day = DAY - 1;
        let now = DAY * SECONDS_PER_DAY;

        // una búsqueda con click y otra sin, en cada bucket de 4h del día
        let buckets: Vec<u64> = (day * 6..day * 6 + 6).collect();
        for g in &buckets {
            let range = TimeRange::bucket(*g, 4 * SECONDS_PER_HOUR);
            write_queries(
                &plan.artifact(JOINED_QUERIES, *g),
                &[query(range.start, true), query(range.end - 1, false)],
            );
        }

        let builder = local_builder(plan);
        let report = builder.build_all(Some(now)).await.unwrap();

        // 6 buckets x 4 hojas + 4 rollups del día
        assert_eq!(report.total_stages, 28);
        assert_eq!(report.built.len(), 28);
        assert_eq!(report.status, PassStatus::Succeeded);

        let plan = builder.provider();
        let daily = plan.artifact(CTR_STATS_DAILY, day);
        let reader = TableReader::open(&daily).unwrap();
        assert_eq!(
            reader.range(),
            TimeRange::new(
                day * SECONDS_PER_DAY * MICROS_PER_SECOND,
                (day + 1) * SECONDS_PER_DAY * MICROS_PER_SECOND
            )
        );

        let rows: Vec<_> = reader.map(|r| r.unwrap()).collect();
        assert_eq!(rows[0].key, "items");
        assert_eq!(rows[0].value, json!({"views": 12, "clicks": 6}));
        assert_eq!(rows[1].key, "queries");
        let queries: CtrCounter = serde_json::from_value(rows[1].value.clone()).unwrap();
        assert_eq!(queries, CtrCounter { views: 12, clicks: 6 });

        // los 6 sinks hoja del día existen
        for g in &buckets {
            assert!(std::path::Path::new(&plan.artifact(CTR_STATS, *g)).is_file());
        }

        // segunda pasada: todo ya publicado
        let again = builder.build_all(Some(now)).await.unwrap();
        assert!(again.built.is_empty());
        assert_eq!(again.up_to_date, 28);
    }

    #[tokio::test]
    async fn build_pass_difiere_buckets_abiertos_y_sin_datos() {
        let tmp = temp_dir("deferred");
        let config = PlanConfig {
            customer: "acme".to_string(),
            lookback_secs: SECONDS_PER_DAY,
            ..Default::default()
        };
        let plan = ReportPlan::new(&tmp, config).unwrap();
        // a mitad de un bucket de 4h: el bucket actual está abierto
        let now = DAY * SECONDS_PER_DAY + 2 * SECONDS_PER_HOUR;

        let builder = local_builder(plan);
        let report = builder.build_all(Some(now)).await.unwrap();

        // no hay joined queries: nada se construye y nada falla
        assert!(report.built.is_empty());
        assert_eq!(report.absent, report.total_stages);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn build_all_informa_el_stage_fallido_y_bloquea_dependientes() {
        let tmp = temp_dir("failure");
        let s = |name: &str| tmp.join(name).to_string_lossy().to_string();

        fs::write(s("broken.jsonl"), "esto no es json\n").unwrap();
        write_queries(&s("good.jsonl"), &[query(TimeRange::bucket(1, SECONDS_PER_HOUR).start, true)]);

        let stages = vec![
            stage(StageKind::CtrStats, vec![s("broken.jsonl")], &s("bad_leaf.jsonl")),
            stage(StageKind::CtrStats, vec![s("good.jsonl")], &s("good_leaf.jsonl")),
            stage(StageKind::CtrCounterMerge, vec![s("bad_leaf.jsonl")], &s("bad_rollup.jsonl")),
        ];

        let builder = local_builder(stages);
        let err = builder.build_all(Some(DAY * SECONDS_PER_DAY)).await.unwrap_err();

        match err {
            BuildError::PassFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].stage, "bad_leaf.jsonl");
                assert!(failures[0].error.contains("local"));
            }
            other => panic!("error inesperado: {:?}", other),
        }

        assert!(tmp.join("good_leaf.jsonl").is_file());
        assert!(!tmp.join("bad_rollup.jsonl").exists());

        let report = builder.build_pass(Some(DAY * SECONDS_PER_DAY)).await.unwrap();
        assert_eq!(report.blocked, vec!["bad_rollup.jsonl".to_string()]);
        assert_eq!(report.up_to_date, 1);
    }

    #[tokio::test]
    async fn build_loop_corre_pasadas_hasta_la_senal() {
        let tmp = temp_dir("loop");
        let input = tmp.join("raw.jsonl").to_string_lossy().to_string();
        write_queries(&input, &[query(1, true)]);
        let stages = vec![stage(
            StageKind::CtrStats,
            vec![input],
            &tmp.join("out.jsonl").to_string_lossy(),
        )];

        let builder = local_builder(stages);
        let (tx, rx) = watch::channel(false);
        let options = LoopOptions {
            interval: Duration::from_millis(10),
            retry_interval: Duration::from_millis(10),
        };

        let mut passes = Vec::new();
        builder
            .build_loop(options, rx, |report| {
                passes.push((report.built.len(), report.up_to_date));
                if passes.len() == 2 {
                    let _ = tx.send(true);
                }
            })
            .await
            .unwrap();

        assert_eq!(passes, vec![(1, 0), (0, 1)]);
    }

    #[tokio::test]
    async fn build_loop_reintenta_con_retry_interval_tras_un_fallo() {
        let tmp = temp_dir("loop_retry");
        let broken = tmp.join("broken.jsonl").to_string_lossy().to_string();
        fs::write(&broken, "esto no es json\n").unwrap();
        let stages = vec![stage(
            StageKind::CtrStats,
            vec![broken],
            &tmp.join("bad_leaf.jsonl").to_string_lossy(),
        )];

        let builder = local_builder(stages);
        let (tx, rx) = watch::channel(false);
        // con `interval` la segunda pasada no llegaría nunca dentro del timeout
        let options = LoopOptions {
            interval: Duration::from_secs(3 * 3600),
            retry_interval: Duration::from_millis(10),
        };

        let mut passes = Vec::new();
        let run = builder.build_loop(options, rx, |report| {
            passes.push((report.is_success(), report.failures.len()));
            if passes.len() == 2 {
                let _ = tx.send(true);
            }
        });
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("el loop no reintentó con retry_interval")
            .unwrap();

        assert_eq!(passes, vec![(false, 1), (false, 1)]);
    }

    #[tokio::test]
    async fn build_loop_sale_si_la_senal_llega_durante_la_espera() {
        let tmp = temp_dir("loop_shutdown");
        let input = tmp.join("raw.jsonl").to_string_lossy().to_string();
        write_queries(&input, &[query(1, true)]);
        let stages = vec![stage(
            StageKind::CtrStats,
            vec![input],
            &tmp.join("out.jsonl").to_string_lossy(),
        )];

        let builder = local_builder(stages);
        let (tx, rx) = watch::channel(false);
        let options = LoopOptions {
            interval: Duration::from_secs(3 * 3600),
            retry_interval: Duration::from_secs(3 * 3600),
        };

        let mut passes = 0;
        let run = builder.build_loop(options, rx, |_| passes += 1);
        let signal = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        };

        let (result, _) = tokio::time::timeout(Duration::from_secs(10), async { tokio::join!(run, signal) })
            .await
            .expect("el loop siguió durmiendo tras la señal");
        result.unwrap();

        assert_eq!(passes, 1);
    }

    #[tokio::test]
    async fn build_all_con_opciones_por_defecto_espera_el_margen() {
        let tmp = temp_dir("default_settle");
        let input = tmp.join("raw.jsonl").to_string_lossy().to_string();
        write_queries(&input, &[query(1, true)]);
        let range = TimeRange::bucket(DAY * 24 - 1, SECONDS_PER_HOUR);
        let stages = vec![Stage::new(
            StageKind::CtrStats,
            vec![input],
            tmp.join("out.jsonl").to_string_lossy(),
            range,
            SECONDS_PER_HOUR,
        )
        .unwrap()];

        let builder = ReportBuilder::new(
            stages,
            Arc::new(SingleHostScheme::local()),
            Arc::new(LocalExecutor::new(StageContext::default())),
            BuilderOptions::default(),
        );

        // recién cerrado: todavía dentro del margen
        let closed_at = range.end / MICROS_PER_SECOND;
        let report = builder.build_all(Some(closed_at)).await.unwrap();
        assert!(report.built.is_empty());
        assert_eq!(report.absent, 1);

        let report = builder.build_all(Some(closed_at + DEFAULT_SETTLE_SECS)).await.unwrap();
        assert_eq!(report.built.len(), 1);
    }

    #[tokio::test]
    async fn build_loop_no_arranca_si_ya_hay_senal() {
        let builder = local_builder(Vec::<Stage>::new());
        let (_tx, rx) = watch::channel(true);
        let options = LoopOptions {
            interval: Duration::from_secs(3600),
            retry_interval: Duration::from_secs(3600),
        };

        let mut passes = 0;
        builder.build_loop(options, rx, |_| passes += 1).await.unwrap();
        assert_eq!(passes, 0);
    }
}
