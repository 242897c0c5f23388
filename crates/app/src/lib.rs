//! Process wiring: builds every component once from [`AppConfig`], starts the
//! background workers, and tears them down in reverse order.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use castline_events::{InMemoryEventBus, PipelineEvent};
use castline_infra::config::AppConfig;
use castline_infra::episodes::InMemoryEpisodeStore;
use castline_infra::feed::{FeedCache, FeedMeta, RssRenderer};
use castline_infra::invalidation::{InvalidationCoordinator, InvalidationStrategy, LogOnlyCdnClient};
use castline_infra::jobs::{JobRunner, PassthroughProcessor};
use castline_infra::store::{InMemoryJobStore, InMemorySubmissionStore};
use castline_infra::workers::{
    InvalidationWorker, WorkerHandle, spawn_cache_sweeper, spawn_drain_ticker, spawn_periodic,
};
use castline_infra::{CastlineService, ServiceParts};
use castline_pipeline::JobStatus;

pub type Bus = Arc<InMemoryEventBus<PipelineEvent>>;

/// How often the stale-job reaper looks for stuck jobs.
const REAPER_PERIOD: Duration = Duration::from_secs(15 * 60);

/// A running castline process.
pub struct Runtime {
    pub config: AppConfig,
    pub service: Arc<CastlineService<Bus>>,
    pub coordinator: Arc<InvalidationCoordinator>,
    /// Start order; stopped back to front.
    workers: Vec<WorkerHandle>,
}

impl Runtime {
    /// Wire all components and start the workers. Must run inside a tokio runtime.
    pub fn start(config: AppConfig) -> Self {
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let submissions = InMemorySubmissionStore::arc();
        let jobs = InMemoryJobStore::arc();
        let episodes = InMemoryEpisodeStore::arc();

        let feed_url = config.feed_url();
        let runner = Arc::new(JobRunner::new(
            submissions.clone(),
            jobs,
            Arc::new(PassthroughProcessor::new(format!(
                "{}/audio",
                config.public_base_url.trim_end_matches('/')
            ))),
            episodes.clone(),
            bus.clone(),
            config.runner(),
        ));

        let cache = Arc::new(FeedCache::new(config.cache()));
        let coordinator = Arc::new(InvalidationCoordinator::new(
            cache.clone(),
            Arc::new(LogOnlyCdnClient::default()),
            config.invalidation(),
        ));

        let service = Arc::new(CastlineService::new(ServiceParts {
            meta: FeedMeta::new(config.feed_id.clone(), feed_url.clone()),
            submissions,
            episodes,
            runner: runner.clone(),
            renderer: Arc::new(RssRenderer),
            cache: cache.clone(),
            coordinator: coordinator.clone(),
            clock: Arc::new(castline_core::SystemClock),
        }));

        let mut workers = vec![
            spawn_cache_sweeper(cache),
            InvalidationWorker::spawn(bus.as_ref(), coordinator.clone(), Some(config.feed_id.clone())),
        ];
        if config.invalidation_strategy == InvalidationStrategy::Scheduled {
            workers.push(spawn_drain_ticker(coordinator.clone(), config.invalidation_drain_interval));
        }

        let stale_hours = config.stale_job_hours;
        workers.push(spawn_periodic("stale-job-reaper", REAPER_PERIOD, move || {
            let runner = runner.clone();
            async move {
                match runner.reap_stale(stale_hours).await {
                    Ok(reaped) => {
                        for job in reaped.into_iter().filter(|j| j.status() == JobStatus::Queued) {
                            let runner = runner.clone();
                            tokio::spawn(async move {
                                if let Err(err) = runner.run(job.id()).await {
                                    error!(job_id = %job.id(), error = %err, "requeued job ended in failure");
                                }
                            });
                        }
                    }
                    Err(err) => error!(error = %err, "stale job sweep failed"),
                }
            }
        }));

        info!(
            feed_id = %config.feed_id,
            feed_url = %feed_url,
            strategy = %config.invalidation_strategy,
            workers = workers.len(),
            "castline started"
        );

        Self {
            config,
            service,
            coordinator,
            workers,
        }
    }

    pub fn worker_names(&self) -> Vec<&'static str> {
        self.workers.iter().map(WorkerHandle::name).collect()
    }

    /// Stop workers newest first, then flush queued invalidations.
    pub async fn shutdown(mut self) {
        while let Some(worker) = self.workers.pop() {
            let name = worker.name();
            worker.stop().await;
            info!(worker = name, "worker stopped");
        }

        let flushed = self.coordinator.shutdown().await;
        info!(flushed = flushed.len(), "castline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castline_infra::feed::RenderOptions;
    use castline_infra::invalidation::InvalidationSource;
    use castline_pipeline::ContentKind;

    fn config(pairs: &'static [(&'static str, &'static str)]) -> AppConfig {
        AppConfig::from_lookup(|key| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        })
        .unwrap()
    }

    #[tokio::test]
    async fn starts_workers_and_shuts_down() {
        let runtime = Runtime::start(config(&[]));
        assert_eq!(
            runtime.worker_names(),
            vec!["feed-cache-sweeper", "invalidation-worker", "stale-job-reaper"]
        );
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn scheduled_strategy_adds_drain_ticker_and_flushes_on_shutdown() {
        let runtime = Runtime::start(config(&[("CASTLINE_INVALIDATION_STRATEGY", "scheduled")]));
        assert!(runtime.worker_names().contains(&"invalidation-drain"));

        let feed_id = runtime.config.feed_id.clone();
        runtime
            .coordinator
            .invalidate(&feed_id, "test", InvalidationSource::Manual)
            .await;
        assert!(runtime.coordinator.has_pending());

        let coordinator = runtime.coordinator.clone();
        runtime.shutdown().await;
        assert!(!coordinator.has_pending());
    }

    #[tokio::test]
    async fn submitted_content_reaches_the_feed() {
        let runtime = Runtime::start(config(&[]));
        let id = runtime
            .service
            .submit_content("https://example.com/post", ContentKind::Url, None)
            .await
            .unwrap();

        let mut completed = false;
        for _ in 0..200 {
            if runtime.service.get_job_status(id).await.unwrap().progress == 100 {
                completed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(completed, "background job did not finish");

        let feed = runtime.service.get_rendered_feed(&RenderOptions::default()).await.unwrap();
        assert!(feed.content.contains("https://example.com/post"));
        assert!(feed.content.contains("http://localhost:8080/audio/"));
        runtime.shutdown().await;
    }
}
