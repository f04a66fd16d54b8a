//! Dispatcher: job subjects × providers × variants → ledger.
//!
//! Subjects are sampled chunks (fresh generation) or existing pairs
//! (re-asks); both go through the same pipeline:
//! 1. Plan: build every job, fingerprint it, skip what the ledger already has
//!    (or what this run already claimed)
//! 2. Dispatch: one task per pending job, bounded by its provider's pool
//! 3. Re-ask: a job whose adapter call failed terminally gets another
//!    whole-prompt attempt before being skipped
//! 4. Commit: each validated result is appended to the ledger by the
//!    collecting loop, off the async worker threads
//!
//! Per-job failures (including a panicked job task) are counted and never
//! abort the run. A ledger write failure cancels everything in flight and is
//! returned.

use crate::ledger::{AppendOutcome, Fingerprint, Ledger, pair_fingerprint};
use crate::models::{
    GenerationError, GenerationJob, JobSubject, PairOrigin, PairgenError, Result, ResultRecord,
    RunSummary, SampledSet, SourcePair,
};
use crate::pipeline::ProviderPool;
use crate::provider::{OutputSchema, PromptRenderer, StructuredResult};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Knobs for a dispatch run.
#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    /// Independent generations per (subject, provider)
    pub variants_per_job: u32,
    /// Whole-prompt attempts after a terminal failure
    pub reask_attempts: u32,
    pub show_progress: bool,
    /// Dispatch at most this many subjects that still have work; subjects
    /// whose jobs are all done do not count
    pub limit: Option<usize>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            variants_per_job: 1,
            reask_attempts: 1,
            show_progress: false,
            limit: None,
        }
    }
}

/// A job that survived planning.
#[derive(Debug)]
struct PendingJob {
    job: GenerationJob,
    fingerprint: Fingerprint,
    /// Position in the plan, used for run ids
    ordinal: usize,
}

/// What a job task produced.
#[derive(Debug)]
enum Generation {
    /// Validated and ready to commit
    Ready(Box<ResultRecord>),
    /// Terminal failure after retries and re-asks
    Failed,
    Cancelled,
}

/// State shared by every job task.
struct JobContext {
    schema: Arc<OutputSchema>,
    reask_attempts: u32,
    run_tag: String,
    cancel: CancellationToken,
}

/// Orchestrates generation jobs across providers.
pub struct Dispatcher {
    providers: Vec<Arc<ProviderPool>>,
    renderer: Arc<dyn PromptRenderer>,
    schema: Arc<OutputSchema>,
    ledger: Arc<Ledger>,
    options: DispatchOptions,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        providers: Vec<Arc<ProviderPool>>,
        renderer: Arc<dyn PromptRenderer>,
        schema: OutputSchema,
        ledger: Arc<Ledger>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            providers,
            renderer,
            schema: Arc::new(schema),
            ledger,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token (e.g. wired to Ctrl-C).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Generate pairs for every sampled chunk not yet in the ledger.
    ///
    /// Chunks are taken by label (sorted), then in sample order.
    pub async fn run(&self, sampled: &SampledSet) -> Result<RunSummary> {
        let subjects = sampled
            .iter()
            .flat_map(|(_, chunks)| chunks.iter().cloned().map(JobSubject::Chunk));
        self.dispatch(subjects).await
    }

    /// Re-ask every existing pair not yet in the ledger, in file order.
    pub async fn run_pairs(&self, pairs: &[SourcePair]) -> Result<RunSummary> {
        self.dispatch(pairs.iter().cloned().map(JobSubject::Pair)).await
    }

    /// Build and filter the job list.
    ///
    /// Order: subject, provider, variant. Jobs already in the ledger, and
    /// repeats of a job earlier in the same plan, are counted as skipped.
    /// Subjects past the limit are not considered at all.
    fn plan<I>(&self, subjects: I, summary: &mut RunSummary) -> Vec<PendingJob>
    where
        I: IntoIterator<Item = JobSubject>,
    {
        let mut claimed: HashSet<Fingerprint> = HashSet::new();
        let mut pending = Vec::new();
        let mut planned_subjects = 0usize;

        for subject in subjects {
            if self.options.limit.is_some_and(|limit| planned_subjects >= limit) {
                break;
            }

            let mut has_work = false;
            for provider in &self.providers {
                for variant_index in 0..self.options.variants_per_job {
                    let job = GenerationJob {
                        rendered_prompt: self.renderer.render(&subject, variant_index),
                        subject: subject.clone(),
                        provider_id: provider.id().to_string(),
                        variant_index,
                    };
                    let fingerprint = job.fingerprint();
                    let counts = summary.counts_mut(provider.id(), subject.source_label());
                    counts.sampled += 1;

                    if self.ledger.contains(&fingerprint) || !claimed.insert(fingerprint.clone()) {
                        counts.skipped_done += 1;
                        continue;
                    }

                    pending.push(PendingJob {
                        job,
                        fingerprint,
                        ordinal: pending.len(),
                    });
                    has_work = true;
                }
            }

            if has_work {
                planned_subjects += 1;
            }
        }

        pending
    }

    async fn dispatch<I>(&self, subjects: I) -> Result<RunSummary>
    where
        I: IntoIterator<Item = JobSubject>,
    {
        let start = Instant::now();
        let mut summary = RunSummary::default();
        let pending = self.plan(subjects, &mut summary);

        for pool in &self.providers {
            debug!(
                provider = pool.id(),
                concurrency = pool.concurrency(),
                max_retries = pool.retry_policy().max_retries,
                "Provider pool"
            );
        }
        let totals = summary.totals();
        info!(
            providers = self.providers.len(),
            jobs = totals.sampled,
            already_done = totals.skipped_done,
            pending = pending.len(),
            "Dispatch planned"
        );

        if pending.is_empty() {
            info!("All jobs already committed, nothing to do");
            summary.finalize(start.elapsed().as_secs_f64());
            return Ok(summary);
        }

        let pb = self.progress_bar(pending.len());
        let pools: BTreeMap<&str, Arc<ProviderPool>> = self
            .providers
            .iter()
            .map(|p| (p.id(), Arc::clone(p)))
            .collect();

        let uuid = Uuid::new_v4().simple().to_string();
        let ctx = Arc::new(JobContext {
            schema: Arc::clone(&self.schema),
            reask_attempts: self.options.reask_attempts,
            run_tag: uuid[..8].to_string(),
            cancel: self.cancel.clone(),
        });

        let mut tasks = JoinSet::new();
        // Cell of each task, for jobs that never report back
        let mut cells: HashMap<tokio::task::Id, (String, String)> = HashMap::new();
        for pending_job in pending {
            let provider_id = pending_job.job.provider_id.clone();
            let source_label = pending_job.job.subject.source_label().to_string();

            let Some(pool) = pools.get(provider_id.as_str()).cloned() else {
                return Err(PairgenError::Internal(format!(
                    "No pool for provider '{provider_id}'"
                )));
            };

            let ctx = Arc::clone(&ctx);
            let handle = tasks.spawn(async move { execute(&ctx, &pool, pending_job).await });
            cells.insert(handle.id(), (provider_id, source_label));
        }

        let mut succeeded = 0usize;
        let mut failed = 0usize;

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "Job task panicked, counting it as failed");
                    if let Some((provider_id, source_label)) = cells.get(&e.id()) {
                        summary.counts_mut(provider_id, source_label).failed_terminal += 1;
                    }
                    failed += 1;
                    pb.inc(1);
                    continue;
                }
            };
            let Some((provider_id, source_label)) = cells.get(&id) else {
                return self.abort(&mut tasks, &pb, PairgenError::Internal("Unknown job task".into()));
            };

            match outcome {
                Ok(Generation::Ready(record)) => match self.commit(*record).await {
                    Ok((AppendOutcome::Committed, duplicate_content)) => {
                        summary.counts_mut(provider_id, source_label).succeeded += 1;
                        succeeded += 1;
                        if duplicate_content {
                            summary.duplicate_content += 1;
                        }
                    }
                    Ok((AppendOutcome::Duplicate, _)) => {
                        summary.counts_mut(provider_id, source_label).skipped_done += 1;
                    }
                    Err(e) => return self.abort(&mut tasks, &pb, e),
                },
                Ok(Generation::Failed) => {
                    summary.counts_mut(provider_id, source_label).failed_terminal += 1;
                    failed += 1;
                }
                Ok(Generation::Cancelled) => {
                    summary.counts_mut(provider_id, source_label).cancelled += 1;
                }
                Err(e) => return self.abort(&mut tasks, &pb, e),
            }

            pb.inc(1);
            pb.set_message(format!("ok: {succeeded}, failed: {failed}"));
        }

        pb.finish_with_message(format!("Done! {succeeded} committed, {failed} failed"));
        summary.finalize(start.elapsed().as_secs_f64());

        let totals = summary.totals();
        info!(
            succeeded = totals.succeeded,
            failed_terminal = totals.failed_terminal,
            skipped_done = totals.skipped_done,
            cancelled = totals.cancelled,
            duplicate_content = summary.duplicate_content,
            runtime_secs = summary.runtime_secs,
            "Dispatch complete"
        );

        if self.cancel.is_cancelled() && totals.cancelled > 0 {
            warn!(cancelled = totals.cancelled, "Run was cancelled, remaining jobs stay pending");
        }

        Ok(summary)
    }

    /// Append one record on the blocking pool.
    ///
    /// Also reports whether a record with the same content already existed.
    async fn commit(&self, record: ResultRecord) -> Result<(AppendOutcome, bool)> {
        let ledger = Arc::clone(&self.ledger);
        tokio::task::spawn_blocking(move || {
            let duplicate_content = ledger.contains_content(&record.content_hash);
            let outcome = ledger.append(&record)?;
            if duplicate_content && outcome == AppendOutcome::Committed {
                debug!(run_id = %record.run_id, "Committed a pair whose content already exists");
            }
            Ok((outcome, duplicate_content))
        })
        .await
        .map_err(|e| PairgenError::Internal(format!("Ledger append task failed: {e}")))?
    }

    /// Stop everything in flight and surface a fatal error.
    fn abort<T: 'static>(
        &self,
        tasks: &mut JoinSet<T>,
        pb: &ProgressBar,
        error: PairgenError,
    ) -> Result<RunSummary> {
        warn!(error = %error, "Fatal error, stopping dispatch");
        self.cancel.cancel();
        tasks.abort_all();
        pb.abandon_with_message("aborted");
        Err(error)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }
}

/// Generate, re-ask on terminal failure and validate one job.
async fn execute(ctx: &JobContext, pool: &ProviderPool, pending: PendingJob) -> Result<Generation> {
    let PendingJob {
        job,
        fingerprint,
        ordinal,
    } = pending;

    let generated = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Ok(Generation::Cancelled),
        generated = generate_with_reask(ctx, pool, &job, &fingerprint) => generated?,
    };

    match generated {
        Ok(result) => Ok(Generation::Ready(Box::new(build_record(
            ctx,
            &job,
            fingerprint,
            ordinal,
            result,
        )))),
        Err(e) => {
            warn!(
                provider = %job.provider_id,
                subject = %job.subject.reference(),
                fingerprint = %fingerprint.short(),
                kind = %e.kind,
                error = %e.message,
                "Job failed, leaving it for the next run"
            );
            Ok(Generation::Failed)
        }
    }
}

/// Call the provider, with up to `reask_attempts` whole-prompt retries.
///
/// The outer `Result` carries only infrastructure failures.
async fn generate_with_reask(
    ctx: &JobContext,
    pool: &ProviderPool,
    job: &GenerationJob,
    fingerprint: &Fingerprint,
) -> Result<std::result::Result<StructuredResult, GenerationError>> {
    let label = fingerprint.short();
    let mut asks = 0u32;

    loop {
        asks += 1;
        let outcome = pool.generate(label, &job.rendered_prompt, &ctx.schema).await?;
        let result = outcome
            .result
            .and_then(|r| ctx.schema.validate(&r).map(|_| r));

        match result {
            Ok(r) => return Ok(Ok(r)),
            Err(e) if asks <= ctx.reask_attempts && !e.permanent => {
                debug!(
                    provider = %job.provider_id,
                    job = label,
                    kind = %e.kind,
                    ask = asks,
                    "Re-asking after terminal failure"
                );
            }
            Err(e) => return Ok(Err(e)),
        }
    }
}

fn build_record(
    ctx: &JobContext,
    job: &GenerationJob,
    fingerprint: Fingerprint,
    ordinal: usize,
    result: StructuredResult,
) -> ResultRecord {
    let StructuredResult { mut fields, model } = result;
    let instruction = fields.remove("instruction").unwrap_or_default();
    let response = fields.remove("response").unwrap_or_default();
    let (source_text, origin) = match &job.subject {
        JobSubject::Chunk(chunk) => (chunk.text.clone(), None),
        JobSubject::Pair(pair) => (String::new(), Some(PairOrigin::from(pair))),
    };

    ResultRecord {
        content_hash: pair_fingerprint(&instruction, &response),
        fingerprint,
        run_id: format!(
            "{}-{}-{}-{}",
            ctx.run_tag,
            job.provider_id,
            job.subject.source_label(),
            ordinal
        ),
        provider_id: job.provider_id.clone(),
        model,
        source_label: job.subject.source_label().to_string(),
        variant_index: job.variant_index,
        instruction,
        response,
        extra_fields: fields,
        raw_chunk_ref: job.subject.reference(),
        source_text,
        origin,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, SourcePair};
    use crate::provider::{ProviderAdapter, RetryPolicy, TemplateRenderer};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Echoes the prompt back as a valid pair.
    struct EchoAdapter(&'static str);

    #[async_trait]
    impl ProviderAdapter for EchoAdapter {
        fn id(&self) -> &str {
            self.0
        }

        async fn generate(
            &self,
            prompt: &str,
            _schema: &OutputSchema,
        ) -> std::result::Result<StructuredResult, GenerationError> {
            Ok(StructuredResult::from_pairs([
                ("instruction", format!("Q: {prompt}")),
                ("response", format!("A: {prompt}")),
            ]))
        }
    }

    /// Panics on prompts containing "Dó".
    struct FragileAdapter;

    #[async_trait]
    impl ProviderAdapter for FragileAdapter {
        fn id(&self) -> &str {
            "fragile"
        }

        async fn generate(
            &self,
            prompt: &str,
            schema: &OutputSchema,
        ) -> std::result::Result<StructuredResult, GenerationError> {
            if prompt.contains("Dó") {
                panic!("adapter bug");
            }
            EchoAdapter("fragile").generate(prompt, schema).await
        }
    }

    fn pool(id: &'static str) -> Arc<ProviderPool> {
        pool_with(Arc::new(EchoAdapter(id)))
    }

    fn pool_with(adapter: Arc<dyn ProviderAdapter>) -> Arc<ProviderPool> {
        Arc::new(ProviderPool::new(
            adapter,
            2,
            RetryPolicy::none(),
            Duration::from_secs(5),
        ))
    }

    fn sampled() -> SampledSet {
        let mut set = SampledSet::new();
        set.insert(
            "Wiki",
            vec![Chunk::new("Wiki", 0, "Aon"), Chunk::new("Wiki", 4, "Dó")],
        );
        set.insert("Oireachtas", vec![Chunk::new("Oireachtas", 1, "Trí")]);
        set
    }

    fn dispatcher(ledger: Arc<Ledger>, providers: Vec<Arc<ProviderPool>>, variants: u32) -> Dispatcher {
        Dispatcher::new(
            providers,
            Arc::new(TemplateRenderer::new("{TEXT}")),
            OutputSchema::default(),
            ledger,
            DispatchOptions {
                variants_per_job: variants,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_run_commits_cartesian_product() {
        let temp = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::open(&temp.path().join("l.jsonl"), false).unwrap());

        let summary = dispatcher(ledger.clone(), vec![pool("a"), pool("b")], 2)
            .run(&sampled())
            .await
            .unwrap();

        // 3 chunks × 2 providers × 2 variants
        assert_eq!(summary.totals().sampled, 12);
        assert_eq!(summary.totals().succeeded, 12);
        assert_eq!(summary.counts("b", "Wiki").succeeded, 4);
        assert_eq!(ledger.len(), 12);

        let records = Ledger::read_records(ledger.path()).unwrap();
        let record = records.iter().find(|r| r.source_text == "Trí").unwrap();
        assert_eq!(record.instruction, "Q: Trí");
        assert_eq!(record.raw_chunk_ref, "Oireachtas#1");
        assert!(record.run_id.contains(&format!("-{}-Oireachtas-", record.provider_id)));
    }

    #[tokio::test]
    async fn test_within_run_duplicates_are_claimed_once() {
        let temp = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::open(&temp.path().join("l.jsonl"), false).unwrap());
        let mut set = SampledSet::new();
        set.insert(
            "Wiki",
            vec![Chunk::new("Wiki", 0, "Aon"), Chunk::new("Wiki", 7, " Aon\n")],
        );

        let summary = dispatcher(ledger.clone(), vec![pool("a")], 1).run(&set).await.unwrap();
        let counts = summary.counts("a", "Wiki");
        assert_eq!(counts.sampled, 2);
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.skipped_done, 1);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_commits_nothing() {
        let temp = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::open(&temp.path().join("l.jsonl"), false).unwrap());
        let dispatcher = dispatcher(ledger.clone(), vec![pool("a")], 1);
        dispatcher.cancellation_token().cancel();

        let summary = dispatcher.run(&sampled()).await.unwrap();
        assert_eq!(summary.totals().cancelled, 3);
        assert_eq!(summary.totals().succeeded, 0);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_panicked_job_counts_as_failed() {
        let temp = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::open(&temp.path().join("l.jsonl"), false).unwrap());

        let summary = dispatcher(ledger.clone(), vec![pool_with(Arc::new(FragileAdapter))], 1)
            .run(&sampled())
            .await
            .unwrap();

        let wiki = summary.counts("fragile", "Wiki");
        assert_eq!(wiki.succeeded, 1);
        assert_eq!(wiki.failed_terminal, 1);
        assert_eq!(summary.counts("fragile", "Oireachtas").succeeded, 1);
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test]
    async fn test_limit_counts_subjects_with_work() {
        let temp = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::open(&temp.path().join("l.jsonl"), false).unwrap());
        let limited = |ledger: Arc<Ledger>| {
            Dispatcher::new(
                vec![pool("a"), pool("b")],
                Arc::new(TemplateRenderer::new("{TEXT}")),
                OutputSchema::default(),
                ledger,
                DispatchOptions {
                    limit: Some(2),
                    ..Default::default()
                },
            )
        };

        // Labels in order: Oireachtas (Trí), then Wiki (Aon, Dó)
        let first = limited(ledger.clone()).run(&sampled()).await.unwrap();
        assert_eq!(first.totals().succeeded, 4);
        assert_eq!(first.counts("a", "Wiki").succeeded, 1);

        let second = limited(ledger.clone()).run(&sampled()).await.unwrap();
        assert_eq!(second.totals().sampled, 6);
        assert_eq!(second.totals().skipped_done, 4);
        assert_eq!(second.totals().succeeded, 2);

        let third = limited(ledger.clone()).run(&sampled()).await.unwrap();
        assert_eq!(third.totals().succeeded, 0);
        assert_eq!(ledger.len(), 6);
    }

    #[tokio::test]
    async fn test_run_pairs_records_the_origin() {
        let temp = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::open(&temp.path().join("l.jsonl"), false).unwrap());
        let pairs = vec![
            SourcePair::new("LIMA", 1, "Why?", "Because."),
            SourcePair::new("LIMA", 2, " Why? ", "Because.\n"),
        ];

        let summary = dispatcher(ledger.clone(), vec![pool("a")], 1)
            .run_pairs(&pairs)
            .await
            .unwrap();
        let counts = summary.counts("a", "LIMA");
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.skipped_done, 1);

        let records = Ledger::read_records(ledger.path()).unwrap();
        assert_eq!(records.len(), 1);
        let origin = records[0].origin.as_ref().unwrap();
        assert_eq!(origin.instruction, "Why?");
        assert_eq!(origin.hash, pair_fingerprint("Why?", "Because."));
        assert_eq!(records[0].raw_chunk_ref, "LIMA#1");
        assert!(records[0].source_text.is_empty());
    }
}
