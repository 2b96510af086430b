//! The job state machine: owns every status transition, drives the remote
//! operations and persists each mutation before the side effect it gates is
//! trusted.

use std::fs;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, instrument};

use annoq_data::{JobOptions, JobRecord, Status};

use crate::error::{Error, Result};
use crate::executor::{shell_quote, RemoteCommand, RemoteExecutor};
use crate::output::{self, ParsedOutput};
use crate::queue::JobQueue;
use crate::settings::Settings;
use crate::storage::StorageBackend;
use crate::store::JobStore;

pub struct JobManager {
    settings: Settings,
    store: JobStore,
    queue: JobQueue,
    executor: Arc<dyn RemoteExecutor>,
    storage: Arc<dyn StorageBackend>,
}

impl JobManager {
    /// Build a manager and restore state from the queue directory: cached
    /// records are rehydrated and still-active jobs are re-enqueued in
    /// backup-file age order.
    pub fn new(
        settings: Settings,
        executor: Arc<dyn RemoteExecutor>,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        let store = JobStore::new(&settings.queue_dir)?;
        let queue = JobQueue::new(&settings.queue_dir)?;
        let manager = Self {
            settings,
            store,
            queue,
            executor,
            storage,
        };
        for job in manager.store.load_all()? {
            if job.status.is_active() {
                manager.queue.enqueue_if_absent(&job.corpus_id)?;
            }
        }
        Ok(manager)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Fetch the job for a corpus, rehydrated from the store or freshly
    /// created, with caller-supplied overrides applied.
    pub fn get_job(&self, corpus_id: &str, options: JobOptions) -> Result<JobRecord> {
        let mut job = self
            .store
            .get(corpus_id)?
            .unwrap_or_else(|| JobRecord::new(corpus_id));
        job.apply(options);
        Ok(job)
    }

    pub fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        self.store.load_all()
    }

    /// Remove the job record and dequeue it. The store refuses while a
    /// remote process is running unless `force` is set.
    pub fn drop_job(&self, corpus_id: &str, force: bool) -> Result<()> {
        self.store.remove(corpus_id, force)?;
        self.queue.remove(corpus_id)
    }

    /// Queue position among waiting jobs, 1-based; -1 when not waiting.
    pub fn priority(&self, corpus_id: &str) -> Result<i32> {
        let (_, waiting) = self.running_waiting()?;
        Ok(waiting
            .iter()
            .position(|job| job.corpus_id == corpus_id)
            .map(|position| position as i32 + 1)
            .unwrap_or(-1))
    }

    /// Queued jobs partitioned into running and waiting, in queue order.
    pub fn running_waiting(&self) -> Result<(Vec<JobRecord>, Vec<JobRecord>)> {
        let mut running = Vec::new();
        let mut waiting = Vec::new();
        for corpus_id in self.queue.snapshot() {
            if let Some(job) = self.store.get(&corpus_id)? {
                if job.status.is_running() {
                    running.push(job);
                } else if job.status.is_waiting() {
                    waiting.push(job);
                }
            }
        }
        Ok((running, waiting))
    }

    /// Dequeue jobs that are done, aborted or erroneous.
    pub fn unqueue_inactive(&self) -> Result<()> {
        for corpus_id in self.queue.snapshot() {
            let inactive = match self.store.get(&corpus_id)? {
                Some(job) => job.status.is_inactive(),
                None => true,
            };
            if inactive {
                info!(corpus_id = %corpus_id, "unqueueing inactive job");
                self.queue.remove(&corpus_id)?;
            }
        }
        Ok(())
    }

    fn set_status(&self, job: &mut JobRecord, status: Status) -> Result<()> {
        if job.status != status {
            debug!(
                corpus_id = %job.corpus_id,
                from = job.status.name(),
                to = status.name(),
                "status transition"
            );
            job.status = status;
            self.store.save(job)?;
        }
        Ok(())
    }

    fn set_pid(&self, job: &mut JobRecord, pid: Option<u32>) -> Result<()> {
        job.pid = pid;
        self.store.save(job)
    }

    fn reset_time(&self, job: &mut JobRecord) -> Result<()> {
        job.latest_seconds_taken = 0.0;
        job.started = None;
        job.done = None;
        job.process_done = None;
        self.store.save(job)
    }

    /// Move the job to `error` before surfacing the failure, so the
    /// persisted state reflects it even when the caller never looks.
    fn fail(&self, job: &mut JobRecord, err: Error) -> Error {
        if let Err(save_err) = self.set_status(job, Status::Error) {
            error!(
                corpus_id = %job.corpus_id,
                error = %save_err,
                "failed to persist error status"
            );
        }
        err
    }

    /// Queue an annotation run: verify the corpus is complete, then sync it
    /// to the annotation host. Leaves the job in `waiting`, ready for the
    /// reconciler to start it once a worker is free.
    pub async fn request_annotation(&self, job: &mut JobRecord) -> Result<()> {
        self.queue.add(job)?;
        self.check_requirements(job).await?;
        self.sync_to_server(job).await
    }

    /// Queue an install run. The corpus is already on the annotation host,
    /// so the job only has to wait for a worker.
    pub fn request_install(&self, job: &mut JobRecord) -> Result<()> {
        self.queue.add(job)?;
        self.set_status(job, Status::WaitingInstall)
    }

    /// Check that the corpus has a config file and at least one source file
    /// on the storage backend.
    pub async fn check_requirements(&self, job: &mut JobRecord) -> Result<()> {
        let corpus_dir = self.settings.storage_corpus_dir(&job.corpus_id);
        let contents = match self.storage.list_contents(&corpus_dir).await {
            Ok(contents) => contents,
            Err(e) => return Err(self.fail(job, e)),
        };
        if !contents
            .iter()
            .any(|entry| entry.name == self.settings.corpus_config)
        {
            return Err(self.fail(
                job,
                Error::MissingRequirement {
                    corpus_id: job.corpus_id.clone(),
                    reason: "no config file provided".to_string(),
                },
            ));
        }
        let source_prefix = format!("{}/", self.settings.source_dir);
        if !contents
            .iter()
            .any(|entry| !entry.is_dir() && entry.path.starts_with(&source_prefix))
        {
            return Err(self.fail(
                job,
                Error::MissingRequirement {
                    corpus_id: job.corpus_id.clone(),
                    reason: "no source files provided".to_string(),
                },
            ));
        }
        Ok(())
    }

    /// Sync corpus files from the storage backend to the annotation host.
    /// With a local storage backend there is nothing to move and the job
    /// goes straight to `waiting`.
    #[instrument(skip(self, job), fields(corpus_id = %job.corpus_id))]
    pub async fn sync_to_server(&self, job: &mut JobRecord) -> Result<()> {
        if self.storage.local() {
            self.set_status(job, Status::Waiting)?;
            return Ok(());
        }
        self.set_status(job, Status::SyncingCorpus)?;

        let remote_dir = self.settings.remote_corpus_dir(&job.corpus_id);
        let prepare = RemoteCommand::shell(
            r#"mkdir -p "$1" && cd "$1" && rm -f "$2" "$3""#,
            &[&remote_dir, &self.settings.log_file, &self.settings.run_script],
        );
        match self.executor.run(&prepare).await {
            Ok(out) if out.stderr.is_empty() => {}
            Ok(out) => {
                return Err(self.fail(
                    job,
                    Error::Job(format!(
                        "failed to create corpus dir on the annotation server: {}",
                        out.stderr.trim()
                    )),
                ))
            }
            Err(e) => return Err(self.fail(job, e.into())),
        }

        let local_dir = self.settings.local_corpus_dir(&job.corpus_id);
        if let Err(e) = fs::create_dir_all(&local_dir) {
            return Err(self.fail(job, e.into()));
        }
        let corpus_dir = self.settings.storage_corpus_dir(&job.corpus_id);
        if let Err(e) = self.storage.download_dir(&corpus_dir, &local_dir).await {
            return Err(self.fail(
                job,
                Error::Transfer(format!(
                    "failed to download corpus '{}' from storage: {}",
                    job.corpus_id, e
                )),
            ));
        }

        let config = self.settings.local_config_file(&job.corpus_id);
        match self.executor.push(&config, &remote_dir, false).await {
            Ok(out) if out.stderr.is_empty() => {}
            Ok(out) => {
                return Err(self.fail(
                    job,
                    Error::Transfer(format!(
                        "failed to copy corpus config to the annotation server: {}",
                        out.stderr.trim()
                    )),
                ))
            }
            Err(e) => return Err(self.fail(job, e.into())),
        }

        let sources = self.settings.local_source_dir(&job.corpus_id);
        match self.executor.push(&sources, &remote_dir, true).await {
            Ok(out) if out.stderr.is_empty() => {}
            Ok(out) => {
                return Err(self.fail(
                    job,
                    Error::Transfer(format!(
                        "failed to copy corpus files to the annotation server: {}",
                        out.stderr.trim()
                    )),
                ))
            }
            Err(e) => return Err(self.fail(job, e.into())),
        }

        self.set_status(job, Status::Waiting)?;
        Ok(())
    }

    /// Launch a tool invocation detached from the connection: a run script
    /// is written on the remote host which starts the command under
    /// `nohup time -p`, redirects all output to the log file and echoes the
    /// process id. Returns that pid.
    async fn launch_detached(
        &self,
        job: &mut JobRecord,
        tool_command: String,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let script = format!(
            "{} nohup time -p {} > {} 2>&1 &\necho $!",
            self.settings.environ, tool_command, self.settings.log_file
        );
        let remote_dir = self.settings.remote_corpus_dir(&job.corpus_id);
        let launch = RemoteCommand::shell(
            r#"cd "$1" && printf '%s\n' "$2" > "$3" && chmod +x "$3" && "./$3""#,
            &[&remote_dir, &script, &self.settings.run_script],
        );

        job.latest_seconds_taken = 0.0;
        job.started = Some(now);
        job.done = None;
        job.process_done = None;
        self.store.save(job)?;

        let out = match self.executor.run(&launch).await {
            Ok(out) => out,
            Err(e) => {
                let _ = self.reset_time(job);
                return Err(self.fail(job, e.into()));
            }
        };
        if !out.success() {
            let _ = self.reset_time(job);
            return Err(self.fail(
                job,
                Error::Job(format!(
                    "failed to launch remote process: {}",
                    out.stderr.trim()
                )),
            ));
        }
        match out.stdout.trim().parse::<u32>() {
            Ok(pid) => Ok(pid),
            Err(_) => {
                let _ = self.reset_time(job);
                Err(self.fail(
                    job,
                    Error::Job("annotation server did not report a process id".to_string()),
                ))
            }
        }
    }

    /// Start the annotation run for this corpus.
    #[instrument(skip(self, job, now), fields(corpus_id = %job.corpus_id))]
    pub async fn start_annotation(&self, job: &mut JobRecord, now: DateTime<Utc>) -> Result<()> {
        let mut command = format!("{} {}", self.settings.command, self.settings.run_args);
        for export in &job.exports {
            command.push(' ');
            command.push_str(&shell_quote(export));
        }
        if !job.files.is_empty() {
            command.push_str(" --file");
            for file in &job.files {
                command.push(' ');
                command.push_str(&shell_quote(file));
            }
        }
        let pid = self.launch_detached(job, command, now).await?;
        info!(corpus_id = %job.corpus_id, pid = pid, "annotation process started");
        self.set_pid(job, Some(pid))?;
        self.set_status(job, Status::Annotating)?;
        Ok(())
    }

    /// Start the install run publishing annotated output to the search
    /// index, scrambled or plain depending on the job.
    #[instrument(skip(self, job, now), fields(corpus_id = %job.corpus_id))]
    pub async fn start_install(&self, job: &mut JobRecord, now: DateTime<Utc>) -> Result<()> {
        let mut installs = self.settings.default_installs.clone();
        if job.install_scrambled {
            installs.push(self.settings.scrambled_install.clone());
        } else {
            installs.push(self.settings.plain_install.clone());
        }
        let command = format!(
            "{} {} {}",
            self.settings.command,
            self.settings.install_args,
            installs.join(" ")
        );
        let pid = self.launch_detached(job, command, now).await?;
        info!(corpus_id = %job.corpus_id, pid = pid, "install process started");
        self.set_pid(job, Some(pid))?;
        self.set_status(job, Status::Installing)?;
        Ok(())
    }

    /// Abort the job. Waiting jobs are simply dequeued; running jobs get a
    /// termination signal, where "no such process" from the remote host
    /// counts as success because the process is already gone.
    #[instrument(skip(self, job), fields(corpus_id = %job.corpus_id))]
    pub async fn abort(&self, job: &mut JobRecord) -> Result<()> {
        if job.status.is_waiting() {
            self.queue.remove(&job.corpus_id)?;
            self.set_status(job, Status::Aborted)?;
            return Ok(());
        }
        if !job.status.is_running() {
            return Err(Error::ProcessNotRunning);
        }
        let pid = match job.pid {
            Some(pid) => pid,
            None => return Err(Error::ProcessNotFound),
        };

        let kill = RemoteCommand::new("kill").arg("-TERM").arg(pid.to_string());
        let out = self.executor.run(&kill).await?;
        if out.success() || out.stderr.to_lowercase().contains("no such process") {
            self.set_pid(job, None)?;
            self.set_status(job, Status::Aborted)?;
            Ok(())
        } else {
            Err(Error::Job(format!(
                "failed to abort job: {}",
                out.stderr.trim()
            )))
        }
    }

    /// Reconciliation step for a job that should have a remote process.
    /// Returns true while the process is still alive. Once it is gone the
    /// log decides: 100% progress advances the lifecycle, anything else is
    /// an error, since a process that dies without reaching 100% failed by
    /// definition.
    #[instrument(skip(self, job), fields(corpus_id = %job.corpus_id))]
    pub async fn poll(&self, job: &mut JobRecord) -> Result<bool> {
        if let Some(pid) = job.pid {
            let probe = RemoteCommand::new("kill").arg("-0").arg(pid.to_string());
            let out = match self.executor.run(&probe).await {
                Ok(out) => out,
                Err(e) => return Err(self.fail(job, e.into())),
            };
            if out.success() {
                return Ok(true);
            }
            debug!(stderr = %out.stderr.trim(), "remote process is gone");
            self.set_pid(job, None)?;
        }

        let parsed = self.fetch_output(job).await?;
        if job.latest_progress.as_deref() == Some("100%") {
            match job.status {
                Status::Annotating => {
                    if self.storage.local() {
                        self.set_status(job, Status::DoneSyncing)?;
                    } else {
                        self.set_status(job, Status::DoneAnnotating)?;
                    }
                }
                Status::Installing => {
                    job.installed = true;
                    self.store.save(job)?;
                    self.set_status(job, Status::DoneInstalling)?;
                }
                _ => {}
            }
        } else {
            if !parsed.errors.is_empty() {
                debug!(errors = %parsed.errors_text(), "errors in process output");
            }
            if !parsed.misc.is_empty() {
                debug!(output = %parsed.misc_text(), "process output");
            }
            self.set_status(job, Status::Error)?;
        }
        Ok(false)
    }

    /// Read and parse the job's remote log file. Updates the job's latest
    /// progress and, when the log carries the `real` time summary, the
    /// process-done timestamp.
    pub async fn fetch_output(&self, job: &mut JobRecord) -> Result<ParsedOutput> {
        if !job.status.has_process_output() {
            return Ok(ParsedOutput::default());
        }
        let log_file = self.settings.remote_log_file(&job.corpus_id);
        let out = self
            .executor
            .run(&RemoteCommand::new("cat").arg(&log_file))
            .await?;
        let text = out.stdout.trim();
        if text.is_empty() {
            return Ok(ParsedOutput::default());
        }
        let parsed = output::parse(text);
        job.latest_progress = Some(parsed.progress.clone().unwrap_or_default());
        if let (Some(started), Some(seconds)) = (job.started, parsed.real_seconds) {
            job.process_done =
                Some(started + Duration::milliseconds((seconds * 1000.0).round() as i64));
        }
        Ok(parsed)
    }

    /// Elapsed-time estimate for the job, persisted when it changes.
    pub fn seconds_taken(&self, job: &mut JobRecord, now: DateTime<Utc>) -> Result<f64> {
        let before = job.clone();
        let seconds = job.measure_seconds(now);
        if *job != before {
            self.store.save(job)?;
        }
        Ok(seconds)
    }

    /// Pull export artifacts and plain-text source snapshots from the
    /// annotation host, then push both to the storage backend.
    #[instrument(skip(self, job), fields(corpus_id = %job.corpus_id))]
    pub async fn sync_results(&self, job: &mut JobRecord) -> Result<()> {
        self.set_status(job, Status::SyncingResults)?;

        let local_dir = self.settings.local_corpus_dir(&job.corpus_id);
        if let Err(e) = fs::create_dir_all(&local_dir) {
            return Err(self.fail(job, e.into()));
        }

        let remote_export = self.settings.remote_export_dir(&job.corpus_id);
        match self.executor.pull(&remote_export, &local_dir, &[]).await {
            Ok(out) if out.stderr.is_empty() => {}
            Ok(out) => {
                return Err(self.fail(
                    job,
                    Error::Transfer(format!(
                        "failed to retrieve exports from the annotation server: {}",
                        out.stderr.trim()
                    )),
                ))
            }
            Err(e) => return Err(self.fail(job, e.into())),
        }

        let remote_work = self.settings.remote_work_dir(&job.corpus_id);
        let filters = vec![
            format!("--include={}", self.settings.plain_text_file),
            "--include=*/".to_string(),
            "--exclude=*".to_string(),
            "--prune-empty-dirs".to_string(),
        ];
        match self.executor.pull(&remote_work, &local_dir, &filters).await {
            Ok(out) if out.stderr.is_empty() => {}
            Ok(out) => {
                return Err(self.fail(
                    job,
                    Error::Transfer(format!(
                        "failed to retrieve text snapshots from the annotation server: {}",
                        out.stderr.trim()
                    )),
                ))
            }
            Err(e) => return Err(self.fail(job, e.into())),
        }

        // Produced results are already sitting in the staging area, so a
        // failed upload is worth more noise than a failed pull.
        let export_dir = self.settings.storage_export_dir(&job.corpus_id);
        let local_export = self.settings.local_export_dir(&job.corpus_id);
        if let Err(e) = self.storage.upload_dir(&export_dir, &local_export).await {
            return Err(self.fail(
                job,
                Error::Transfer(format!("failed to upload exports to storage: {}", e)),
            ));
        }
        let work_dir = self.settings.storage_work_dir(&job.corpus_id);
        let local_work = self.settings.local_work_dir(&job.corpus_id);
        if let Err(e) = self.storage.upload_dir(&work_dir, &local_work).await {
            return Err(self.fail(
                job,
                Error::Transfer(format!(
                    "failed to upload text snapshots to storage: {}",
                    e
                )),
            ));
        }

        self.set_status(job, Status::DoneSyncing)?;
        Ok(())
    }

    /// Remove the corpus working directory from the annotation host,
    /// aborting a running process first. Directory removal problems are
    /// logged but do not fail the operation.
    #[instrument(skip(self, job), fields(corpus_id = %job.corpus_id))]
    pub async fn remove_from_remote(&self, job: &mut JobRecord) -> Result<()> {
        match self.abort(job).await {
            Ok(()) => {}
            Err(Error::ProcessNotRunning) => {}
            Err(e) => return Err(e),
        }
        let remote_dir = self.settings.remote_corpus_dir(&job.corpus_id);
        let out = self
            .executor
            .run(&RemoteCommand::shell(r#"rm -rf "$1""#, &[&remote_dir]))
            .await?;
        if !out.stderr.is_empty() {
            error!(
                corpus_id = %job.corpus_id,
                stderr = %out.stderr.trim(),
                "failed to remove corpus dir from the annotation server"
            );
        }
        Ok(())
    }

    /// Run the tool's cleanup for all annotation and export files. Returns
    /// the tool's joined stdout as an informational message.
    pub async fn clean(&self, job: &JobRecord) -> Result<String> {
        let remote_dir = self.settings.remote_corpus_dir(&job.corpus_id);
        let script = format!(
            r#"cd "$1" && rm -f "$2" "$3" && {} {} {} --all"#,
            self.settings.environ, self.settings.command, self.settings.clean_args
        );
        let command = RemoteCommand::shell(
            &script,
            &[&remote_dir, &self.settings.log_file, &self.settings.run_script],
        );
        self.run_clean(&command).await
    }

    /// Cleanup restricted to export files.
    pub async fn clean_exports(&self, job: &JobRecord) -> Result<String> {
        let remote_dir = self.settings.remote_corpus_dir(&job.corpus_id);
        let script = format!(
            r#"cd "$1" && {} {} {} --export"#,
            self.settings.environ, self.settings.command, self.settings.clean_args
        );
        let command = RemoteCommand::shell(&script, &[&remote_dir]);
        self.run_clean(&command).await
    }

    async fn run_clean(&self, command: &RemoteCommand) -> Result<String> {
        let out = self.executor.run(command).await?;
        if !out.stderr.is_empty() {
            return Err(Error::Job(out.stderr.trim().to_string()));
        }
        Ok(out
            .stdout
            .lines()
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(", "))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::tempdir;

    use crate::executor::CommandOutput;
    use crate::testing::{setup, test_settings, MockExecutor, MockStorage, RUNTIME};

    fn demo_storage() -> MockStorage {
        MockStorage::new(vec![
            MockStorage::entry("config.yaml", "config.yaml"),
            MockStorage::entry("a.txt", "source/a.txt"),
        ])
    }

    fn manager(
        dir: &std::path::Path,
        executor: MockExecutor,
        storage: MockStorage,
    ) -> (JobManager, Arc<MockExecutor>) {
        let executor = Arc::new(executor);
        let manager = JobManager::new(
            test_settings(dir),
            executor.clone(),
            Arc::new(storage),
        )
        .unwrap();
        (manager, executor)
    }

    // Full happy path: sync, launch with echoed pid, poll after death with
    // 100% progress in the log, results still remote.
    #[test]
    fn test_annotation_lifecycle() {
        setup();
        let dir = tempdir().unwrap();
        let executor = MockExecutor::new(|command| {
            Ok(match command.program.as_str() {
                "kill" => CommandOutput::failed(1, "kill: no such process"),
                "cat" => CommandOutput::ok("12:00:07 PROGRESS 100%\nreal 7.00\n"),
                "sh" if command.to_line().contains("nohup") => CommandOutput::ok("4242\n"),
                _ => CommandOutput::ok(""),
            })
        });
        let (manager, executor) = manager(dir.path(), executor, demo_storage());

        let mut job = manager.get_job("demo-1", JobOptions::default()).unwrap();
        manager.queue().add(&job).unwrap();
        RUNTIME.block_on(async {
            manager.check_requirements(&mut job).await.unwrap();
            manager.sync_to_server(&mut job).await.unwrap();
            assert_eq!(Status::Waiting, job.status);
            // Config and source files were both pushed to the remote host.
            assert_eq!(2, executor.pushes.lock().unwrap().len());

            let started = Utc::now();
            manager.start_annotation(&mut job, started).await.unwrap();
            assert_eq!(Status::Annotating, job.status);
            assert_eq!(Some(4242), job.pid);
            assert_eq!(Some(started), job.started);
            assert_eq!(0.0, job.latest_seconds_taken);

            let alive = manager.poll(&mut job).await.unwrap();
            assert!(!alive);
            assert_eq!(Status::DoneAnnotating, job.status);
            assert_eq!(None, job.pid);
            assert_eq!(Some(started + Duration::seconds(7)), job.process_done);
        });
        // Every transition went through the store.
        let persisted = manager.store().get("demo-1").unwrap().unwrap();
        assert_eq!(Status::DoneAnnotating, persisted.status);
        assert_eq!(None, persisted.pid);
        assert!(executor.call_count() >= 3);
    }

    // Missing source files: requirements check fails, record lands in
    // error with no pid.
    #[test]
    fn test_missing_sources_is_an_error() {
        setup();
        let dir = tempdir().unwrap();
        let storage = MockStorage::new(vec![MockStorage::entry("config.yaml", "config.yaml")]);
        let (manager, _executor) = manager(dir.path(), MockExecutor::silent(), storage);

        let mut job = manager.get_job("demo-2", JobOptions::default()).unwrap();
        let err = RUNTIME
            .block_on(manager.check_requirements(&mut job))
            .unwrap_err();
        assert!(matches!(err, Error::MissingRequirement { .. }));
        assert_eq!(Status::Error, job.status);

        let persisted = manager.store().get("demo-2").unwrap().unwrap();
        assert_eq!(Status::Error, persisted.status);
        assert_eq!(None, persisted.pid);
    }

    #[test]
    fn test_local_storage_skips_corpus_sync() {
        setup();
        let dir = tempdir().unwrap();
        let mut storage = demo_storage();
        storage.local = true;
        let (manager, executor) = manager(dir.path(), MockExecutor::silent(), storage);

        let mut job = manager.get_job("demo-1", JobOptions::default()).unwrap();
        RUNTIME
            .block_on(manager.sync_to_server(&mut job))
            .unwrap();
        assert_eq!(Status::Waiting, job.status);
        assert_eq!(0, executor.call_count());
    }

    // A live process leaves the job untouched.
    #[test]
    fn test_poll_alive_is_a_no_op() {
        setup();
        let dir = tempdir().unwrap();
        let executor = MockExecutor::new(|command| {
            Ok(match command.program.as_str() {
                "kill" => CommandOutput::ok(""),
                _ => CommandOutput::ok(""),
            })
        });
        let (manager, executor) = manager(dir.path(), executor, demo_storage());

        let mut job = manager.get_job("demo-1", JobOptions::default()).unwrap();
        job.status = Status::Annotating;
        job.pid = Some(4242);
        manager.store().save(&job).unwrap();

        let alive = RUNTIME.block_on(manager.poll(&mut job)).unwrap();
        assert!(alive);
        assert_eq!(Status::Annotating, job.status);
        assert_eq!(Some(4242), job.pid);
        assert_eq!(1, executor.call_count());
    }

    // Dead process without a completion marker means failure, even with
    // only warnings in the log.
    #[test]
    fn test_poll_dead_without_completion_is_an_error() {
        setup();
        let dir = tempdir().unwrap();
        let executor = MockExecutor::new(|command| {
            Ok(match command.program.as_str() {
                "kill" => CommandOutput::failed(1, "kill: no such process"),
                "cat" => CommandOutput::ok("12:00:01 WARNING  model is stale\n"),
                _ => CommandOutput::ok(""),
            })
        });
        let (manager, _executor) = manager(dir.path(), executor, demo_storage());

        let mut job = manager.get_job("demo-1", JobOptions::default()).unwrap();
        job.status = Status::Annotating;
        job.pid = Some(4242);
        manager.store().save(&job).unwrap();

        let alive = RUNTIME.block_on(manager.poll(&mut job)).unwrap();
        assert!(!alive);
        assert_eq!(Status::Error, job.status);
        assert_eq!(None, job.pid);
    }

    #[test]
    fn test_poll_install_completion_sets_installed() {
        setup();
        let dir = tempdir().unwrap();
        let executor = MockExecutor::new(|command| {
            Ok(match command.program.as_str() {
                "kill" => CommandOutput::failed(1, "kill: no such process"),
                "cat" => CommandOutput::ok("12:00:07 PROGRESS 100%\n"),
                _ => CommandOutput::ok(""),
            })
        });
        let (manager, _executor) = manager(dir.path(), executor, demo_storage());

        let mut job = manager.get_job("demo-1", JobOptions::default()).unwrap();
        job.status = Status::Installing;
        job.pid = Some(777);
        manager.store().save(&job).unwrap();

        RUNTIME.block_on(manager.poll(&mut job)).unwrap();
        assert_eq!(Status::DoneInstalling, job.status);
        assert!(job.installed);
    }

    // Aborting a waiting job needs no remote call at all.
    #[test]
    fn test_abort_waiting_dequeues_without_remote_call() {
        setup();
        let dir = tempdir().unwrap();
        let (manager, executor) = manager(dir.path(), MockExecutor::silent(), demo_storage());

        let mut job = manager.get_job("demo-1", JobOptions::default()).unwrap();
        job.status = Status::Waiting;
        manager.store().save(&job).unwrap();
        manager.queue().add(&job).unwrap();

        RUNTIME.block_on(manager.abort(&mut job)).unwrap();
        assert_eq!(Status::Aborted, job.status);
        assert!(!manager.queue().contains("demo-1"));
        assert_eq!(0, executor.call_count());
    }

    #[test]
    fn test_abort_not_running() {
        setup();
        let dir = tempdir().unwrap();
        let (manager, _executor) = manager(dir.path(), MockExecutor::silent(), demo_storage());

        let mut job = manager.get_job("demo-1", JobOptions::default()).unwrap();
        job.status = Status::DoneSyncing;
        let err = RUNTIME.block_on(manager.abort(&mut job)).unwrap_err();
        assert!(matches!(err, Error::ProcessNotRunning));

        job.status = Status::Annotating;
        job.pid = None;
        let err = RUNTIME.block_on(manager.abort(&mut job)).unwrap_err();
        assert!(matches!(err, Error::ProcessNotFound));
    }

    // "No such process" from the remote kill means the process is already
    // gone, which is what an abort wants anyway.
    #[test]
    fn test_abort_tolerates_already_dead_process() {
        setup();
        let dir = tempdir().unwrap();
        let executor = MockExecutor::new(|_| {
            Ok(CommandOutput::failed(1, "kill: (4242) - No such process"))
        });
        let (manager, _executor) = manager(dir.path(), executor, demo_storage());

        let mut job = manager.get_job("demo-1", JobOptions::default()).unwrap();
        job.status = Status::Annotating;
        job.pid = Some(4242);
        manager.store().save(&job).unwrap();

        RUNTIME.block_on(manager.abort(&mut job)).unwrap();
        assert_eq!(Status::Aborted, job.status);
        assert_eq!(None, job.pid);
    }

    #[test]
    fn test_seconds_taken_monotonic_and_persisted() {
        setup();
        let dir = tempdir().unwrap();
        let (manager, _executor) = manager(dir.path(), MockExecutor::silent(), demo_storage());

        let mut job = manager.get_job("demo-1", JobOptions::default()).unwrap();
        let started = Utc::now();
        job.status = Status::Annotating;
        job.started = Some(started);
        manager.store().save(&job).unwrap();

        let first = manager
            .seconds_taken(&mut job, started + Duration::seconds(30))
            .unwrap();
        assert!((first - 30.0).abs() < 0.01);
        // Clock rewind must not lower the estimate.
        let second = manager
            .seconds_taken(&mut job, started + Duration::seconds(12))
            .unwrap();
        assert!(second >= first);

        let persisted = manager.store().get("demo-1").unwrap().unwrap();
        assert!((persisted.latest_seconds_taken - second).abs() < 0.01);
    }

    #[test]
    fn test_sync_results_success_and_upload_failure() {
        setup();
        let dir = tempdir().unwrap();
        let (manager, executor) = manager(dir.path(), MockExecutor::silent(), demo_storage());

        let mut job = manager.get_job("demo-1", JobOptions::default()).unwrap();
        job.status = Status::DoneAnnotating;
        manager.store().save(&job).unwrap();

        RUNTIME.block_on(manager.sync_results(&mut job)).unwrap();
        assert_eq!(Status::DoneSyncing, job.status);
        assert_eq!(2, executor.pulls.lock().unwrap().len());
    }

    #[test]
    fn test_failed_launch_resets_time_and_sets_error() {
        setup();
        let dir = tempdir().unwrap();
        let executor =
            MockExecutor::new(|_| Ok(CommandOutput::failed(127, "sh: annotate: not found")));
        let (manager, _executor) = manager(dir.path(), executor, demo_storage());

        let mut job = manager.get_job("demo-1", JobOptions::default()).unwrap();
        job.status = Status::Waiting;
        manager.store().save(&job).unwrap();

        let err = RUNTIME
            .block_on(manager.start_annotation(&mut job, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, Error::Job(_)));
        assert_eq!(Status::Error, job.status);
        assert_eq!(None, job.started);
        assert_eq!(None, job.pid);
    }

    #[test]
    fn test_clean_joins_tool_output() {
        setup();
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_seen = calls.clone();
        let executor = MockExecutor::new(move |_| {
            calls_seen.fetch_add(1, Ordering::Relaxed);
            Ok(CommandOutput::ok("removed annotations\nremoved exports\n"))
        });
        let (manager, _executor) = manager(dir.path(), executor, demo_storage());

        let job = manager.get_job("demo-1", JobOptions::default()).unwrap();
        let message = RUNTIME.block_on(manager.clean(&job)).unwrap();
        assert_eq!("removed annotations, removed exports", message);
        assert_eq!(1, calls.load(Ordering::Relaxed));
    }

    #[test]
    fn test_clean_surfaces_stderr() {
        setup();
        let dir = tempdir().unwrap();
        let executor = MockExecutor::new(|_| {
            Ok(CommandOutput {
                exit_code: Some(0),
                stdout: String::new(),
                stderr: "cannot clean".to_string(),
            })
        });
        let (manager, _executor) = manager(dir.path(), executor, demo_storage());

        let job = manager.get_job("demo-1", JobOptions::default()).unwrap();
        let err = RUNTIME.block_on(manager.clean_exports(&job)).unwrap_err();
        assert!(matches!(err, Error::Job(_)));
    }

    #[test]
    fn test_active_jobs_requeued_on_restart() {
        setup();
        let dir = tempdir().unwrap();
        {
            let (manager, _executor) =
                manager(dir.path(), MockExecutor::silent(), demo_storage());
            let mut job = manager.get_job("demo-1", JobOptions::default()).unwrap();
            job.status = Status::Waiting;
            manager.store().save(&job).unwrap();
            // Not queued before the restart.
            assert!(!manager.queue().contains("demo-1"));
        }
        let (manager, _executor) = manager(dir.path(), MockExecutor::silent(), demo_storage());
        assert!(manager.queue().contains("demo-1"));
    }
}
