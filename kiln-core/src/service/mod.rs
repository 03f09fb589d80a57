//! Build orchestration service.
//!
//! [`BuildService`] owns the engine, object store and secret provider
//! collaborators and drives each accepted job through the phase machine:
//! preparing, fetching secrets, downloading resources, fetching codebases,
//! running steps, building, saving, generating the manifest, and finally
//! success or failure. Every transition is announced through the injected
//! [`BuildNotifier`]; exactly one terminal status is emitted per job, on
//! every exit path including panics.

use crate::builder::{build_compose_project, build_single_image, run_build_steps, SingleBuild};
use crate::compose::{ComposeParser, ComposeProject};
use crate::config::Config;
use crate::detect;
use crate::engine::ContainerEngine;
use crate::error::{KilnError, Result};
use crate::fetch::fetch_codebase;
use crate::manifest;
use crate::notify::{BuildLogger, BuildNotifier, BuildPhase};
use crate::output::store_outputs;
use crate::resource;
use crate::secrets::SecretProvider;
use crate::spec::{
    self, BuildResult, BuildSpec, InjectMethod, OutputTarget, ServiceOutput,
};
use crate::store::ObjectStore;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// The build orchestration service. Shared across all concurrent jobs.
pub struct BuildService {
    config: Config,
    engine: Arc<dyn ContainerEngine>,
    store: Option<Arc<dyn ObjectStore>>,
    secrets: Arc<dyn SecretProvider>,
    http: reqwest::Client,
}

/// What a successful job hands back to the notifier.
struct JobOutcome {
    artifact_ref: Option<String>,
    warnings: Vec<String>,
}

impl BuildService {
    pub fn new(
        config: Config,
        engine: Arc<dyn ContainerEngine>,
        store: Option<Arc<dyn ObjectStore>>,
        secrets: Arc<dyn SecretProvider>,
    ) -> Result<Self> {
        let work_dir = PathBuf::from(&config.work_dir);
        std::fs::create_dir_all(&work_dir).map_err(|e| KilnError::io(&work_dir, e))?;
        Ok(Self { config, engine, store, secrets, http: reqwest::Client::new() })
    }

    /// The secret provider, shared with the channel layer for
    /// `secret_request` handling.
    pub fn secret_provider(&self) -> Arc<dyn SecretProvider> {
        self.secrets.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run one job to completion. The spec arrives as YAML text; parsing
    /// happens inside the job so every accepted request produces exactly one
    /// terminal status through the same path.
    ///
    /// Cancellation policy: when the token fires (client disconnect or
    /// shutdown) the job stops at its next suspension point and terminates
    /// with a `failure` status.
    #[instrument(skip(self, spec_yaml, notifier, cancel), fields(build_id = %build_id))]
    pub async fn run_job(
        self: Arc<Self>,
        build_id: String,
        spec_yaml: String,
        notifier: Arc<dyn BuildNotifier>,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        let logger = BuildLogger::new(&build_id, notifier.clone());

        let job = async {
            let job_timeout = self.config.job_timeout();
            tokio::select! {
                outcome = tokio::time::timeout(
                    job_timeout,
                    self.execute(&build_id, &spec_yaml, &logger, &cancel),
                ) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(KilnError::Timeout {
                        operation: "build job".to_string(),
                        seconds: job_timeout.as_secs(),
                    }),
                },
                _ = cancel.cancelled() => Err(KilnError::Cancelled),
            }
        };

        // A panicking job must still deliver its terminal status.
        let outcome = AssertUnwindSafe(job).catch_unwind().await;
        let duration = started.elapsed().as_secs_f64();

        match outcome {
            Ok(Ok(outcome)) => {
                info!(build_id = %build_id, duration, "Build succeeded");
                let message = if outcome.warnings.is_empty() {
                    "Build completed successfully".to_string()
                } else {
                    format!(
                        "Build completed successfully (warnings: {})",
                        outcome.warnings.join("; ")
                    )
                };
                notifier.notify_status(
                    &build_id,
                    BuildPhase::Success,
                    Some(&message),
                    outcome.artifact_ref.as_deref(),
                    Some(duration),
                );
            }
            Ok(Err(e)) => {
                error!(build_id = %build_id, error = %e, "Build failed");
                let message = format!("{} [{}]", e, e.kind());
                notifier.notify_status(
                    &build_id,
                    BuildPhase::Failure,
                    Some(&message),
                    None,
                    Some(duration),
                );
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<String>()
                    .map(String::as_str)
                    .or_else(|| panic.downcast_ref::<&str>().copied())
                    .unwrap_or("unknown panic");
                error!(build_id = %build_id, panic = %detail, "Build task panicked");
                let message = format!("Internal error: build task panicked: {} [internal]", detail);
                notifier.notify_status(
                    &build_id,
                    BuildPhase::Failure,
                    Some(&message),
                    None,
                    Some(duration),
                );
            }
        }
    }

    async fn execute(
        &self,
        build_id: &str,
        spec_yaml: &str,
        logger: &BuildLogger,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        let status = |phase: BuildPhase| logger.status(phase);

        let spec = spec::load_from_bytes(spec_yaml.as_bytes(), "yaml")?;
        info!(build_id = %build_id, name = %spec.name, version = %spec.version, "Build spec parsed");

        // --- Preparing: per-job workspace ---
        status(BuildPhase::Preparing);
        let build_dir = PathBuf::from(&self.config.work_dir).join(build_id);
        std::fs::create_dir_all(&build_dir).map_err(|e| KilnError::io(&build_dir, e))?;
        logger.system(&format!("Using build directory: {}", build_dir.display()));

        // The directory is removed on completion unless a local output
        // without an explicit path needs it to host the exported tars, or
        // the build failed (kept for post-mortem).
        let retain_dir = spec.build_config.output_target == OutputTarget::Local
            && spec.build_config.local_path.is_none();
        let result = self
            .execute_in_dir(&spec, &build_dir, logger, cancel, status)
            .await;

        match &result {
            Ok(_) if !retain_dir => {
                if let Err(e) = std::fs::remove_dir_all(&build_dir) {
                    warn!(dir = %build_dir.display(), error = %e, "Failed to clean build directory");
                }
            }
            Ok(_) => {
                logger.system(&format!(
                    "Keeping build directory for local output: {}",
                    build_dir.display()
                ));
            }
            Err(_) => {
                logger.system(&format!(
                    "Keeping build directory after failure: {}",
                    build_dir.display()
                ));
            }
        }
        result
    }

    async fn execute_in_dir(
        &self,
        spec: &BuildSpec,
        build_dir: &Path,
        logger: &BuildLogger,
        cancel: &CancellationToken,
        status: impl Fn(BuildPhase),
    ) -> Result<JobOutcome> {
        let engine = self.engine.as_ref();
        let mut result = BuildResult::default();

        // --- Environment variables ---
        let mut merged_env = self.load_env_files(spec, build_dir, logger);
        merged_env.extend(spec.env.clone());
        logger.system(&format!("Loaded {} environment variables", merged_env.len()));

        // --- Secrets ---
        check_cancelled(cancel)?;
        status(BuildPhase::FetchingSecrets);
        let runtime_secrets = self.fetch_secrets(spec, build_dir, logger).await?;
        let mut runtime_env = merged_env;
        // Secrets shadow regular env on name collision.
        runtime_env.extend(runtime_secrets);

        // --- Resources ---
        check_cancelled(cancel)?;
        status(BuildPhase::DownloadingResources);
        if !spec.resources.is_empty() {
            logger.system("Downloading resources...");
        }
        for res in &spec.resources {
            check_cancelled(cancel)?;
            resource::acquire(&self.http, res, build_dir, self.config.http_timeout(), logger)
                .await?;
        }

        // --- Codebases ---
        check_cancelled(cancel)?;
        status(BuildPhase::FetchingCodebases);
        if !spec.codebases.is_empty() {
            logger.system("Fetching codebases...");
        }
        for codebase in &spec.codebases {
            check_cancelled(cancel)?;
            let dest = build_dir.join(
                codebase.target_in_host.as_deref().unwrap_or(codebase.name.as_str()),
            );
            logger.system(&format!(
                "Fetching codebase '{}' ({:?}) into {}",
                codebase.name,
                codebase.source_kind,
                dest.display()
            ));
            fetch_codebase(codebase, &dest, logger).await?;
        }

        // --- Build steps ---
        check_cancelled(cancel)?;
        status(BuildPhase::RunningSteps);
        if !spec.build_steps.is_empty() {
            logger.system("Executing build steps...");
            run_build_steps(engine, build_dir, spec, logger).await?;
        }

        // --- Main build ---
        check_cancelled(cancel)?;
        status(BuildPhase::Building);
        let compose_project = if let Some(compose_file) = &spec.build_config.compose_file {
            Some(self.build_compose(spec, compose_file, build_dir, &mut result, logger).await?)
        } else {
            self.build_single(spec, build_dir, &mut result, logger).await?;
            None
        };

        // --- Outputs ---
        check_cancelled(cancel)?;
        status(BuildPhase::Saving);
        let output_base = match &spec.build_config.local_path {
            Some(path) if spec.build_config.output_target == OutputTarget::Local => {
                let base = PathBuf::from(path);
                std::fs::create_dir_all(&base).map_err(|e| KilnError::io(&base, e))?;
                base
            }
            _ => build_dir.to_path_buf(),
        };
        let output = store_outputs(
            engine,
            self.store.as_deref(),
            spec,
            &mut result,
            &output_base,
            logger,
        )
        .await?;

        // --- Runtime manifest ---
        check_cancelled(cancel)?;
        if spec.run_config.generate {
            status(BuildPhase::GeneratingManifest);
            logger.system("Generating runtime manifest...");
            let run_manifest = manifest::synthesize(
                spec,
                &result,
                &runtime_env,
                &output.tag_table,
                compose_project.as_ref(),
            );
            if run_manifest.services.is_empty() {
                logger.system("Skipping manifest: no services were generated");
            } else {
                let path = output_base.join(format!("{}-{}.run.yml", spec.name, spec.version));
                manifest::write_manifest(&run_manifest, &path)?;
                logger.system(&format!("Runtime manifest written to {}", path.display()));
                result.manifest_path = Some(path);
            }
        }

        result.success = true;
        result.logs = logger.transcript();

        Ok(JobOutcome { artifact_ref: output.artifact_ref, warnings: output.warnings })
    }

    /// Env files load in list order; the first occurrence of a key wins
    /// among files, and spec-level env overrides them all afterwards.
    /// Unreadable files are warnings, not failures.
    fn load_env_files(
        &self,
        spec: &BuildSpec,
        build_dir: &Path,
        logger: &BuildLogger,
    ) -> HashMap<String, String> {
        let mut merged = HashMap::new();
        for env_file in &spec.env_files {
            let mut path = build_dir.join(env_file);
            if !path.exists() {
                path = PathBuf::from(env_file);
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => {
                    for (key, value) in spec::parse_env_file(&content) {
                        merged.entry(key).or_insert(value);
                    }
                }
                Err(e) => {
                    logger.system(&format!("Warning: cannot read env file '{}': {}", env_file, e));
                }
            }
        }
        merged
    }

    /// Fetch every secret. Env-injected secrets are returned for the runtime
    /// environment; file-injected secrets are written into the build root.
    /// Values are never logged.
    async fn fetch_secrets(
        &self,
        spec: &BuildSpec,
        build_dir: &Path,
        logger: &BuildLogger,
    ) -> Result<HashMap<String, String>> {
        let mut fetched = HashMap::new();
        if spec.secrets.is_empty() {
            return Ok(fetched);
        }
        logger.system("Fetching secrets...");

        for secret in &spec.secrets {
            let value = tokio::time::timeout(
                self.config.secret_timeout(),
                self.secrets.get_secret(&secret.source),
            )
            .await
            .map_err(|_| KilnError::Timeout {
                operation: format!("secret fetch '{}'", secret.source),
                seconds: self.config.secret_timeout_secs,
            })??;

            match secret.inject_method {
                InjectMethod::Env => {
                    fetched.insert(secret.name.clone(), value);
                }
                InjectMethod::File => {
                    let target = crate::archive::sanitize_entry_path(
                        build_dir,
                        Path::new(&secret.name),
                    )?;
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| KilnError::io(parent, e))?;
                    }
                    std::fs::write(&target, &value).map_err(|e| KilnError::io(&target, e))?;
                    restrict_mode(&target);
                }
            }
            logger.system(&format!("Secret '{}' fetched successfully", secret.name));
        }
        Ok(fetched)
    }

    async fn build_compose(
        &self,
        spec: &BuildSpec,
        compose_file: &str,
        build_dir: &Path,
        result: &mut BuildResult,
        logger: &BuildLogger,
    ) -> Result<ComposeProject> {
        logger.system(&format!("Building using compose file: {}", compose_file));
        let compose_path =
            crate::archive::sanitize_entry_path(build_dir, Path::new(compose_file))?;
        let project = ComposeParser::parse_file(&compose_path)?;

        let errors = build_compose_project(
            self.engine.as_ref(),
            build_dir,
            compose_file,
            &project,
            spec,
            result,
            logger,
        )
        .await?;
        if !errors.is_empty() {
            return Err(KilnError::BuildFailed { reason: errors.join("; ") });
        }
        logger.system("Compose project built successfully");
        Ok(project)
    }

    async fn build_single(
        &self,
        spec: &BuildSpec,
        build_dir: &Path,
        result: &mut BuildResult,
        logger: &BuildLogger,
    ) -> Result<()> {
        let (context_dir, dockerfile) = self.find_dockerfile(spec, build_dir, logger)?;

        // Resolve tags up front so the id-by-tag fallback can work even
        // when the spec declares none.
        let tags = if spec.build_config.tags.is_empty() {
            vec![format!("{}:{}", spec.name, spec.version)]
        } else {
            spec.build_config.tags.clone()
        };
        let single = SingleBuild::from_config(&spec.build_config, dockerfile, tags);
        let image_id =
            build_single_image(self.engine.as_ref(), &context_dir, &single, logger).await?;

        let image_size = self
            .engine
            .image_inspect(&image_id)
            .await
            .map(|i| i.size)
            .unwrap_or_default();

        result.image_ids.insert(spec.name.clone(), image_id.clone());
        result.image_sizes.insert(spec.name.clone(), image_size);
        result.service_outputs.insert(
            spec.name.clone(),
            ServiceOutput { image_id, image_size, logs: logger.transcript() },
        );
        Ok(())
    }

    /// Locate (or synthesize) the Dockerfile for a single-image build.
    ///
    /// Resolution order: inline content, configured path, build-root
    /// autodetect, first-codebase autodetect, and finally an
    /// ecosystem-detected builtin template written into the context.
    fn find_dockerfile(
        &self,
        spec: &BuildSpec,
        build_dir: &Path,
        logger: &BuildLogger,
    ) -> Result<(PathBuf, String)> {
        if let Some(dockerfile) = &spec.build_config.dockerfile {
            if dockerfile.contains('\n') {
                let path = build_dir.join("Dockerfile.inline");
                std::fs::write(&path, dockerfile).map_err(|e| KilnError::io(&path, e))?;
                logger.system("Using inline Dockerfile");
                return Ok((build_dir.to_path_buf(), "Dockerfile.inline".to_string()));
            }
            let full = crate::archive::sanitize_entry_path(build_dir, Path::new(dockerfile))?;
            if !full.exists() {
                return Err(KilnError::InvalidSpec {
                    reason: format!("configured dockerfile '{}' does not exist", dockerfile),
                });
            }
            let context = full.parent().unwrap_or(build_dir).to_path_buf();
            let name = full
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "Dockerfile".to_string());
            logger.system(&format!("Using Dockerfile at path: {}", dockerfile));
            return Ok((context, name));
        }

        if build_dir.join("Dockerfile").exists() {
            logger.system("Auto-detected Dockerfile at build root");
            return Ok((build_dir.to_path_buf(), "Dockerfile".to_string()));
        }

        let first_codebase_dir = spec.codebases.first().map(|codebase| {
            build_dir.join(
                codebase.target_in_host.as_deref().unwrap_or(codebase.name.as_str()),
            )
        });
        if let Some(dir) = &first_codebase_dir {
            if dir.join("Dockerfile").exists() {
                logger.system(&format!(
                    "Auto-detected Dockerfile in first codebase: {}",
                    spec.codebases[0].name
                ));
                return Ok((dir.clone(), "Dockerfile".to_string()));
            }
        }

        // No Dockerfile anywhere: detect the ecosystem and synthesize one.
        let context = first_codebase_dir.unwrap_or_else(|| build_dir.to_path_buf());
        let ecosystem = detect::detect_ecosystem(&context)?;
        let template = detect::template_for(&ecosystem)?;
        let path = context.join("Dockerfile");
        std::fs::write(&path, template).map_err(|e| KilnError::io(&path, e))?;
        logger.system(&format!(
            "No Dockerfile found; generated one from the {} template (marker: {})",
            ecosystem.language, ecosystem.marker
        ));
        Ok((context, "Dockerfile".to_string()))
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(KilnError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_mode(_path: &Path) {}
