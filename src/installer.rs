//! Installation orchestration.
//!
//! [`Installer`] drives every formula in a plan through
//! `Resolving → Fetching → Verifying → Installing → Validating → Committed`,
//! or into a failure attributed to the phase it was in.
//!
//! Each formula in the plan becomes one shared future. A node starts fetching
//! immediately, concurrently with its dependencies, but only enters
//! `Installing` once every dependency has committed. Install steps and probes
//! are bounded by the `jobs` semaphore. A failed node fails its dependents
//! with [`InstallError::DependencyFailed`]; unrelated nodes carry on.
//!
//! Until a node records its receipt (the `Committed` transition) any failure
//! or cancellation rolls the new keg back and restores the previous one.

use crate::cellar::{self, Layout};
use crate::download::{FetchedSource, RetryPolicy, SourceFetcher, Transport};
use crate::error::{InstallError, InstallFailure, Phase, Result};
use crate::executor::{self, DependencyKeg, InstallExecutor, KegCommit};
use crate::formula::{FormulaLookup, FormulaRecord};
use crate::lock::KeyedLocks;
use crate::receipt::{self, InstallationReceipt, ReceiptStore};
use crate::resolve;
use crate::symlink;
use crate::validate::{self, ValidationPolicy, ValidationRunner};
use anyhow::anyhow;
use futures::future::{BoxFuture, FutureExt, Shared};
use indicatif::MultiProgress;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Tunables for an [`Installer`]
#[derive(Debug, Clone)]
pub struct Settings {
    /// Formulae allowed in `Installing`/`Validating` at once
    pub jobs: usize,
    pub retry: RetryPolicy,
    /// PATH entries after dependency bins, for steps and probes
    pub build_path: String,
    pub validation_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            jobs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            retry: RetryPolicy::default(),
            build_path: executor::DEFAULT_BUILD_PATH.to_string(),
            validation_timeout: validate::DEFAULT_TIMEOUT,
        }
    }
}

/// What the caller asked for
#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    pub formulae: Vec<String>,
    /// Options to enable on the requested formulae
    pub options: BTreeSet<String>,
    pub validation: ValidationPolicy,
}

impl InstallRequest {
    pub fn new(formula: impl Into<String>) -> Self {
        Self {
            formulae: vec![formula.into()],
            ..Default::default()
        }
    }

    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.insert(option.into());
        self
    }

    pub fn with_validation(mut self, policy: ValidationPolicy) -> Self {
        self.validation = policy;
        self
    }
}

/// Result for one formula of a plan
#[derive(Debug, Clone)]
pub enum Outcome {
    Installed(InstallationReceipt),
    /// Receipt already matched; nothing was fetched or run
    AlreadyInstalled(InstallationReceipt),
    Failed(Arc<InstallFailure>),
}

impl Outcome {
    pub fn receipt(&self) -> Option<&InstallationReceipt> {
        match self {
            Outcome::Installed(receipt) | Outcome::AlreadyInstalled(receipt) => Some(receipt),
            Outcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&InstallFailure> {
        match self {
            Outcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Outcomes of one install call, in plan order
#[derive(Debug, Clone)]
pub struct InstallReport {
    pub outcomes: Vec<(String, Outcome)>,
}

impl InstallReport {
    pub fn get(&self, formula: &str) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == formula)
            .map(|(_, outcome)| outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = &InstallFailure> {
        self.outcomes.iter().filter_map(|(_, outcome)| outcome.failure())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Exit code of the root cause: the first failure that is not a failed dependency.
    pub fn exit_code(&self) -> u8 {
        self.failures()
            .find(|f| !matches!(f.error, InstallError::DependencyFailed { .. }))
            .or_else(|| self.failures().next())
            .map(InstallFailure::exit_code)
            .unwrap_or(0)
    }
}

/// Installation state of one formula
#[derive(Debug, Clone)]
pub enum InstallStatus {
    NotInstalled,
    Installed(InstallationReceipt),
}

/// Observer for per-formula progress. Every method defaults to a no-op.
pub trait Reporter: Send + Sync {
    fn phase(&self, _formula: &str, _phase: Phase) {}

    fn already_installed(&self, _receipt: &InstallationReceipt) {}

    fn installed(&self, _receipt: &InstallationReceipt) {}

    fn failed(&self, _failure: &InstallFailure) {}
}

pub struct NoopReporter;

impl Reporter for NoopReporter {}

type NodeFuture<'a> = Shared<BoxFuture<'a, Outcome>>;

/// The installation engine
pub struct Installer {
    layout: Layout,
    lookup: Arc<dyn FormulaLookup>,
    store: Arc<dyn ReceiptStore>,
    fetcher: SourceFetcher,
    executor: InstallExecutor,
    validator: ValidationRunner,
    jobs: Semaphore,
    locks: KeyedLocks,
    reporter: Arc<dyn Reporter>,
}

impl Installer {
    pub fn new(
        layout: Layout,
        lookup: Arc<dyn FormulaLookup>,
        store: Arc<dyn ReceiptStore>,
        transport: Arc<dyn Transport>,
        settings: Settings,
    ) -> Self {
        let fetcher = SourceFetcher::new(&layout.cache, transport).with_retry(settings.retry);
        let executor = InstallExecutor::new(layout.clone(), settings.build_path.clone());
        let validator = ValidationRunner::new(settings.build_path, settings.validation_timeout);

        Self {
            layout,
            lookup,
            store,
            fetcher,
            executor,
            validator,
            jobs: Semaphore::new(settings.jobs.max(1)),
            locks: KeyedLocks::new(),
            reporter: Arc::new(NoopReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Show download progress bars
    pub fn with_progress(mut self, progress: MultiProgress) -> Self {
        self.fetcher = self.fetcher.with_progress(progress);
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Install plan for `formulae`, dependencies first.
    pub fn plan(&self, formulae: &[String]) -> Result<Vec<FormulaRecord>> {
        resolve::resolve_many(formulae, self.lookup.as_ref())
    }

    /// Install the requested formulae and everything they depend on.
    ///
    /// Resolution errors fail the whole call before anything is touched;
    /// after that, each formula's result is reported separately.
    pub async fn install(
        &self,
        request: &InstallRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<InstallReport, InstallFailure> {
        let first = request.formulae.first().cloned().unwrap_or_default();
        let resolving = |error: InstallError| InstallFailure::new(first.clone(), Phase::Resolving, error);

        for name in &request.formulae {
            self.reporter.phase(name, Phase::Resolving);
        }
        let plan = self.plan(&request.formulae).map_err(resolving)?;
        let roots: BTreeSet<&str> = request.formulae.iter().map(String::as_str).collect();

        for option in &request.options {
            let recognised = plan
                .iter()
                .filter(|f| roots.contains(f.name.as_str()))
                .any(|f| f.option(option).is_some());
            if !recognised {
                return Err(resolving(InstallError::InvalidFormula {
                    name: first.clone(),
                    reason: format!("unknown option {}", option),
                }));
            }
        }

        self.layout.ensure().map_err(|e| resolving(e.into()))?;

        tracing::debug!(
            plan = ?plan.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            "resolved install plan"
        );

        let mut nodes: HashMap<String, NodeFuture<'_>> = HashMap::new();
        for formula in &plan {
            let dependencies: Vec<(String, NodeFuture<'_>)> = formula
                .dependencies
                .iter()
                .filter_map(|dep| nodes.get(dep).map(|node| (dep.clone(), node.clone())))
                .collect();

            // Dependencies keep whatever options they were installed with
            let on_request = roots.contains(formula.name.as_str());
            let options: Option<BTreeSet<String>> = on_request.then(|| {
                request
                    .options
                    .iter()
                    .filter(|o| formula.option(o).is_some())
                    .cloned()
                    .collect()
            });

            let node = self
                .run_node(
                    formula.clone(),
                    dependencies,
                    options,
                    on_request,
                    request.validation,
                    cancel,
                )
                .boxed()
                .shared();
            nodes.insert(formula.name.clone(), node);
        }

        let outcomes = futures::future::join_all(
            plan.iter()
                .filter_map(|f| nodes.get(&f.name).cloned())
                .collect::<Vec<_>>(),
        )
        .await;

        Ok(InstallReport {
            outcomes: plan.into_iter().map(|f| f.name).zip(outcomes).collect(),
        })
    }

    async fn run_node(
        &self,
        formula: FormulaRecord,
        dependencies: Vec<(String, NodeFuture<'_>)>,
        options: Option<BTreeSet<String>>,
        on_request: bool,
        policy: ValidationPolicy,
        cancel: &CancellationToken,
    ) -> Outcome {
        match self
            .install_node(&formula, dependencies, options.as_ref(), on_request, policy, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(failure) => {
                match &failure.error {
                    InstallError::Cancelled | InstallError::DependencyFailed { .. } => {
                        tracing::debug!(formula = %failure.formula, error = %failure.error, "install aborted")
                    }
                    _ => tracing::error!(
                        formula = %failure.formula,
                        phase = %failure.phase,
                        error = %failure.error,
                        "install failed"
                    ),
                }
                self.reporter.failed(&failure);
                Outcome::Failed(Arc::new(failure))
            }
        }
    }

    async fn install_node(
        &self,
        formula: &FormulaRecord,
        dependencies: Vec<(String, NodeFuture<'_>)>,
        requested_options: Option<&BTreeSet<String>>,
        on_request: bool,
        policy: ValidationPolicy,
        cancel: &CancellationToken,
    ) -> std::result::Result<Outcome, InstallFailure> {
        let name = formula.name.as_str();
        let at = |phase: Phase| move |error: InstallError| InstallFailure::new(name, phase, error);

        if cancel.is_cancelled() {
            return Err(at(Phase::Resolving)(InstallError::Cancelled));
        }

        let _guard = self.locks.lock(name).await;
        let version = formula.version().map_err(at(Phase::Resolving))?;
        let previous = self
            .store
            .current_receipt(name)
            .await
            .map_err(at(Phase::Resolving))?;

        let options = match requested_options {
            Some(requested) => requested.clone(),
            None => previous
                .iter()
                .flat_map(|r| r.enabled_options.iter())
                .filter(|o| formula.option(o).is_some())
                .cloned()
                .collect(),
        };
        let options = &options;

        if let Some(previous) = &previous
            && is_current(previous, formula, &version, options)
        {
            let mut receipt = previous.clone();
            if on_request && !receipt.installed_on_request {
                receipt.installed_on_request = true;
                self.store
                    .record_installation(&receipt)
                    .await
                    .map_err(at(Phase::Committed))?;
            }
            tracing::debug!(formula = name, version = %version, "already installed");
            self.reporter.already_installed(&receipt);
            return Ok(Outcome::AlreadyInstalled(receipt));
        }

        // Fetch while dependencies finish
        self.reporter.phase(name, Phase::Fetching);
        let fetch = async {
            let acquired = self
                .fetcher
                .acquire(formula, cancel)
                .await
                .map_err(at(Phase::Fetching))?;
            self.reporter.phase(name, Phase::Verifying);
            acquired.verify().await.map_err(at(Phase::Verifying))
        };
        let ready = futures::future::join_all(dependencies.iter().map(|(_, node)| node.clone()));
        let (fetched, ready) = futures::join!(fetch, ready);

        let mut dep_kegs = Vec::with_capacity(ready.len());
        for ((dep, _), outcome) in dependencies.iter().zip(ready) {
            match outcome.receipt() {
                Some(receipt) => dep_kegs.push(DependencyKeg::new(dep, &receipt.install_prefix)),
                None => {
                    return Err(at(Phase::Installing)(InstallError::DependencyFailed {
                        dependency: dep.clone(),
                    }));
                }
            }
        }
        let fetched: FetchedSource = fetched?;

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(at(Phase::Installing)(InstallError::Cancelled)),
            permit = self.jobs.acquire() => permit
                .map_err(|e| at(Phase::Installing)(anyhow!("job limit closed: {}", e).into()))?,
        };

        self.reporter.phase(name, Phase::Installing);
        let commit = self
            .executor
            .install(formula, &fetched.path, &dep_kegs, options, cancel)
            .await
            .map_err(at(Phase::Installing))?;

        self.reporter.phase(name, Phase::Validating);
        let validation = self
            .validator
            .run(formula, commit.keg(), &dep_kegs, cancel)
            .await
            .map_err(at(Phase::Validating))?;

        if let Some(error) = validate::failure_error(&validation) {
            match policy {
                ValidationPolicy::RollBack => {
                    self.abandon(commit, &[], previous.as_ref());
                    return Err(at(Phase::Validating)(error));
                }
                ValidationPolicy::KeepAndWarn => {
                    tracing::warn!(formula = name, error = %error, "installed, but validation failed");
                }
            }
        }

        // Until the receipt is written the node is still in Validating
        let replaceable = previous
            .as_ref()
            .map(|r| r.linked_artifacts.clone())
            .unwrap_or_default();
        let linked = match symlink::link_keg(&self.layout, commit.keg(), &replaceable) {
            Ok(linked) => linked,
            Err(e) => {
                self.abandon(commit, &[], previous.as_ref());
                return Err(at(Phase::Validating)(e.into()));
            }
        };

        let mut receipt = InstallationReceipt::new(
            name,
            &version,
            commit.keg().to_path_buf(),
            fetched.digest.clone(),
            &formula.url,
            formula.dependencies.clone(),
            on_request || previous.as_ref().is_some_and(|r| r.installed_on_request),
            options.clone(),
        );
        receipt.linked_artifacts = linked.iter().cloned().collect();
        receipt.validation = validation;

        if cancel.is_cancelled() {
            self.abandon(commit, &linked, previous.as_ref());
            return Err(at(Phase::Validating)(InstallError::Cancelled));
        }
        if let Err(e) = self.store.record_installation(&receipt).await {
            self.abandon(commit, &linked, previous.as_ref());
            return Err(at(Phase::Validating)(e));
        }
        self.reporter.phase(name, Phase::Committed);

        let keg = commit.keg().to_path_buf();
        if let Err(e) = commit.finalize() {
            tracing::warn!(formula = name, error = %e, "failed to remove backup keg");
        }
        if let Some(previous) = &previous {
            self.retire(previous, &keg, &receipt.linked_artifacts);
        }

        tracing::debug!(formula = name, version = %version, keg = %keg.display(), "installed");
        self.reporter.installed(&receipt);
        Ok(Outcome::Installed(receipt))
    }

    /// Undo an uncommitted keg and put the previous installation's links back.
    fn abandon(&self, commit: KegCommit, linked: &[PathBuf], previous: Option<&InstallationReceipt>) {
        let keg = commit.keg().to_path_buf();
        if let Err(e) = symlink::unlink_artifacts(linked, &keg) {
            tracing::error!(keg = %keg.display(), error = %e, "failed to remove links");
        }
        if let Err(e) = commit.rollback() {
            tracing::error!(keg = %keg.display(), error = %e, "rollback failed");
        }

        if let Some(previous) = previous
            && previous.install_prefix.is_dir()
            && let Err(e) =
                symlink::link_keg(&self.layout, &previous.install_prefix, &previous.linked_artifacts)
        {
            tracing::error!(
                keg = %previous.install_prefix.display(),
                error = %e,
                "failed to restore links of previous keg"
            );
        }
    }

    /// Remove what a superseded receipt owned and the new one does not.
    fn retire(&self, previous: &InstallationReceipt, keg: &std::path::Path, linked: &BTreeSet<PathBuf>) {
        if previous.install_prefix == keg {
            return;
        }

        let stale: Vec<PathBuf> = previous
            .linked_artifacts
            .difference(linked)
            .cloned()
            .collect();
        if let Err(e) = symlink::unlink_artifacts(&stale, &previous.install_prefix) {
            tracing::warn!(formula = %previous.formula_name, error = %e, "failed to remove stale links");
        }
        if previous.install_prefix.exists()
            && let Err(e) = std::fs::remove_dir_all(&previous.install_prefix)
        {
            tracing::warn!(
                keg = %previous.install_prefix.display(),
                error = %e,
                "failed to remove superseded keg"
            );
        }
        tracing::debug!(
            formula = %previous.formula_name,
            version = %previous.installed_version,
            "removed superseded keg"
        );
    }

    /// Remove an installed formula, its links and its keg.
    ///
    /// Refused with [`InstallError::HasDependents`] while other installed
    /// formulae depend on it, unless `force` is set.
    pub async fn uninstall(&self, name: &str, force: bool) -> Result<InstallationReceipt> {
        let _guard = self.locks.lock(name).await;

        let receipt = self
            .store
            .current_receipt(name)
            .await?
            .ok_or_else(|| InstallError::NotInstalled(name.to_string()))?;

        let receipts = self.store.list_receipts().await?;
        let dependents = resolve::dependents_of(name, receipt::dependency_graph(&receipts));
        if !dependents.is_empty() {
            if !force {
                return Err(InstallError::HasDependents {
                    name: name.to_string(),
                    dependents,
                });
            }
            tracing::warn!(formula = name, dependents = ?dependents, "uninstalling despite dependents");
        }

        let links = self
            .store
            .remove_installation(name)
            .await?
            .unwrap_or_default();
        let removed = symlink::unlink_artifacts(&links, &receipt.install_prefix)?;
        tracing::debug!(formula = name, links = removed.len(), "removed links");

        if receipt.install_prefix.exists() {
            std::fs::remove_dir_all(&receipt.install_prefix)?;
        }
        if let Some(formula_dir) = receipt.install_prefix.parent() {
            cellar::remove_if_empty(formula_dir)?;
        }

        Ok(receipt)
    }

    pub async fn status(&self, name: &str) -> Result<InstallStatus> {
        Ok(match self.store.current_receipt(name).await? {
            Some(receipt) => InstallStatus::Installed(receipt),
            None => InstallStatus::NotInstalled,
        })
    }

    pub async fn list(&self) -> Result<Vec<InstallationReceipt>> {
        self.store.list_receipts().await
    }

    /// Fetch and verify the sources of the whole plan without installing.
    pub async fn fetch(
        &self,
        formulae: &[String],
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<(String, FetchedSource)>, InstallFailure> {
        let first = formulae.first().cloned().unwrap_or_default();
        let plan = self
            .plan(formulae)
            .map_err(|e| InstallFailure::new(first, Phase::Resolving, e))?;

        futures::future::try_join_all(plan.iter().map(|formula| async move {
            let at = |phase: Phase| {
                move |error: InstallError| InstallFailure::new(formula.name.as_str(), phase, error)
            };
            self.reporter.phase(&formula.name, Phase::Fetching);
            let acquired = self
                .fetcher
                .acquire(formula, cancel)
                .await
                .map_err(at(Phase::Fetching))?;
            self.reporter.phase(&formula.name, Phase::Verifying);
            let source = acquired.verify().await.map_err(at(Phase::Verifying))?;
            Ok::<_, InstallFailure>((formula.name.clone(), source))
        }))
        .await
    }
}

/// A receipt that already describes what `formula` would install
fn is_current(
    receipt: &InstallationReceipt,
    formula: &FormulaRecord,
    version: &str,
    options: &BTreeSet<String>,
) -> bool {
    let same_source = match &formula.sha256 {
        Some(digest) => *digest == receipt.fetched_digest,
        None => formula.url == receipt.source_url,
    };
    same_source
        && receipt.installed_version == version
        && receipt.enabled_options == *options
        && receipt.install_prefix.is_dir()
}
