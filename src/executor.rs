//! Install step execution in a scoped working directory.
//!
//! Every install gets a fresh staging directory under `<cellar>/.staging`:
//!
//! ```text
//! <cellar>/.staging/<name>-XXXXXX/
//!   src/      extracted source, steps run here
//!   prefix/   $PREFIX, becomes the keg on commit
//!   home/     $HOME
//!   tmp/      $TMPDIR
//! ```
//!
//! Steps run with a cleared environment seeded only with the variables below,
//! so host configuration never leaks into a build:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `PATH` | dependency `bin` dirs, then the build path |
//! | `HOME`, `TMPDIR` | scratch dirs inside staging |
//! | `PREFIX` | staged prefix |
//! | `KEGS_FORMULA`, `KEGS_VERSION` | the formula being installed |
//! | `DEP_<NAME>` | keg of each dependency (`python@3.11` → `DEP_PYTHON_3_11`) |
//!
//! plus the `env` of every option the request enabled.
//!
//! Nothing outside staging is touched until all steps succeed. The commit is
//! a pair of renames: the existing keg (if any) moves aside to a backup, then
//! the staged prefix moves into place. The returned [`KegCommit`] decides the
//! backup's fate.

use crate::cellar::{self, Layout};
use crate::error::{InstallError, Result};
use crate::extract;
use crate::formula::{FormulaRecord, InstallStep};
use crate::relocate;
use anyhow::{Context, anyhow};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// PATH entries available to every step after dependency bins
pub const DEFAULT_BUILD_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";

/// Captured step output kept in errors, from the end
pub const OUTPUT_LIMIT: usize = 16 * 1024;

/// An installed dependency as seen by a dependent's build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyKeg {
    pub name: String,
    pub path: PathBuf,
}

impl DependencyKeg {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// `DEP_<NAME>` with non-alphanumerics replaced by `_`
    pub fn env_name(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("DEP_{}", name)
    }

    pub fn bin(&self) -> PathBuf {
        self.path.join("bin")
    }
}

struct StagingDirs {
    src: PathBuf,
    prefix: PathBuf,
    home: PathBuf,
    tmp: PathBuf,
}

impl StagingDirs {
    fn create(root: &Path) -> Result<Self> {
        let dirs = Self {
            src: root.join("src"),
            prefix: root.join("prefix"),
            home: root.join("home"),
            tmp: root.join("tmp"),
        };
        for dir in [&dirs.src, &dirs.prefix, &dirs.home, &dirs.tmp] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(dirs)
    }
}

/// Runs install steps and commits the result into the Cellar
pub struct InstallExecutor {
    layout: Layout,
    build_path: String,
}

impl InstallExecutor {
    pub fn new(layout: Layout, build_path: impl Into<String>) -> Self {
        Self {
            layout,
            build_path: build_path.into(),
        }
    }

    /// Extract `archive`, run every install step, then commit the staged prefix
    /// as `<cellar>/<name>/<version>`.
    ///
    /// The first failing step aborts the install with
    /// [`InstallError::InstallStepFailed`]; staging is discarded and any
    /// existing keg is left as it was.
    pub async fn install(
        &self,
        formula: &FormulaRecord,
        archive: &Path,
        dependencies: &[DependencyKeg],
        enabled_options: &BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> Result<KegCommit> {
        let version = formula.version()?;
        let keg = self.layout.keg_path(&formula.name, &version);

        let staging_root = self.layout.staging();
        fs::create_dir_all(&staging_root)
            .with_context(|| format!("Failed to create {}", staging_root.display()))?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-", formula.name))
            .tempdir_in(&staging_root)?;
        let dirs = StagingDirs::create(staging.path())?;

        let workdir = {
            let archive = archive.to_path_buf();
            let src = dirs.src.clone();
            tokio::task::spawn_blocking(move || extract::extract_source(&archive, &src))
                .await
                .map_err(|e| anyhow!("extraction task failed: {}", e))??
        };

        let env = self.environment(formula, &version, &dirs, dependencies, enabled_options);

        for (index, step) in formula.install.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(InstallError::Cancelled);
            }
            tracing::debug!(formula = %formula.name, index, step = %step, "running install step");
            run_step(index, step, &workdir, &env, cancel).await?;
        }

        let relocated = {
            let prefix = dirs.prefix.clone();
            let keg = keg.clone();
            tokio::task::spawn_blocking(move || relocate::relocate_text_files(&prefix, &prefix, &keg))
                .await
                .map_err(|e| anyhow!("relocation task failed: {}", e))??
        };
        if !relocated.is_empty() {
            tracing::debug!(formula = %formula.name, files = relocated.len(), "relocated staged prefix");
        }

        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        let commit = commit(&dirs.prefix, &keg)?;
        tracing::debug!(
            formula = %formula.name,
            keg = %keg.display(),
            replaced = commit.previous.is_some(),
            "committed keg"
        );
        Ok(commit)
    }

    fn environment(
        &self,
        formula: &FormulaRecord,
        version: &str,
        dirs: &StagingDirs,
        dependencies: &[DependencyKeg],
        enabled_options: &BTreeSet<String>,
    ) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();

        for option in formula
            .options
            .iter()
            .filter(|option| enabled_options.contains(&option.name))
        {
            env.extend(option.env.clone());
        }

        // Reserved variables win over option env
        env.insert("PATH".into(), search_path(dependencies, None, &self.build_path));
        env.insert("HOME".into(), dirs.home.display().to_string());
        env.insert("TMPDIR".into(), dirs.tmp.display().to_string());
        env.insert("PREFIX".into(), dirs.prefix.display().to_string());
        env.insert("KEGS_FORMULA".into(), formula.name.clone());
        env.insert("KEGS_VERSION".into(), version.to_string());
        for dep in dependencies {
            env.insert(dep.env_name(), dep.path.display().to_string());
        }

        env
    }
}

/// `first`, then each dependency's `bin`, then `build_path`, colon-joined.
pub fn search_path(dependencies: &[DependencyKeg], first: Option<&Path>, build_path: &str) -> String {
    first
        .map(Path::to_path_buf)
        .into_iter()
        .chain(dependencies.iter().map(DependencyKeg::bin))
        .map(|p| p.display().to_string())
        .chain((!build_path.is_empty()).then(|| build_path.to_string()))
        .collect::<Vec<_>>()
        .join(":")
}

async fn run_step(
    index: usize,
    step: &InstallStep,
    workdir: &Path,
    env: &BTreeMap<String, String>,
    cancel: &CancellationToken,
) -> Result<()> {
    let failed = |status: String, output: String| InstallError::InstallStepFailed {
        index,
        step: step.to_string(),
        status,
        output,
    };

    let mut command = match step {
        InstallStep::Shell(script) => {
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg(script);
            command
        }
        InstallStep::Exec(argv) => {
            let Some((program, args)) = argv.split_first() else {
                return Err(failed("not run".to_string(), "empty argv".to_string()));
            };
            let mut command = Command::new(program);
            command.args(args);
            command
        }
    };

    let child = command
        .env_clear()
        .envs(env)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| failed("spawn error".to_string(), e.to_string()))?;

    // Dropping the wait future kills the child
    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(InstallError::Cancelled),
        output = child.wait_with_output() => output?,
    };

    if !output.status.success() {
        return Err(failed(
            output.status.to_string(),
            combined_output(&output.stdout, &output.stderr),
        ));
    }
    Ok(())
}

/// stdout followed by stderr, tail-truncated to [`OUTPUT_LIMIT`]
pub fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stdout).into_owned();
    if !text.is_empty() && !text.ends_with('\n') && !stderr.is_empty() {
        text.push('\n');
    }
    text.push_str(&String::from_utf8_lossy(stderr));
    truncate_tail(&text, OUTPUT_LIMIT)
}

/// Keep the last `limit` bytes of `text`, cut at a char boundary.
pub fn truncate_tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... output truncated ...]\n{}", &text[start..])
}

fn backup_path(keg: &Path) -> PathBuf {
    let version = keg
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    keg.with_file_name(format!(".{}.previous", version))
}

fn commit(staged: &Path, keg: &Path) -> Result<KegCommit> {
    if let Some(parent) = keg.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let previous = if keg.symlink_metadata().is_ok() {
        let backup = backup_path(keg);
        if backup.exists() {
            fs::remove_dir_all(&backup)
                .with_context(|| format!("Failed to clear stale backup {}", backup.display()))?;
        }
        fs::rename(keg, &backup)
            .with_context(|| format!("Failed to move aside {}", keg.display()))?;
        Some(backup)
    } else {
        None
    };

    if let Err(e) = fs::rename(staged, keg) {
        if let Some(backup) = &previous
            && let Err(restore) = fs::rename(backup, keg)
        {
            tracing::error!(keg = %keg.display(), error = %restore, "failed to restore previous keg");
        }
        return Err(anyhow::Error::new(e)
            .context(format!("Failed to commit keg {}", keg.display()))
            .into());
    }

    Ok(KegCommit {
        keg: keg.to_path_buf(),
        previous,
        settled: false,
    })
}

/// A keg moved into place whose predecessor is still kept as a backup.
///
/// Call [`finalize`](Self::finalize) once the install is recorded, or
/// [`rollback`](Self::rollback) to undo it. Dropping an unsettled commit rolls
/// it back.
#[must_use = "an unsettled commit is rolled back on drop"]
#[derive(Debug)]
pub struct KegCommit {
    keg: PathBuf,
    previous: Option<PathBuf>,
    settled: bool,
}

impl KegCommit {
    pub fn keg(&self) -> &Path {
        &self.keg
    }

    /// Whether a keg of the same version existed before this commit
    pub fn replaced_existing(&self) -> bool {
        self.previous.is_some()
    }

    /// Keep the new keg and discard the backup.
    pub fn finalize(mut self) -> Result<()> {
        self.settled = true;
        if let Some(backup) = self.previous.take() {
            fs::remove_dir_all(&backup)
                .with_context(|| format!("Failed to remove backup {}", backup.display()))?;
        }
        Ok(())
    }

    /// Remove the new keg and put the previous one back.
    pub fn rollback(mut self) -> Result<()> {
        self.settled = true;
        self.restore()
    }

    fn restore(&mut self) -> Result<()> {
        if self.keg.exists() {
            fs::remove_dir_all(&self.keg)
                .with_context(|| format!("Failed to remove {}", self.keg.display()))?;
        }
        match self.previous.take() {
            Some(backup) => {
                fs::rename(&backup, &self.keg)
                    .with_context(|| format!("Failed to restore {}", self.keg.display()))?;
            }
            None => {
                if let Some(parent) = self.keg.parent() {
                    cellar::remove_if_empty(parent)?;
                }
            }
        }
        tracing::debug!(keg = %self.keg.display(), "rolled back keg");
        Ok(())
    }
}

impl Drop for KegCommit {
    fn drop(&mut self) {
        if !self.settled
            && let Err(e) = self.restore()
        {
            tracing::error!(keg = %self.keg.display(), error = %e, "rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::FormulaOption;
    use std::time::{Duration, Instant};

    fn archive(dir: &Path) -> PathBuf {
        let path = dir.join("libx-1.0.0.tar.gz");
        let file = fs::File::create(&path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let body = b"hello from libx\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "libx-1.0.0/greeting.txt", &body[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    fn formula(steps: &[&str]) -> FormulaRecord {
        FormulaRecord {
            name: "libx".into(),
            desc: None,
            homepage: None,
            license: None,
            url: "file:///src/libx-1.0.0.tar.gz".into(),
            sha256: None,
            version: None,
            dependencies: vec![],
            options: vec![],
            install: steps.iter().map(|s| InstallStep::Shell(s.to_string())).collect(),
            test: None,
        }
    }

    fn setup() -> (tempfile::TempDir, Layout, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path().join("prefix"), dir.path().join("cache"));
        let archive = archive(dir.path());
        (dir, layout, archive)
    }

    fn staging_is_empty(layout: &Layout) -> bool {
        fs::read_dir(layout.staging())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[test]
    fn test_dep_env_name() {
        assert_eq!(DependencyKeg::new("python@3.11", "/k").env_name(), "DEP_PYTHON_3_11");
        assert_eq!(DependencyKeg::new("lib-x.y", "/k").env_name(), "DEP_LIB_X_Y");
    }

    #[test]
    fn test_truncate_tail_keeps_end() {
        let text = format!("{}END", "a".repeat(OUTPUT_LIMIT * 2));
        let truncated = truncate_tail(&text, OUTPUT_LIMIT);
        assert!(truncated.ends_with("END"));
        assert!(truncated.len() <= OUTPUT_LIMIT + 64);

        // Never splits a multi-byte char
        let text = "é".repeat(10);
        assert!(truncate_tail(&text, 5).ends_with("éé"));
    }

    #[tokio::test]
    async fn test_steps_run_in_source_dir_and_commit() {
        let (_dir, layout, archive) = setup();
        let executor = InstallExecutor::new(layout.clone(), DEFAULT_BUILD_PATH);
        let formula = formula(&[
            "mkdir -p \"$PREFIX/bin\"",
            "cp greeting.txt \"$PREFIX/greeting.txt\"",
            "printf '#!/bin/sh\\necho %s\\n' \"$PREFIX\" > \"$PREFIX/bin/libx\"",
        ]);

        let commit = executor
            .install(&formula, &archive, &[], &BTreeSet::new(), &CancellationToken::new())
            .await
            .unwrap();
        let keg = layout.keg_path("libx", "1.0.0");
        assert_eq!(commit.keg(), keg);
        assert!(!commit.replaced_existing());
        commit.finalize().unwrap();

        assert_eq!(
            fs::read_to_string(keg.join("greeting.txt")).unwrap(),
            "hello from libx\n"
        );
        // Staged prefix rewritten to the keg path
        let script = fs::read_to_string(keg.join("bin/libx")).unwrap();
        assert!(script.contains(&keg.display().to_string()));
        assert!(staging_is_empty(&layout));
    }

    #[tokio::test]
    async fn test_environment_is_cleared_and_seeded() {
        let (_dir, layout, archive) = setup();
        let executor = InstallExecutor::new(layout.clone(), DEFAULT_BUILD_PATH);
        let mut formula = formula(&["env > \"$PREFIX/env.txt\""]);
        formula.options = vec![
            FormulaOption {
                name: "fast".into(),
                description: None,
                env: BTreeMap::from([("LIBX_FAST".to_string(), "1".to_string())]),
            },
            FormulaOption {
                name: "debug".into(),
                description: None,
                env: BTreeMap::from([("LIBX_DEBUG".to_string(), "1".to_string())]),
            },
        ];
        let deps = [DependencyKeg::new("python@3.11", "/opt/k/Cellar/python@3.11/3.11.9")];
        let enabled = BTreeSet::from(["fast".to_string()]);

        executor
            .install(&formula, &archive, &deps, &enabled, &CancellationToken::new())
            .await
            .unwrap()
            .finalize()
            .unwrap();

        let env = fs::read_to_string(layout.keg_path("libx", "1.0.0").join("env.txt")).unwrap();
        let vars: BTreeMap<&str, &str> = env.lines().filter_map(|l| l.split_once('=')).collect();

        assert_eq!(vars["KEGS_FORMULA"], "libx");
        assert_eq!(vars["KEGS_VERSION"], "1.0.0");
        assert_eq!(vars["DEP_PYTHON_3_11"], "/opt/k/Cellar/python@3.11/3.11.9");
        assert_eq!(
            vars["PATH"],
            format!("/opt/k/Cellar/python@3.11/3.11.9/bin:{}", DEFAULT_BUILD_PATH)
        );
        assert_eq!(vars["LIBX_FAST"], "1");
        assert!(!vars.contains_key("LIBX_DEBUG"));
        // Cargo exports this to the test process; the step must not see it
        assert!(!vars.contains_key("CARGO_MANIFEST_DIR"));

        let allowed = [
            "PATH", "HOME", "TMPDIR", "PREFIX", "KEGS_FORMULA", "KEGS_VERSION",
            "DEP_PYTHON_3_11", "LIBX_FAST", "PWD", "OLDPWD", "SHLVL", "_",
        ];
        for key in vars.keys() {
            assert!(allowed.contains(key), "unexpected variable {}", key);
        }
    }

    #[tokio::test]
    async fn test_first_failing_step_halts_and_discards() {
        let (dir, layout, archive) = setup();
        let executor = InstallExecutor::new(layout.clone(), DEFAULT_BUILD_PATH);

        // An earlier install of the same version
        let keg = layout.keg_path("libx", "1.0.0");
        fs::create_dir_all(&keg).unwrap();
        fs::write(keg.join("old.txt"), "old").unwrap();

        let marker = dir.path().join("third-ran");
        let formula = formula(&[
            "touch \"$PREFIX/partial\"",
            "echo building; echo 'fatal: no compiler' >&2; exit 3",
            &format!("touch {}", marker.display()),
        ]);

        let err = executor
            .install(&formula, &archive, &[], &BTreeSet::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            InstallError::InstallStepFailed {
                index,
                status,
                output,
                ..
            } => {
                assert_eq!(index, 1);
                assert!(status.contains('3'));
                assert!(output.contains("building"));
                assert!(output.contains("fatal: no compiler"));
            }
            other => panic!("expected step failure, got {:?}", other),
        }

        assert!(!marker.exists());
        assert_eq!(fs::read_to_string(keg.join("old.txt")).unwrap(), "old");
        assert!(!keg.join("partial").exists());
        assert!(staging_is_empty(&layout));
    }

    #[tokio::test]
    async fn test_long_output_is_truncated() {
        let (_dir, layout, archive) = setup();
        let executor = InstallExecutor::new(layout, DEFAULT_BUILD_PATH);
        let formula = formula(&["i=0; while [ $i -lt 4000 ]; do echo line-$i-xxxxxxxx; i=$((i+1)); done; exit 1"]);

        match executor
            .install(&formula, &archive, &[], &BTreeSet::new(), &CancellationToken::new())
            .await
        {
            Err(InstallError::InstallStepFailed { output, .. }) => {
                assert!(output.len() <= OUTPUT_LIMIT + 64);
                assert!(output.contains("line-3999-"));
                assert!(!output.contains("line-0-"));
            }
            other => panic!("expected step failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_kills_running_step() {
        let (_dir, layout, archive) = setup();
        let executor = InstallExecutor::new(layout.clone(), DEFAULT_BUILD_PATH);
        let formula = formula(&["sleep 30"]);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = executor
            .install(&formula, &archive, &[], &BTreeSet::new(), &cancel)
            .await;
        assert!(matches!(result, Err(InstallError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(staging_is_empty(&layout));
        assert!(!layout.keg_path("libx", "1.0.0").exists());
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_keg() {
        let (_dir, layout, archive) = setup();
        let executor = InstallExecutor::new(layout.clone(), DEFAULT_BUILD_PATH);
        let keg = layout.keg_path("libx", "1.0.0");
        fs::create_dir_all(&keg).unwrap();
        fs::write(keg.join("marker"), "old").unwrap();

        let formula = formula(&["echo new > \"$PREFIX/marker\""]);
        let commit = executor
            .install(&formula, &archive, &[], &BTreeSet::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(commit.replaced_existing());
        assert_eq!(fs::read_to_string(keg.join("marker")).unwrap(), "new\n");

        commit.rollback().unwrap();
        assert_eq!(fs::read_to_string(keg.join("marker")).unwrap(), "old");
        assert!(!backup_path(&keg).exists());
    }

    #[tokio::test]
    async fn test_unsettled_commit_rolls_back_on_drop() {
        let (_dir, layout, archive) = setup();
        let executor = InstallExecutor::new(layout.clone(), DEFAULT_BUILD_PATH);
        let formula = formula(&["true"]);

        let commit = executor
            .install(&formula, &archive, &[], &BTreeSet::new(), &CancellationToken::new())
            .await
            .unwrap();
        drop(commit);

        assert!(!layout.keg_path("libx", "1.0.0").exists());
        assert!(!layout.cellar().join("libx").exists());
    }

    #[tokio::test]
    async fn test_finalize_discards_backup() {
        let (_dir, layout, archive) = setup();
        let executor = InstallExecutor::new(layout.clone(), DEFAULT_BUILD_PATH);
        let keg = layout.keg_path("libx", "1.0.0");
        fs::create_dir_all(&keg).unwrap();

        executor
            .install(&formula(&["true"]), &archive, &[], &BTreeSet::new(), &CancellationToken::new())
            .await
            .unwrap()
            .finalize()
            .unwrap();

        assert!(keg.is_dir());
        assert!(!backup_path(&keg).exists());
        assert_eq!(layout.installed_versions("libx").unwrap(), vec!["1.0.0"]);
    }
}
