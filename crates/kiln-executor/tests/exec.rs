//! Executor behaviour against a scripted stand-in for the OCI runtime.
//!
//! The fake runtime checks the bundle the executor prepared, snapshots its
//! `config.json`, and then runs a per-test shell body instead of a container.
//! No mounts are made, so these tests run unprivileged.

use kiln_executor::{
    ConfigError, ExecError, ExecErrorKind, Executor, ProgressSink, SetupStage, StepEvent,
    StepOutcome,
};
use kiln_runtime::{RuntimeError, SpecCleanup, SpecProvider, SpecRequest, StepIo};
use kiln_schema::oci::Spec;
use kiln_schema::{
    BundleId, CancelCause, Context, ExecutionMeta, ExecutorConfig, LocalDir, Mount,
    MountDescriptor, Mountable,
};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A root filesystem reference that needs no mounting.
struct EmptyRoot {
    readonly: bool,
}

impl Mountable for EmptyRoot {
    fn mount(&self, _: &Context, _: bool) -> io::Result<Vec<MountDescriptor>> {
        Ok(Vec::new())
    }

    fn is_read_only(&self) -> bool {
        self.readonly
    }
}

/// A root reference whose descriptor the kernel rejects.
struct BrokenRoot;

impl Mountable for BrokenRoot {
    fn mount(&self, _: &Context, _: bool) -> io::Result<Vec<MountDescriptor>> {
        Ok(vec![MountDescriptor::new("kiln-no-such-fs", "none")])
    }

    fn is_read_only(&self) -> bool {
        false
    }
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    calls: PathBuf,
    specs: PathBuf,
    runtime: PathBuf,
}

impl Harness {
    /// `body` runs in place of the container, with `$bundle` and `$id` set.
    fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        let calls = dir.path().join("calls");
        let specs = dir.path().join("specs");
        std::fs::create_dir(&specs).unwrap();
        let runtime = dir.path().join("fake-runc");
        std::fs::write(
            &runtime,
            format!(
                r#"#!/bin/sh
echo "$*" >> '{calls}'
while [ $# -gt 0 ]; do
  case "$1" in
    --log|--log-format) shift 2 ;;
    *) break ;;
  esac
done
cmd="$1"
shift
case "$cmd" in
  --version) echo "fake-runc version 1.1.12" ;;
  delete) exit 0 ;;
  run)
    [ "$1" = "--bundle" ] || exit 98
    bundle="$2"
    id="$3"
    [ -f "$bundle/config.json" ] || exit 97
    [ -d "$bundle/rootfs" ] || exit 96
    cp "$bundle/config.json" '{specs}'/"$id.json"
    {body}
    ;;
  *) exit 99 ;;
esac
"#,
                calls = calls.display(),
                specs = specs.display(),
            ),
        )
        .unwrap();
        std::fs::set_permissions(&runtime, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self {
            _dir: dir,
            root,
            calls,
            specs,
            runtime,
        }
    }

    fn config(&self) -> ExecutorConfig {
        ExecutorConfig::new(&self.root).with_runtime(self.runtime.to_string_lossy())
    }

    fn executor(&self) -> Executor {
        Executor::new(&self.config()).unwrap()
    }

    fn calls(&self) -> String {
        std::fs::read_to_string(&self.calls).unwrap_or_default()
    }

    fn captured_specs(&self) -> Vec<Spec> {
        std::fs::read_dir(&self.specs)
            .unwrap()
            .map(|e| {
                let content = std::fs::read_to_string(e.unwrap().path()).unwrap();
                serde_json::from_str(&content).unwrap()
            })
            .collect()
    }

    fn only_spec(&self) -> Spec {
        let mut specs = self.captured_specs();
        assert_eq!(specs.len(), 1);
        specs.remove(0)
    }

    fn leftover_bundles(&self) -> Vec<PathBuf> {
        std::fs::read_dir(&self.root)
            .unwrap()
            .filter_map(|e| {
                let e = e.unwrap();
                BundleId::is_generated(&e.file_name().to_string_lossy()).then(|| e.path())
            })
            .collect()
    }
}

fn run(exec: &Executor, ctx: &Context, meta: &ExecutionMeta) -> Result<(), ExecError> {
    exec.exec(ctx, meta, &EmptyRoot { readonly: false }, &[], StepIo::null())
}

fn sh(script: &str) -> ExecutionMeta {
    ExecutionMeta::new(["/bin/sh", "-c", script])
}

#[test]
fn successful_step_leaves_nothing_behind() {
    let h = Harness::new("exit 0");
    let exec = h.executor();
    run(&exec, &Context::background(), &sh("true")).unwrap();

    assert!(h.leftover_bundles().is_empty());
    let calls = h.calls();
    let log = exec.root().join("runc-log.json");
    assert!(calls.contains(&format!("--log {} --log-format json run --bundle", log.display())));
}

#[test]
fn failing_step_reports_exit_code() {
    let h = Harness::new("exit 1");
    let exec = h.executor();
    let err = run(&exec, &Context::background(), &sh("false")).unwrap_err();
    assert!(matches!(err, ExecError::StepFailed { exit_code: 1 }));
    assert_eq!(err.to_string(), "exit code 1");
    assert!(h.leftover_bundles().is_empty());
}

#[test]
fn cancellation_returns_promptly_and_cleans_up() {
    let h = Harness::new("sleep 100");
    let exec = h.executor();
    let ctx = Context::background().with_timeout(Duration::from_millis(300));

    let started = Instant::now();
    let err = run(&exec, &ctx, &sh("sleep 100")).unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(10));

    match err {
        ExecError::Cancelled { cause, exit_code } => {
            assert_eq!(cause, CancelCause::DeadlineExceeded);
            assert_eq!(exit_code, Some(137));
        }
        other => panic!("expected cancellation, got {other}"),
    }
    assert!(h.leftover_bundles().is_empty());
    assert!(h.calls().contains("delete --force"));
}

#[test]
fn cancelled_context_runs_nothing() {
    let h = Harness::new("exit 0");
    let exec = h.executor();
    let ctx = Context::background();
    ctx.cancel();

    let err = run(&exec, &ctx, &sh("true")).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.exit_code(), None);
    assert!(!h.calls().contains(" run "));
    assert!(h.leftover_bundles().is_empty());
}

#[test]
fn concurrent_steps_use_distinct_bundles() {
    let h = Harness::new("exit 0");
    let exec = h.executor();
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let exec = &exec;
                s.spawn(move || run(exec, &Context::background(), &sh(&format!("echo {i}"))))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    });

    let specs = h.captured_specs();
    assert_eq!(specs.len(), 8);
    let roots: std::collections::HashSet<_> = specs
        .iter()
        .map(|s| s.root.as_ref().unwrap().path.clone())
        .collect();
    assert_eq!(roots.len(), 8);
    assert!(h.leftover_bundles().is_empty());
}

#[test]
fn mount_fault_is_isolated_to_its_step() {
    let h = Harness::new("exit 0");
    let exec = h.executor();
    std::thread::scope(|s| {
        let broken = s.spawn(|| {
            exec.exec(
                &Context::background(),
                &sh("true"),
                &BrokenRoot,
                &[],
                StepIo::null(),
            )
        });
        let healthy: Vec<_> = (0..4)
            .map(|_| s.spawn(|| run(&exec, &Context::background(), &sh("true"))))
            .collect();

        let err = broken.join().unwrap().unwrap_err();
        assert_eq!(err.stage(), Some(SetupStage::RootfsMount));
        for handle in healthy {
            handle.join().unwrap().unwrap();
        }
    });
    assert_eq!(h.captured_specs().len(), 4);
    assert!(h.leftover_bundles().is_empty());
}

#[test]
fn working_dir_must_stay_inside_rootfs() {
    let h = Harness::new("exit 0");
    let exec = h.executor();
    let err = run(
        &exec,
        &Context::background(),
        &sh("true").with_cwd("/../../etc"),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ExecErrorKind::Setup);
    assert_eq!(err.stage(), Some(SetupStage::WorkingDir));
    assert!(!h.calls().contains(" run "));
    assert!(h.leftover_bundles().is_empty());
}

#[test]
fn working_dir_is_created() {
    let h = Harness::new(r#"[ -d "$bundle/rootfs/work/src" ] || exit 95"#);
    let exec = h.executor();
    run(
        &exec,
        &Context::background(),
        &sh("true").with_cwd("/work/src"),
    )
    .unwrap();
    assert_eq!(h.only_spec().process.unwrap().cwd, "/work/src");
}

#[test]
fn read_only_root_is_reflected_in_spec() {
    let h = Harness::new("exit 0");
    let exec = h.executor();
    let cache = tempfile::tempdir().unwrap();
    let mounts = [Mount::new(
        "/cache",
        Arc::new(LocalDir::read_only(cache.path())),
    )];
    exec.exec(
        &Context::background(),
        &sh("true"),
        &EmptyRoot { readonly: true },
        &mounts,
        StepIo::null(),
    )
    .unwrap();

    let spec = h.only_spec();
    assert!(spec.root.as_ref().unwrap().readonly);
    let cache_mount = spec
        .mounts
        .iter()
        .find(|m| m.destination == "/cache")
        .unwrap();
    assert!(cache_mount.options.contains(&"ro".to_owned()));
}

#[test]
fn writable_root_is_not_upgraded() {
    let h = Harness::new("exit 0");
    let exec = h.executor();
    run(&exec, &Context::background(), &sh("true")).unwrap();
    let spec = h.only_spec();
    let root = spec.root.unwrap();
    assert!(!root.readonly);
    assert!(root.path.ends_with("/rootfs"));
}

#[test]
fn step_meta_reaches_the_spec() {
    let h = Harness::new("exit 0");
    let exec = h.executor();
    let meta = ExecutionMeta::new(["make", "-j4"])
        .with_env("CC", "clang")
        .with_user("0:0")
        .with_hostname("builder");
    run(&exec, &Context::background(), &meta).unwrap();

    let spec = h.only_spec();
    let process = spec.process.unwrap();
    assert_eq!(process.args, vec!["make", "-j4"]);
    assert!(process.env.contains(&"CC=clang".to_owned()));
    assert_eq!((process.user.uid, process.user.gid), (0, 0));
    assert_eq!(spec.hostname.as_deref(), Some("builder"));
    let hosts = spec
        .mounts
        .iter()
        .find(|m| m.destination == "/etc/hosts")
        .unwrap();
    assert_eq!(
        hosts.source.as_deref(),
        Some(exec.root().join("hosts.builder").to_str().unwrap())
    );
}

#[test]
fn unknown_user_is_an_identity_error() {
    let h = Harness::new("exit 0");
    let exec = h.executor();
    let err = run(
        &exec,
        &Context::background(),
        &sh("true").with_user("nobody"),
    )
    .unwrap_err();
    assert_eq!(err.stage(), Some(SetupStage::Identity));
    assert!(h.leftover_bundles().is_empty());
}

#[test]
fn streams_are_forwarded() {
    let h = Harness::new("cat; echo done >&2");
    let exec = h.executor();
    let out = Capture::default();
    let err = Capture::default();
    exec.exec(
        &Context::background(),
        &sh("cat"),
        &EmptyRoot { readonly: false },
        &[],
        StepIo::null()
            .with_stdin(io::Cursor::new(b"piped through".to_vec()))
            .with_stdout(out.clone())
            .with_stderr(err.clone()),
    )
    .unwrap();
    assert_eq!(out.text(), "piped through");
    assert_eq!(err.text(), "done\n");
}

#[test]
fn empty_args_are_rejected_before_anything_runs() {
    let h = Harness::new("exit 0");
    let exec = h.executor();
    let err = run(&exec, &Context::background(), &ExecutionMeta::default()).unwrap_err();
    assert_eq!(err.stage(), Some(SetupStage::Validation));
    assert!(!h.calls().contains(" run "));
}

#[derive(Default)]
struct Recorder(Mutex<Vec<StepEvent>>);

impl ProgressSink for Recorder {
    fn on_event(&self, event: &StepEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

#[test]
fn progress_events_bracket_each_step() {
    let h = Harness::new("exit 3");
    let recorder = Arc::new(Recorder::default());
    let exec = h.executor().with_progress(recorder.clone());
    let _ = run(&exec, &Context::background(), &sh("exit 3"));

    let events = recorder.0.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], StepEvent::Started { .. }));
    match &events[1] {
        StepEvent::Finished { outcome, .. } => assert_eq!(*outcome, StepOutcome::Failed(3)),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(events[0].bundle_id(), events[1].bundle_id());
}

/// Provider that fails after acquiring a resource, or counts releases.
struct CountingProvider {
    fail: bool,
    released: Arc<AtomicUsize>,
}

impl SpecProvider for CountingProvider {
    fn generate_spec(
        &self,
        _ctx: &Context,
        req: &SpecRequest<'_>,
    ) -> Result<(Spec, SpecCleanup), RuntimeError> {
        let mut cleanup = SpecCleanup::new();
        let released = Arc::clone(&self.released);
        cleanup.push(move || {
            released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        if self.fail {
            return Err(RuntimeError::ExecFailed("provider exploded".to_owned()));
        }
        let mut spec = Spec::default();
        spec.process = Some(kiln_schema::oci::Process {
            args: req.meta.args.clone(),
            cwd: "/".to_owned(),
            ..Default::default()
        });
        Ok((spec, cleanup))
    }
}

#[test]
fn spec_resources_are_released_once() {
    for fail in [false, true] {
        let h = Harness::new("exit 0");
        let released = Arc::new(AtomicUsize::new(0));
        let exec = h.executor().with_spec_provider(Arc::new(CountingProvider {
            fail,
            released: Arc::clone(&released),
        }));
        let result = run(&exec, &Context::background(), &sh("true"));
        if fail {
            assert_eq!(result.unwrap_err().stage(), Some(SetupStage::SpecGeneration));
        } else {
            result.unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(h.leftover_bundles().is_empty());
    }
}

#[test]
fn symlinked_root_is_rejected() {
    let h = Harness::new("exit 0");
    let target = h.root.with_file_name("real-root");
    std::fs::create_dir(&target).unwrap();
    let link = h.root.with_file_name("linked-root");
    std::os::unix::fs::symlink(&target, &link).unwrap();

    let config = ExecutorConfig::new(&link).with_runtime(h.runtime.to_string_lossy());
    let err = Executor::new(&config).unwrap_err();
    assert!(matches!(err, ConfigError::RootIsSymlink(_)));
    assert_eq!(std::fs::read_dir(&target).unwrap().count(), 0);
}

#[test]
fn missing_runtime_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExecutorConfig::new(dir.path().join("root")).with_runtime("/nonexistent/runc");
    let err = Executor::new(&config).unwrap_err();
    assert!(matches!(err, ConfigError::RuntimeNotFound(_)));
    assert!(!dir.path().join("root").exists());
}

fn plant_stale_bundle(root: &Path) -> PathBuf {
    let stale = root.join(BundleId::generate());
    std::fs::create_dir_all(stale.join("rootfs")).unwrap();
    stale
}

#[test]
fn stale_bundles_are_swept_when_root_is_free() {
    let h = Harness::new("exit 0");
    std::fs::create_dir_all(&h.root).unwrap();
    let stale = plant_stale_bundle(&h.root);

    let first = h.executor();
    assert!(!stale.exists());

    // A second executor must not sweep while the first is alive.
    let stale = plant_stale_bundle(&h.root);
    let second = h.executor();
    assert!(stale.exists());
    assert!(second.sweep().unwrap().is_none());

    drop(first);
    let report = second.sweep().unwrap().unwrap();
    assert_eq!(report.removed, vec![stale.clone()]);
    assert!(!stale.exists());
    assert!(h.calls().contains("delete --force"));
}

#[test]
fn sweep_spares_steps_that_start_while_it_runs() {
    let h = Harness::new(r#"sleep 1; [ -f "$bundle/config.json" ] || exit 42"#);
    let exec = h.executor();
    let planted: Vec<PathBuf> = (0..400).map(|_| plant_stale_bundle(&h.root)).collect();

    std::thread::scope(|s| {
        let sweeper = s.spawn(|| exec.sweep().unwrap().unwrap());
        std::thread::sleep(Duration::from_millis(50));
        run(&exec, &Context::background(), &sh("true")).unwrap();

        let report = sweeper.join().unwrap();
        assert!(report.skipped.is_empty());
        assert!(report.removed.iter().all(|p| planted.contains(p)));
    });
    assert!(h.leftover_bundles().is_empty());
}
