use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use assert_cmd::Command;
use foldsym::{
    config::{CountMode, FoldConfig, OutputOrder},
    folder::write_folded,
    pipeline::{FoldOutcome, JitMapInput, RunInputs},
    symbolication::line_table::{LineTableError, LineTableResolver},
    FoldError, Pipeline,
};
use foldsym_tests::{local_libfoo, pulled_libfoo, ElfFixture, Workspace, LIBFOO};
use predicates::prelude::predicate;
use tokio::sync::watch;

fn render(outcome: &FoldOutcome) -> String {
    let mut out = Vec::new();
    write_folded(&outcome.entries, &mut out).unwrap();
    String::from_utf8(out).unwrap()
}

async fn fold(config: FoldConfig, inputs: &RunInputs) -> Result<FoldOutcome, FoldError> {
    let (_stop_tx, stop_rx) = watch::channel(());
    Pipeline::new(config)?.fold(inputs, stop_rx).await
}

fn inputs(ws: &Workspace) -> RunInputs {
    RunInputs {
        capture: ws.path("capture.txt"),
        manifest: Some(ws.path("manifest.txt")),
        ..Default::default()
    }
}

#[test]
fn test_scenario_binary() {
    let mut cmd = Command::cargo_bin("foldsym-tests").unwrap();
    cmd.arg("override");
    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Processed: 2 samples, 1 overrides."))
        .stdout("foo::main();foo_compute 2\n");

    let mut cmd = Command::cargo_bin("foldsym-tests").unwrap();
    cmd.arg("stripped");
    cmd.assert()
        .success()
        .stdout("libfoo.so+0x2004;libfoo.so+0x1010 2\n");
}

#[tokio::test]
async fn test_stripped_then_override() {
    let ws = Workspace::new();
    pulled_libfoo(&ws);
    ws.write("capture.txt", "buildid:b1b1b1b1+0x1000\n");

    let outcome = fold(ws.config(), &inputs(&ws)).await.unwrap();
    assert_eq!(render(&outcome), "libfoo.so+0x1000 1\n");
    assert_eq!(outcome.summary.frames.unresolved, 1);

    // the cache from the first run is reused, the local copy replaces it
    local_libfoo(&ws);
    let outcome = fold(ws.with_symbol_dir(ws.config()), &inputs(&ws)).await.unwrap();
    assert_eq!(render(&outcome), "foo_compute 1\n");
    assert_eq!(outcome.summary.overrides, 1);
    assert_eq!(outcome.summary.frames.symbol_table, 1);
    assert_eq!(
        fs::read(ws.path("cache/b1b1b1b1/libfoo.so")).unwrap(),
        fs::read(ws.path(&format!("symbols/{LIBFOO}"))).unwrap()
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_symfs_links_follow_cache() {
    let ws = Workspace::new();
    pulled_libfoo(&ws);
    ws.write("capture.txt", "/system/lib64/libfoo.so+0x1000\n");
    fold(ws.config(), &inputs(&ws)).await.unwrap();

    let link = ws.path(&format!("symfs/{LIBFOO}"));
    let target = fs::read_link(&link).unwrap();
    assert_eq!(target, ws.path("cache/b1b1b1b1/libfoo.so"));
    assert!(target.is_absolute());
}

#[tokio::test]
async fn test_aggregation_example() {
    let ws = Workspace::new();
    ws.write(
        "capture.txt",
        "libt.so c\nlibt.so b\nlibt.so a\n\nlibt.so c\nlibt.so b\nlibt.so a\n\nlibt.so x\nlibt.so a\n",
    );
    let inputs = RunInputs {
        capture: ws.path("capture.txt"),
        ..Default::default()
    };
    let outcome = fold(ws.config(), &inputs).await.unwrap();
    assert_eq!(render(&outcome), "a;b;c 2\na;x 1\n");
    assert_eq!(outcome.summary.samples, 3);
}

#[tokio::test]
async fn test_deterministic_output() {
    let ws = Workspace::new();
    pulled_libfoo(&ws);
    local_libfoo(&ws);
    let mut capture = String::new();
    for i in 0..200u64 {
        capture.push_str(&format!(
            "# pid=1 weight={}\nbuildid:b1b1b1b1+0x{:x}\nlibother.so+0x{:x}\n\n",
            i % 7 + 1,
            0x1000 + (i % 5) * 0x40,
            i % 3
        ));
    }
    ws.write("capture.txt", capture);

    let mut config = ws.with_symbol_dir(ws.config());
    config.resolver.concurrency = 8;
    let first = render(&fold(config.clone(), &inputs(&ws)).await.unwrap());
    let second = render(&fold(config, &inputs(&ws)).await.unwrap());
    assert_eq!(first, second);
    assert!(first.starts_with("libother.so+0x0;foo_compute "));
}

#[tokio::test]
async fn test_jit_map_and_report_sample_capture() {
    let ws = Workspace::new();
    pulled_libfoo(&ws);
    ws.write(
        "capture.txt",
        "\
sample:
  event_count: 500
  thread_id: 4242
  vaddr_in_file: 7000
  file: [anon:dalvik-jit-code-cache]
  symbol: unknown
  callchain:
    vaddr_in_file: 1000
    file: /system/lib64/libfoo.so
    symbol: unknown
sample:
  event_count: 250
  thread_id: 4242
  vaddr_in_file: 7000
  file: [anon:dalvik-jit-code-cache]
  symbol: unknown
",
    );
    ws.write("jit/perf-4242.map", "7000 100 void com.example.FFT.transform(double[])\n");

    let mut inputs = inputs(&ws);
    inputs.jit_maps = vec![JitMapInput::parse(ws.path("jit").to_str().unwrap())];
    let outcome = fold(ws.config(), &inputs).await.unwrap();
    assert_eq!(
        render(&outcome),
        "libfoo.so+0x1000;void com.example.FFT.transform(double[]) 500\n\
         void com.example.FFT.transform(double[]) 250\n"
    );
    assert_eq!(outcome.summary.frames.jit_map, 2);
    assert_eq!(outcome.summary.jit_processes, 1);

    let mut config = ws.config();
    config.output.count = CountMode::Samples;
    config.output.order = OutputOrder::Count;
    let outcome = fold(config, &inputs).await.unwrap();
    assert_eq!(
        render(&outcome),
        "libfoo.so+0x1000;void com.example.FFT.transform(double[]) 1\n\
         void com.example.FFT.transform(double[]) 1\n"
    );
}

#[derive(Debug, Default)]
struct CountingTool {
    calls: AtomicUsize,
}

impl LineTableResolver for CountingTool {
    fn lookup(&self, object: &Path, addresses: &[u64]) -> Result<Vec<Option<String>>, LineTableError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(object.ends_with(LIBFOO));
        Ok(addresses
            .iter()
            .map(|a| (*a < 0x3000).then(|| format!("line_0x{a:x}")))
            .collect())
    }
}

#[tokio::test]
async fn test_line_table_batched_per_artifact() {
    let ws = Workspace::new();
    ws.write(
        &format!("pulled/{LIBFOO}"),
        ElfFixture::new().build_id(foldsym_tests::B1).debug_info().build(),
    );
    ws.write("manifest.txt", format!("0xb1b1b1b1={LIBFOO}\n"));
    ws.write(
        "capture.txt",
        "libfoo.so+0x1000\nlibfoo.so+0x2000\n\nlibfoo.so+0x1000\nlibfoo.so+0x3000\n",
    );

    let tool = Arc::new(CountingTool::default());
    let line_table: Arc<dyn LineTableResolver> = tool.clone();
    let (_stop_tx, stop_rx) = watch::channel(());
    let outcome = Pipeline::new(ws.config())
        .unwrap()
        .with_line_table(Some(line_table))
        .fold(&inputs(&ws), stop_rx)
        .await
        .unwrap();

    assert_eq!(
        render(&outcome),
        "line_0x2000;line_0x1000 1\nlibfoo.so+0x3000;line_0x1000 1\n"
    );
    assert_eq!(tool.calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.summary.prefetched, 2);
    assert_eq!(outcome.summary.frames.line_table, 3);
}

#[tokio::test]
async fn test_missing_binaries_degrade() {
    let ws = Workspace::new();
    // listed in the manifest but never pulled
    ws.write("manifest.txt", format!("0xb1b1b1b1={LIBFOO}\nnot a manifest line\n"));
    ws.write("capture.txt", "buildid:b1b1b1b1+0x1000\nlibgone.so+0x10\nlibfoo.so\n");

    let outcome = fold(ws.config(), &inputs(&ws)).await.unwrap();
    assert_eq!(render(&outcome), "libgone.so+0x10;libfoo.so+0x1000 1\n");
    let counts = outcome.diagnostics.counts();
    assert_eq!(counts.missing_artifact, 2);
    assert_eq!(counts.malformed_input, 2);
    assert_eq!(outcome.summary.lines.capture.skipped, 1);
    assert_eq!(outcome.summary.lines.manifest.skipped, 1);
}

#[tokio::test]
async fn test_unreadable_side_inputs_degrade() {
    let ws = Workspace::new();
    ws.write("capture.txt", "libfoo.so+0x10\n");
    ws.write("jit/notes.map", "10 10 void Foo.bar()\n");
    let inputs = RunInputs {
        capture: ws.path("capture.txt"),
        manifest: Some(ws.path("no-manifest.txt")),
        jit_maps: vec![
            JitMapInput::parse(ws.path("perf-7.map").to_str().unwrap()),
            JitMapInput::parse(ws.path("jit/notes.map").to_str().unwrap()),
        ],
        ..Default::default()
    };

    let outcome = fold(ws.config(), &inputs).await.unwrap();
    assert_eq!(render(&outcome), "libfoo.so+0x10 1\n");
    assert_eq!(outcome.summary.jit_processes, 0);
    assert_eq!(outcome.summary.frames.unresolved, 1);
    // the manifest, the missing perf-7.map, and a map of unknown process
    assert_eq!(outcome.diagnostics.counts().unreadable_input, 3);
}

#[tokio::test]
async fn test_no_samples_is_fatal() {
    let ws = Workspace::new();
    ws.write("capture.txt", "garbage\n\nmore garbage\n");
    let inputs = RunInputs {
        capture: ws.path("capture.txt"),
        ..Default::default()
    };
    let err = fold(ws.config(), &inputs).await.unwrap_err();
    assert!(matches!(err, FoldError::NoSamples { .. }));
}

#[tokio::test]
async fn test_cancelled_run_writes_nothing() {
    let ws = Workspace::new();
    pulled_libfoo(&ws);
    ws.write("capture.txt", "buildid:b1b1b1b1+0x1000\n");
    let mut inputs = inputs(&ws);
    inputs.output = Some(ws.path("folded.txt"));

    let (stop_tx, stop_rx) = watch::channel(());
    stop_tx.send(()).unwrap();
    let err = Pipeline::new(ws.config())
        .unwrap()
        .run(&inputs, stop_rx)
        .await
        .unwrap_err();
    assert!(matches!(err, FoldError::Cancelled));
    assert!(!ws.path("folded.txt").exists());
}

#[tokio::test]
async fn test_run_writes_output_file() {
    let ws = Workspace::new();
    pulled_libfoo(&ws);
    local_libfoo(&ws);
    ws.write("capture.txt", "buildid:b1b1b1b1+0x1000\n\nbuildid:b1b1b1b1+0x1000\n");
    let mut inputs = inputs(&ws);
    inputs.output = Some(ws.path("out/folded.txt"));

    let (_stop_tx, stop_rx) = watch::channel(());
    let summary = Pipeline::new(ws.with_symbol_dir(ws.config()))
        .unwrap()
        .run(&inputs, stop_rx)
        .await
        .unwrap();
    assert_eq!(summary.folded_entries, 1);
    assert_eq!(fs::read_to_string(ws.path("out/folded.txt")).unwrap(), "foo_compute 2\n");
    assert!(ws.root().join("symfs").is_dir());
}
