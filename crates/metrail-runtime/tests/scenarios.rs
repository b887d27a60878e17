//! End-to-end scenarios: compile a program, run its VM over log lines,
//! and observe the metric store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use metrail_metrics::{DatumValue, Metric, Store};
use metrail_runtime::{instantiate_metrics, LogLine, Vm};

fn build(src: &str) -> (Vec<Arc<Metric>>, Vm) {
    let prog = Arc::new(metrail_compiler::compile("test", src).expect("compile"));
    let metrics = instantiate_metrics(&prog, "test.mtl");
    let vm = Vm::new(prog, metrics.clone(), None);
    (metrics, vm)
}

fn feed(vm: &mut Vm, ts: DateTime<Utc>, lines: &[&str]) {
    for text in lines {
        vm.process_line(&LogLine::new(ts, "app.log", *text));
    }
}

fn int_value(m: &Metric, labels: &[&str]) -> i64 {
    let labels: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
    m.get_datum(&labels).expect("datum present").get_int()
}

#[test]
fn scenario_counter_increment() {
    let (metrics, mut vm) = build("counter lines_total\n/.*/ {\n  lines_total++\n}\n");
    feed(&mut vm, Utc::now(), &["a", "b", "c"]);
    assert_eq!(int_value(&metrics[0], &[]), 3);
    assert_eq!(vm.errors(), 0);
}

#[test]
fn scenario_capref_typing() {
    let (metrics, mut vm) = build(
        "gauge bytes_sent by host\n/host=(?P<h>\\S+) bytes=(?P<n>\\d+)/ {\n  bytes_sent[$h] = $n\n}\n",
    );
    feed(
        &mut vm,
        Utc::now(),
        &["host=x bytes=42", "host=y bytes=7", "host=x bytes=100"],
    );
    assert_eq!(int_value(&metrics[0], &["x"]), 100);
    assert_eq!(int_value(&metrics[0], &["y"]), 7);
}

#[test]
fn scenario_otherwise() {
    let (metrics, mut vm) = build(
        "counter matched\ncounter fallback\n/foo/ {\n  matched++\n}\notherwise {\n  fallback++\n}\n",
    );
    feed(&mut vm, Utc::now(), &["foo", "bar", "foobaz"]);
    assert_eq!(int_value(&metrics[0], &[]), 2);
    assert_eq!(int_value(&metrics[1], &[]), 1);
}

#[test]
fn scenario_histogram_buckets() {
    let (metrics, mut vm) = build(
        "histogram latency_ms buckets 1, 10, 100\n/t=(\\d+)/ {\n  latency_ms = $1\n}\n",
    );
    feed(&mut vm, Utc::now(), &["t=5", "t=50", "t=500", "t=0"]);
    let datum = metrics[0].get_datum(&[]).expect("histogram datum");
    let DatumValue::Buckets(b) = datum.value() else {
        panic!("expected buckets");
    };
    // Upper-inclusive ranges (−∞,1], (1,10], (10,100] and the +Inf
    // overflow bucket; four observations in total.
    assert_eq!(b.counts, vec![1, 1, 1, 1]);
    assert_eq!(b.count, 4);
}

#[test]
fn scenario_type_error_fails_compile() {
    let result = metrail_compiler::compile("test", "counter c\n/(\\d+) (\\w+)/ {\n  c = $1 + $2\n}\n");
    assert!(result.is_err());
}

#[test]
fn scenario_delete_with_expiry() {
    let store = Store::new();
    let (metrics, mut vm) = build(
        "gauge session by id\n/login id=(\\S+)/ {\n  session[$1] = 1\n}\n/logout id=(\\S+)/ {\n  del session[$1] after 5m\n}\n",
    );
    store.add(Arc::clone(&metrics[0])).unwrap();

    // Events happened ten minutes ago.
    let then = Utc::now() - chrono::Duration::minutes(10);
    feed(&mut vm, then, &["login id=abc", "logout id=abc"]);
    assert!(metrics[0].get_datum(&["abc".to_string()]).is_some());

    // The expiry has passed; a sweep removes the label.
    assert_eq!(store.gc(), 1);
    assert!(metrics[0].get_datum(&["abc".to_string()]).is_none());
}

#[test]
fn scenario_delete_without_expiry_is_immediate() {
    let (metrics, mut vm) = build(
        "gauge session by id\n/login id=(\\S+)/ {\n  session[$1] = 1\n}\n/logout id=(\\S+)/ {\n  del session[$1]\n}\n",
    );
    feed(&mut vm, Utc::now(), &["login id=abc", "logout id=abc"]);
    assert!(metrics[0].get_datum(&["abc".to_string()]).is_none());
}

#[test]
fn vm_is_deterministic_over_a_line_sequence() {
    let src = "counter total by word\n/(\\w+) (\\d+)/ {\n  total[$1] += $2\n}\n";
    let lines = ["alpha 2", "beta 3", "alpha 5", "nope", "beta 1"];
    let run = |_: usize| {
        let (metrics, mut vm) = build(src);
        feed(&mut vm, Utc::now(), &lines);
        (
            int_value(&metrics[0], &["alpha"]),
            int_value(&metrics[0], &["beta"]),
        )
    };
    assert_eq!(run(0), run(1));
    assert_eq!(run(0), (7, 4));
}

#[test]
fn runtime_error_counts_and_continues() {
    let (metrics, mut vm) = build(
        "counter good\ncounter ratio\n/r=(\\d+) d=(\\d+)/ {\n  ratio = $1 / $2\n}\n/ok/ {\n  good++\n}\n",
    );
    // Division by zero on the first line must not stop the second.
    feed(&mut vm, Utc::now(), &["r=4 d=0", "ok"]);
    assert_eq!(vm.errors(), 1);
    assert_eq!(int_value(&metrics[0], &[]), 1);
    assert!(!vm.terminated());
}

#[test]
fn stop_terminates_the_program() {
    let (metrics, mut vm) = build("counter c\n/quit/ {\n  stop\n}\n/.*/ {\n  c++\n}\n");
    feed(&mut vm, Utc::now(), &["a", "quit"]);
    assert!(vm.terminated());
    // The first line counted; the stop line halted before the second
    // conditional ran.
    assert_eq!(int_value(&metrics[0], &[]), 1);
}

#[test]
fn strptime_sets_metric_write_time() {
    let (metrics, mut vm) = build(
        "counter seen\n/^(\\d{4}-\\d{2}-\\d{2} \\d{2}:\\d{2}:\\d{2})/ {\n  strptime($1, \"%Y-%m-%d %H:%M:%S\")\n  seen++\n}\n",
    );
    feed(&mut vm, Utc::now(), &["2024-03-01 10:30:00 started"]);
    let datum = metrics[0].get_datum(&[]).unwrap();
    assert_eq!(datum.time().to_rfc3339(), "2024-03-01T10:30:00+00:00");
}

#[test]
fn decorator_wraps_statements() {
    let (metrics, mut vm) = build(
        "counter errors_total\ndef stamped {\n  /^E/ {\n    next\n  }\n}\n@stamped {\n  /(\\d+)/ {\n    errors_total += $1\n  }\n}\n",
    );
    feed(&mut vm, Utc::now(), &["E 3", "I 9", "E 4"]);
    assert_eq!(int_value(&metrics[0], &[]), 7);
}

#[test]
fn subst_and_tolower_produce_new_strings() {
    let (metrics, mut vm) = build(
        "text last\n/id=(\\S+)/ {\n  last = tolower(subst(/-+/, \"_\", $1))\n}\n",
    );
    feed(&mut vm, Utc::now(), &["id=AB--CD-e"]);
    let datum = metrics[0].get_datum(&[]).unwrap();
    assert_eq!(datum.get_text(), "ab_cd_e");
}

#[test]
fn subst_accepts_a_fragment_needle() {
    let (metrics, mut vm) = build(
        "const DASHES /-+/\ntext last\n/id=(\\S+)/ {\n  last = subst(DASHES, \"_\", $1)\n}\n",
    );
    feed(&mut vm, Utc::now(), &["id=a--b"]);
    let datum = metrics[0].get_datum(&[]).unwrap();
    assert_eq!(datum.get_text(), "a_b");
}

#[test]
fn builtin_plumbing() {
    let (metrics, mut vm) = build(
        "counter bytes_total\ngauge name_len\ntext source\n/^alloc ([0-9a-f]+)/ {\n  bytes_total += strtol($1, 16)\n  name_len = len($0)\n  source = getfilename()\n}\n",
    );
    feed(&mut vm, Utc::now(), &["alloc ff", "alloc 10"]);
    assert_eq!(int_value(&metrics[0], &[]), 0xff + 0x10);
    assert_eq!(int_value(&metrics[1], &[]), "alloc 10".len() as i64);
    assert_eq!(metrics[2].get_datum(&[]).unwrap().get_text(), "app.log");
    assert_eq!(vm.errors(), 0);
}

#[test]
fn reload_preserves_counter_value() {
    let store = Store::new();
    let src = "counter hits by code\n/code=(\\d+)/ {\n  hits[$1]++\n}\n";

    let (metrics, mut vm) = build(src);
    store.add(Arc::clone(&metrics[0])).unwrap();
    feed(&mut vm, Utc::now(), &["code=200", "code=200", "code=500"]);

    // Reload: semantically unchanged program, fresh metric instances.
    let (metrics2, mut vm2) = build(src);
    store.add(Arc::clone(&metrics2[0])).unwrap();
    assert_eq!(int_value(&metrics2[0], &["200"]), 2);

    feed(&mut vm2, Utc::now(), &["code=200"]);
    assert_eq!(int_value(&metrics2[0], &["200"]), 3);
    assert_eq!(store.get("hits").len(), 1);
}

#[test]
fn expiry_not_due_survives_gc() {
    let store = Store::new();
    let (metrics, mut vm) = build(
        "gauge session by id\n/logout id=(\\S+)/ {\n  session[$1] = 0\n  del session[$1] after 5m\n}\n",
    );
    store.add(Arc::clone(&metrics[0])).unwrap();
    feed(&mut vm, Utc::now(), &["logout id=fresh"]);
    assert_eq!(store.gc(), 0);
    assert!(metrics[0].get_datum(&["fresh".to_string()]).is_some());
}

#[test]
fn loader_dispatch_and_reload() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        use tokio::sync::{broadcast, watch};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hits.mtl");
        tokio::fs::write(&path, "counter hits\n/hit/ {\n  hits++\n}\n")
            .await
            .unwrap();

        let store = Arc::new(Store::new());
        let (lines_tx, _) = broadcast::channel(64);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut loader =
            metrail_runtime::Loader::new(Arc::clone(&store), lines_tx.clone(), shutdown_rx)
                .unwrap();

        assert_eq!(loader.load_dir(dir.path()).await.unwrap(), 1);
        assert_eq!(loader.loaded().len(), 1);

        lines_tx
            .send(Arc::new(LogLine::new(Utc::now(), "app.log", "hit one")))
            .unwrap();
        lines_tx
            .send(Arc::new(LogLine::new(Utc::now(), "app.log", "miss")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let hits = store.get("hits");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get_datum(&[]).unwrap().get_int(), 1);

        // Reload the same file; the counter value carries over.
        loader.load_file(&path).await.unwrap();
        let hits = store.get("hits");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get_datum(&[]).unwrap().get_int(), 1);

        // A broken rewrite keeps the old program running.
        tokio::fs::write(&path, "counter hits\n/hit/ {\n  hits = $9\n}\n")
            .await
            .unwrap();
        assert!(!loader.load_file(&path).await.unwrap());
        lines_tx
            .send(Arc::new(LogLine::new(Utc::now(), "app.log", "hit two")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.get("hits")[0].get_datum(&[]).unwrap().get_int(), 2);
    });
}
