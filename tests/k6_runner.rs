//! End-to-end runner tests against a fake load-generator executable.
//!
//! The fake generator mimics the real invocation contract: it is called as
//! `<bin> run <script>` and the rendered script, not the exit code, decides
//! what lands in the result file. Here the "script" template renders to a
//! shell script that writes a JSON result into the cache slot and appends to
//! a call log, so the tests can count actual subprocess invocations.
#![cfg(unix)]

use plateau::{
    find_optimal_vus, BenchmarkConfig, EndpointDescriptor, K6Runner, Observation, TrialCache,
};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// The rendered "k6 script" is itself a shell script. Each run logs one line
/// and reports a throughput of `vus + 0.5` req/s into the results file.
const TEMPLATE: &str = r#"
echo "vus={{ pre_allocated_vus }}" >> "{{ data_file }}.calls"
printf '%s' "$HF_TOKEN" > "{{ data_file }}.token"
cat > "{{ results_file }}" <<EOF
{"throughput_req_per_sec": {{ pre_allocated_vus }}.5,
 "vus": {{ pre_allocated_vus }},
 "host": "{{ host }}",
 "engine": "{{ engine }}",
 "duration": "{{ duration }}"}
EOF
"#;

fn fake_generator(dir: &Path) -> std::path::PathBuf {
    let bin = dir.join("fake-k6");
    // discard the "run" argument and execute the rendered script
    fs::write(&bin, "#!/bin/sh\nexec /bin/sh \"$2\"\n").unwrap();
    let mut perms = fs::metadata(&bin).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&bin, perms).unwrap();
    bin
}

fn session(dir: &Path) -> (K6Runner, TrialCache) {
    let templates = dir.join("templates");
    fs::create_dir_all(&templates).unwrap();
    fs::write(templates.join("embedding-suite.js.j2"), TEMPLATE).unwrap();

    let config = BenchmarkConfig {
        dataset_path: dir.join("dataset"),
        text_column: "text".to_owned(),
        total_requests: 100,
        duration: "1m".to_owned(),
        template: "embedding-suite.js.j2".to_owned(),
        template_dir: templates,
        k6_bin: fake_generator(dir),
        script_path: dir.join("generated").join("script.js"),
        api_token: Some("hf_test_token".to_owned()),
    };
    let endpoint = EndpointDescriptor {
        hw_type: "nvidia-l4".to_owned(),
        vendor: "aws".to_owned(),
        engine: "torch".to_owned(),
        batch_size: 32,
        base_url: "https://example.test".to_owned(),
        image: Some("ghcr.io/org/infinity:1.2".to_owned()),
    };
    let cache = TrialCache::new(dir.join("results"));
    let runner = K6Runner::new(config, endpoint, cache.clone()).unwrap();
    (runner, cache)
}

fn call_count(dir: &Path) -> usize {
    match fs::read_to_string(dir.join("dataset.calls")) {
        Ok(log) => log.lines().count(),
        Err(_) => 0,
    }
}

#[test]
fn trial_runs_once_then_serves_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let (mut runner, cache) = session(dir.path());

    assert_eq!(runner.run(4).unwrap(), 4.5);
    assert_eq!(call_count(dir.path()), 1);

    // identical trial: served from cache, generator not invoked again
    assert_eq!(runner.run(4).unwrap(), 4.5);
    assert_eq!(call_count(dir.path()), 1);

    // the raw metrics written by the generator survive in the cache slot
    let stored = cache.lookup(&runner.key_for(4)).unwrap().unwrap();
    assert_eq!(stored.raw["engine"], serde_json::json!("torch"));
    assert_eq!(stored.raw["duration"], serde_json::json!("1m"));
}

#[test]
fn credential_reaches_the_generator_environment() {
    let dir = tempfile::tempdir().unwrap();
    let (mut runner, _cache) = session(dir.path());

    runner.run(2).unwrap();
    let token = fs::read_to_string(dir.path().join("dataset.token")).unwrap();
    assert_eq!(token, "hf_test_token");
}

#[test]
fn script_location_is_reused_across_trials() {
    let dir = tempfile::tempdir().unwrap();
    let (mut runner, _cache) = session(dir.path());

    runner.run(1).unwrap();
    let first = fs::read_to_string(dir.path().join("generated").join("script.js")).unwrap();
    assert!(first.contains("vus=1"));

    runner.run(2).unwrap();
    let second = fs::read_to_string(dir.path().join("generated").join("script.js")).unwrap();
    assert!(second.contains("vus=2"));

    // one script file total, overwritten each trial
    let generated: Vec<_> = fs::read_dir(dir.path().join("generated"))
        .unwrap()
        .collect();
    assert_eq!(generated.len(), 1);
}

#[test]
fn full_search_memoizes_repeated_probes() {
    let dir = tempfile::tempdir().unwrap();
    let (mut runner, _cache) = session(dir.path());

    // throughput is vus + 0.5, so expansion climbs to the cap of 8, and
    // refinement bisects 4..8: it probes 6, then 4 again (a cache hit)
    let outcome = find_optimal_vus(&mut runner, 8, 1).unwrap();

    assert_eq!(
        outcome.optimal,
        Observation {
            vus: 8,
            throughput: 8.5
        }
    );
    let probed: Vec<usize> = outcome.history.iter().map(|obs| obs.vus).collect();
    assert_eq!(probed, vec![1, 2, 4, 8, 6, 4]);
    // six observations, but only five subprocess invocations
    assert_eq!(call_count(dir.path()), 5);
}

#[test]
fn a_second_session_reuses_the_whole_history() {
    let dir = tempfile::tempdir().unwrap();
    let (mut runner, _cache) = session(dir.path());
    find_optimal_vus(&mut runner, 8, 1).unwrap();
    let invocations = call_count(dir.path());

    // same endpoint facts, fresh runner: every trial is a cache hit
    let (mut rerun, _cache) = session(dir.path());
    let outcome = find_optimal_vus(&mut rerun, 8, 1).unwrap();
    assert_eq!(outcome.optimal.vus, 8);
    assert_eq!(call_count(dir.path()), invocations);
}
