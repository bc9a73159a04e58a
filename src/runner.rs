use crate::{BenchmarkConfig, EndpointDescriptor, Error, Task, TrialCache, TrialKey, TrialResult};
use minijinja::{context, Environment};
use std::fs;
use std::process::Command;
use tracing::{debug, info, warn};

/// A source of throughput measurements, one trial at a time.
///
/// Implementations must treat a failed trial as a measurement of zero
/// throughput rather than an error: a single flaky trial must not abort a
/// long search. Errors are reserved for conditions that would make every
/// subsequent trial fail the same way.
///
/// The trait is also implemented for any
/// `FnMut(usize) -> Result<f64, Error>`, so a search can be driven by a
/// closure in tests or simulations.
pub trait TrialRunner {
    /// Measure the throughput, in requests per second, that the endpoint
    /// sustains under `vus` concurrent virtual users.
    fn run(&mut self, vus: usize) -> Result<f64, Error>;
}

impl<F> TrialRunner for F
where
    F: FnMut(usize) -> Result<f64, Error>,
{
    fn run(&mut self, vus: usize) -> Result<f64, Error> {
        (self)(vus)
    }
}

/// A [`TrialRunner`] that renders a k6 script and runs it as a subprocess.
///
/// Each trial renders the configured template with the endpoint facts and
/// the candidate VU count, writes it to the fixed script location, and
/// invokes the load generator against it. The generator writes its JSON
/// result straight into the trial's cache slot; a cached slot short-circuits
/// the whole procedure, which is the dominant optimization since a single
/// trial blocks for the full configured duration.
///
/// The generator's exit code is not the success signal. The presence and
/// shape of the result file is: a missing or malformed result degrades to a
/// throughput of zero, which is cached like any other measurement so the
/// same failing trial is not re-run.
#[derive(Debug)]
pub struct K6Runner {
    config: BenchmarkConfig,
    endpoint: EndpointDescriptor,
    cache: TrialCache,
    task: Task,
    template: String,
}

impl K6Runner {
    /// Build a runner for one benchmarking session.
    ///
    /// All configuration-class checks happen here, before any trial can run:
    /// the template identifier must name a recognized task category
    /// ([`Error::UnknownTask`]), the template file must be readable, and its
    /// syntax must parse.
    pub fn new(
        config: BenchmarkConfig,
        endpoint: EndpointDescriptor,
        cache: TrialCache,
    ) -> Result<Self, Error> {
        let task = Task::from_template(&config.template)?;
        let path = config.template_dir.join(&config.template);
        let template =
            fs::read_to_string(&path).map_err(|source| Error::Io { path, source })?;
        let env = Environment::new();
        env.template_from_str(&template)?;

        Ok(Self {
            config,
            endpoint,
            cache,
            task,
            template,
        })
    }

    /// The task category derived from the configured template.
    pub fn task(&self) -> Task {
        self.task
    }

    /// The fingerprint a trial at `vus` virtual users would be cached under.
    pub fn key_for(&self, vus: usize) -> TrialKey {
        TrialKey::new(self.task, &self.endpoint, vus)
    }

    /// Run (or recall) one trial. See [`TrialRunner::run`].
    pub fn run(&mut self, vus: usize) -> Result<f64, Error> {
        let key = self.key_for(vus);
        match self.cache.lookup(&key) {
            Ok(Some(result)) => {
                info!(
                    %key,
                    throughput = result.throughput_req_per_sec,
                    "serving trial from cache"
                );
                return Ok(result.throughput_req_per_sec.max(0.0));
            }
            Ok(None) => {}
            Err(err) => warn!(%key, %err, "cache lookup failed, re-running trial"),
        }

        // the generator writes its result directly into the cache slot
        let results_file = self.cache.prepare_slot(&key)?;
        let script = self.render_script(vus, &results_file)?;
        if let Some(parent) = self.config.script_path.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&self.config.script_path, script).map_err(|source| Error::Io {
            path: self.config.script_path.clone(),
            source,
        })?;

        debug!(
            bin = %self.config.k6_bin.display(),
            script = %self.config.script_path.display(),
            "invoking load generator"
        );
        let mut command = Command::new(&self.config.k6_bin);
        command.arg("run").arg(&self.config.script_path);
        if let Some(token) = &self.config.api_token {
            command.env("HF_TOKEN", token);
        }
        match command.output() {
            Ok(output) if !output.status.success() => {
                // not fatal: the result file, not the exit code, decides
                warn!(
                    %key,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "load generator exited abnormally"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(%key, %err, "failed to invoke load generator"),
        }

        let result = match self.cache.lookup(&key) {
            Ok(Some(result)) => result,
            Ok(None) => {
                warn!(%key, "no result file produced, recording zero throughput");
                TrialResult::new(0.0)
            }
            Err(err) => {
                warn!(%key, %err, "unreadable result file, recording zero throughput");
                TrialResult::new(0.0)
            }
        };
        if let Err(err) = self.cache.store(&key, &result) {
            warn!(%key, %err, "failed to persist trial result");
        }
        Ok(result.throughput_req_per_sec.max(0.0))
    }

    fn render_script(&self, vus: usize, results_file: &std::path::Path) -> Result<String, Error> {
        let env = Environment::new();
        let script = env.render_str(
            &self.template,
            context! {
                text_column => &self.config.text_column,
                host => &self.endpoint.base_url,
                data_file => self.config.dataset_path.display().to_string(),
                results_file => results_file.display().to_string(),
                pre_allocated_vus => vus,
                total_requests => self.config.total_requests,
                hw_type => &self.endpoint.hw_type,
                batch_size => self.endpoint.batch_size,
                vendor => &self.endpoint.vendor,
                engine => &self.endpoint.engine,
                duration => &self.config.duration,
            },
        )?;
        Ok(script)
    }
}

impl TrialRunner for K6Runner {
    fn run(&mut self, vus: usize) -> Result<f64, Error> {
        K6Runner::run(self, vus)
    }
}

#[cfg(test)]
fn endpoint() -> EndpointDescriptor {
    EndpointDescriptor {
        hw_type: "nvidia-l4".to_owned(),
        vendor: "aws".to_owned(),
        engine: "torch".to_owned(),
        batch_size: 32,
        base_url: "https://example.test".to_owned(),
        image: None,
    }
}

#[cfg(test)]
fn config_in(dir: &std::path::Path, template: &str, k6_bin: &str) -> BenchmarkConfig {
    BenchmarkConfig {
        dataset_path: dir.join("data.csv"),
        text_column: "text".to_owned(),
        total_requests: 100,
        duration: "1m".to_owned(),
        template: template.to_owned(),
        template_dir: dir.join("templates"),
        k6_bin: k6_bin.into(),
        script_path: dir.join("generated").join("script.js"),
        api_token: None,
    }
}

#[cfg(test)]
fn write_template(dir: &std::path::Path, name: &str, body: &str) {
    let templates = dir.join("templates");
    fs::create_dir_all(&templates).unwrap();
    fs::write(templates.join(name), body).unwrap();
}

#[test]
fn unknown_template_fails_before_anything_runs() {
    let dir = tempfile::tempdir().unwrap();
    let cache = TrialCache::new(dir.path().join("results"));
    let err = K6Runner::new(
        config_in(dir.path(), "foo.js.j2", "/does/not/exist"),
        endpoint(),
        cache,
    )
    .unwrap_err();
    assert!(matches!(err, Error::UnknownTask(t) if t == "foo.js.j2"));
}

#[test]
fn missing_template_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let cache = TrialCache::new(dir.path().join("results"));
    let err = K6Runner::new(
        config_in(dir.path(), "classification-analysis.js.j2", "k6"),
        endpoint(),
        cache,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Io { .. }));
}

#[test]
fn invalid_template_syntax_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write_template(dir.path(), "classification-analysis.js.j2", "{% broken");
    let cache = TrialCache::new(dir.path().join("results"));
    let err = K6Runner::new(
        config_in(dir.path(), "classification-analysis.js.j2", "k6"),
        endpoint(),
        cache,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Template(_)));
}

#[test]
fn cache_hit_skips_the_load_generator() {
    let dir = tempfile::tempdir().unwrap();
    write_template(
        dir.path(),
        "classification-analysis.js.j2",
        "host={{ host }} vus={{ pre_allocated_vus }}",
    );
    let cache = TrialCache::new(dir.path().join("results"));
    let key = TrialKey::new(Task::Classification, &endpoint(), 8);
    cache.store(&key, &TrialResult::new(42.5)).unwrap();

    // the binary does not exist, so any subprocess attempt would fail
    let mut runner = K6Runner::new(
        config_in(dir.path(), "classification-analysis.js.j2", "/does/not/exist"),
        endpoint(),
        cache,
    )
    .unwrap();
    assert_eq!(runner.run(8).unwrap(), 42.5);
    // a hit returns before the script is even rendered
    assert!(!dir.path().join("generated").join("script.js").exists());
}

#[test]
#[cfg(unix)]
fn missing_result_degrades_to_zero_and_is_cached() {
    let dir = tempfile::tempdir().unwrap();
    write_template(
        dir.path(),
        "embedding-suite.js.j2",
        "vus={{ pre_allocated_vus }}",
    );
    let cache = TrialCache::new(dir.path().join("results"));

    // /bin/true runs fine but never writes a result file
    let mut runner = K6Runner::new(
        config_in(dir.path(), "embedding-suite.js.j2", "/bin/true"),
        endpoint(),
        cache.clone(),
    )
    .unwrap();
    assert_eq!(runner.run(3).unwrap(), 0.0);

    // the zero is persisted under the key...
    let key = TrialKey::new(Task::Embedding, &endpoint(), 3);
    assert_eq!(
        cache.lookup(&key).unwrap().unwrap().throughput_req_per_sec,
        0.0
    );

    // ...so a later session sharing the cache never re-runs the trial: this
    // runner's binary cannot be invoked at all
    let mut cached_only = K6Runner::new(
        config_in(dir.path(), "embedding-suite.js.j2", "/does/not/exist"),
        endpoint(),
        cache,
    )
    .unwrap();
    assert_eq!(cached_only.run(3).unwrap(), 0.0);
}

#[test]
#[cfg(unix)]
fn malformed_cached_result_is_rerun() {
    let dir = tempfile::tempdir().unwrap();
    write_template(
        dir.path(),
        "embedding-suite.js.j2",
        "vus={{ pre_allocated_vus }}",
    );
    let cache = TrialCache::new(dir.path().join("results"));
    let key = TrialKey::new(Task::Embedding, &endpoint(), 2);
    let slot = cache.prepare_slot(&key).unwrap();
    fs::write(&slot, b"garbage").unwrap();

    // lookup fails, so the trial re-runs; /bin/true leaves no result, and
    // the garbage entry is overwritten with a parseable zero
    let mut runner = K6Runner::new(
        config_in(dir.path(), "embedding-suite.js.j2", "/bin/true"),
        endpoint(),
        cache.clone(),
    )
    .unwrap();
    assert_eq!(runner.run(2).unwrap(), 0.0);
    assert_eq!(
        cache.lookup(&key).unwrap().unwrap().throughput_req_per_sec,
        0.0
    );
}
