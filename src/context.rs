//! Execution context passed to every core operation.
//!
//! It owns the worker pool used by the numeric inner loops, the cache of transform plans,
//! the transform timing wisdom and the optional run log file. There is no global state: two
//! contexts can run side by side with different thread counts.

use crate::engine::fft::Transform3d;
use crate::engine::wisdom::Wisdom;
use crate::engine::work_domain::benchmark_length;
use crate::error::{DeconvError, Result};
use crate::volume::Dims;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub struct ExecutionContext {
    threads: usize,
    pool: ThreadPool,
    plans: Mutex<HashMap<Dims, Arc<Transform3d>>>,
    wisdom: Mutex<Wisdom>,
    wisdom_path: Option<PathBuf>,
    run_log: Option<Mutex<BufWriter<File>>>,
}

impl ExecutionContext {
    /// Creates a context with a dedicated pool of `threads` workers.
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(DeconvError::Configuration(
                "at least one thread is needed".to_string(),
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("deconv3d-worker-{i}"))
            .build()
            .map_err(|err| DeconvError::Configuration(err.to_string()))?;
        Ok(ExecutionContext {
            threads,
            pool,
            plans: Mutex::new(HashMap::new()),
            wisdom: Mutex::new(Wisdom::new()),
            wisdom_path: None,
            run_log: None,
        })
    }

    /// Loads the transform timing wisdom from `path` and stores it there again on
    /// [`save_wisdom`](Self::save_wisdom).
    pub fn with_wisdom_file(mut self, path: PathBuf) -> Self {
        self.wisdom = Mutex::new(Wisdom::load_or_default(&path));
        self.wisdom_path = Some(path);
        self
    }

    /// Mirrors [`info`](Self::info) and [`warn`](Self::warn) messages into a file.
    pub fn with_run_log(mut self, path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|err| DeconvError::io(path, err))?;
        let mut writer = BufWriter::new(file);
        writeln!(
            writer,
            "deconv3d {} run started {}",
            env!("CARGO_PKG_VERSION"),
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        )
        .map_err(|err| DeconvError::io(path, err))?;
        self.run_log = Some(Mutex::new(writer));
        Ok(self)
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs `op` inside the worker pool, so every rayon call it makes uses this context's
    /// threads.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    /// Returns the transform plan for `dims`, building it on first use.
    pub fn plan(&self, dims: Dims) -> Result<Arc<Transform3d>> {
        let mut plans = self.plans.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(plan) = plans.get(&dims) {
            return Ok(Arc::clone(plan));
        }
        log::debug!("planning transforms for {dims:?}");
        let plan = Arc::new(Transform3d::new(dims)?);
        plans.insert(dims, Arc::clone(&plan));
        self.wisdom
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_plan(dims);
        Ok(plan)
    }

    /// Number of distinct plans built so far.
    pub fn cached_plans(&self) -> usize {
        self.plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Seconds per 1D transform of length `len`, measured once and then taken from the wisdom.
    pub fn transform_timing(&self, len: usize) -> f64 {
        let mut wisdom = self.wisdom.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(seconds) = wisdom.timing(len) {
            return seconds;
        }
        let seconds = benchmark_length(len);
        wisdom.record_timing(len, seconds);
        seconds
    }

    /// Stores the wisdom if a wisdom file was configured. Failures are only logged.
    pub fn save_wisdom(&self) {
        if let Some(path) = &self.wisdom_path {
            self.wisdom
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .save_best_effort(path);
        }
    }

    pub fn info(&self, message: &str) {
        log::info!("{message}");
        self.append_log(message);
    }

    pub fn warn(&self, message: &str) {
        log::warn!("{message}");
        self.append_log(&format!("Warning: {message}"));
    }

    fn append_log(&self, message: &str) {
        if let Some(run_log) = &self.run_log {
            let mut writer = run_log.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = writeln!(writer, "{message}").and_then(|_| writer.flush()) {
                log::debug!("could not write to run log: {err}");
            }
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("threads", &self.threads)
            .field("wisdom_path", &self.wisdom_path)
            .finish()
    }
}
