//! Execution context: thread pool, kernel choices and storage policy.
//!
//! Nothing here is global. A [`Context`] is built once, handed to the
//! solver and the kernels, and dropped (tearing down its thread pool) when
//! the run is over.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::accel::{Accelerator, ComputingModel};
use crate::error::{Error, Result};
use crate::kernels::Variant;
use crate::tree::TreeStrategy;

/// Environment variable overriding the worker count in [`ContextBuilder::from_env`].
pub const NUM_THREADS_ENV: &str = "RMF_NUM_THREADS";

/// Dense factorization applied to every element's ATL block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FactorMethod {
    /// Hermitian positive definite problems.
    Cholesky,
    LuNoPiv,
    #[default]
    LuPiv,
    LuIncPiv,
    Qr,
    QrInc,
}

/// Storage strategy for element matrices.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    InCore,
    /// Factored blocks are written to `dir` after factorization and read
    /// back for the solve.
    OutOfCore { dir: PathBuf },
}

/// How the scheduler walks the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    /// One task per child subtree, no global synchronization between levels.
    Tree,
    /// Generation by generation with a join after each level.
    Levels { parallel: bool },
}

impl Default for Traversal {
    fn default() -> Self {
        Traversal::Tree
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub block_size: usize,
    pub method: FactorMethod,
    pub strategy: TreeStrategy,
    pub computing_model: ComputingModel,
    pub backend: Backend,
    /// Keep factored elements whose connectivity did not change.
    pub reuse: bool,
    /// Zero a child's contribution once merged into its parent.
    pub zero_merged_source: bool,
    pub traversal: Traversal,
    pub variant: Variant,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 64,
            method: FactorMethod::default(),
            strategy: TreeStrategy::default(),
            computing_model: ComputingModel::default(),
            backend: Backend::default(),
            reuse: false,
            zero_merged_source: false,
            traversal: Traversal::default(),
            variant: Variant::default(),
        }
    }
}

pub struct Context {
    config: Config,
    pool: Option<rayon::ThreadPool>,
    accelerator: Option<Arc<dyn Accelerator>>,
    kernel_calls: AtomicU64,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            config: Config::default(),
            pool: None,
            accelerator: None,
            kernel_calls: AtomicU64::new(0),
        }
    }
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub fn method(&self) -> FactorMethod {
        self.config.method
    }

    pub fn variant(&self) -> Variant {
        self.config.variant
    }

    /// Number of workers tasks are spread over.
    pub fn threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    /// Run `f` on this context's pool.
    pub fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }

    /// The accelerator, when the computing model picks it for the calling
    /// worker thread.
    pub(crate) fn accelerator(&self) -> Option<&dyn Accelerator> {
        match &self.accelerator {
            Some(acc) if self.config.computing_model.selects_accelerator() => Some(acc.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn count_kernel(&self) {
        self.kernel_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Total micro-kernel invocations issued through this context.
    pub fn kernel_calls(&self) -> u64 {
        self.kernel_calls.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct ContextBuilder {
    config: Config,
    threads: Option<usize>,
    accelerator: Option<Arc<dyn Accelerator>>,
}

impl ContextBuilder {
    /// Start from defaults, taking the worker count from `RMF_NUM_THREADS`
    /// when set.
    pub fn from_env() -> Self {
        let mut b = Self::default();
        if let Some(n) = std::env::var(NUM_THREADS_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            b.threads = Some(n);
        }
        b
    }

    /// Replace every setting except the pool and the accelerator.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Worker count of the pool; `0` lets rayon decide.
    pub fn threads(mut self, n: usize) -> Self {
        self.threads = Some(n);
        self
    }

    pub fn block_size(mut self, nb: usize) -> Self {
        self.config.block_size = nb;
        self
    }

    pub fn method(mut self, method: FactorMethod) -> Self {
        self.config.method = method;
        self
    }

    pub fn strategy(mut self, strategy: TreeStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn computing_model(mut self, model: ComputingModel) -> Self {
        self.config.computing_model = model;
        self
    }

    pub fn accelerator(mut self, acc: Arc<dyn Accelerator>) -> Self {
        self.accelerator = Some(acc);
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn reuse(mut self, reuse: bool) -> Self {
        self.config.reuse = reuse;
        self
    }

    pub fn zero_merged_source(mut self, zero: bool) -> Self {
        self.config.zero_merged_source = zero;
        self
    }

    pub fn traversal(mut self, traversal: Traversal) -> Self {
        self.config.traversal = traversal;
        self
    }

    pub fn variant(mut self, variant: Variant) -> Self {
        self.config.variant = variant;
        self
    }

    pub fn build(self) -> Result<Context> {
        if self.config.block_size == 0 {
            return Err(Error::InvalidConfig("block size must be positive".into()));
        }
        let pool = match self.threads {
            None => None,
            Some(n) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("rmf-worker-{}", i))
                    .build()
                    .map_err(|e| Error::ThreadPool(e.to_string()))?,
            ),
        };
        tracing::debug!(
            threads = ?pool.as_ref().map(|p| p.current_num_threads()),
            block_size = self.config.block_size,
            method = ?self.config.method,
            "context built"
        );
        Ok(Context {
            config: self.config,
            pool,
            accelerator: self.accelerator,
            kernel_calls: AtomicU64::new(0),
        })
    }
}
