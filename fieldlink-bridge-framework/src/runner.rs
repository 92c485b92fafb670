//! Bridge runner for lifecycle management.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fieldlink_common::{init_tracing, shutdown_signal};

use crate::BridgeArgs;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

/// How long workers get to stop after cancellation before they are aborted.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bridge runner that manages the lifecycle of a bridge process.
///
/// Handles:
/// - Logging initialization (with optional CLI override)
/// - Task spawning and management
/// - Cooperative shutdown on Ctrl+C / SIGTERM through a [`CancellationToken`]
///
/// # Example
///
/// ```ignore
/// use fieldlink_bridge_framework::{BridgeArgs, BridgeConfig, BridgeRunner};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = BridgeArgs::parse_with_default("mybridge.json5");
///     let config = MyBridgeConfig::load(&args.config)?;
///
///     let mut runner = BridgeRunner::new_with_args("mybridge", config, Some(&args))?;
///
///     let cancel = runner.cancel_token();
///     runner.spawn("worker", async move {
///         cancel.cancelled().await;
///     });
///
///     runner.run().await?;
///     Ok(())
/// }
/// ```
pub struct BridgeRunner<C: BridgeConfig> {
    /// Bridge name for logging.
    name: String,
    /// Bridge version.
    version: String,
    /// The loaded configuration.
    config: C,
    /// Cancelled when the bridge shuts down.
    cancel: CancellationToken,
    /// Spawned tasks with their names.
    tasks: Vec<(String, JoinHandle<()>)>,
    shutdown_timeout: Duration,
}

impl<C: BridgeConfig> BridgeRunner<C> {
    /// Create a runner without touching global logging state.
    pub fn new(name: impl Into<String>, config: C) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            config,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Create a runner and initialize logging from the config,
    /// with the CLI `--log-level` taking precedence.
    pub fn new_with_args(
        name: impl Into<String>,
        config: C,
        args: Option<&BridgeArgs>,
    ) -> Result<Self> {
        let mut log_config = config.logging().clone();
        if let Some(level) = args.and_then(|a| a.log_level.as_ref()) {
            log_config.level = level.clone();
        }

        init_tracing(&log_config).map_err(|e| BridgeError::config(e.to_string()))?;

        let runner = Self::new(name, config);
        tracing::info!(bridge = %runner.name, version = %runner.version, "Starting bridge");
        Ok(runner)
    }

    /// Set how long workers may take to stop before being aborted.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Get the bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bridge version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a reference to the configuration.
    pub fn config(&self) -> &C {
        &self.config
    }

    /// Token cancelled when the bridge shuts down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a worker task.
    ///
    /// Workers are expected to watch the [`cancel_token`](Self::cancel_token)
    /// and return once it fires.
    pub fn spawn<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.push((name.into(), handle));
    }

    /// Spawn a worker task that returns a Result.
    ///
    /// Errors are logged automatically.
    pub fn spawn_with_error<F, E>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let worker = name.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = future.await {
                tracing::error!(worker = %worker, error = %e, "Worker failed");
            }
        });
        self.tasks.push((name, handle));
    }

    /// Run the bridge until Ctrl+C or SIGTERM is received.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the bridge until `shutdown` resolves or the token is cancelled.
    ///
    /// On shutdown the token is cancelled and every worker is awaited up to
    /// the shutdown timeout; stragglers are aborted.
    pub async fn run_until<S>(self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tracing::info!(
            bridge = %self.name,
            tasks = self.tasks.len(),
            "Bridge running. Press Ctrl+C to stop."
        );

        tokio::select! {
            _ = shutdown => {
                tracing::info!(bridge = %self.name, "Received shutdown signal");
            }
            _ = self.cancel.cancelled() => {
                tracing::info!(bridge = %self.name, "Shutdown requested");
            }
        }

        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        for (worker, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => tracing::debug!(worker = %worker, "Worker stopped"),
                Ok(Err(e)) if e.is_panic() => {
                    tracing::error!(worker = %worker, "Worker panicked");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    tracing::warn!(worker = %worker, "Worker did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        tracing::info!(bridge = %self.name, "Goodbye!");

        Ok(())
    }
}

/// Convenience function to run a bridge with minimal boilerplate.
///
/// # Example
///
/// ```ignore
/// use fieldlink_bridge_framework::{run_bridge, BridgeConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     run_bridge::<MyBridgeConfig, _>("mybridge", "mybridge.json5", |runner| {
///         let cancel = runner.cancel_token();
///         runner.spawn("worker", my_worker(cancel));
///         Ok(())
///     }).await
/// }
/// ```
pub async fn run_bridge<C, F>(
    name: &str,
    default_config: &'static str,
    setup: F,
) -> anyhow::Result<()>
where
    C: BridgeConfig,
    F: FnOnce(&mut BridgeRunner<C>) -> Result<()>,
{
    let args = BridgeArgs::parse_with_default(default_config);
    let config = C::load(&args.config).map_err(|e| anyhow::anyhow!("{}", e))?;

    let mut runner =
        BridgeRunner::new_with_args(name, config, Some(&args)).map_err(|e| anyhow::anyhow!("{}", e))?;

    setup(&mut runner).map_err(|e| anyhow::anyhow!("{}", e))?;

    runner.run().await.map_err(|e| anyhow::anyhow!("{}", e))
}
