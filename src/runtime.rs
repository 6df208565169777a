//! Runtime separation for the control plane and the matching plane.
//!
//! Matching rounds burn CPU on the pairwise candidate search; on a shared
//! runtime a large round can hold a worker thread long enough for the
//! periodic loops to miss a lease or status refresh, making a healthy role
//! look offline. A process that runs matchmaker workers therefore gets a
//! second runtime sized to its configured worker count, while a
//! Director-only process keeps everything on one small runtime.
//!
//! [`ServiceRuntimes::for_config`] derives the whole setup from the service
//! configuration; components receive [`RuntimeHandles`] and spawn their
//! loops on the right plane.
//!
//! # Example
//!
//! ```rust,no_run
//! use crymatch::config::ServiceConfig;
//! use crymatch::runtime::ServiceRuntimes;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::default();
//!     let runtimes = ServiceRuntimes::for_config(&config)?;
//!
//!     runtimes.block_on(async {
//!         // ... build and start the roles with runtimes.handles()
//!     });
//!
//!     Ok(())
//! }
//! ```

use tokio::runtime::{Builder, Handle, Runtime};

use crate::config::{Mode, ServiceConfig};
use crate::constants::CONTROL_PLANE_THREADS;
use crate::error::Result;

/// Handles for spawning tasks on the correct plane.
///
/// Cheap to clone. When the process has no matching plane (Director-only
/// mode, or [`from_current`](Self::from_current)), both handles point at
/// the same runtime.
#[derive(Clone)]
pub struct RuntimeHandles {
    /// Periodic loops: lease refresh, pingers, fetchers, Director ticks.
    pub control: Handle,

    /// Per-pool matching rounds.
    pub matching: Handle,
}

impl RuntimeHandles {
    /// Both planes on the caller's current runtime.
    ///
    /// For tests and embedders that accept the starvation trade-off of a
    /// single runtime.
    pub fn from_current() -> Self {
        let current = Handle::current();
        Self {
            control: current.clone(),
            matching: current,
        }
    }
}

/// Owned runtimes, derived from the service configuration.
///
/// Held by the entry point for the life of the process; components get
/// cloneable handles via [`handles`](Self::handles).
pub struct ServiceRuntimes {
    control: Runtime,
    /// Present only when this process runs matchmaker workers.
    matching: Option<Runtime>,
    handles: RuntimeHandles,
}

impl ServiceRuntimes {
    /// Build the runtimes a process with this configuration needs.
    ///
    /// The control plane stays small regardless of the machine: its loops
    /// are latency-sensitive but near-idle. The matching plane exists only
    /// for modes that run workers and is sized to `MatchmakerThreads`, so
    /// every worker can hold a round without queueing behind another.
    pub fn for_config(config: &ServiceConfig) -> Result<Self> {
        config.validate()?;

        let control = Builder::new_multi_thread()
            .worker_threads(CONTROL_PLANE_THREADS)
            .thread_name("crymatch-ctrl")
            .enable_all()
            .build()?;

        let matching = match config.mode {
            // A Director never runs a matching round.
            Mode::Director => None,
            Mode::Standalone | Mode::Matchmaker => Some(
                Builder::new_multi_thread()
                    .worker_threads(config.matchmaker_threads)
                    .thread_name("crymatch-match")
                    .enable_all()
                    .build()?,
            ),
        };

        let handles = RuntimeHandles {
            control: control.handle().clone(),
            matching: matching
                .as_ref()
                .map(|runtime| runtime.handle().clone())
                .unwrap_or_else(|| control.handle().clone()),
        };

        Ok(Self {
            control,
            matching,
            handles,
        })
    }

    /// Cloneable handles for spawning tasks on each plane.
    pub fn handles(&self) -> RuntimeHandles {
        self.handles.clone()
    }

    /// Block on a future from synchronous entry-point code. Runs on the
    /// control plane.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.control.block_on(future)
    }

    /// Wind down: the matching plane stops first so no new rounds start
    /// while the control loops drain their last state writes.
    pub fn shutdown(self) {
        if let Some(matching) = self.matching {
            drop(matching);
        }
        drop(self.control);
    }
}
