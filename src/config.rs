//! # Machine Configuration
//!
//! Tunables and the process-wide feature switch for the device state
//! machines.
//!
//! ## Quick Start
//!
//! ```
//! use zigbee_device_runtime::MachineConfig;
//!
//! let config = MachineConfig::builder().managed(true).build();
//! assert!(config.managed);
//! ```
//!
//! ## Configuration Options
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `managed` | `false` | Route events through the state machine instead of the legacy control path |
//!
//! The `managed` switch mirrors the `--dev-test-managed <n>` process argument
//! (n > 0 enables it). It is immutable after startup: it is read once and
//! passed into machine construction, never consulted live.

use std::time::Duration;

/// Minimum window a sleeping end-device keeps its receiver on after a MAC
/// data poll: 7.68 s plus headroom for confirm latency.
///
/// Used as the single-shot timeout for every outstanding network request and
/// as the "recently heard" horizon of the reachability derivation.
pub const MIN_MAC_POLL_RX_ON: Duration = Duration::from_millis(8000);

/// How often an item read is retried before it is dropped from the poll
/// queue.
pub const MAX_POLL_ITEM_RETRIES: u8 = 3;

/// Pause between two binding-table verification walks.
///
/// `Awake`/`Poll` activity inside this window does not restart the walk.
pub const BINDING_VERIFY_PERIOD: Duration = Duration::from_secs(60 * 5);

/// Reported time since last wake-up while no wake-up was ever observed.
///
/// Large enough that every "recently heard" comparison fails.
pub const LAST_AWAKE_FALLBACK: Duration = Duration::from_millis(8_640_000);

/// Process-wide machine configuration
#[derive(Debug, Clone, Default)]
pub struct MachineConfig {
    /// Whether devices are managed by the state machine (default: false).
    ///
    /// An unmanaged machine stays inert; the legacy implementation keeps
    /// handling the device and the dispatcher never routes events here.
    pub managed: bool,
}

impl MachineConfig {
    /// Create a new builder
    pub fn builder() -> MachineConfigBuilder {
        MachineConfigBuilder::default()
    }

    /// Read the configuration from the process arguments.
    ///
    /// Recognizes `--dev-test-managed <n>`; any value above zero enables the
    /// machine. Missing or unparsable values leave it disabled.
    pub fn from_process_args() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self {
            managed: managed_from_args(&args),
        }
    }
}

/// Builder for MachineConfig
#[derive(Default)]
pub struct MachineConfigBuilder {
    config: MachineConfig,
}

impl MachineConfigBuilder {
    /// Enable or disable the state machine (default: false)
    pub fn managed(mut self, managed: bool) -> Self {
        self.config.managed = managed;
        self
    }

    /// Build the configuration
    pub fn build(self) -> MachineConfig {
        self.config
    }
}

fn managed_from_args(args: &[String]) -> bool {
    args.iter()
        .position(|a| a == "--dev-test-managed")
        .and_then(|pos| args.get(pos + 1))
        .and_then(|value| value.parse::<i64>().ok())
        .map(|n| n > 0)
        .unwrap_or(false)
}

// ============================================================================
// UNIT TESTS
// ============================================================================
