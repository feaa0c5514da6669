//! Timing and retry budgets
//!
//! Every wait in the engine is a fixed delay or a bounded poll; the numbers
//! live here so tests and slow platforms can tune them without touching the
//! protocol code.

/// Controller timing configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OhciConfig {
    /// Settle delay after disabling or re-enabling a control/bulk list
    pub list_settle_us: u32,
    /// Completion poll increment; transfer timeouts count these units
    pub poll_interval_us: u32,
    /// Verify polls for a root hub port feature
    pub port_retry_budget: u32,
    pub port_retry_delay_us: u32,
    /// Delay before and after asserting controller reset, and after a global
    /// bus reset
    pub reset_settle_us: u32,
    /// Polls for the controller reset bit to self-clear
    pub reset_retry_budget: u32,
    pub reset_retry_delay_us: u32,
    /// How long each port is held in reset during controller reset
    pub port_reset_hold_us: u32,
    /// Settle after each port step during controller reset
    pub port_step_us: u32,
    /// Polls for the first start-of-frame after entering Operational
    pub sof_retry_budget: u32,
    /// Delay after every functional state change
    pub state_settle_us: u32,
    /// Delay after turning periodic list processing on
    pub periodic_settle_us: u32,
    /// Delay after entering Operational, before waiting for SOF
    pub bring_up_settle_us: u32,
}

impl OhciConfig {
    pub const fn new() -> Self {
        Self {
            list_settle_us: 20_000,
            poll_interval_us: 1_000,
            port_retry_budget: 100,
            port_retry_delay_us: 1_000,
            reset_settle_us: 50_000,
            reset_retry_budget: 50,
            reset_retry_delay_us: 1_000,
            port_reset_hold_us: 200_000,
            port_step_us: 1_000,
            sof_retry_budget: 100,
            state_settle_us: 1_000,
            periodic_settle_us: 1_000,
            bring_up_settle_us: 50_000,
        }
    }
}

impl Default for OhciConfig {
    fn default() -> Self {
        Self::new()
    }
}
