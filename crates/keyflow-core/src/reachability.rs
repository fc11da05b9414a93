use thiserror::Error;
use tokio::sync::mpsc;

/// Connectivity edge reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityEvent {
    Reachable,
    Unreachable,
}

#[derive(Debug, Error)]
#[error("failed to start reachability monitoring: {0}")]
pub struct ReachabilityError(pub String);

/// Network reachability collaborator.
///
/// `start` is called once during manager initialization; a start failure is
/// logged by the manager and never fatal. Implementations deliver edge
/// events only, not levels.
pub trait ReachabilityMonitor: Send + Sync {
    fn start(&self) -> Result<mpsc::Receiver<ReachabilityEvent>, ReachabilityError>;
}
