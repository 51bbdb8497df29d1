//! Infrastructure Layer
//!
//! Cross-cutting runtime components: admission control, health probing,
//! client streaming and shutdown coordination.

pub mod concurrency_limiter;
pub mod health_prober;
pub mod shutdown;
pub mod stream_bridge;

pub use concurrency_limiter::{ConcurrencyLimiter, InFlightPermit};
pub use health_prober::{HealthProber, ProbeConfig, ProbeResult};
pub use shutdown::{shutdown_signal, ShutdownController, TaskGuard};
pub use stream_bridge::{EmitOutcome, StreamBridge, StreamEvent, TaskStream};
