//! Child-process supervision: stdio framing, lifecycle, fleet management.
//!
//! Each service gets one [`Supervisor`] owning one child process. The
//! supervisor owns the [`Framer`] (the framer holds no back-reference) and
//! exposes only command methods; the [`ProcessManager`] tracks the live
//! supervisors for the proxy and the management surface.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │               ProcessManager                   │
//! ├──────────────┬──────────────┬─────────────────┤
//! │ Supervisor   │ Supervisor   │ Supervisor      │
//! │  └─ Framer   │  └─ Framer   │  └─ Framer      │
//! ├──────────────┴──────────────┴─────────────────┤
//! │  child A     │  child B     │  child C        │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! State machine per service:
//!
//! ```text
//! stopped ──start──▶ starting ──spawned──▶ running
//! running ──exit/signal──▶ crashed
//! crashed ──auto_restart & n < max──▶ restarting ──delay──▶ starting
//! *       ──stop──▶ stopped
//! ```

pub mod framer;
pub mod log_buffer;
pub mod manager;
pub mod supervisor;

pub use framer::Framer;
pub use log_buffer::{LogBuffer, LogLine};
pub use manager::{ProcessManager, ServiceCounts};
pub use supervisor::{backoff_delay, ServiceState, ServiceStatus, Supervisor};
