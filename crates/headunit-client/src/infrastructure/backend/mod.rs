//! Session backends: implementations of the bring-up ports.
//!
//! - **`simulated`** – an in-process phone.  Each stage succeeds after a short
//!   delay and the secure channel is a memory pipe to a task that plays the
//!   phone's side of the control protocol.  Used by the `headunit` binary on
//!   machines without a phone attached.
//!
//! - **`mock`** – a scripted backend for tests.  Every stage and every
//!   release is recorded in a shared event log, and any stage can be made to
//!   fail, panic, or hang.

pub mod mock;
pub mod simulated;

pub use mock::{MockControlChannel, ScriptedBackend};
pub use simulated::{PhoneScript, SimulatedBackend};
