//! Data-less signals used to wake up observers of shared state.

use tokio::sync::watch;

/// Transmitter side of a coordination signal.
pub type SignalTx = watch::Sender<()>;

/// Receiver side of a coordination signal.
pub type SignalRx = watch::Receiver<()>;

pub fn create_signal() -> (SignalTx, SignalRx) {
    watch::channel(())
}
