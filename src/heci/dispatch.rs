//! HECI dispatcher thread.
//!
//! Runs in a dedicated thread using `edge-executor` for cooperative
//! scheduling, driven by `futures_lite::future::block_on`. The single
//! task waits on the inbound channel and processes packets in receipt
//! order, so grants and client fragments are applied in the order the
//! host sent them.
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────┐
//!  │  heci-dispatch thread                                │
//!  │  ┌────────────────────────────────────────────────┐  │
//!  │  │  futures_lite::block_on                        │  │
//!  │  │  ┌──────────────────────────────────────────┐  │  │
//!  │  │  │  edge_executor::LocalExecutor            │  │  │
//!  │  │  │   run_dispatch: inbound.receive().await  │  │  │
//!  │  │  │                 ──▶ process_packet       │  │  │
//!  │  │  └──────────────────────────────────────────┘  │  │
//!  │  └────────────────────────────────────────────────┘  │
//!  └──────────────────────────────────────────────────────┘
//! ```

extern crate alloc;
use alloc::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::info;

use super::Heci;
use super::dma::DmaEngine;
use super::transport::Transport;

const STACK_SIZE: usize = 16 * 1024;

/// Handle to a running dispatcher thread.
pub struct Dispatcher {
    stop: Arc<Signal<CriticalSectionRawMutex, ()>>,
    thread: std::thread::JoinHandle<()>,
}

impl Dispatcher {
    /// Stop the dispatcher and wait for its thread to exit. Packets still
    /// queued stay in the inbound channel.
    pub fn shutdown(self) {
        self.stop.signal(());
        if self.thread.join().is_err() {
            log::error!("HECI: dispatcher thread panicked");
        }
    }
}

fn run_dispatch_loop<T, E>(heci: Arc<Heci<T, E>>, stop: Arc<Signal<CriticalSectionRawMutex, ()>>)
where
    T: Transport + 'static,
    E: DmaEngine + 'static,
{
    let executor: edge_executor::LocalExecutor<'_, 8> = edge_executor::LocalExecutor::new();

    executor
        .spawn(async move { heci.run_dispatch().await })
        .detach();

    info!("HECI: dispatcher started");
    futures_lite::future::block_on(executor.run(stop.wait()));
    info!("HECI: dispatcher stopped");
}

/// Spawn the dispatcher thread for `heci`.
pub fn spawn_dispatcher<T, E>(heci: Arc<Heci<T, E>>) -> std::io::Result<Dispatcher>
where
    T: Transport + 'static,
    E: DmaEngine + 'static,
{
    let stop = Arc::new(Signal::new());
    let thread_stop = stop.clone();
    let thread = std::thread::Builder::new()
        .name("heci-dispatch".into())
        .stack_size(STACK_SIZE)
        .spawn(move || run_dispatch_loop(heci, thread_stop))?;
    Ok(Dispatcher { stop, thread })
}

// ── Tests ────────────────────────────────────────────────────
