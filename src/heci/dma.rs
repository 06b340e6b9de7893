//! DMA offload: host-donated window, page allocator, copy engine.
//!
//! The host donates one page-aligned buffer in its memory with
//! DMA_ALLOC_NOTIFY. Large outbound messages are copied into a run of
//! free pages by the copy engine and announced with DMA_XFER_REQ; the
//! host returns the pages with DMA_XFER_ACK.
//!
//! ```text
//!  window:  base ─┬──────┬──────┬──────┬──────┬─ ... ─┐
//!                 │ pg 0 │ pg 1 │ pg 2 │ pg 3 │       │  ≤ MAX_DMA_PAGES
//!                 └──────┴──────┴──────┴──────┴─ ... ─┘
//!  bitmap:           1      1      0      1
//!                   └─ live xfer ─┘       └─ live xfer
//! ```
//!
//! Two lock domains: the window (bitmap + live transfers) behind a
//! blocking mutex, and the single engine behind an async mutex that is
//! held across the completion wait.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, with_timeout};
use heapless::Vec;
use log::{debug, warn};

use super::wire::XferEntry;
use crate::error::DmaError;

/// Upper bound on window pages; larger windows are clamped.
pub const MAX_DMA_PAGES: usize = 256;

const BITMAP_WORDS: usize = MAX_DMA_PAGES / 32;

// ── Copy engine ──────────────────────────────────────────────

/// Completion signal raised from the DMA interrupt.
pub struct DmaCompletion(Signal<CriticalSectionRawMutex, ()>);

impl DmaCompletion {
    pub const fn new() -> Self {
        Self(Signal::new())
    }

    pub fn signal(&self) {
        self.0.signal(());
    }

    fn reset(&self) {
        self.0.reset();
    }

    async fn wait(&self) {
        self.0.wait().await;
    }
}

impl Default for DmaCompletion {
    fn default() -> Self {
        Self::new()
    }
}

/// One local-to-window copy.
#[derive(Debug, Clone, Copy)]
pub struct Transfer<'a> {
    pub src: &'a [u8],
    /// Host physical address inside the window.
    pub dst: u64,
}

/// Hardware memory-to-memory copy engine.
///
/// `start_transfer` programs the engine and returns; the platform's DMA
/// interrupt must end up in [`DmaCompletion::signal`] (via
/// `Heci::on_dma_interrupt`).
pub trait DmaEngine: Send {
    /// `false` for platforms without a copy engine. The driver then
    /// refuses host windows and never takes the DMA path.
    const PRESENT: bool = true;

    fn start_transfer(&mut self, xfer: Transfer<'_>, done: &DmaCompletion) -> Result<(), DmaError>;

    fn abort_transfer(&mut self);

    /// Write back cached lines covering `buf` before the engine reads it.
    fn clean_dcache(&mut self, _buf: &[u8]) {}
}

/// Engine for platforms without DMA.
pub struct NoDma;

impl DmaEngine for NoDma {
    const PRESENT: bool = false;

    fn start_transfer(&mut self, _xfer: Transfer<'_>, _done: &DmaCompletion) -> Result<(), DmaError> {
        Err(DmaError::EngineFault)
    }

    fn abort_transfer(&mut self) {}
}

// ── Page bitmap ──────────────────────────────────────────────

/// First-fit allocator over window pages.
pub struct PageBitmap {
    bits: [u32; BITMAP_WORDS],
    n_pages: usize,
}

impl PageBitmap {
    pub fn new(n_pages: usize) -> Self {
        Self {
            bits: [0; BITMAP_WORDS],
            n_pages: n_pages.min(MAX_DMA_PAGES),
        }
    }

    pub fn n_pages(&self) -> usize {
        self.n_pages
    }

    pub fn is_used(&self, page: usize) -> bool {
        self.bits[page / 32] & (1 << (page % 32)) != 0
    }

    pub fn used(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Reserve `count` contiguous pages; returns the first page index.
    pub fn alloc(&mut self, count: usize) -> Option<usize> {
        if count == 0 || count > self.n_pages {
            return None;
        }
        let mut run = 0;
        for page in 0..self.n_pages {
            if self.is_used(page) {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                let start = page + 1 - count;
                for p in start..=page {
                    self.bits[p / 32] |= 1 << (p % 32);
                }
                return Some(start);
            }
        }
        None
    }

    pub fn free(&mut self, start: usize, count: usize) {
        for p in start..(start + count).min(self.n_pages) {
            self.bits[p / 32] &= !(1 << (p % 32));
        }
    }
}

// ── Window ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LiveTransfer {
    entry: XferEntry,
    first_page: usize,
    n_pages: usize,
}

struct DmaWindow {
    base: u64,
    pages: PageBitmap,
    live: Vec<LiveTransfer, MAX_DMA_PAGES>,
}

struct WindowState {
    window: Option<DmaWindow>,
    /// Bumped on every re-notification so stale reservations are dropped.
    generation: u32,
}

/// Pages reserved for one outbound message, not yet announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub host_addr: u64,
    pub len: u32,
    first_page: usize,
    n_pages: usize,
    generation: u32,
}

impl Reservation {
    pub fn entry(&self) -> XferEntry {
        XferEntry {
            host_addr: self.host_addr,
            len: self.len,
        }
    }
}

// ── Offload ──────────────────────────────────────────────────

pub struct DmaOffload<E> {
    window: BlockingMutex<CriticalSectionRawMutex, RefCell<WindowState>>,
    engine: Mutex<CriticalSectionRawMutex, E>,
    done: DmaCompletion,
    page_size: u32,
    timeout: Duration,
}

impl<E: DmaEngine> DmaOffload<E> {
    pub fn new(engine: E, page_size: u32, timeout_ms: u32) -> Self {
        Self {
            window: BlockingMutex::new(RefCell::new(WindowState {
                window: None,
                generation: 0,
            })),
            engine: Mutex::new(engine),
            done: DmaCompletion::new(),
            page_size,
            timeout: Duration::from_millis(u64::from(timeout_ms)),
        }
    }

    /// Install (or replace) the host window. Live transfers of a
    /// previous window are discarded.
    pub fn install_window(&self, base: u64, size: u32) -> Result<usize, DmaError> {
        if !E::PRESENT {
            warn!("HECI[dma]: no copy engine, refusing window");
            return Err(DmaError::NotReady);
        }
        let page = u64::from(self.page_size);
        if size == 0 || u64::from(size) % page != 0 || base % page != 0 {
            warn!("HECI[dma]: window {:#x}+{:#x} not page aligned", base, size);
            return Err(DmaError::BadWindow);
        }
        let n_pages = (size / self.page_size) as usize;
        if n_pages > MAX_DMA_PAGES {
            debug!("HECI[dma]: clamping window to {} pages", MAX_DMA_PAGES);
        }
        let pages = PageBitmap::new(n_pages);
        let n_pages = pages.n_pages();
        self.window.lock(|w| {
            let mut w = w.borrow_mut();
            w.generation = w.generation.wrapping_add(1);
            w.window = Some(DmaWindow {
                base,
                pages,
                live: Vec::new(),
            });
        });
        debug!("HECI[dma]: window {:#x}, {} pages", base, n_pages);
        Ok(n_pages)
    }

    pub fn is_ready(&self) -> bool {
        self.window.lock(|w| w.borrow().window.is_some())
    }

    /// Pages currently reserved or live.
    pub fn used_pages(&self) -> usize {
        self.window
            .lock(|w| w.borrow().window.as_ref().map_or(0, |w| w.pages.used()))
    }

    /// Reserve contiguous pages for `len` bytes. Never blocks.
    pub fn reserve(&self, len: usize) -> Result<Reservation, DmaError> {
        let n_pages = len.div_ceil(self.page_size as usize);
        self.window.lock(|w| {
            let mut w = w.borrow_mut();
            let generation = w.generation;
            let window = w.window.as_mut().ok_or(DmaError::NotReady)?;
            let first_page = window.pages.alloc(n_pages).ok_or(DmaError::NoPages)?;
            Ok(Reservation {
                host_addr: window.base + first_page as u64 * u64::from(self.page_size),
                len: len as u32,
                first_page,
                n_pages,
                generation,
            })
        })
    }

    /// Give back a reservation that was never announced.
    pub fn release(&self, res: Reservation) {
        self.window.lock(|w| {
            let mut w = w.borrow_mut();
            if w.generation != res.generation {
                return;
            }
            if let Some(window) = w.window.as_mut() {
                window.pages.free(res.first_page, res.n_pages);
            }
        });
    }

    /// Mark a reservation as announced to the host; its pages stay taken
    /// until a matching transfer ack.
    pub fn commit(&self, res: Reservation) {
        self.window.lock(|w| {
            let mut w = w.borrow_mut();
            if w.generation != res.generation {
                return;
            }
            if let Some(window) = w.window.as_mut() {
                let live = LiveTransfer {
                    entry: res.entry(),
                    first_page: res.first_page,
                    n_pages: res.n_pages,
                };
                // One entry per page at most, so the list cannot overflow.
                let _ = window.live.push(live);
            }
        });
    }

    /// Free every live transfer named in `entries`. Unknown or repeated
    /// entries are ignored. Returns how many transfers were freed.
    pub fn ack(&self, entries: &[XferEntry]) -> usize {
        self.window.lock(|w| {
            let mut w = w.borrow_mut();
            let Some(window) = w.window.as_mut() else {
                warn!("HECI[dma]: transfer ack without a window");
                return 0;
            };
            let mut freed = 0;
            for entry in entries {
                match window.live.iter().position(|t| t.entry == *entry) {
                    Some(i) => {
                        let t = window.live.swap_remove(i);
                        window.pages.free(t.first_page, t.n_pages);
                        freed += 1;
                    }
                    None => debug!(
                        "HECI[dma]: ack for unknown transfer {:#x}+{}",
                        entry.host_addr, entry.len
                    ),
                }
            }
            freed
        })
    }

    /// Run one copy on the engine and wait for its completion interrupt.
    /// On timeout the engine transfer is aborted.
    pub async fn copy(&self, xfer: Transfer<'_>) -> Result<(), DmaError> {
        let mut engine = self.engine.lock().await;
        self.done.reset();
        engine.clean_dcache(xfer.src);
        engine.start_transfer(xfer, &self.done)?;
        self.wait(&mut *engine).await
    }

    async fn wait(&self, engine: &mut E) -> Result<(), DmaError> {
        if with_timeout(self.timeout, self.done.wait()).await.is_err() {
            warn!("HECI[dma]: copy engine timed out, aborting");
            engine.abort_transfer();
            return Err(DmaError::Timeout);
        }
        Ok(())
    }

    /// Completion interrupt entry point.
    pub fn on_interrupt(&self) {
        self.done.signal();
    }
}

// ── Tests ────────────────────────────────────────────────────
