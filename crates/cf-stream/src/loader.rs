//! Process-global stream loader thread.
//!
//! A single background thread drains an MPSC work queue of refill requests.
//! Deduplication lives on the instances themselves: an `enqueued` flag makes
//! repeat requests no-ops while one is in flight, and a `processing` flag
//! lets `wait_until_idle` establish exclusive access before control-thread
//! mutation of loader-owned state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::stream_data::StreamWaveData;

struct Loader {
    sender: Sender<Arc<StreamWaveData>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

static LOADER: OnceLock<Loader> = OnceLock::new();

fn loader() -> &'static Loader {
    LOADER.get_or_init(|| {
        let (sender, receiver) = unbounded::<Arc<StreamWaveData>>();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name("cf-stream-loader".into())
            .spawn(move || loader_thread(receiver, thread_running))
            .ok();
        Loader {
            sender,
            running,
            handle: Mutex::new(handle),
        }
    })
}

fn loader_thread(receiver: Receiver<Arc<StreamWaveData>>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        match receiver.recv_timeout(Duration::from_millis(1)) {
            Ok(instance) => {
                // `processing` is raised before `enqueued` clears so
                // wait_until_idle never observes a gap between the two.
                instance.processing.store(true, Ordering::Release);
                instance.enqueued.store(false, Ordering::Release);

                if instance.is_active() {
                    instance.fill_ring_buffer();
                }

                instance.processing.store(false, Ordering::Release);
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Queue a refill for the instance. An in-flight request subsumes new ones.
pub(crate) fn enqueue(instance: &Arc<StreamWaveData>) {
    if instance.enqueued.swap(true, Ordering::AcqRel) {
        return;
    }
    if loader().sender.send(Arc::clone(instance)).is_err() {
        instance.enqueued.store(false, Ordering::Release);
    }
}

/// Stop the loader thread. Intended for orderly shutdown; streams created
/// afterwards fall back to their synchronous prefill only.
pub fn shutdown_loader() {
    if let Some(loader) = LOADER.get() {
        loader.running.store(false, Ordering::Release);
        if let Some(handle) = loader.handle.lock().take() {
            let _ = handle.join();
        }
    }
}
