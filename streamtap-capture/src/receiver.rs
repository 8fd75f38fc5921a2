//! ## streamtap-capture::receiver
//! **Receive thread shared by the capture backends**
//!
//! The thread keeps exactly one receive outstanding: it draws a buffer from
//! the pool, receives into it, pushes the filled buffer onto the ready queue
//! and immediately draws the next one. The consumer owns each frame until it
//! drops it, which returns the buffer to the pool.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::queue::SegQueue;
use streamtap_core::alloc::BufferPool;
use streamtap_core::time::EpochClock;
use streamtap_core::PoolError;
use tracing::{debug, error, warn};

use crate::packet::CapturedFrame;

/// Upper bound on a single wait for a free buffer, so the stop flag is
/// observed while the consumer is holding every buffer.
const POOL_WAIT: Duration = Duration::from_millis(100);

/// Something the receive thread can pull raw frames from.
pub trait FrameSource: Send + 'static {
    /// Receives one frame into `buf`. `WouldBlock`, `TimedOut` and
    /// `Interrupted` are treated as an idle tick; `Ok(0)` means nothing usable
    /// arrived.
    fn recv_into(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

pub struct CaptureWorker {
    ready: Arc<SegQueue<CapturedFrame>>,
    stop: Arc<AtomicBool>,
    healthy: Arc<AtomicBool>,
    pool: BufferPool,
    handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    pub fn spawn<S: FrameSource>(
        name: &str,
        source: S,
        pool: BufferPool,
        clock: Arc<dyn EpochClock>,
    ) -> io::Result<Self> {
        let ready = Arc::new(SegQueue::new());
        let stop = Arc::new(AtomicBool::new(false));
        let healthy = Arc::new(AtomicBool::new(true));

        let handle = {
            let ready = Arc::clone(&ready);
            let stop = Arc::clone(&stop);
            let healthy = Arc::clone(&healthy);
            let pool = pool.clone();
            thread::Builder::new().name(name.to_string()).spawn(move || {
                receive_loop(source, &pool, &ready, &stop, &healthy, clock.as_ref())
            })?
        };

        Ok(Self {
            ready,
            stop,
            healthy,
            pool,
            handle: Some(handle),
        })
    }

    pub fn poll_next(&self) -> Option<CapturedFrame> {
        if self.stop.load(Ordering::Acquire) {
            return None;
        }
        self.ready.pop()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Sets the stop flag and blocks until the receive thread has exited.
    /// Frames still queued are dropped. Safe to call more than once.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.pool.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Capture receive thread panicked");
            }
        }
        while self.ready.pop().is_some() {}
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop<S: FrameSource>(
    mut source: S,
    pool: &BufferPool,
    ready: &SegQueue<CapturedFrame>,
    stop: &AtomicBool,
    healthy: &AtomicBool,
    clock: &dyn EpochClock,
) {
    while !stop.load(Ordering::Acquire) {
        let mut buffer = match pool.acquire(POOL_WAIT) {
            Ok(buffer) => buffer,
            Err(PoolError::Exhausted) => continue,
            Err(_) => break,
        };

        match source.recv_into(buffer.spare_mut()) {
            Ok(0) => {}
            Ok(len) => {
                buffer.set_len(len);
                ready.push(CapturedFrame::new(buffer, clock.now_ms()));
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                if stop.load(Ordering::Acquire) {
                    debug!(error = %e, "Receive aborted by shutdown");
                    break;
                }
                error!(error = %e, "Capture receive failed");
                healthy.store(false, Ordering::Release);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::{unbounded, Receiver, Sender};
    use std::time::Instant;
    use streamtap_core::alloc::PoolPolicy;
    use streamtap_core::time::ManualClock;
    use tracing_test::traced_test;

    struct ChannelSource(Receiver<io::Result<Vec<u8>>>);

    impl FrameSource for ChannelSource {
        fn recv_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.recv_timeout(Duration::from_millis(5)) {
                Ok(Ok(data)) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    Ok(len)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(io::ErrorKind::TimedOut.into()),
            }
        }
    }

    fn worker(capacity: usize) -> (CaptureWorker, Sender<io::Result<Vec<u8>>>) {
        let (tx, rx) = unbounded();
        let pool = BufferPool::new(capacity, 64, PoolPolicy::Bounded).unwrap();
        let worker = CaptureWorker::spawn(
            "capture-test",
            ChannelSource(rx),
            pool,
            Arc::new(ManualClock::new(42)),
        )
        .unwrap();
        (worker, tx)
    }

    fn poll_within(worker: &CaptureWorker, limit: Duration) -> Option<CapturedFrame> {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if let Some(frame) = worker.poll_next() {
                return Some(frame);
            }
            thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn frames_arrive_in_order_with_epoch() {
        let (mut worker, tx) = worker(4);
        tx.send(Ok(vec![1, 2, 3])).unwrap();
        tx.send(Ok(vec![4])).unwrap();

        let first = poll_within(&worker, Duration::from_secs(2)).unwrap();
        let second = poll_within(&worker, Duration::from_secs(2)).unwrap();
        assert_eq!(first.data(), &[1, 2, 3]);
        assert_eq!(second.data(), &[4]);
        assert_eq!(first.epoch(), 42);
        worker.stop();
    }

    #[test]
    fn held_frames_block_the_receiver_until_dropped() {
        let (mut worker, tx) = worker(2);
        for n in 0..3u8 {
            tx.send(Ok(vec![n])).unwrap();
        }

        let a = poll_within(&worker, Duration::from_secs(2)).unwrap();
        let b = poll_within(&worker, Duration::from_secs(2)).unwrap();
        assert!(poll_within(&worker, Duration::from_millis(50)).is_none());
        assert_eq!(worker.pool().free_len(), 0);

        drop(a);
        let c = poll_within(&worker, Duration::from_secs(2)).unwrap();
        assert_eq!(c.data(), &[2]);
        drop((b, c));
        worker.stop();
    }

    #[test]
    #[traced_test]
    fn receive_error_marks_socket_unhealthy() {
        let (mut worker, tx) = worker(2);
        tx.send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "boom")))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while worker.is_healthy() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!worker.is_healthy());
        assert!(logs_contain("Capture receive failed"));
        worker.stop();
    }

    #[test]
    fn stop_is_idempotent_and_drains_queue() {
        let (mut worker, tx) = worker(4);
        tx.send(Ok(vec![9])).unwrap();
        thread::sleep(Duration::from_millis(50));

        worker.stop();
        worker.stop();
        assert!(!worker.is_running());
        assert!(worker.poll_next().is_none());
        assert!(worker.is_healthy());
    }
}
