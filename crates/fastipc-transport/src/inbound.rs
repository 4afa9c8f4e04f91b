use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::lifecycle::Lifecycle;
use crate::segment::{segment_name, signal_name, Segment, FRAME_AREA_OFFSET};
use crate::signal::WakeSignal;

struct ReaderState {
    segment: Segment,
    offset: usize,
    /// Counter value of the last frame consumed.
    last: i32,
    index: u32,
}

/// Synchronous reader over the segment chain of one direction.
pub struct SegmentReader {
    name: String,
    config: TransportConfig,
    signal: WakeSignal,
    lifecycle: Lifecycle,
    state: Mutex<ReaderState>,
}

impl SegmentReader {
    /// Create the direction: segment `.0` and the wake signal.
    pub fn create(name: &str, config: TransportConfig) -> Result<Self> {
        let segment = Segment::create(&segment_name(name, 0), config.min_segment_size)?;
        let signal = WakeSignal::open(&signal_name(name), true)?;
        Ok(Self::with_segment(name, config, segment, signal))
    }

    /// Attach to a direction whose segment `.0` the writer created.
    pub fn open(name: &str, config: TransportConfig) -> Result<Self> {
        let segment = Segment::open_with_retry(&segment_name(name, 0), config.open_timeout)?;
        let signal = WakeSignal::open(&signal_name(name), false)?;
        Ok(Self::with_segment(name, config, segment, signal))
    }

    fn with_segment(
        name: &str,
        config: TransportConfig,
        segment: Segment,
        signal: WakeSignal,
    ) -> Self {
        Self {
            name: name.to_string(),
            config,
            signal,
            lifecycle: Lifecycle::new(),
            state: Mutex::new(ReaderState {
                segment,
                offset: FRAME_AREA_OFFSET,
                last: 0,
                index: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish counter of the current segment, or `None` once disposed.
    pub fn poll_counter(&self) -> Option<i32> {
        let _guard = self.lifecycle.enter()?;
        self.lock_state().segment.publish_counter().ok()
    }

    /// Whether the writer has published a frame not yet consumed.
    pub fn has_pending(&self) -> bool {
        let Some(_guard) = self.lifecycle.enter() else {
            return false;
        };
        let state = self.lock_state();
        state
            .segment
            .publish_counter()
            .is_ok_and(|counter| is_ahead(counter, state.last))
    }

    /// Consume the next published frame.
    ///
    /// Returns `Ok(None)` once disposed and [`TransportError::NoPendingFrame`]
    /// when the writer has not published anything new. A sentinel is followed
    /// transparently and reported as an empty frame.
    pub fn read_next_frame(&self) -> Result<Option<Bytes>> {
        let Some(_guard) = self.lifecycle.enter() else {
            return Ok(None);
        };
        let mut state = self.lock_state();
        if !is_ahead(state.segment.publish_counter()?, state.last) {
            return Err(TransportError::NoPendingFrame);
        }

        let (payload, next_offset) = state.segment.read_frame(state.offset)?;
        state.last = state.last.wrapping_add(1);

        if !payload.is_empty() {
            state.offset = next_offset;
            return Ok(Some(payload));
        }

        state.segment.mark_reclaimed()?;
        let index = state.index + 1;
        let successor = Segment::open_with_retry(
            &segment_name(&self.name, index),
            self.config.open_timeout,
        )?;
        trace!(transport = %self.name, segment = %successor.name(), "followed continuation");
        state.segment = successor;
        state.index = index;
        state.offset = FRAME_AREA_OFFSET;
        Ok(Some(Bytes::new()))
    }

    /// Next user frame, skipping continuation sentinels.
    ///
    /// Returns `Ok(None)` when nothing new is published and
    /// [`TransportError::Disposed`] once disposed.
    pub fn try_next_message(&self) -> Result<Option<Bytes>> {
        loop {
            match self.read_next_frame() {
                Ok(Some(frame)) if frame.is_empty() => continue,
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => return Err(TransportError::Disposed),
                Err(TransportError::NoPendingFrame) => return Ok(None),
                Err(err) => return Err(err),
            }
        }
    }

    /// Block on the wake signal for at most the configured idle wait.
    pub fn wait(&self) -> Result<bool> {
        if self.lifecycle.is_released() {
            return Err(TransportError::Disposed);
        }
        self.signal.wait(self.config.idle_wait)
    }

    pub fn is_disposed(&self) -> bool {
        self.lifecycle.is_released()
    }

    /// Stop reading. Blocks until an in-progress read completes.
    pub fn dispose(&self) {
        if self.lifecycle.release() {
            debug!(transport = %self.name, "segment reader disposed");
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ReaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// The reading half of one transport direction, driven by its own thread.
pub struct InboundTransport {
    reader: Arc<SegmentReader>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    failed: Arc<AtomicBool>,
}

impl InboundTransport {
    /// Start reading `name` on a dedicated thread, handing every frame to
    /// `on_message` in write order.
    ///
    /// With `create` the direction is created here and the writer attaches
    /// later; otherwise the writer's segment `.0` is opened.
    pub fn spawn<F>(name: &str, create: bool, config: TransportConfig, on_message: F) -> Result<Self>
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        Self::spawn_with_failure(name, create, config, on_message, |_| {})
    }

    /// Like [`spawn`](Self::spawn), also calling `on_failure` on the reader
    /// thread if reading stops on an error rather than on dispose. No
    /// message is delivered after `on_failure`.
    pub fn spawn_with_failure<F, E>(
        name: &str,
        create: bool,
        config: TransportConfig,
        on_message: F,
        on_failure: E,
    ) -> Result<Self>
    where
        F: FnMut(Bytes) + Send + 'static,
        E: FnOnce(TransportError) + Send + 'static,
    {
        let reader = if create {
            SegmentReader::create(name, config)?
        } else {
            SegmentReader::open(name, config)?
        };
        let reader = Arc::new(reader);
        let failed = Arc::new(AtomicBool::new(false));

        let thread = thread::Builder::new()
            .name(format!("fastipc-in-{name}"))
            .spawn({
                let reader = Arc::clone(&reader);
                let failed = Arc::clone(&failed);
                move || {
                    if let Err(err) = run_reader(&reader, on_message) {
                        failed.store(true, Ordering::Release);
                        on_failure(err);
                    }
                }
            })?;
        let thread_id = thread.thread().id();

        Ok(Self {
            reader,
            thread: Mutex::new(Some(thread)),
            thread_id,
            failed,
        })
    }

    pub fn name(&self) -> &str {
        self.reader.name()
    }

    pub fn is_disposed(&self) -> bool {
        self.reader.is_disposed()
    }

    /// Whether the reader thread stopped on an error.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Stop the reader thread. No message is delivered after this returns,
    /// except when called from the reader thread itself, which exits once
    /// the current callback returns.
    pub fn dispose(&self) {
        self.reader.dispose();
        if let Err(err) = self.reader.signal.notify() {
            warn!(transport = %self.reader.name, error = %err, "failed to wake reader");
        }

        if thread::current().id() == self.thread_id {
            return;
        }
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(transport = %self.reader.name, "reader thread panicked");
            }
        }
    }
}

impl Drop for InboundTransport {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for InboundTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundTransport")
            .field("reader", &self.reader)
            .field("failed", &self.is_failed())
            .finish()
    }
}

/// Spin for a bounded number of idle polls after activity, then block on the
/// wake signal. Returns the error that stopped reading, if any.
fn run_reader<F>(reader: &SegmentReader, mut on_message: F) -> Result<()>
where
    F: FnMut(Bytes),
{
    debug!(transport = %reader.name, "reader thread started");
    let spin_budget = reader.config.spin_iterations;
    let mut idle = 0u32;

    loop {
        match reader.try_next_message() {
            Ok(Some(frame)) => {
                on_message(frame);
                idle = 0;
            }
            Ok(None) if idle < spin_budget => {
                idle += 1;
                std::hint::spin_loop();
            }
            Ok(None) => match reader.wait() {
                Ok(_) => {}
                Err(TransportError::Disposed) => break,
                Err(err) => {
                    error!(transport = %reader.name, error = %err, "wake signal failed");
                    return Err(err);
                }
            },
            Err(TransportError::Disposed) => break,
            Err(err) => {
                error!(transport = %reader.name, error = %err, "reader stopped");
                return Err(err);
            }
        }
    }
    debug!(transport = %reader.name, "reader thread stopped");
    Ok(())
}

fn is_ahead(counter: i32, last: i32) -> bool {
    counter.wrapping_sub(last) > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::OutboundTransport;
    use std::collections::HashMap;
    use std::sync::mpsc;
    use std::time::Duration;

    fn unique_name(tag: &str) -> String {
        format!(
            "fastipc-in-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        )
    }

    fn small_config() -> TransportConfig {
        TransportConfig {
            min_segment_size: 256,
            growth_factor: 2,
            spin_iterations: 50,
            idle_wait: Duration::from_millis(20),
            ..TransportConfig::default()
        }
    }

    #[test]
    fn counter_comparison_wraps() {
        assert!(is_ahead(1, 0));
        assert!(!is_ahead(0, 0));
        assert!(!is_ahead(0, 1));
        assert!(is_ahead(i32::MIN, i32::MAX));
    }

    #[test]
    fn read_before_publish_reports_no_pending_frame() {
        let name = unique_name("nopending");
        let reader = SegmentReader::create(&name, small_config()).unwrap();
        assert_eq!(reader.poll_counter(), Some(0));
        assert!(!reader.has_pending());
        assert!(matches!(
            reader.read_next_frame(),
            Err(TransportError::NoPendingFrame)
        ));
    }

    #[test]
    fn disposed_reader_returns_none() {
        let name = unique_name("disposed");
        let reader = SegmentReader::create(&name, small_config()).unwrap();
        reader.dispose();
        assert_eq!(reader.poll_counter(), None);
        assert!(reader.read_next_frame().unwrap().is_none());
        assert!(matches!(
            reader.try_next_message(),
            Err(TransportError::Disposed)
        ));
    }

    #[test]
    fn sentinel_is_reported_as_empty_frame() {
        let name = unique_name("sentinel");
        let config = TransportConfig {
            min_segment_size: 64,
            growth_factor: 1,
            ..small_config()
        };
        let writer = OutboundTransport::create(&name, config.clone()).unwrap();
        let reader = SegmentReader::open(&name, config).unwrap();

        writer.write(&[1; 40]).unwrap();
        writer.write(&[2; 40]).unwrap();

        assert_eq!(reader.read_next_frame().unwrap().unwrap().len(), 40);
        assert!(reader.read_next_frame().unwrap().unwrap().is_empty());
        assert_eq!(reader.read_next_frame().unwrap().unwrap()[0], 2);
    }

    #[test]
    fn read_failure_is_reported_once() {
        let name = unique_name("failure");
        let config = TransportConfig {
            open_timeout: Duration::from_millis(50),
            ..small_config()
        };
        let (tx, rx) = mpsc::channel();
        let inbound = InboundTransport::spawn_with_failure(
            &name,
            true,
            config,
            |_| {},
            move |err| {
                let _ = tx.send(err);
            },
        )
        .unwrap();
        assert!(!inbound.is_failed());

        // A published counter with no frame behind it reads as a hand-off to
        // a successor segment that never appears.
        let segment = Segment::open(&segment_name(&name, 0)).unwrap();
        segment.publish(1).unwrap();

        let err = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(err, TransportError::Open { .. }), "{err:?}");
        assert!(inbound.is_failed());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        inbound.dispose();
    }

    #[test]
    fn dispose_is_not_a_failure() {
        let name = unique_name("clean");
        let (tx, rx) = mpsc::channel::<TransportError>();
        let inbound = InboundTransport::spawn_with_failure(
            &name,
            true,
            small_config(),
            |_| {},
            move |err| {
                let _ = tx.send(err);
            },
        )
        .unwrap();
        inbound.dispose();
        assert!(!inbound.is_failed());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn spawned_reader_delivers_in_order() {
        let name = unique_name("order");
        let (tx, rx) = mpsc::channel();
        let inbound = InboundTransport::spawn(&name, true, small_config(), move |frame| {
            let _ = tx.send(frame.to_vec());
        })
        .unwrap();
        let writer = OutboundTransport::open(&name, small_config()).unwrap();

        for i in 0..500u32 {
            writer.write(&i.to_le_bytes()).unwrap();
        }
        for i in 0..500u32 {
            let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(frame, i.to_le_bytes());
        }
        assert!(writer.segment_count() > 1);
        inbound.dispose();
    }

    #[test]
    fn concurrent_writers_never_tear_frames() {
        let name = unique_name("concurrent");
        let (tx, rx) = mpsc::channel();
        let inbound = InboundTransport::spawn(&name, true, small_config(), move |frame| {
            let _ = tx.send(frame);
        })
        .unwrap();
        let writer = Arc::new(OutboundTransport::open(&name, small_config()).unwrap());

        let writers: Vec<_> = (0..4u8)
            .map(|id| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || {
                    for seq in 0..200u16 {
                        // [writer id][seq LE][len][len bytes of filler]
                        let len = (seq % 37) as u8 + 1;
                        let mut payload = vec![id];
                        payload.extend_from_slice(&seq.to_le_bytes());
                        payload.push(len);
                        payload.extend(std::iter::repeat(id).take(usize::from(len)));
                        writer.write(&payload).unwrap();
                    }
                })
            })
            .collect();
        for handle in writers {
            handle.join().unwrap();
        }

        let mut next_seq: HashMap<u8, u16> = HashMap::new();
        for _ in 0..800 {
            let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let id = frame[0];
            let seq = u16::from_le_bytes([frame[1], frame[2]]);
            let len = usize::from(frame[3]);
            assert_eq!(frame.len(), 4 + len);
            assert!(frame[4..].iter().all(|b| *b == id));

            let expected = next_seq.entry(id).or_insert(0);
            assert_eq!(seq, *expected);
            *expected += 1;
        }
        inbound.dispose();
    }

    #[test]
    fn dispose_stops_delivery() {
        let name = unique_name("stop");
        let (tx, rx) = mpsc::channel();
        let inbound = InboundTransport::spawn(&name, true, small_config(), move |frame| {
            let _ = tx.send(frame);
        })
        .unwrap();
        let writer = OutboundTransport::open(&name, small_config()).unwrap();

        writer.write(b"before").unwrap();
        assert_eq!(
            &rx.recv_timeout(Duration::from_secs(5)).unwrap()[..],
            b"before"
        );

        inbound.dispose();
        assert!(inbound.is_disposed());
        writer.write(b"after").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn dispose_from_callback_does_not_deadlock() {
        let name = unique_name("selfdispose");
        let slot: Arc<Mutex<Option<Arc<InboundTransport>>>> = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel();

        let inbound = Arc::new(
            InboundTransport::spawn(&name, true, small_config(), {
                let slot = Arc::clone(&slot);
                move |_frame| {
                    if let Some(inbound) = slot.lock().unwrap().take() {
                        inbound.dispose();
                    }
                    let _ = tx.send(());
                }
            })
            .unwrap(),
        );
        *slot.lock().unwrap() = Some(Arc::clone(&inbound));
        let writer = OutboundTransport::open(&name, small_config()).unwrap();

        writer.write(b"stop").unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(inbound.is_disposed());
    }
}
