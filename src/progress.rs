//! Progress reporting and the soft memory throttle.
//!
//! A background ticker logs task status (percent read, line rate, byte
//! rate) at a fixed interval; writers and the processor register extra
//! gauges. The memory throttle samples resident set size and raises a flag
//! the line dispatcher consults between lines; it is backpressure only,
//! correctness never depends on it.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Bytes,
    Gauge,
}

/// A named counter shown alongside progress status.
#[derive(Clone)]
pub struct Metric {
    pub name: String,
    pub kind: MetricKind,
    pub value: Arc<AtomicI64>,
}

struct Ticker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Line and byte progress for one task at a time.
pub struct Progress {
    interval: Duration,
    enabled: bool,
    lines: AtomicI64,
    metrics: Mutex<Vec<Metric>>,
    ticker: Mutex<Option<Ticker>>,
}

impl Progress {
    pub fn new(interval: Duration, enabled: bool) -> Self {
        Progress {
            interval,
            enabled,
            lines: AtomicI64::new(0),
            metrics: Mutex::new(Vec::new()),
            ticker: Mutex::new(None),
        }
    }

    /// Begin reporting a task; `current` tracks bytes consumed of `total`.
    pub fn start(self: &Arc<Self>, total: u64, current: Arc<AtomicI64>, task: &str) {
        self.lines.store(0, Ordering::Relaxed);

        if !self.enabled {
            return;
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let me = Arc::clone(self);
        let task = task.to_string();
        let started = Instant::now();

        let handle = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(me.interval) {
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    me.report(&task, total, &current, started);
                }
                _ => return,
            }
        });

        *self.ticker.lock().expect("progress ticker poisoned") =
            Some(Ticker { stop: stop_tx, handle });
    }

    fn report(&self, task: &str, total: u64, current: &AtomicI64, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64().max(1e-6);
        let bytes = current.load(Ordering::Relaxed) as f64;
        let lines = self.lines.load(Ordering::Relaxed);

        let done_percent = if total > 0 { 100.0 * bytes / total as f64 } else { 0.0 };
        let speed_mbps = bytes / elapsed / (1024.0 * 1024.0);
        let speed_lps = lines as f64 / elapsed;

        let mut status = format!(
            "{}: {:.1}% bytes read, {} lines processed, {:.1} l/s, {:.1} MB/s, elapsed {:.1}s",
            task, done_percent, lines, speed_lps, speed_mbps, elapsed
        );

        for m in self.metrics.lock().expect("progress metrics poisoned").iter() {
            let v = m.value.load(Ordering::Relaxed);
            match m.kind {
                MetricKind::Bytes => {
                    status.push_str(&format!(
                        ", {}: {:.1} MB/s",
                        m.name,
                        v as f64 / (elapsed * 1024.0 * 1024.0)
                    ));
                }
                MetricKind::Gauge => {
                    status.push_str(&format!(", {}: {}", m.name, v));
                }
            }
        }

        tracing::info!("{}", status);
    }

    /// Stop the ticker for the current task.
    pub fn stop(&self) {
        if let Some(t) = self.ticker.lock().expect("progress ticker poisoned").take() {
            let _ = t.stop.send(());
            let _ = t.handle.join();
        }
    }

    /// Reset line counting and metrics between passes.
    pub fn reset(&self) {
        self.stop();
        self.lines.store(0, Ordering::Relaxed);
        self.metrics.lock().expect("progress metrics poisoned").clear();
    }

    pub fn add_metric(&self, name: impl Into<String>, kind: MetricKind, value: Arc<AtomicI64>) {
        self.metrics
            .lock()
            .expect("progress metrics poisoned")
            .push(Metric { name: name.into(), kind, value });
    }

    pub fn count_line(&self) -> i64 {
        self.lines.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn lines(&self) -> i64 {
        self.lines.load(Ordering::Relaxed)
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        if let Some(t) = self.ticker.lock().expect("progress ticker poisoned").take() {
            let _ = t.stop.send(());
            let _ = t.handle.join();
        }
    }
}

/// Read wrapper counting consumed bytes.
pub struct CountingReader<R> {
    inner: R,
    bytes: Arc<AtomicI64>,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        CountingReader { inner, bytes: Arc::new(AtomicI64::new(0)) }
    }

    pub fn bytes(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.bytes)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes.fetch_add(n as i64, Ordering::Relaxed);
        Ok(n)
    }
}

/// Write wrapper counting written bytes.
pub struct CountingWriter<W> {
    inner: W,
    bytes: Arc<AtomicI64>,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        CountingWriter { inner, bytes: Arc::new(AtomicI64::new(0)) }
    }

    pub fn bytes(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.bytes)
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.bytes.fetch_add(n as i64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Soft heap limit watcher.
///
/// Samples resident set size every ~100 ms and raises `flag` while usage
/// exceeds the limit. The dispatcher clears the flag after its pause.
pub struct MemoryThrottle {
    pub flag: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MemoryThrottle {
    pub fn start(limit_mb: usize) -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        if limit_mb == 0 || heap_in_use().is_none() {
            return MemoryThrottle { flag, stop, handle: None };
        }

        let limit = (limit_mb as u64) * 1024 * 1024;
        let f = Arc::clone(&flag);
        let s = Arc::clone(&stop);

        let handle = std::thread::spawn(move || {
            while !s.load(Ordering::Relaxed) {
                if let Some(used) = heap_in_use() {
                    if used > limit {
                        f.store(true, Ordering::Relaxed);
                    }
                }

                std::thread::sleep(Duration::from_millis(100));
            }
        });

        MemoryThrottle { flag, stop, handle: Some(handle) }
    }
}

impl Drop for MemoryThrottle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Resident set size in bytes, from `/proc/self/statm`.
#[cfg(target_os = "linux")]
fn heap_in_use() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = content.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn heap_in_use() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_reader() {
        let data = b"hello world";
        let mut r = CountingReader::new(&data[..]);
        let bytes = CountingReader::bytes(&r);

        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();

        assert_eq!(out, data);
        assert_eq!(bytes.load(Ordering::Relaxed), data.len() as i64);
    }

    #[test]
    fn test_counting_writer() {
        let mut w = CountingWriter::new(Vec::new());
        let bytes = w.bytes();

        w.write_all(b"abc").unwrap();
        w.flush().unwrap();

        assert_eq!(bytes.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_count_line_is_monotonic() {
        let p = Progress::new(Duration::from_secs(5), false);
        assert_eq!(p.count_line(), 1);
        assert_eq!(p.count_line(), 2);
        assert_eq!(p.lines(), 2);
    }

    #[test]
    fn test_disabled_throttle_never_flags() {
        let t = MemoryThrottle::start(0);
        assert!(!t.flag.load(Ordering::Relaxed));
    }
}
