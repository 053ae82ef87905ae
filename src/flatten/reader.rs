//! Line scanning and concurrent dispatch.
//!
//! One scanner thread assigns sequence numbers in input order and hands
//! line copies to a bounded pool of workers. Each worker owns its walker
//! sink, path buffer and segment list, reused across lines. Both passes run
//! through the same machinery and differ only in the sink they install.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::bounded;
use flate2::read::MultiGzDecoder;
use regex::Regex;
use serde_json::Value as Json;

use crate::error::{KilnError, Result};
use crate::flatten::walker::{WalkSink, Walker};
use crate::progress::{CountingReader, Progress};

/// Per-pass hooks installed by the processor.
pub trait LineSink: Send + Sync {
    type Walk: WalkSink + Send;

    /// Build a walker sink for one worker.
    fn walk_sink(&self) -> Self::Walk;

    fn line_started(&self, _seq: i64, _n: i64) -> Result<()> {
        Ok(())
    }

    fn line_finished(&self, _seq: i64, _n: i64) -> Result<()> {
        Ok(())
    }
}

struct Job {
    seq: i64,
    n: i64,
    line: Vec<u8>,
}

/// Scans input lines and dispatches them to the worker pool.
pub struct LineReader {
    pub concurrency: usize,
    pub add_sequence: bool,
    pub max_lines: i64,
    pub offset_lines: i64,
    pub buf_size: usize,
    pub match_prefix: Option<Regex>,

    pub sequence: AtomicI64,
    pub errors: Arc<AtomicI64>,
    pub throttle: Arc<AtomicBool>,
    pub progress: Arc<Progress>,
}

/// An open input with decompression applied.
pub struct ReadSession {
    reader: Box<dyn BufRead + Send>,
    pub name: String,
}

impl LineReader {
    /// Open an input file, wiring byte counting into progress.
    ///
    /// Empty files surface [`KilnError::EmptyInput`] so the caller can
    /// decide whether that is fatal.
    pub fn session(&self, path: &Path, task: &str) -> Result<ReadSession> {
        let name = path.display().to_string();

        let file = std::fs::File::open(path)
            .map_err(|e| KilnError::io(format!("failed to open file {}", name), e))?;
        let meta = file
            .metadata()
            .map_err(|e| KilnError::io(format!("failed to read file stats {}", name), e))?;

        if meta.len() == 0 {
            return Err(KilnError::EmptyInput(name));
        }

        let counting = CountingReader::new(file);
        let bytes = CountingReader::bytes(&counting);
        self.progress.start(meta.len(), bytes, task);

        let low = name.to_lowercase();
        let reader: Box<dyn BufRead + Send> = if low.ends_with(".gz") {
            Box::new(BufReader::new(MultiGzDecoder::new(counting)))
        } else if low.ends_with(".zst") {
            let dec = zstd::stream::read::Decoder::new(counting)
                .map_err(|e| KilnError::io(format!("failed to init zstd reader for {}", name), e))?;
            Box::new(BufReader::new(dec))
        } else {
            Box::new(BufReader::with_capacity(64 * 1024, counting))
        };

        Ok(ReadSession { reader, name })
    }

    /// Read every line of the session through the worker pool.
    ///
    /// When `single_key` is set, workers walk only that path instead of the
    /// whole document.
    pub fn read<H: LineSink>(
        &self,
        mut sess: ReadSession,
        walker: &Walker,
        handler: &H,
        single_key: Option<&[String]>,
    ) -> Result<()> {
        let concurrency = self.concurrency.max(1);

        let (job_tx, job_rx) = bounded::<Job>(concurrency);
        let (buf_tx, buf_rx) = bounded::<Vec<u8>>(concurrency * 2);

        let stop = AtomicBool::new(false);
        let first_err: Mutex<Option<KilnError>> = Mutex::new(None);
        let mut scan_err: Option<KilnError> = None;

        std::thread::scope(|scope| {
            for _ in 0..concurrency {
                let job_rx = job_rx.clone();
                let buf_tx = buf_tx.clone();
                let stop = &stop;
                let first_err = &first_err;

                scope.spawn(move || {
                    let mut sink = handler.walk_sink();
                    let mut flat_path: Vec<u8> = Vec::with_capacity(512);
                    let mut segments: Vec<String> = Vec::with_capacity(20);

                    while let Ok(job) = job_rx.recv() {
                        let res = self.run_line(
                            &job,
                            walker,
                            handler,
                            &mut sink,
                            &mut flat_path,
                            &mut segments,
                            single_key,
                        );

                        let _ = buf_tx.try_send(job.line);

                        if let Err(e) = res {
                            let mut fe = first_err.lock().expect("first error poisoned");
                            if fe.is_none() {
                                *fe = Some(e);
                            }
                            stop.store(true, Ordering::Relaxed);
                        }
                    }
                });
            }

            drop(job_rx);
            drop(buf_tx);

            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }

                let mut line = buf_rx.try_recv().unwrap_or_default();
                line.clear();

                match sess.reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        scan_err = Some(KilnError::io(format!("scan failed: {}", sess.name), e));
                        break;
                    }
                }

                if line.last() == Some(&b'\n') {
                    line.pop();
                }
                if line.last() == Some(&b'\r') {
                    line.pop();
                }

                if line.len() > self.buf_size {
                    scan_err = Some(KilnError::io(
                        format!("scan failed: {}", sess.name),
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("line exceeds buffer size of {} bytes", self.buf_size),
                        ),
                    ));
                    break;
                }

                let n = self.progress.count_line();

                if self.offset_lines > 0 && n <= self.offset_lines {
                    continue;
                }

                let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

                if job_tx.send(Job { seq, n, line }).is_err() {
                    break;
                }

                if self.throttle.swap(false, Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(110));
                }

                if self.max_lines > 0 && self.max_lines + self.offset_lines <= n {
                    break;
                }
            }

            drop(job_tx);
        });

        self.progress.stop();

        if let Some(e) = first_err.into_inner().expect("first error poisoned") {
            return Err(e);
        }
        if let Some(e) = scan_err {
            return Err(e);
        }

        Ok(())
    }

    fn run_line<H: LineSink, S: WalkSink>(
        &self,
        job: &Job,
        walker: &Walker,
        handler: &H,
        sink: &mut S,
        flat_path: &mut Vec<u8>,
        segments: &mut Vec<String>,
        single_key: Option<&[String]>,
    ) -> Result<()> {
        handler.line_started(job.seq, job.n)?;

        if self.add_sequence {
            let raw = job.seq.to_string();
            sink.on_number(
                job.seq,
                b"._sequence",
                0,
                &["_sequence".to_string()],
                job.seq as f64,
                raw.as_bytes(),
            );
        }

        if let Some(body) = self.line_body(job.seq, &job.line, sink) {
            match serde_json::from_slice::<Json>(body) {
                Ok(parsed) => {
                    flat_path.clear();
                    segments.clear();

                    match single_key {
                        Some(path) => walker.get_key(job.seq, flat_path, path, &parsed, sink),
                        None => walker.walk(job.seq, flat_path, 0, segments, &parsed, sink),
                    }
                }
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        line = %String::from_utf8_lossy(body),
                        error = %e,
                        "skipping malformed JSON line"
                    );
                }
            }
        }

        handler.line_finished(job.seq, job.n)
    }

    /// Locate the JSON body, emitting prefix captures along the way.
    ///
    /// Returns `None` when the line carries nothing to parse; the decode
    /// error counter reflects lines without JSON and without a prefix regex.
    fn line_body<'l, S: WalkSink>(
        &self,
        seq: i64,
        line: &'l [u8],
        sink: &mut S,
    ) -> Option<&'l [u8]> {
        if line.len() >= 2 && line[0] == b'{' {
            return Some(line);
        }

        match line.iter().position(|&b| b == b'{') {
            Some(pos) => {
                if pos > 0 {
                    if let Some(re) = &self.match_prefix {
                        self.emit_prefix(seq, &line[..pos], re, sink);
                    }
                }

                Some(&line[pos..])
            }
            None => {
                if let Some(re) = &self.match_prefix {
                    self.emit_prefix(seq, line, re, sink);
                    // No body at all: treat as an empty object.
                    Some(b"{}")
                } else {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        line = %String::from_utf8_lossy(line),
                        "could not find JSON in line"
                    );
                    None
                }
            }
        }
    }

    /// Emit every capture group of every prefix match as `._prefix.[k]`,
    /// with `k` assigned across all matches.
    fn emit_prefix<S: WalkSink>(&self, seq: i64, prefix: &[u8], re: &Regex, sink: &mut S) {
        let text = String::from_utf8_lossy(prefix);
        let mut k = 0usize;

        for caps in re.captures_iter(&text) {
            for group in caps.iter().skip(1) {
                let m = group.map_or("", |g| g.as_str());
                let flat = format!("._prefix.[{}]", k);
                let path = vec!["_prefix".to_string(), format!("[{}]", k)];

                sink.on_string(seq, flat.as_bytes(), "._prefix".len(), &path, m.as_bytes());
                k += 1;
            }
        }
    }
}
