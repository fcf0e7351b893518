use crate::error::ProbeError;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

/// Accepts the 11-digit mobile format the uploads contain.
pub fn is_valid_number(line: &str) -> bool {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| regex::Regex::new(r"^1\d{10}$").expect("valid pattern"));
    pattern.is_match(line.trim())
}

/// Count the valid numbers in an input file without keeping them in memory.
pub fn count_valid_numbers(path: &Path) -> std::io::Result<u32> {
    let reader = BufReader::new(File::open(path)?);
    let mut total = 0u32;
    for line in reader.lines() {
        if is_valid_number(&line?) {
            total += 1;
        }
    }
    Ok(total)
}

struct StreamInner {
    reader: Option<BufReader<File>>,
    retries: VecDeque<String>,
    closed: bool,
}

/// Thread-safe FIFO over a line-oriented input file with push-back for
/// retries. `get()` serves the retry buffer before the file; `push_back()`
/// always succeeds, including after `close()`.
pub struct NumberStream {
    inner: Mutex<StreamInner>,
}

impl NumberStream {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(Self {
            inner: Mutex::new(StreamInner {
                reader: Some(reader),
                retries: VecDeque::new(),
                closed: false,
            }),
        })
    }

    /// Next number to probe. Fails with `Empty` once the stream is closed or
    /// both the retry buffer and the file are exhausted.
    pub fn get(&self) -> Result<String, ProbeError> {
        let mut inner = self.inner.lock().expect("number stream poisoned");
        if inner.closed {
            return Err(ProbeError::Empty);
        }
        if let Some(number) = inner.retries.pop_front() {
            return Ok(number);
        }
        let Some(reader) = inner.reader.as_mut() else {
            return Err(ProbeError::Empty);
        };
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line).map_err(|_| ProbeError::Empty)?;
            if read == 0 {
                return Err(ProbeError::Empty);
            }
            let number = line.trim();
            if !number.is_empty() {
                return Ok(number.to_string());
            }
        }
    }

    /// Return an unclassified number for a later retry.
    pub fn push_back(&self, number: String) {
        let mut inner = self.inner.lock().expect("number stream poisoned");
        inner.retries.push_back(number);
    }

    /// Detach from the input file. Subsequent `get()` calls fail with `Empty`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("number stream poisoned");
        inner.reader = None;
        inner.closed = true;
    }

    /// True when neither the retry buffer nor the file has anything left.
    pub fn is_empty(&self) -> bool {
        let mut inner = self.inner.lock().expect("number stream poisoned");
        if inner.closed {
            return true;
        }
        if !inner.retries.is_empty() {
            return false;
        }
        match inner.reader.as_mut() {
            Some(reader) => reader.fill_buf().map(|buf| buf.is_empty()).unwrap_or(true),
            None => true,
        }
    }

    /// Consume everything left for checkpointing: the unread file tail in
    /// original order, then the retry buffer. Leaves the stream closed.
    pub fn drain_remaining(&self) -> Vec<String> {
        let mut inner = self.inner.lock().expect("number stream poisoned");
        let mut remaining = Vec::new();
        if let Some(reader) = inner.reader.take() {
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let number = line.trim();
                if !number.is_empty() {
                    remaining.push(number.to_string());
                }
            }
        }
        remaining.extend(inner.retries.drain(..));
        inner.closed = true;
        remaining
    }
}
