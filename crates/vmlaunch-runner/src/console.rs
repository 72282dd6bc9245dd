//! Console output of a run: a bounded backlog for polling plus a live feed.

use std::{collections::VecDeque, sync::Arc};

use tokio::sync::{Mutex, broadcast};

use crate::settings;

const LIVE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleStream {
    Stdout,
    Stderr,
    /// Messages from the launcher itself (exec line, exit status).
    System,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub seq: u64,
    pub stream: ConsoleStream,
    pub text: String,
}

#[derive(Debug)]
struct ConsoleBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<ConsoleLine>,
}

impl ConsoleBuffer {
    fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines,
            lines: VecDeque::new(),
        }
    }

    fn push_line(&mut self, stream: ConsoleStream, text: String) -> ConsoleLine {
        let line = ConsoleLine {
            seq: self.next_seq,
            stream,
            text,
        };
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back(line.clone());
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
        line
    }

    fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<ConsoleLine>, u64) {
        // Cursor 0 means "most recent lines".
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let out: Vec<ConsoleLine> = self.lines.iter().skip(start).cloned().collect();
            let last = out.last().map(|l| l.seq).unwrap_or(0);
            return (out, last);
        }

        self.read_after(cursor, limit)
    }

    fn read_after(&self, cursor: u64, limit: usize) -> (Vec<ConsoleLine>, u64) {
        let mut out = Vec::new();
        let mut last = cursor;
        for line in self.lines.iter().filter(|l| l.seq > cursor) {
            out.push(line.clone());
            last = line.seq;
            if out.len() >= limit {
                break;
            }
        }
        (out, last)
    }
}

/// Shared writer/reader for one run's console.
#[derive(Debug, Clone)]
pub struct Console {
    buffer: Arc<Mutex<ConsoleBuffer>>,
    live: broadcast::Sender<ConsoleLine>,
}

impl Default for Console {
    fn default() -> Self {
        Self::with_max_lines(settings::console_max_lines())
    }
}

impl Console {
    pub fn with_max_lines(max_lines: usize) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            buffer: Arc::new(Mutex::new(ConsoleBuffer::new(max_lines.max(1)))),
            live,
        }
    }

    pub async fn emit(&self, stream: ConsoleStream, text: impl Into<String>) {
        let line = self.buffer.lock().await.push_line(stream, text.into());
        // No subscribers is fine; the backlog still has the line.
        let _ = self.live.send(line);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleLine> {
        self.live.subscribe()
    }

    /// Lines after `cursor` (at most `limit`) and the cursor to pass next time.
    pub async fn tail(&self, cursor: u64, limit: usize) -> (Vec<ConsoleLine>, u64) {
        self.buffer.lock().await.tail_after(cursor, limit)
    }

    /// Like [`tail`](Self::tail), but cursor 0 starts at the oldest line kept
    /// instead of the most recent ones.
    pub async fn read_after(&self, cursor: u64, limit: usize) -> (Vec<ConsoleLine>, u64) {
        self.buffer.lock().await.read_after(cursor, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_drops_oldest_lines() {
        let mut buf = ConsoleBuffer::new(3);
        for i in 0..5 {
            buf.push_line(ConsoleStream::Stdout, format!("line {i}"));
        }
        let (lines, last) = buf.tail_after(0, 10);
        let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(last, 5);
    }

    #[test]
    fn tail_resumes_from_cursor() {
        let mut buf = ConsoleBuffer::new(100);
        for i in 0..10 {
            buf.push_line(ConsoleStream::Stderr, format!("{i}"));
        }
        let (first, cursor) = buf.tail_after(4, 3);
        assert_eq!(first.iter().map(|l| l.seq).collect::<Vec<_>>(), vec![5, 6, 7]);
        assert_eq!(cursor, 7);

        let (rest, cursor) = buf.tail_after(cursor, 100);
        assert_eq!(rest.len(), 3);
        assert_eq!(cursor, 10);

        let (none, cursor) = buf.tail_after(cursor, 100);
        assert!(none.is_empty());
        assert_eq!(cursor, 10);
    }

    #[test]
    fn read_after_zero_starts_at_oldest_line() {
        let mut buf = ConsoleBuffer::new(1000);
        for i in 0..600 {
            buf.push_line(ConsoleStream::Stdout, format!("{i}"));
        }
        let (first, cursor) = buf.read_after(0, 500);
        assert_eq!(first.len(), 500);
        assert_eq!(first[0].seq, 1);
        assert_eq!(cursor, 500);

        let (rest, cursor) = buf.read_after(cursor, 500);
        assert_eq!(rest.len(), 100);
        assert_eq!(cursor, 600);
    }

    #[tokio::test]
    async fn subscribers_see_new_lines() {
        let console = Console::with_max_lines(10);
        let mut rx = console.subscribe();
        console.emit(ConsoleStream::System, "hello").await;

        let line = rx.recv().await.unwrap();
        assert_eq!(line.seq, 1);
        assert_eq!(line.stream, ConsoleStream::System);
        assert_eq!(line.text, "hello");
    }
}
