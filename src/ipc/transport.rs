//! Newline-delimited JSON framing over a child process's stdio pipes.
//!
//! Pipe reads are blocking, so each direction gets a dedicated OS thread
//! that hands lines to the async side over a channel — the same split the
//! teacher's `worker_bridge::stdout_reader_task` uses and explains inline.

use std::io::{BufRead, BufReader, Write};
use std::process::{ChildStdin, ChildStdout};
use std::thread;

use tokio::sync::mpsc;

/// Spawn a blocking thread that writes one line per incoming string to `stdin`.
/// Returns the sender side; dropping it (or a write error) ends the thread.
pub fn spawn_line_writer(mut stdin: ChildStdin) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    thread::spawn(move || {
        // A current-thread runtime isn't needed: this is a plain blocking
        // loop driven by `blocking_recv`, matching the reader thread below.
        while let Some(line) = rx.blocking_recv() {
            if writeln!(stdin, "{line}").is_err() {
                break;
            }
            if stdin.flush().is_err() {
                break;
            }
        }
    });
    tx
}

/// Spawn a blocking thread that reads lines from `stdout` and forwards them.
/// The channel closes (sender dropped) when the pipe hits end-of-stream or
/// errors — callers observe this as "worker crashed" mid-operation.
pub fn spawn_line_reader(stdout: ChildStdout) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    thread::spawn(move || {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            match line {
                Ok(l) if !l.trim().is_empty() => {
                    if tx.send(l).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        // tx drops here, closing the channel — the reader observes end-of-stream.
    });
    rx
}
