//! C3: worker-thread-per-endpoint asynchronous message loop. Grounded on
//! `examples/original_source/src/platform/windows/ipc/pipes.h`/`pipes.cpp`
//! (`AsyncNamedPipe::worker_thread`/`run_message_loop`), adapted from the
//! original's `std::jthread` + callback triple to a plain `JoinHandle` plus
//! an `Arc<AtomicBool>` stop flag, since Rust has no cooperative-cancellation
//! thread type in std.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::error::PipeOutcome;
use crate::pipe::PipeEndpoint;

const POLL_TIMEOUT: Duration = Duration::from_millis(250);
const SEND_TIMEOUT: Duration = Duration::from_secs(1);
const RECEIVE_BUFFER_LEN: usize = 256;

pub type MessageCallback = Box<dyn Fn(&[u8]) + Send + 'static>;
pub type ErrorCallback = Box<dyn Fn(&str) + Send + 'static>;
pub type BrokenPipeCallback = Box<dyn Fn() + Send + 'static>;

/// Wraps a connected [`PipeEndpoint`] with a background thread that polls
/// `receive` and dispatches to callbacks, so callers never block on I/O.
pub struct AsyncNamedPipe {
    pipe: Arc<PipeEndpoint>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncNamedPipe {
    pub fn new(pipe: PipeEndpoint) -> Self {
        Self {
            pipe: Arc::new(pipe),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    /// Starts the worker thread. Returns `false` if already running.
    pub fn start(
        &mut self,
        on_message: MessageCallback,
        on_error: ErrorCallback,
        on_broken_pipe: Option<BrokenPipeCallback>,
    ) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let pipe = Arc::clone(&self.pipe);
        let running = Arc::clone(&self.running);

        self.worker = Some(std::thread::spawn(move || {
            run_message_loop(&pipe, &running, &on_message, &on_error, on_broken_pipe.as_deref());
        }));

        true
    }

    /// Stops the worker thread, unblocking any pending receive by
    /// disconnecting the underlying pipe, then joins the thread.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.pipe.disconnect();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    /// Sends a message with the loop's default timeout. Safe to call
    /// concurrently with the running worker thread since `PipeEndpoint::send`
    /// takes `&self`.
    pub fn send(&self, message: &[u8]) -> bool {
        self.pipe.send(message, SEND_TIMEOUT)
    }

    pub fn is_connected(&self) -> bool {
        self.pipe.is_connected()
    }
}

impl Drop for AsyncNamedPipe {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_message_loop(
    pipe: &PipeEndpoint,
    running: &AtomicBool,
    on_message: &MessageCallback,
    on_error: &ErrorCallback,
    on_broken_pipe: Option<&BrokenPipeCallback>,
) {
    let mut buffer = [0u8; RECEIVE_BUFFER_LEN];

    while running.load(Ordering::SeqCst) {
        let (outcome, count) = pipe.receive(&mut buffer, POLL_TIMEOUT);
        match outcome {
            PipeOutcome::Success => on_message(&buffer[..count]),
            PipeOutcome::Timeout => continue,
            PipeOutcome::BrokenPipe | PipeOutcome::Disconnected => {
                debug!("async pipe loop observed broken/disconnected pipe, exiting");
                if let Some(cb) = on_broken_pipe {
                    cb();
                }
                break;
            }
            PipeOutcome::Error => {
                warn!("async pipe loop receive error, continuing");
                on_error("pipe receive failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn connected_pair(tag: &str) -> (PipeEndpoint, PipeEndpoint) {
        let name = format!(
            r"\\.\pipe\sunshine_wgc_asyncloop_test_{}_{}",
            tag,
            std::process::id()
        );
        let mut server = PipeEndpoint::create_server(&name).expect("server create");
        let connect_thread = std::thread::spawn({
            let name = name.clone();
            move || PipeEndpoint::create_client(&name)
        });
        assert!(server.wait_for_client_connection(Duration::from_secs(2)));
        let client = connect_thread.join().unwrap().expect("client connect");
        (server, client)
    }

    #[test]
    fn delivers_received_messages_to_the_callback() {
        let (server, client) = connected_pair("deliver");
        let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = Arc::clone(&received);

        let mut async_pipe = AsyncNamedPipe::new(client);
        async_pipe.start(
            Box::new(move |bytes| received_clone.lock().unwrap().extend_from_slice(bytes)),
            Box::new(|_| {}),
            None,
        );

        assert!(server.send(&[1, 2, 3], Duration::from_secs(1)));
        std::thread::sleep(Duration::from_millis(500));

        assert_eq!(*received.lock().unwrap(), vec![1, 2, 3]);
        async_pipe.stop();
    }

    #[test]
    fn stop_is_idempotent_and_joins_cleanly() {
        let (_server, client) = connected_pair("stop");
        let mut async_pipe = AsyncNamedPipe::new(client);
        async_pipe.start(Box::new(|_| {}), Box::new(|_| {}), None);
        async_pipe.stop();
        async_pipe.stop();
    }

    #[test]
    fn broken_pipe_callback_fires_when_peer_drops() {
        let (server, client) = connected_pair("broken");
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);

        let mut async_pipe = AsyncNamedPipe::new(client);
        async_pipe.start(
            Box::new(|_| {}),
            Box::new(|_| {}),
            Some(Box::new(move || fired_clone.store(true, Ordering::SeqCst))),
        );

        drop(server);
        std::thread::sleep(Duration::from_millis(500));
        assert!(fired.load(Ordering::SeqCst));
        async_pipe.stop();
    }
}
