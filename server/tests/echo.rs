//! End-to-end exercise of the whole core: a real echo service over
//! loopback, timer fan-out through `run_after`, and a clean shutdown drain
//! with the bootstrap/stop records landing in the log file.
//!
//! Everything lives in one test function because the server singletons
//! initialize once per process.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use task_server::{
    Registry, ShutdownType, SocketFactory, TaskHandler, TaskRef, TaskServer, ThreadNum,
};

struct EchoFactory;

impl SocketFactory for EchoFactory {
    fn create_socket_task(&self) -> Box<dyn TaskHandler> {
        Box::new(EchoConn {
            line: String::new(),
        })
    }
}

struct EchoConn {
    line: String,
}

impl TaskHandler for EchoConn {
    fn execute_slice(&mut self, task: &TaskRef, _thr_num: ThreadNum) {
        loop {
            if task.need_early_close() {
                task.terminate();
                return;
            }
            if !task.read_line(&mut self.line) {
                // A failed read may have just discovered EOF.
                if task.need_early_close() {
                    task.terminate();
                }
                return;
            }
            task.write_text(&self.line).write_text("\n");
            task.flush();
        }
    }
}

struct TimerProbe {
    armed: Instant,
    delay_sec: u64,
    fired: Arc<AtomicBool>,
}

impl TaskHandler for TimerProbe {
    fn execute_slice(&mut self, _task: &TaskRef, _thr_num: ThreadNum) {
        let elapsed = self.armed.elapsed().as_secs_f64();
        assert!(
            elapsed + 0.5 >= self.delay_sec as f64,
            "timer fired {elapsed:.2}s after arming, wanted {}s",
            self.delay_sec
        );
        assert!(
            elapsed <= self.delay_sec as f64 + 2.0,
            "timer fired {elapsed:.2}s after arming, wanted {}s",
            self.delay_sec
        );
        self.fired.store(true, Ordering::SeqCst);
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn echo_timers_and_shutdown() {
    let log_path = std::env::temp_dir().join(format!("task_server_test_{}.log", std::process::id()));
    task_server::logging::set_log_file_name(log_path.to_str().unwrap());

    let reg = Registry::parse(
        "[task_server]\n\
         max_threads = 4\n\
         jiffies_per_sec = 100\n\
         soft_sockets_limit = 500\n\
         hard_sockets_limit = 1000\n\
         log_thread_buf_size = 1 MB\n\
         slow_shutdown_timeout = 10\n\
         fast_shutdown_timeout = 5\n",
    );
    TaskServer::initialize_with_registry(reg).expect("server init");

    let port = free_port();
    assert!(TaskServer::add_listening_port(port, Arc::new(EchoFactory)));

    let server = std::thread::spawn(TaskServer::run);

    // Wait for the listener to come up.
    let addr = format!("127.0.0.1:{port}");
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match TcpStream::connect(&addr) {
            Ok(_) => break,
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(50))
            }
            Err(err) => panic!("listener never came up: {err}"),
        }
    }

    // Echo: several concurrent clients, many lines each, all returned
    // verbatim and in order.
    let clients: Vec<_> = (0..10)
        .map(|c| {
            let addr = addr.clone();
            std::thread::spawn(move || {
                let mut stream = TcpStream::connect(&addr).unwrap();
                stream
                    .set_read_timeout(Some(Duration::from_secs(20)))
                    .unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                for i in 0..200 {
                    let msg = format!("client {c} line {i}");
                    stream.write_all(msg.as_bytes()).unwrap();
                    stream.write_all(b"\r\n").unwrap();
                    line.clear();
                    reader.read_line(&mut line).unwrap();
                    assert_eq!(line.trim_end(), msg);
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    // Timer fan-out: delays of one to three seconds must all fire within a
    // second of their target.
    let probes: Vec<Arc<AtomicBool>> = (0..15)
        .map(|i| {
            let fired = Arc::new(AtomicBool::new(false));
            let delay_sec = 1 + (i % 3) as u64;
            let task = task_server::SrvTask::new(Box::new(TimerProbe {
                armed: Instant::now(),
                delay_sec,
                fired: Arc::clone(&fired),
            }));
            task.run_after(delay_sec);
            fired
        })
        .collect();
    std::thread::sleep(Duration::from_secs(5));
    for (i, fired) in probes.iter().enumerate() {
        assert!(fired.load(Ordering::SeqCst), "timer probe {i} never fired");
    }

    // Shutdown drain: the run loop exits, and the log carries both the
    // bootstrap and the final stop record.
    TaskServer::request_shutdown(ShutdownType::Fast);
    server.join().expect("server run loop");
    TaskServer::finalize();

    let log = std::fs::read_to_string(&log_path).unwrap_or_default();
    assert!(log.contains("start "), "missing bootstrap record:\n{log}");
    assert!(log.contains("stop          0 "), "missing stop record:\n{log}");
    let _ = std::fs::remove_file(&log_path);
}
