//! End-to-end tests that run the built tcp-beacon binary.

use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn beacon() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tcp-beacon"));
    for var in ["RUST_LOG", "BEACON_LISTEN", "BEACON_PAYLOAD", "BEACON_INTERVAL_MS"] {
        cmd.env_remove(var);
    }
    cmd
}

fn run(args: &[&str]) -> Output {
    beacon().args(args).output().unwrap()
}

struct KillOnDrop(Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn connect_with_retry(addr: &str) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Err(e) => panic!("beacon never came up on {addr}: {e}"),
        }
    }
}

#[test]
fn test_bind_in_use_is_fatal() {
    let holder = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = holder.local_addr().unwrap().to_string();

    let output = run(&["--listen", &addr]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to bind"), "stderr: {stderr}");
    assert!(stderr.contains(&addr), "stderr: {stderr}");
}

#[test]
fn test_invalid_interval_is_fatal() {
    let output = run(&["--interval-ms", "0"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("interval"), "stderr: {stderr}");
}

#[test]
fn test_serves_payload() {
    // Reserve a free port, then hand it to the beacon
    let addr = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .to_string();

    let child = beacon()
        .args(["serve", "--listen", &addr])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let _guard = KillOnDrop(child);

    let mut client = connect_with_retry(&addr);
    client
        .set_read_timeout(Some(Duration::from_millis(1500)))
        .unwrap();

    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"t321t");

    thread::sleep(Duration::from_millis(2200));
    let mut more = [0u8; 10];
    client.read_exact(&mut more).unwrap();
    assert_eq!(&more, b"t321tt321t");
    drop(client);

    // Still accepting new clients
    let mut again = connect_with_retry(&addr);
    again
        .set_read_timeout(Some(Duration::from_millis(1500)))
        .unwrap();
    again.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"t321t");
}
