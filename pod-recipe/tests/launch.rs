use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{
    fs,
    net::TcpListener,
    os::unix::fs::PermissionsExt,
    path::Path,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tempfile::TempDir;

/// An application directory the service uid can enter, with a server script
/// that ignores its arguments and marks when it started. It lives in `/tmp`
/// because the launcher drops to uid 1000 when the tests run as root.
fn app_dir() -> TempDir {
    let dir = TempDir::new_in("/tmp").unwrap();
    fs::create_dir(dir.path().join("service")).unwrap();
    fs::write(dir.path().join("service/__init__.py"), "app = object()\n").unwrap();

    let server = dir.path().join("server.sh");
    fs::write(&server, "#!/bin/sh\ntouch \"$0.started\"\nexec sleep 30\n").unwrap();
    fs::set_permissions(&server, fs::Permissions::from_mode(0o755)).unwrap();
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o777)).unwrap();
    dir
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("0.0.0.0:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn launch(dir: &Path, port: u16, entry_point: &str) -> Child {
    Command::new(env!("CARGO_BIN_EXE_pod-recipe"))
        .arg("launch")
        .arg("--port")
        .arg(port.to_string())
        .arg("--workdir")
        .arg(dir)
        .arg("--server")
        .arg(dir.join("server.sh"))
        .arg(entry_point)
        .env_remove("PORT")
        .env_remove("LOG_LEVEL")
        .stdin(Stdio::null())
        .spawn()
        .unwrap()
}

fn wait_for(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn sigterm_is_forwarded_and_stops_the_server() {
    let dir = app_dir();
    let mut launcher = launch(dir.path(), free_port(), "service:app");

    assert!(
        wait_for(&dir.path().join("server.sh.started"), Duration::from_secs(10)),
        "server never started"
    );
    kill(Pid::from_raw(launcher.id() as i32), Signal::SIGTERM).unwrap();

    let status = launcher.wait().unwrap();
    // The server died from the forwarded SIGTERM and the launcher reports it
    // as a clean stop with the shell convention 128 + signal.
    assert_eq!(status.code(), Some(128 + Signal::SIGTERM as i32));
}

#[test]
fn unresolved_entry_point_never_starts_the_server() {
    let dir = app_dir();
    let status = launch(dir.path(), free_port(), "accounts:app").wait().unwrap();

    assert!(!status.success());
    assert!(!dir.path().join("server.sh.started").exists());
}

#[test]
fn occupied_port_fails_without_fallback() {
    let dir = app_dir();
    let listener = TcpListener::bind("0.0.0.0:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let status = launch(dir.path(), port, "service:app").wait().unwrap();

    assert!(!status.success());
    assert!(!dir.path().join("server.sh.started").exists());
}
