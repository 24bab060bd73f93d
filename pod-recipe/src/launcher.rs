use log::{debug, info, warn};
use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, FdFlag},
    sys::{
        signal::{kill, sigprocmask, SigSet, SigmaskHow, Signal},
        socket::{bind, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn},
    },
    unistd::{self, Gid, Pid, Uid, User},
};
use std::{
    io,
    os::unix::{
        io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        process::{CommandExt, ExitStatusExt},
    },
    path::PathBuf,
    process::{Command, ExitStatus},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use crate::{
    error::LaunchError,
    models::{BindAddress, EntryPoint, Identity, LogLevel},
};

/// Signals the container runtime uses to stop the service.
const TERMINATION_SIGNALS: &[Signal] = &[Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LaunchState {
    NotStarted,
    Binding,
    Serving,
    Stopped,
    Failed,
}

impl LaunchState {
    pub fn transition(self, to: LaunchState) -> Result<LaunchState, LaunchError> {
        use LaunchState::*;

        match (self, to) {
            (NotStarted, Binding)
            | (Binding, Serving)
            | (Binding, Failed)
            | (Serving, Stopped)
            | (Serving, Failed) => Ok(to),
            (from, to) => Err(LaunchError::IllegalTransition { from, to }),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LaunchConfig {
    pub bind: BindAddress,
    pub log_level: LogLevel,
    pub entry_point: EntryPoint,
    pub server: String,
    /// Directory the server runs in and resolves the entry-point module from.
    pub workdir: PathBuf,
    /// Identity to switch to when started as root.
    pub identity: Option<Identity>,
}

impl LaunchConfig {
    /// Server arguments for an already bound socket. `--preload` makes the
    /// server import the entry point before it starts listening.
    pub fn server_args(&self, fd: RawFd) -> Vec<String> {
        vec![
            format!("--bind=fd://{}", fd),
            format!("--log-level={}", self.log_level),
            "--preload".into(),
            self.entry_point.to_string(),
        ]
    }
}

/// The privileged part of the launch: the entry point has been checked and
/// the listening socket is bound.
#[derive(Debug)]
pub struct SetupPhase {
    config: LaunchConfig,
    socket: OwnedFd,
    state: LaunchState,
}

/// The unprivileged part of the launch. There is no way back to a
/// `SetupPhase`.
#[derive(Debug)]
pub struct RunPhase {
    config: LaunchConfig,
    socket: OwnedFd,
    state: LaunchState,
}

#[derive(Debug)]
pub struct LaunchOutcome {
    pub state: LaunchState,
    pub status: ExitStatus,
}

impl LaunchOutcome {
    /// Exit code to hand back to the container runtime.
    pub fn exit_code(&self) -> i32 {
        match (self.status.code(), self.status.signal()) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }
}

fn check_entry_point(config: &LaunchConfig) -> Result<(), LaunchError> {
    match config.entry_point.locate(&config.workdir) {
        Some(path) => {
            debug!("entry point module {} found at {:?}", config.entry_point.module, path);
            Ok(())
        }
        None => {
            let candidates = config
                .entry_point
                .module_candidates()
                .iter()
                .map(|candidate| candidate.display().to_string())
                .collect::<Vec<_>>()
                .join(" or ");
            Err(LaunchError::UnresolvedEntryPoint {
                reference: config.entry_point.to_string(),
                reason: format!("no {} under {:?}", candidates, config.workdir),
            })
        }
    }
}

/// Binds without listening, the server starts listening once its
/// application has loaded.
fn bind_socket(bind_address: BindAddress) -> Result<OwnedFd, LaunchError> {
    let address = bind_address.to_string();
    let to_error = |errno: Errno| match errno {
        Errno::EADDRINUSE => LaunchError::PortInUse {
            port: bind_address.port.get(),
        },
        errno => LaunchError::Bind {
            address: address.clone(),
            source: io::Error::from(errno),
        },
    };

    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(to_error)?;
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    setsockopt(socket.as_raw_fd(), sockopt::ReuseAddr, &true).map_err(to_error)?;

    let addr = SockaddrIn::new(0, 0, 0, 0, bind_address.port.get());
    bind(socket.as_raw_fd(), &addr).map_err(to_error)?;

    Ok(socket)
}

impl SetupPhase {
    /// Resolves the entry point and binds the port, in that order, so a bad
    /// entry point never leaves a bound port behind.
    pub fn prepare(config: LaunchConfig) -> Result<SetupPhase, LaunchError> {
        let state = LaunchState::NotStarted.transition(LaunchState::Binding)?;
        info!("binding {} for {}", config.bind, config.entry_point);

        check_entry_point(&config)?;
        let socket = bind_socket(config.bind)?;

        Ok(SetupPhase {
            config,
            socket,
            state,
        })
    }

    pub fn state(&self) -> LaunchState {
        self.state
    }

    /// Switches to the configured identity when running as root. Anything
    /// that needs root, such as binding a low port, has already happened.
    pub fn deescalate(self) -> Result<RunPhase, LaunchError> {
        let SetupPhase {
            config,
            socket,
            state,
        } = self;

        if unistd::geteuid().is_root() {
            let identity = config.identity.as_ref().ok_or_else(|| LaunchError::Deescalation {
                uid: 0,
                reason: "refusing to run the server as root without an identity".into(),
            })?;
            drop_privileges(identity)?;
            info!("running as {} ({})", identity.username, identity.uid);
        } else {
            let uid = unistd::geteuid().as_raw();
            match &config.identity {
                Some(identity) if identity.uid != uid => warn!(
                    "started as uid {} instead of {} ({}), not switching",
                    uid, identity.uid, identity.username
                ),
                _ => debug!("already running unprivileged as uid {}", uid),
            }
        }

        Ok(RunPhase {
            config,
            socket,
            state,
        })
    }
}

fn drop_privileges(identity: &Identity) -> Result<(), LaunchError> {
    let failed = |reason: String| LaunchError::Deescalation {
        uid: identity.uid,
        reason,
    };

    let uid = Uid::from_raw(identity.uid);
    let gid = match User::from_uid(uid) {
        Ok(Some(user)) => user.gid,
        Ok(None) => {
            warn!("uid {} has no passwd entry, using it as gid", identity.uid);
            Gid::from_raw(identity.uid)
        }
        Err(err) => return Err(failed(format!("cannot look up uid: {}", err))),
    };

    unistd::setgroups(&[gid]).map_err(|err| failed(format!("setgroups: {}", err)))?;
    unistd::setgid(gid).map_err(|err| failed(format!("setgid: {}", err)))?;
    unistd::setuid(uid).map_err(|err| failed(format!("setuid: {}", err)))?;

    if unistd::setuid(Uid::from_raw(0)).is_ok() {
        return Err(failed("root could be regained after switching".into()));
    }

    Ok(())
}

impl RunPhase {
    pub fn state(&self) -> LaunchState {
        self.state
    }

    /// Starts the server on the bound socket and waits for it to exit,
    /// forwarding termination signals. The socket is closed when this returns.
    pub fn serve(self) -> Result<LaunchOutcome, LaunchError> {
        let RunPhase {
            config,
            socket,
            state,
        } = self;

        let fd = socket.as_raw_fd();
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty())).map_err(|errno| LaunchError::Bind {
            address: config.bind.to_string(),
            source: io::Error::from(errno),
        })?;

        let mut signals = SigSet::empty();
        for signal in TERMINATION_SIGNALS {
            signals.add(*signal);
        }
        signals.thread_block().map_err(|errno| LaunchError::Spawn {
            program: config.server.clone(),
            source: io::Error::from(errno),
        })?;

        let mut command = Command::new(&config.server);
        command.args(config.server_args(fd)).current_dir(&config.workdir);
        unsafe {
            command.pre_exec(move || {
                sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&signals), None)?;
                Ok(())
            });
        }

        info!("starting {} {:?}", config.server, config.server_args(fd));
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                state.transition(LaunchState::Failed)?;
                return Err(LaunchError::Spawn {
                    program: config.server.clone(),
                    source,
                });
            }
        };
        let state = state.transition(LaunchState::Serving)?;

        let pid = Pid::from_raw(child.id() as i32);
        let terminating = Arc::new(AtomicBool::new(false));
        let exited = Arc::new(AtomicBool::new(false));
        {
            let terminating = terminating.clone();
            let exited = exited.clone();
            thread::spawn(move || loop {
                let signal = match signals.wait() {
                    Ok(signal) => signal,
                    Err(err) => {
                        warn!("waiting for signals failed: {}", err);
                        return;
                    }
                };
                if exited.load(Ordering::SeqCst) {
                    return;
                }
                info!("forwarding {:?} to server", signal);
                terminating.store(true, Ordering::SeqCst);
                if let Err(err) = kill(pid, signal) {
                    warn!("could not forward {:?}: {}", signal, err);
                }
            });
        }

        let status = child.wait().map_err(|source| LaunchError::Spawn {
            program: config.server.clone(),
            source,
        })?;
        exited.store(true, Ordering::SeqCst);
        drop(socket);

        if status.success() || terminating.load(Ordering::SeqCst) {
            let state = state.transition(LaunchState::Stopped)?;
            info!("server stopped ({})", status);
            Ok(LaunchOutcome { state, status })
        } else {
            state.transition(LaunchState::Failed)?;
            Err(LaunchError::ServerExited(status.to_string()))
        }
    }
}

/// Runs the whole launch sequence: setup, de-escalation, serve.
pub fn launch(config: LaunchConfig) -> Result<LaunchOutcome, LaunchError> {
    let setup = SetupPhase::prepare(config)?;
    debug!("setup finished in state {:?}", setup.state());

    let run = setup.deescalate()?;
    debug!("de-escalated in state {:?}", run.state());

    run.serve()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{convert::TryFrom, fs, net::TcpListener};
    use tempfile::TempDir;

    use crate::models::ListenPort;

    fn app_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("service")).unwrap();
        fs::write(dir.path().join("service/__init__.py"), "app = object()\n").unwrap();
        dir
    }

    fn free_port() -> ListenPort {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        ListenPort::try_from(port).unwrap()
    }

    /// Skips de-escalation, which as root would switch the whole test process
    /// to another uid.
    fn run_phase(setup: SetupPhase) -> RunPhase {
        RunPhase {
            config: setup.config,
            socket: setup.socket,
            state: setup.state,
        }
    }

    fn config(dir: &TempDir, port: ListenPort, server: &str) -> LaunchConfig {
        LaunchConfig {
            bind: BindAddress::all_interfaces(port),
            log_level: LogLevel::Info,
            entry_point: "service:app".parse().unwrap(),
            server: server.into(),
            workdir: dir.path().into(),
            identity: None,
        }
    }

    #[test]
    fn state_machine_transitions() {
        use LaunchState::*;

        assert_eq!(NotStarted.transition(Binding).unwrap(), Binding);
        assert_eq!(Binding.transition(Serving).unwrap(), Serving);
        assert_eq!(Binding.transition(Failed).unwrap(), Failed);
        assert_eq!(Serving.transition(Stopped).unwrap(), Stopped);

        assert!(NotStarted.transition(Serving).is_err());
        assert!(Stopped.transition(Serving).is_err());
        assert!(Failed.transition(Binding).is_err());
        assert!(Serving.transition(Binding).is_err());
    }

    #[test]
    fn occupied_port_is_fatal_without_fallback() {
        let dir = app_dir();
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = ListenPort::try_from(listener.local_addr().unwrap().port()).unwrap();

        match SetupPhase::prepare(config(&dir, port, "true")) {
            Err(LaunchError::PortInUse { port: reported }) => assert_eq!(reported, port.get()),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn unresolvable_entry_point_fails_before_binding() {
        let dir = app_dir();
        let port = free_port();
        let mut config = config(&dir, port, "true");
        config.entry_point = "accounts:app".parse().unwrap();

        match SetupPhase::prepare(config) {
            Err(LaunchError::UnresolvedEntryPoint { reference, .. }) => {
                assert_eq!(reference, "accounts:app")
            }
            other => panic!("unexpected result {:?}", other),
        }

        // Nothing kept the port.
        TcpListener::bind(("0.0.0.0", port.get())).unwrap();
    }

    #[test]
    fn server_receives_bound_socket_and_settings() {
        let dir = app_dir();
        let config = config(&dir, free_port(), "true");
        assert_eq!(
            config.server_args(5),
            vec!["--bind=fd://5", "--log-level=info", "--preload", "service:app"]
        );
    }

    #[test]
    fn server_exit_zero_stops_cleanly() {
        let dir = app_dir();
        let setup = SetupPhase::prepare(config(&dir, free_port(), "true")).unwrap();
        assert_eq!(setup.state(), LaunchState::Binding);

        let outcome = run_phase(setup).serve().unwrap();
        assert_eq!(outcome.state, LaunchState::Stopped);
        assert_eq!(outcome.exit_code(), 0);
    }

    #[test]
    fn deescalation_requires_identity_as_root() {
        let dir = app_dir();
        let setup = SetupPhase::prepare(config(&dir, free_port(), "true")).unwrap();

        match (unistd::geteuid().is_root(), setup.deescalate()) {
            (true, Err(LaunchError::Deescalation { uid: 0, .. })) => (),
            (false, Ok(run)) => assert_eq!(run.state(), LaunchState::Binding),
            (root, other) => panic!("unexpected result {:?} (root: {})", other, root),
        }
    }

    #[test]
    fn failing_server_is_start_fatal() {
        let dir = app_dir();
        let setup = SetupPhase::prepare(config(&dir, free_port(), "false")).unwrap();
        match run_phase(setup).serve() {
            Err(LaunchError::ServerExited(_)) => (),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn missing_server_program_is_start_fatal() {
        let dir = app_dir();
        let setup =
            SetupPhase::prepare(config(&dir, free_port(), "pod-recipe-no-such-server")).unwrap();
        match run_phase(setup).serve() {
            Err(LaunchError::Spawn { program, .. }) => {
                assert_eq!(program, "pod-recipe-no-such-server")
            }
            other => panic!("unexpected result {:?}", other),
        }
    }
}
