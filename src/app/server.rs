//! Process startup: master/kids supervision, worker reactor loop, listening
//! sockets.

use std::process;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::app::args::Args;
use crate::auth::StaticValidator;
use crate::client;
use crate::comm::{event, Flag, Reactor};
use crate::config::{get_config, Config, PortCfg, PortTransport};
use crate::ftp;
use crate::ipc::kids::{ExitStatus, KidRole, Kids};
use crate::mem;

/// Raised by SIGTERM/SIGINT; both the master and workers poll it.
pub static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
/// Raised by SIGHUP.
pub static RECONFIGURE_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(_sig: i32) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_hup_signal(_sig: i32) {
    RECONFIGURE_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        signal::signal(Signal::SIGTERM, SigHandler::Handler(on_stop_signal)).ok();
        signal::signal(Signal::SIGINT, SigHandler::Handler(on_stop_signal)).ok();
        signal::signal(Signal::SIGHUP, SigHandler::Handler(on_hup_signal)).ok();
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn).ok();
    }
}

pub fn run_server(args: Args, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    install_signal_handlers();

    let single = args.no_fork
        || (config.general.effective_workers() == 1 && config.general.cache_dirs.is_empty());
    if single {
        info!("running a single in-process worker");
        worker_main(0);
        return Ok(());
    }

    master_main(&config);
    Ok(())
}

/// The master: fork the roster, reap, restart per policy, revive hopeless
/// kids once their penalty is served.
fn master_main(config: &Config) {
    let mut kids = Kids::new();
    kids.init(config.general.effective_workers(), config.general.cache_dirs.len());
    info!("master supervising {} kid(s)", kids.count());

    loop {
        // (re)start whatever should run
        for i in 0..kids.count() {
            let kid = kids.get(i);
            if kid.running() || kid.hopeless() || kid.exited_happy() {
                continue;
            }
            let role = kid.role();
            let name = kid.name().to_string();
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    match role {
                        KidRole::Worker => worker_main(i),
                        // disk and coordination strands run the same loop
                        // here; their specialized duties live out of process
                        KidRole::Disker | KidRole::Coordinator => worker_main(i),
                    }
                    process::exit(exitcode::OK);
                }
                Ok(ForkResult::Parent { child }) => {
                    info!("started {name} as pid {child}");
                    kids.get(i).started(child);
                }
                Err(e) => {
                    error!("cannot fork {name}: {e}");
                }
            }
        }

        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            stop_kids(&mut kids);
            break;
        }

        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                note_death(&mut kids, pid, ExitStatus::Exited(code));
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                note_death(&mut kids, pid, ExitStatus::Signaled(sig as i32));
            }
            _ => std::thread::sleep(std::time::Duration::from_millis(250)),
        }

        let delay = get_config().general.hopeless_kid_revival_delay.as_secs() as i64;
        kids.forget_old_failures(delay);

        if kids.all_hopeless() {
            error!("all kids are hopeless, giving up");
            process::exit(exitcode::SOFTWARE);
        }
    }

    if kids.all_exited_happy() {
        info!("all kids exited happily");
    }
}

fn note_death(kids: &mut Kids, pid: Pid, status: ExitStatus) {
    crate::utils::clock::update_current_time();
    if let Some(kid) = kids.find(pid) {
        warn!("kid {} (pid {pid}) stopped: {status:?}", kid.name());
        kid.stopped(status);
    }
}

fn stop_kids(kids: &mut Kids) {
    for kid in kids.iter_mut() {
        if let Some(pid) = kid.pid() {
            signal::kill(pid, Signal::SIGTERM).ok();
        }
    }
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
    while kids.some_running() && std::time::Instant::now() < deadline {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, code)) => {
                note_death(kids, pid, ExitStatus::Exited(code))
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                note_death(kids, pid, ExitStatus::Signaled(sig as i32))
            }
            _ => break,
        }
    }
}

/// Open every configured listening socket and route its accepts.
fn start_listening(r: &mut Reactor, ports: Vec<PortCfg>) -> Vec<i32> {
    let cfg = get_config();
    let backlog = cfg.general.effective_backlog();
    let mut listener_fds = Vec::new();

    for mut port in ports {
        // listener TLS contexts are built now; a bad one is fatal
        if let Some(tls) = port.tls.as_mut() {
            if let Err(e) = tls.init_server_contexts(&port.name.clone()) {
                error!("cannot initialize TLS for {}: {e}", port.name);
                process::exit(exitcode::CONFIG);
            }
        }

        let (lfd, local) = match r.open_listener(port.addr, &port.name, backlog) {
            Ok(ok) => ok,
            Err(e) => {
                error!("cannot listen on {}: {e}", port.name);
                process::exit(exitcode::CONFIG);
            }
        };
        info!("listening on {local} ({})", port.name);
        listener_fds.push(lfd);

        let port = Rc::new(port);
        match port.transport {
            PortTransport::Http | PortTransport::Https => {
                let p = port.clone();
                r.set_read_handler(
                    lfd,
                    Some(Box::new(move |r, lfd| {
                        client::accept_connections(r, lfd, &p)
                    })),
                );
            }
            PortTransport::Ftp => {
                let p = port.clone();
                r.set_read_handler(
                    lfd,
                    Some(Box::new(move |r, lfd| ftp::accept_connections(r, lfd, &p))),
                );
            }
        }
    }
    listener_fds
}

fn schedule_pool_clean(r: &mut Reactor) {
    r.events.add(
        "pool cleanup",
        mem::CLEAN_INTERVAL as f64,
        Box::new(|r| {
            mem::pools().clean_pools(mem::CLEAN_INTERVAL);
            schedule_pool_clean(r);
        }),
    );
}

/// One worker: a reactor, its listeners, and the pump loop.
fn worker_main(index: usize) {
    let cfg = get_config();
    let started_at = chrono::Utc::now();

    crate::auth::set_validator(Arc::new(StaticValidator {
        users: cfg.auth.basic_users.clone(),
    }));
    mem::pools().set_idle_limit(cfg.general.memory_pools_limit.as_bytes() as isize);

    let backend = cfg
        .general
        .backend_kind()
        .expect("backend validated at config time");
    let mut r = match Reactor::new(cfg.general.max_connections, backend) {
        Ok(r) => r,
        Err(e) => {
            error!("cannot initialize reactor: {e}");
            process::exit(exitcode::OSERR);
        }
    };
    info!("worker {index} using the {} backend", r.backend_name());

    let ports = match cfg.listening_ports() {
        Ok(p) => p,
        Err(e) => {
            error!("port configuration error: {e}");
            process::exit(exitcode::CONFIG);
        }
    };
    let listener_fds = start_listening(&mut r, ports);
    schedule_pool_clean(&mut r);

    if index == 0 {
        sd_notify::notify(false, &[sd_notify::NotifyState::Ready]).ok();
    }

    let mut listeners_open = true;
    loop {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) && listeners_open {
            info!("worker {index}: graceful shutdown, closing listeners");
            r.shutting_down = true;
            for &lfd in &listener_fds {
                r.comm_close(lfd);
            }
            listeners_open = false;
        }
        if RECONFIGURE_REQUESTED.swap(false, Ordering::SeqCst) {
            match crate::config::reload_config() {
                Ok(changed) => {
                    if changed {
                        crate::server::ipcache::flush();
                        crate::auth::cache::do_config_change_cleanup(&mut r);
                    }
                }
                Err(e) => error!("reconfigure failed: {e}"),
            }
        }

        event::run_due(&mut r);
        r.check_timeouts();

        match r.do_select(1000) {
            Flag::Ok | Flag::Timeout | Flag::Idle => {}
            Flag::Shutdown => {
                info!("worker {index}: drained, exiting");
                break;
            }
            Flag::CommError => {
                error!("worker {index}: reactor failure");
                process::exit(exitcode::IOERR);
            }
            Flag::ErrClosing => {}
        }
        if r.shutting_down && r.fds.number_fd() == 0 {
            break;
        }
    }

    mem::pools().flush_all_counters();
    info!(
        "worker {index}: uptime {}",
        crate::format_duration(&(chrono::Utc::now() - started_at))
    );
}
