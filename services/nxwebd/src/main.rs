mod modules;

use clap::{App, Arg};
use modules::benchmark::BenchmarkHandler;
use modules::hello::HelloHandler;
use modules::subreq::SubreqHandler;
use modules::upload::{EchoHandler, UploadHandler};
use nxweb::config::{Config, Listen};
use nxweb::filters::FileCacheFilter;
use nxweb::logging;
use nxweb::server::handler::{flags, HandlerBuilder, HandlerRegistry, ProxyHandler};
use nxweb::server::sendfile::SendfileHandler;
use nxweb::server::{Server, ServerRuntime};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static REOPEN_LOGS: AtomicBool = AtomicBool::new(false);
static DIAGNOSTICS: AtomicBool = AtomicBool::new(false);

// Signal handlers only flip flags (and _exit for the forced-shutdown
// alarm); a watcher thread does the actual work.
extern "C" fn on_sigterm(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_sigalrm(_sig: libc::c_int) {
    unsafe { libc::_exit(0) };
}

extern "C" fn on_sighup(_sig: libc::c_int) {
    REOPEN_LOGS.store(true, Ordering::SeqCst);
}

extern "C" fn on_sigusr2(_sig: libc::c_int) {
    DIAGNOSTICS.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    type Sigfn = extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGTERM, on_sigterm as Sigfn as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_sigterm as Sigfn as libc::sighandler_t);
        libc::signal(libc::SIGALRM, on_sigalrm as Sigfn as libc::sighandler_t);
        libc::signal(libc::SIGHUP, on_sighup as Sigfn as libc::sighandler_t);
        libc::signal(libc::SIGUSR1, on_sighup as Sigfn as libc::sighandler_t);
        libc::signal(libc::SIGUSR2, on_sigusr2 as Sigfn as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn read_pid_file(path: &Path) -> Option<libc::pid_t> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<libc::pid_t>()
        .ok()
}

fn write_pid_file(path: &Path) {
    let pid = unsafe { libc::getpid() };
    if std::fs::write(path, format!("{}\n", pid)).is_err() {
        eprintln!("can't write pid file {}", path.display());
    }
}

/// Stop a running instance via its pid file.
fn shutdown_running_instance(pid_file: &Path) -> i32 {
    match read_pid_file(pid_file) {
        Some(pid) => {
            if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
                println!("sent SIGTERM to pid {}", pid);
                0
            } else {
                eprintln!("can't signal pid {}", pid);
                1
            }
        }
        None => {
            eprintln!("can't read pid file {}", pid_file.display());
            1
        }
    }
}

fn drop_privileges(group: Option<&str>, user: Option<&str>) -> Result<(), String> {
    unsafe {
        if let Some(group) = group {
            let cname = std::ffi::CString::new(group).map_err(|_| "bad group name".to_owned())?;
            let gr = libc::getgrnam(cname.as_ptr());
            if gr.is_null() {
                return Err(format!("unknown group {}", group));
            }
            if libc::setgid((*gr).gr_gid) != 0 {
                return Err(format!("can't setgid to {}", group));
            }
        }
        if let Some(user) = user {
            let cname = std::ffi::CString::new(user).map_err(|_| "bad user name".to_owned())?;
            let pw = libc::getpwnam(cname.as_ptr());
            if pw.is_null() {
                return Err(format!("unknown user {}", user));
            }
            if libc::setuid((*pw).pw_uid) != 0 {
                return Err(format!("can't setuid to {}", user));
            }
        }
    }
    Ok(())
}

fn build_registry(config: &Config) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    registry.register(
        HandlerBuilder::new("benchmark", Arc::new(BenchmarkHandler))
            .prefix("/benchmark-inprocess")
            .priority(100)
            .flags(flags::HANDLE_GET)
            .build(),
    );
    registry.register(
        HandlerBuilder::new("benchmark_inworker", Arc::new(BenchmarkHandler))
            .prefix("/benchmark-inworker")
            .priority(100)
            .flags(flags::HANDLE_GET | flags::INWORKER)
            .build(),
    );
    registry.register(
        HandlerBuilder::new("hello", Arc::new(HelloHandler))
            .prefix("/hello")
            .priority(1000)
            .flags(flags::HANDLE_GET | flags::PARSE_PARAMETERS | flags::PARSE_COOKIES)
            .build(),
    );
    registry.register(
        HandlerBuilder::new("echo", Arc::new(EchoHandler))
            .prefix("/echo")
            .priority(150_000)
            .flags(flags::HANDLE_POST)
            .build(),
    );
    registry.register(
        HandlerBuilder::new("upload", Arc::new(UploadHandler))
            .prefix("/upload")
            .priority(200_000)
            .flags(flags::HANDLE_POST | flags::INWORKER)
            .build(),
    );
    registry.register(
        HandlerBuilder::new("subreq", Arc::new(SubreqHandler))
            .prefix("/subreq")
            .priority(200_000)
            .flags(flags::HANDLE_GET)
            .build(),
    );

    // one proxy handler per configured backend, with an on-disk cache
    for (idx, _backend) in config.backends.iter().enumerate() {
        let prefix = format!("/backend{}", idx + 1);
        let name: &'static str = Box::leak(format!("backend{}", idx + 1).into_boxed_str());
        let prefix_static: &'static str = Box::leak(prefix.into_boxed_str());
        registry.register(
            HandlerBuilder::new(name, Arc::new(ProxyHandler))
                .prefix(prefix_static)
                .priority(10_000)
                .flags(flags::HANDLE_ANY | flags::ACCEPT_CONTENT)
                .uri("")
                .proxy_pool(idx)
                .filter(Arc::new(FileCacheFilter::new("www/cache/proxy")))
                .build(),
        );
    }

    // static files from the document root, lowest priority
    registry.register(
        HandlerBuilder::new("sendfile", Arc::new(SendfileHandler))
            .priority(900_000)
            .flags(flags::HANDLE_GET)
            .dir("www/root")
            .memcache(true)
            .charset("utf-8")
            .index_file("index.htm")
            .build(),
    );

    registry
}

fn main() {
    let matches = App::new("nxwebd")
        .version(nxweb::REVISION)
        .version_short("v")
        .author("Bush Hammer Industries")
        .about("Runs the nxweb http server.")
        .arg(Arg::with_name("daemon").short("d").help("Run as daemon"))
        .arg(
            Arg::with_name("shutdown")
                .short("s")
                .help("Shutdown a running instance via its pid file"),
        )
        .arg(
            Arg::with_name("work_dir")
                .short("w")
                .takes_value(true)
                .value_name("DIR")
                .help("Change working directory"),
        )
        .arg(
            Arg::with_name("error_log")
                .short("l")
                .takes_value(true)
                .value_name("FILE")
                .help("Error log file"),
        )
        .arg(
            Arg::with_name("access_log")
                .short("a")
                .takes_value(true)
                .value_name("FILE")
                .help("Access log file"),
        )
        .arg(
            Arg::with_name("pid_file")
                .short("p")
                .takes_value(true)
                .value_name("FILE")
                .help("Pid file"),
        )
        .arg(
            Arg::with_name("user")
                .short("u")
                .takes_value(true)
                .value_name("USER")
                .help("Drop privileges to user"),
        )
        .arg(
            Arg::with_name("group")
                .short("g")
                .takes_value(true)
                .value_name("GROUP")
                .help("Drop privileges to group"),
        )
        .arg(
            Arg::with_name("http")
                .short("H")
                .takes_value(true)
                .value_name("[IP]:PORT")
                .help("Http bind address"),
        )
        .arg(
            Arg::with_name("https")
                .short("S")
                .takes_value(true)
                .value_name("[IP]:PORT")
                .help("Https bind address"),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .takes_value(true)
                .value_name("FILE")
                .help("Config file (JSON)"),
        )
        .arg(
            Arg::with_name("target")
                .short("T")
                .takes_value(true)
                .value_name("TARGET")
                .help("Config target to apply"),
        )
        .get_matches();

    if let Some(dir) = matches.value_of("work_dir") {
        if std::env::set_current_dir(dir).is_err() {
            eprintln!("can't chdir to {}", dir);
            std::process::exit(1);
        }
    }

    let mut config = match matches.value_of("config") {
        Some(path) => match Config::load(path, matches.value_of("target")) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{}", err);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    // command-line overrides
    if let Some(addr) = matches.value_of("http") {
        config.listen.insert(
            0,
            Listen {
                address: addr.to_owned(),
                secure: false,
                backlog: 4096,
            },
        );
    }
    if let Some(addr) = matches.value_of("https") {
        config.listen.push(Listen {
            address: addr.to_owned(),
            secure: true,
            backlog: 1024,
        });
    }
    if config.listen.is_empty() {
        config.listen.push(Listen {
            address: format!(":{}", nxweb::config::DEFAULT_PORT),
            secure: false,
            backlog: 4096,
        });
    }
    if let Some(path) = matches.value_of("error_log") {
        config.error_log = Some(PathBuf::from(path));
    }
    if let Some(path) = matches.value_of("access_log") {
        config.access_log = Some(PathBuf::from(path));
    }
    if let Some(path) = matches.value_of("pid_file") {
        config.pid_file = Some(PathBuf::from(path));
    }
    if let Some(user) = matches.value_of("user") {
        config.user = Some(user.to_owned());
    }
    if let Some(group) = matches.value_of("group") {
        config.group = Some(group.to_owned());
    }

    if matches.is_present("shutdown") {
        let pid_file = config
            .pid_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("nxweb.pid"));
        std::process::exit(shutdown_running_instance(&pid_file));
    }

    if matches.is_present("daemon") {
        if unsafe { libc::daemon(1, 0) } != 0 {
            eprintln!("can't daemonize");
            std::process::exit(1);
        }
    }

    let log = logging::init(config.error_log.as_deref(), config.log_level());

    if let Some(pid_file) = config.pid_file.clone() {
        write_pid_file(&pid_file);
    }
    nxweb::access_log::restart(config.access_log.as_deref());

    if let Err(err) = drop_privileges(config.group.as_deref(), config.user.as_deref()) {
        logging::error!(log, "can't drop privileges"; "err" => %err);
        // simulate normal exit so the supervisor does not respawn
        std::process::exit(0);
    }

    let registry = build_registry(&config);
    let shutdown_timeout = config.shutdown_timeout;

    let runtime = match ServerRuntime::new(config, registry) {
        Ok(runtime) => runtime,
        Err(err) => {
            logging::error!(log, "startup failed"; "err" => %err);
            std::process::exit(0);
        }
    };
    let server = match Server::new(runtime, log.clone()) {
        Ok(server) => server,
        Err(err) => {
            logging::error!(log, "bind failed"; "err" => %err);
            std::process::exit(0);
        }
    };

    install_signal_handlers();

    // watcher: translate signal flags into server actions
    let shutdown = server.shutdown.clone();
    let watcher_log = log.clone();
    std::thread::spawn(move || loop {
        if SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst) {
            logging::error!(watcher_log, "shutdown signal received");
            shutdown.trigger();
            // force exit if connections refuse to drain
            unsafe { libc::alarm(shutdown_timeout as libc::c_uint) };
        }
        if REOPEN_LOGS.swap(false, Ordering::SeqCst) {
            logging::error!(watcher_log, "reopening access log");
            nxweb::access_log::restart(None);
        }
        if DIAGNOSTICS.swap(false, Ordering::SeqCst) {
            logging::error!(watcher_log, "diagnostics requested");
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    });

    if let Err(err) = server.run() {
        logging::error!(log, "server run failed"; "err" => %err);
        std::process::exit(0);
    }
}
