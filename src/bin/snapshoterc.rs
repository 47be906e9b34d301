// Copyright 2019 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::path::PathBuf;

use clap::{App, Arg, ArgMatches, SubCommand};
use tokio::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

use snapshoterc::config::Config;
use snapshoterc::control::{default_socket_path, ControlListener};
use snapshoterc::env::{self, Environment};
use snapshoterc::procs::{
    CollisionPolicy, Launcher, Leader, RestartLimits, SessionManager, Supervisor,
};
use snapshoterc::tmux::Tmux;
use snapshoterc::Error;

const START: &str = "start";
const SUPERVISE: &str = "supervise";
const STATUS: &str = "status";
const START_SESSION: &str = "start-session";
const STOP: &str = "stop";
const RESTART: &str = "restart";
const SHUTDOWN: &str = "shutdown";
const LIST: &str = "list";

const CONFIG: &str = "config";
const ENV_FILE: &str = "env-file";
const WORKING_DIR: &str = "working-dir";
const TMUX_SOCKET: &str = "tmux-socket";
const REPLACE: &str = "replace";
const SOCKET: &str = "socket";
const LOG_DIR: &str = "log-dir";
const NAME: &str = "NAME";

trait SetupClapApp {
    fn setup_clap_app(self) -> Self;
    fn config_opts(self) -> Self;
    fn layout_opts(self) -> Self;
    fn tmux_opts(self) -> Self;
    fn socket_opts(self) -> Self;
    fn name_arg(self) -> Self;
}

impl<'a, 'b> SetupClapApp for App<'a, 'b> {
    fn setup_clap_app(self) -> Self {
        self.version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
    }

    fn config_opts(self) -> Self {
        self.arg(
            Arg::with_name(CONFIG)
                .short("c")
                .long(CONFIG)
                .value_name("FILE")
                .env("SNAPSHOTERC_CONFIG")
                .help("TOML manifest of the sessions to run")
                .takes_value(true),
        )
    }

    fn layout_opts(self) -> Self {
        self.arg(
            Arg::with_name(ENV_FILE)
                .short("e")
                .long(ENV_FILE)
                .value_name("FILE")
                .help("environment setup file, defaults to ../../set_pythonpath.sh from the executable")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(WORKING_DIR)
                .short("w")
                .long(WORKING_DIR)
                .value_name("DIR")
                .help("working directory of the workers, defaults to the setup file's directory")
                .takes_value(true),
        )
    }

    fn tmux_opts(self) -> Self {
        self.arg(
            Arg::with_name(TMUX_SOCKET)
                .short("L")
                .long(TMUX_SOCKET)
                .value_name("NAME")
                .help("tmux server socket name (tmux -L)")
                .takes_value(true),
        )
    }

    fn socket_opts(self) -> Self {
        self.arg(
            Arg::with_name(SOCKET)
                .short("s")
                .long(SOCKET)
                .value_name("PATH")
                .help("supervisor control socket")
                .takes_value(true),
        )
    }

    fn name_arg(self) -> Self {
        self.arg(
            Arg::with_name(NAME)
                .help("session name")
                .required(true)
                .index(1),
        )
    }
}

fn app() -> App<'static, 'static> {
    App::new(env!("CARGO_PKG_NAME"))
        .setup_clap_app()
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand(
            SubCommand::with_name(START)
                .about("start every session detached in tmux, then exit (the default without a command)")
                .setup_clap_app()
                .config_opts()
                .layout_opts()
                .tmux_opts()
                .arg(
                    Arg::with_name(REPLACE)
                        .long(REPLACE)
                        .help("kill and recreate sessions that already exist, instead of skipping them"),
                ),
        )
        .subcommand(
            SubCommand::with_name(SUPERVISE)
                .about("run every session as a supervised child process, restarting failed workers")
                .setup_clap_app()
                .config_opts()
                .layout_opts()
                .socket_opts()
                .arg(
                    Arg::with_name(LOG_DIR)
                        .long(LOG_DIR)
                        .value_name("DIR")
                        .help("append worker output to DIR/<session>.log")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name(STATUS)
                .about("show the workers of a running supervisor")
                .config_opts()
                .socket_opts(),
        )
        .subcommand(
            SubCommand::with_name(START_SESSION)
                .about("start a stopped worker")
                .config_opts()
                .socket_opts()
                .name_arg(),
        )
        .subcommand(
            SubCommand::with_name(STOP)
                .about("stop a worker")
                .config_opts()
                .socket_opts()
                .name_arg(),
        )
        .subcommand(
            SubCommand::with_name(RESTART)
                .about("restart a worker")
                .config_opts()
                .socket_opts()
                .name_arg(),
        )
        .subcommand(
            SubCommand::with_name(SHUTDOWN)
                .about("stop every worker and the supervisor")
                .config_opts()
                .socket_opts(),
        )
        .subcommand(
            SubCommand::with_name(LIST)
                .about("show which sessions exist in tmux")
                .config_opts()
                .tmux_opts(),
        )
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("snapshoterc=info")),
        )
        .init();
}

fn main() {
    init_tracing();
    let args = app().get_matches();

    let code = match runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => match runtime.block_on(run(&args)) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: {}", e);
                2
            }
        },
        Err(e) => {
            eprintln!("error: failed to initialize Tokio Runtime: {}", e);
            2
        }
    };

    std::process::exit(code);
}

async fn run(args: &ArgMatches<'_>) -> Result<i32, Error> {
    match args.subcommand() {
        (START, Some(args)) => start(args).await,
        (SUPERVISE, Some(args)) => supervise(args).await,
        (STATUS, Some(args)) => status(args).await,
        (START_SESSION, Some(args)) => leader(args)?.start(name(args)?).await.map(|_| 0),
        (STOP, Some(args)) => leader(args)?.stop(name(args)?).await.map(|_| 0),
        (RESTART, Some(args)) => leader(args)?.restart(name(args)?).await.map(|_| 0),
        (SHUTDOWN, Some(args)) => leader(args)?.shutdown().await.map(|_| 0),
        (LIST, Some(args)) => list(args).await,
        // no command given, start every session with the defaults
        ("", None) => start(args).await,
        (arg, _) => Err(format!("unexpected command: {}", arg).into()),
    }
}

fn load_config(args: &ArgMatches<'_>) -> Result<Config, Error> {
    match args.value_of_os(CONFIG) {
        Some(path) => Config::load(&PathBuf::from(path)),
        None => Ok(Config::default()),
    }
}

/// The environment setup file and the workers' working directory
fn layout(args: &ArgMatches<'_>, config: &Config) -> Result<(PathBuf, PathBuf), Error> {
    let own_dir = env::resolve_own_directory()?;

    let env_file = args
        .value_of_os(ENV_FILE)
        .map(PathBuf::from)
        .unwrap_or_else(|| config.env_file(&own_dir));
    let work_dir = args
        .value_of_os(WORKING_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| config.working_dir(&env_file));

    Ok((env_file, work_dir))
}

fn tmux(args: &ArgMatches<'_>, config: &Config) -> Tmux {
    let mut tmux = config.tmux.clone();
    if let Some(socket_name) = args.value_of(TMUX_SOCKET) {
        tmux.socket_name = Some(socket_name.to_string());
    }
    Tmux::new(&tmux)
}

fn socket(args: &ArgMatches<'_>, config: &Config) -> PathBuf {
    args.value_of_os(SOCKET)
        .map(PathBuf::from)
        .or_else(|| config.supervisor.socket.clone())
        .unwrap_or_else(default_socket_path)
}

fn name<'a>(args: &'a ArgMatches<'_>) -> Result<&'a str, Error> {
    args.value_of(NAME)
        .ok_or_else(|| Error::from("session name is required"))
}

fn leader(args: &ArgMatches<'_>) -> Result<Leader, Error> {
    let config = load_config(args)?;
    Ok(Leader::new(socket(args, &config)))
}

async fn start(args: &ArgMatches<'_>) -> Result<i32, Error> {
    let config = load_config(args)?;
    let (env_file, work_dir) = layout(args, &config)?;

    let collision = if args.is_present(REPLACE) {
        CollisionPolicy::Replace
    } else {
        CollisionPolicy::Skip
    };

    let launcher = Launcher::new(tmux(args, &config), config.sessions()?, env_file, work_dir)?
        .with_collision_policy(collision);
    let report = launcher.launch(&env::process_environment()).await?;

    print!("{}", report);
    Ok(if report.is_success() { 0 } else { 1 })
}

async fn supervise(args: &ArgMatches<'_>) -> Result<i32, Error> {
    let config = load_config(args)?;
    let (env_file, work_dir) = layout(args, &config)?;
    let sessions = config.sessions()?;

    // nothing is spawned when the environment can't be loaded
    let env = Environment::load(&env_file, &env::process_environment())?;

    let log_dir = args
        .value_of_os(LOG_DIR)
        .map(PathBuf::from)
        .or_else(|| config.supervisor.log_dir.clone());

    let listener = ControlListener::bind(&socket(args, &config)).await?;
    let supervisor = Supervisor::start(
        sessions,
        env,
        work_dir,
        RestartLimits::from_config(&config.supervisor),
        log_dir,
    )
    .await?;

    supervisor.serve(listener).await?;
    info!("supervisor exited");
    Ok(0)
}

async fn status(args: &ArgMatches<'_>) -> Result<i32, Error> {
    let workers = leader(args)?.status().await?;

    let width = workers.iter().map(|w| w.name.len()).max().unwrap_or(0);
    for worker in workers {
        println!(
            "{:width$}  {}  (restarts: {})",
            worker.name,
            worker.state,
            worker.restarts,
            width = width
        );
    }
    Ok(0)
}

async fn list(args: &ArgMatches<'_>) -> Result<i32, Error> {
    let config = load_config(args)?;
    let sessions = config.sessions()?;
    let existing = tmux(args, &config).list_sessions().await?;

    for spec in sessions {
        let state = if existing.iter().any(|s| s == spec.name().as_str()) {
            "running"
        } else {
            "absent"
        };
        println!("{}\t{}", spec.name(), state);
    }
    Ok(0)
}
