pub mod models {
    pub mod feeder;
}

pub mod client;
pub mod clock;
pub mod config;
pub mod notify;
pub mod runtime;
pub mod services {
    pub mod history;
    pub mod mock;
    pub mod next_feed;
    pub mod schedules;
    pub mod settings;
    pub mod status;
}

use crate::client::{FeederApi, FeederClient};
use crate::clock::{SystemClock, format_time_of_day};
use crate::config::{Config, load_env_file};
use crate::models::feeder::{HistoryData, MachineStatus, Schedule, Settings};
use crate::runtime::{Notice, NoticeLevel, Runtime};
use crate::services::mock::MockFeeder;
use crate::services::next_feed::NextFeed;
use chrono::{Local, Utc};
use log::{debug, error, info, warn};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::mpsc::{self, Sender};
use std::thread;

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
    variables: usize,
}

#[derive(Debug, Default)]
struct CliOptions {
    env_file: Option<PathBuf>,
    mock: bool,
    push_stdin: bool,
}

fn parse_cli() -> Result<CliOptions, String> {
    let mut args = std::env::args_os();
    args.next(); // skip program name

    let mut opts = CliOptions::default();
    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--env-file") => {
                if opts.env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let value = args
                    .next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
                opts.env_file = Some(PathBuf::from(value));
            }
            Some(s) if s.starts_with("--env-file=") => {
                if opts.env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let path_str = &s["--env-file=".len()..];
                if path_str.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                opts.env_file = Some(PathBuf::from(path_str));
            }
            Some("--mock") => opts.mock = true,
            Some("--push-stdin") => opts.push_stdin = true,
            Some("--") => break,
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        }
    }
    Ok(opts)
}

fn configure_env(explicit: Option<&PathBuf>) -> Result<Option<LoadedEnvFile>, String> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        let variables = load_env_file(path)?;
        return Ok(Some(LoadedEnvFile {
            path: path.clone(),
            explicit: true,
            variables,
        }));
    }

    let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
    let default_path = cwd.join(".env");
    if !default_path.is_file() {
        return Ok(None);
    }
    let variables = load_env_file(&default_path)?;
    Ok(Some(LoadedEnvFile {
        path: default_path,
        explicit: false,
        variables,
    }))
}

/// Forward every non-empty stdin line to the event loop as a push message.
fn spawn_stdin_reader(tx: Sender<String>) -> Result<(), String> {
    thread::Builder::new()
        .name("push-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                if tx.send(line).is_err() {
                    break;
                }
            }
            debug!("stdin closed");
        })
        .map(|_| ())
        .map_err(|e| format!("failed to start stdin reader: {}", e))
}

fn describe_next_feed(next: Option<&NextFeed>) -> String {
    match next {
        None => "no schedule selected".to_string(),
        Some(NextFeed::At { daytime_ms }) => format_time_of_day(&Local, *daytime_ms, Utc::now()),
        Some(NextFeed::MaxTimes {
            per_day,
            window_start_ms,
        }) => match window_start_ms {
            Some(start) => format!(
                "up to {} portion(s) per day from {}",
                per_day,
                format_time_of_day(&Local, *start, Utc::now())
            ),
            None => format!("up to {} portion(s) per day", per_day),
        },
    }
}

/// Log every observable change to the console.
fn attach_console<A: FeederApi>(runtime: &Runtime<A>) {
    runtime.status().status().subscribe(|s: &MachineStatus| {
        debug!(
            "Status: container {:.1} g, plate {:.1} g, gate {}",
            s.container_load,
            s.plate_load,
            if s.open { "open" } else { "closed" }
        );
        if !s.sd_card_connection {
            warn!("Feeder reports no SD card");
        }
    });
    runtime.status().connected().subscribe(|c: &bool| {
        if *c {
            info!("Feeder connected");
        } else {
            warn!("Feeder unreachable");
        }
    });
    runtime.schedules().channel().subscribe(|list: &Vec<Schedule>| {
        let selected = list.iter().find(|s| s.selected).map(|s| s.name.as_str());
        info!("{} schedule(s), selected: {}", list.len(), selected.unwrap_or("-"));
    });
    runtime.settings().channel().subscribe(|s: &Settings| {
        info!(
            "Settings: pet {}, language {:?}",
            s.pet_name.as_deref().unwrap_or("-"),
            s.language
        );
    });
    runtime.next_feed().subscribe(|next: &Option<NextFeed>| {
        info!("Next feed: {}", describe_next_feed(next.as_ref()));
    });
    runtime.history().delta().subscribe(|delta: &HistoryData| {
        for event in &delta.events {
            info!("Event {:?} at {}: {}", event.kind, event.created_on, event.value);
        }
        if !delta.scale_data.is_empty() {
            debug!("{} new scale sample(s)", delta.scale_data.len());
        }
    });
    runtime.notices().subscribe(|n: &Notice| match n.level {
        NoticeLevel::Info => info!("{}", n.message),
        NoticeLevel::Error => error!("{}", n.message),
    });
}

fn drive<A: FeederApi>(api: A, cfg: &Config, push_stdin: bool) -> Result<(), String> {
    let mut runtime = Runtime::new(api, Rc::new(SystemClock), cfg.polling);
    attach_console(&runtime);

    let (tx, inbox) = mpsc::channel();
    if push_stdin {
        spawn_stdin_reader(tx)?;
        info!("Reading push messages from stdin");
    } else {
        drop(tx);
    }

    runtime.bootstrap();
    runtime.run(inbox);
    Ok(())
}

fn run(opts: &CliOptions) -> Result<(), String> {
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (api_url={}, poll_normal={:.1}s, poll_fast={:.1}s, change_threshold={}, slow_grace={:.1}s, timeout={:.1}s, mock={})",
        cfg.api_url,
        cfg.polling.normal.as_secs_f64(),
        cfg.polling.fast.as_secs_f64(),
        cfg.polling.change_threshold,
        cfg.polling.slow_grace.as_secs_f64(),
        cfg.request_timeout.as_secs_f64(),
        cfg.mock_device || opts.mock
    );

    if cfg.mock_device || opts.mock {
        info!("Using the in-memory mock feeder (seed {})", cfg.mock_seed);
        drive(MockFeeder::with_demo_data(cfg.mock_seed), &cfg, opts.push_stdin)
    } else {
        let client = FeederClient::new(&cfg.api_url, cfg.request_timeout);
        info!("Talking to feeder at {}", client.base_url());
        drive(client, &cfg, opts.push_stdin)
    }
}

fn main() {
    let (opts, loaded_env) = match parse_cli().and_then(|opts| {
        let loaded = configure_env(opts.env_file.as_ref())?;
        Ok((opts, loaded))
    }) {
        Ok(v) => v,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!(
            "Environment loaded from {} .env file: {} ({} variable(s))",
            origin,
            info.path.display(),
            info.variables
        );
    }

    info!(
        "tgrbx-sync {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(&opts) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
