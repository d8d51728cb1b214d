use std::{error::Error, path::PathBuf, process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::sync::broadcast::error::RecvError;

use jukebox::{
    config::Config,
    events::Event,
    local::{DirectoryMedia, JsonPlayStore, PlayLog, SimulatedOutputs, StaticParticipants},
    provider::Services,
    session::{Session, Sessions},
    signal::{Handler, ShutdownSignal},
    track::{ParticipantId, RoomId},
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, PartialEq, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// A missing file is not an error: every setting has a default.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("jukebox.toml"), env = "JUKEBOX_CONFIG")]
    config: String,

    /// Room to play in
    #[arg(short, long, default_value_t = String::from("local"), env = "JUKEBOX_ROOM")]
    room: String,

    /// Participants present in the room
    ///
    /// Overrides the roster of the configuration file.
    #[arg(short, long, value_delimiter = ',', env = "JUKEBOX_PARTICIPANTS")]
    participants: Vec<String>,

    /// JSON file with the play log
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    plays_file: Option<PathBuf>,

    /// Directory with one audio file per track id
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    media_directory: Option<PathBuf>,

    /// Directory for cache files
    #[arg(long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    cache_directory: Option<PathBuf>,

    /// Neither read nor write caches
    #[arg(long, default_value_t = false)]
    no_cache: bool,

    /// Import plays from another play log before starting
    #[arg(long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    import: Option<PathBuf>,

    /// Track ids to request on start, in order
    #[arg(short, long, value_name = "ID")]
    enqueue: Vec<String>,

    /// Seconds a track of unknown length plays for
    #[arg(long, default_value_t = 180)]
    fallback_length: u64,

    /// Play this many times faster than real time
    #[arg(long, default_value_t = 1)]
    speedup: u32,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Loads the configuration file and applies command line overrides.
fn load_config(args: &Args) -> jukebox::error::Result<Config> {
    let mut config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) if e.kind == jukebox::error::ErrorKind::NotFound => {
            info!("{} not found, using defaults", args.config);
            Config::default()
        }
        Err(e) => return Err(e),
    };

    if !args.participants.is_empty() {
        config.library.participants.clone_from(&args.participants);
    }
    if let Some(plays_file) = &args.plays_file {
        config.library.plays_file.clone_from(plays_file);
    }
    if let Some(media_directory) = &args.media_directory {
        config.library.media_directory.clone_from(media_directory);
    }
    if let Some(cache_directory) = &args.cache_directory {
        config.cache.directory.clone_from(cache_directory);
    }
    if args.no_cache {
        config.cache.enabled = false;
    }

    Ok(config)
}

fn roster(config: &Config) -> Vec<ParticipantId> {
    config
        .library
        .participants
        .iter()
        .map(|participant| ParticipantId::from(participant.as_str()))
        .collect()
}

/// Logs what plays after a track change.
async fn log_track_change(session: &Session) {
    match session.now_playing().await {
        Some(now_playing) => {
            let title = now_playing
                .track
                .as_ref()
                .map_or_else(|| now_playing.entry.id.to_string(), ToString::to_string);
            let length = now_playing
                .total_secs
                .map_or_else(|| "?".to_owned(), |secs| format!("{}:{:02}", secs / 60, secs % 60));
            info!("now playing {title} [{length}], {}", now_playing.entry);
        }
        None => info!("nothing playing in room {}", session.room()),
    }
}

/// Main application loop.
///
/// # Errors
///
/// This function returns an error when the configuration or the play log
/// cannot be loaded, or the room cannot be opened.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args)?;
    let store = Arc::new(JsonPlayStore::open(&config.library.plays_file).await?);
    let present = roster(&config);
    let requester = present
        .first()
        .cloned()
        .unwrap_or_else(|| ParticipantId::from("local"));
    let participants = Arc::new(StaticParticipants::new(present));
    if config.library.participants.is_empty() {
        warn!("no participants configured, shuffle will not find anything to play");
    }

    let services = Services {
        media: Arc::new(DirectoryMedia::new(&config.library.media_directory)),
        metadata: Arc::clone(&store) as _,
        participants: Arc::clone(&participants) as _,
        plays: Arc::clone(&store) as _,
        outputs: Arc::new(SimulatedOutputs::new(
            Arc::clone(&store) as _,
            Duration::from_secs(args.fallback_length),
            args.speedup,
        )),
    };

    let sessions = Sessions::new(config, services);
    let room = RoomId::new(args.room.as_str());
    let session = sessions.get_or_create(&room)?;
    let mut events = session.events();

    if let Some(path) = &args.import {
        let contents = tokio::fs::read(path).await?;
        let log: PlayLog = serde_json::from_slice(&contents)?;
        session.import_history(log.plays).await?;
    }

    for id in &args.enqueue {
        if let Err(e) = session.enqueue(&id.as_str().into(), &requester).await {
            error!("failed to queue {id}: {e}");
        }
    }

    if session.state().current.is_none() {
        if let Err(e) = session.play_next().await {
            error!("{e}");
        }
    }

    let mut signals = Handler::new()?;
    loop {
        tokio::select! {
            // Prioritize signals.
            biased;

            signal = signals.recv() => {
                if signal.is_shutdown() {
                    info!("received {signal}, shutting down gracefully");
                    sessions.shutdown();
                    break Ok(());
                }

                debug_assert_eq!(signal, ShutdownSignal::Reload);
                match load_config(&args) {
                    Ok(config) => {
                        info!("received {signal}, reloading participants");
                        participants.set(roster(&config));
                        if sessions.reap_empty().await > 0 {
                            info!("everyone left room {room}, shutting down");
                            sessions.shutdown();
                            break Ok(());
                        }
                    }
                    Err(e) => error!("failed to reload {}: {e}", args.config),
                }
            }

            event = events.recv() => match event {
                Ok(Event::TrackChanged) => log_track_change(&session).await,
                Ok(Event::NothingToPlay) => {
                    warn!("nothing to play in room {room}; queue tracks or check the play log");
                }
                Ok(event) => debug!("{event:?}"),
                Err(RecvError::Lagged(missed)) => warn!("missed {missed} events"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    }
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
