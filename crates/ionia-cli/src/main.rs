// crates/ionia-cli/src/main.rs
//
// Command-line surface over the recorder: start a capture session, run it
// for a fixed duration (or until Enter), print statistics as JSON.

use std::io::BufRead;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};

use ionia_media::pipeline::PipelineEvent;
use ionia_media::{
    apartment, AudioOptions, CaptureMode, OutputKind, Recorder, RecorderConfig, VideoOptions,
};

#[derive(Parser)]
#[command(name = "ionia", about = "Desktop A/V capture to MP4, RTMP, or raw AAC", version)]
struct Cli {
    /// Verbose diagnostic output (same as IONIA_DEBUG_LOGS=1).
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record to a local file (MP4, or raw ADTS AAC with --raw-aac).
    Record {
        /// Output path (.mp4, or .aac with --raw-aac).
        #[arg(short, long)]
        output: String,

        /// Audio-only: raw AAC with ADTS headers, no video.
        #[arg(long)]
        raw_aac: bool,

        #[command(flatten)]
        opts: SessionArgs,
    },

    /// Stream to an RTMP ingest URL as FLV.
    Stream {
        /// rtmp:// URL including stream key.
        #[arg(short, long)]
        url: String,

        /// Stream buffer capacity in packets.
        #[arg(long, default_value_t = 256)]
        max_queue: usize,

        /// Stream buffer latency budget in milliseconds.
        #[arg(long, default_value_t = 3000)]
        max_latency_ms: i64,

        #[command(flatten)]
        opts: SessionArgs,
    },

    /// Print the ambient COM apartment mode (STA/MTA/UNKNOWN).
    Apartment,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Mic,
    Desktop,
    Both,
}

impl From<ModeArg> for CaptureMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Mic => CaptureMode::Mic,
            ModeArg::Desktop => CaptureMode::Desktop,
            ModeArg::Both => CaptureMode::Both,
        }
    }
}

#[derive(Args)]
struct SessionArgs {
    /// Which audio sources to capture.
    #[arg(long, value_enum, default_value = "both")]
    mode: ModeArg,

    /// Seconds to run; 0 = run until Enter is pressed.
    #[arg(short, long, default_value_t = 10)]
    duration: u64,

    #[arg(long, default_value_t = 1920)]
    width: u32,

    #[arg(long, default_value_t = 1080)]
    height: u32,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Video bitrate in bits/s.
    #[arg(long, default_value_t = 5_000_000)]
    video_bitrate: usize,

    /// AAC bitrate in bits/s.
    #[arg(long, default_value_t = 192_000)]
    audio_bitrate: usize,

    /// Linear gain applied to the microphone before mixing.
    #[arg(long, default_value_t = 1.2)]
    mic_gain: f32,

    /// Prefer the NVENC hardware encoder.
    #[arg(long)]
    nvenc: bool,

    /// Print a statistics snapshot every N seconds while running.
    #[arg(long)]
    stats_every: Option<u64>,
}

impl SessionArgs {
    fn apply(&self, config: &mut RecorderConfig) {
        config.video = VideoOptions {
            width: self.width,
            height: self.height,
            fps: self.fps,
            bitrate: self.video_bitrate,
            use_nvenc: self.nvenc,
        };
        config.audio = AudioOptions { bitrate: self.audio_bitrate, mic_gain: self.mic_gain };
    }
}

fn debug_logs_from_env() -> bool {
    std::env::var("IONIA_DEBUG_LOGS")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn init_logging(debug: bool) {
    let mut builder = env_logger::Builder::from_default_env();
    if debug {
        builder.filter_level(log::LevelFilter::Debug);
    } else if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(log::LevelFilter::Info);
    }
    builder.init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug || debug_logs_from_env());

    match cli.command {
        Command::Apartment => {
            println!("{}", apartment::probe());
            Ok(())
        }
        Command::Record { output, raw_aac, opts } => {
            let kind = if raw_aac { OutputKind::RawAac } else { OutputKind::Mp4 };
            let mut config = RecorderConfig::new(opts.mode.into(), kind, output);
            opts.apply(&mut config);
            run_session(config, &opts)
        }
        Command::Stream { url, max_queue, max_latency_ms, opts } => {
            let mut config = RecorderConfig::new(opts.mode.into(), OutputKind::Rtmp, url);
            opts.apply(&mut config);
            config.stream_max_packets = max_queue;
            config.stream_max_latency_ms = max_latency_ms;
            run_session(config, &opts)
        }
    }
}

fn run_session(config: RecorderConfig, opts: &SessionArgs) -> Result<()> {
    let mut recorder = Recorder::initialise(config)?;
    recorder.start()?;

    if opts.duration == 0 {
        log::info!("recording — press Enter to stop");
    } else {
        log::info!("recording for {} s", opts.duration);
    }

    let started = Instant::now();
    let mut last_stats = Instant::now();
    let stop_reader = spawn_enter_listener(opts.duration == 0);

    loop {
        std::thread::sleep(Duration::from_millis(200));

        while let Some(event) = recorder.poll_event() {
            match event {
                PipelineEvent::Fatal(msg) => log::error!("pipeline: {msg}"),
                PipelineEvent::Disconnected => log::error!("network sink disconnected"),
            }
        }

        if !recorder.is_running() {
            break;
        }
        if opts.duration > 0 && started.elapsed() >= Duration::from_secs(opts.duration) {
            break;
        }
        if let Some(rx) = &stop_reader {
            if rx.try_recv().is_ok() {
                break;
            }
        }
        if let Some(every) = opts.stats_every {
            if last_stats.elapsed() >= Duration::from_secs(every) {
                last_stats = Instant::now();
                println!("{}", serde_json::to_string(&recorder.stats())?);
            }
        }
    }

    recorder.stop()?;
    println!("{}", serde_json::to_string_pretty(&recorder.stats())?);
    Ok(())
}

/// When running without a duration, a line on stdin ends the session.
fn spawn_enter_listener(enabled: bool) -> Option<std::sync::mpsc::Receiver<()>> {
    if !enabled {
        return None;
    }
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        let _ = stdin.lock().read_line(&mut line);
        let _ = tx.send(());
    });
    Some(rx)
}
