//! Offline conversion benchmark.
//!
//! Reads a WAV fixture, converts it end to end with `convert_offline`, and
//! reports per-run latency plus the real-time factor as JSON. Runs on the
//! stub backend by default so it works without model files; pass
//! `--backend onnx --models <dir>` (with the `onnx` feature built) to
//! measure real sessions.
//!
//! ```text
//! benchmark --input speech.wav [--runs 5] [--backend stub|onnx]
//!           [--models DIR] [--seed N] [--output out.json]
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use serde::Serialize;
use tracing_subscriber::EnvFilter;

use voxmorph_core::audio::resample::resample_chunk;
use voxmorph_core::config::{config_slot, EngineConfig, SR_PROC};
use voxmorph_core::engine::{ConversionEngine, EngineMetrics};
use voxmorph_core::stages::stub::StubBackend;
use voxmorph_core::style::StyleHandle;
use voxmorph_core::BackendHandle;

struct Args {
    input: PathBuf,
    runs: usize,
    backend: String,
    models: Option<PathBuf>,
    seed: u64,
    output: Option<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
    let mut input = None;
    let mut runs = 5usize;
    let mut backend = "stub".to_string();
    let mut models = None;
    let mut seed = 2141u64;
    let mut output = None;

    let mut argv = std::env::args().skip(1);
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--input" => {
                input = Some(PathBuf::from(
                    argv.next().ok_or("--input needs a path")?,
                ));
            }
            "--runs" => {
                runs = argv
                    .next()
                    .ok_or("--runs needs a number")?
                    .parse()
                    .map_err(|e| format!("--runs: {e}"))?;
            }
            "--backend" => {
                backend = argv.next().ok_or("--backend needs stub|onnx")?;
            }
            "--models" => {
                models = Some(PathBuf::from(
                    argv.next().ok_or("--models needs a directory")?,
                ));
            }
            "--seed" => {
                seed = argv
                    .next()
                    .ok_or("--seed needs a number")?
                    .parse()
                    .map_err(|e| format!("--seed: {e}"))?;
            }
            "--output" => {
                output = Some(PathBuf::from(
                    argv.next().ok_or("--output needs a path")?,
                ));
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(Args {
        input: input.ok_or("--input is required")?,
        runs: runs.max(1),
        backend,
        models,
        seed,
        output,
    })
}

/// Decode a WAV to mono f32, mixing channels down when needed.
fn read_wav_mono(path: &PathBuf) -> Result<(Vec<f32>, u32), String> {
    let mut reader = hound::WavReader::open(path).map_err(|e| e.to_string())?;
    let spec = reader.spec();
    let channels = spec.channels as usize;

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| e.to_string())?,
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<Result<_, _>>()
            .map_err(|e| e.to_string())?,
        (hound::SampleFormat::Int, 32) => reader
            .samples::<i32>()
            .map(|s| s.map(|v| v as f32 / 2_147_483_648.0))
            .collect::<Result<_, _>>()
            .map_err(|e| e.to_string())?,
        (fmt, bits) => return Err(format!("unsupported WAV format: {fmt:?}/{bits}-bit")),
    };

    if channels <= 1 {
        return Ok((interleaved, spec.sample_rate));
    }
    let mono = interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p / 100.0).round() as usize;
    sorted[idx]
}

#[derive(Serialize)]
struct Summary {
    input: String,
    backend: String,
    runs: usize,
    audio_secs: f64,
    lap_ms_mean: f64,
    lap_ms_p50: f64,
    lap_ms_p90: f64,
    lap_ms_min: f64,
    lap_ms_max: f64,
    rtf_mean: f64,
    output_samples: usize,
}

fn build_backend(args: &Args) -> Result<BackendHandle, String> {
    match args.backend.as_str() {
        "stub" => Ok(BackendHandle::new(StubBackend::new(args.seed))),
        "onnx" => {
            #[cfg(feature = "onnx")]
            {
                let dir = args
                    .models
                    .as_ref()
                    .ok_or("--backend onnx requires --models")?;
                let backend =
                    voxmorph_core::stages::onnx::OnnxBackend::new(
                        voxmorph_core::stages::onnx::ModelPaths::from_dir(dir),
                    )
                    .map_err(|e| e.to_string())?;
                Ok(BackendHandle::new(backend))
            }
            #[cfg(not(feature = "onnx"))]
            {
                Err("built without the onnx feature; rebuild with --features onnx".into())
            }
        }
        other => Err(format!("unknown backend: {other}")),
    }
}

fn run() -> Result<(), String> {
    let args = parse_args()?;

    let (wav, source_rate) = read_wav_mono(&args.input)?;
    let wav16 = resample_chunk(&wav, source_rate, SR_PROC).map_err(|e| e.to_string())?;
    if wav16.len() < 4_000 {
        return Err("input too short: need at least a quarter second of audio".into());
    }
    let audio_secs = wav16.len() as f64 / SR_PROC as f64;

    let backend = build_backend(&args)?;
    backend.0.lock().warm_up().map_err(|e| e.to_string())?;

    let cfg = EngineConfig {
        seed: args.seed,
        ..Default::default()
    }
    .validated()
    .map_err(|e| e.to_string())?;
    let mut engine = ConversionEngine::new(
        config_slot(cfg),
        StyleHandle::default(),
        backend,
        std::sync::Arc::new(EngineMetrics::default()),
    )
    .map_err(|e| e.to_string())?;

    let mut laps_ms = Vec::with_capacity(args.runs);
    let mut output_samples = 0usize;
    for run in 0..args.runs {
        let t0 = Instant::now();
        let out = engine.convert_offline(&wav16).map_err(|e| e.to_string())?;
        let lap = t0.elapsed().as_secs_f64() * 1e3;
        output_samples = out.len();
        tracing::info!(run, lap_ms = format!("{lap:.1}"), "conversion pass");
        laps_ms.push(lap);
    }

    let mut sorted = laps_ms.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mean = laps_ms.iter().sum::<f64>() / laps_ms.len() as f64;
    let summary = Summary {
        input: args.input.display().to_string(),
        backend: args.backend.clone(),
        runs: args.runs,
        audio_secs,
        lap_ms_mean: mean,
        lap_ms_p50: percentile(&sorted, 50.0),
        lap_ms_p90: percentile(&sorted, 90.0),
        lap_ms_min: sorted[0],
        lap_ms_max: sorted[sorted.len() - 1],
        rtf_mean: mean / 1e3 / audio_secs,
        output_samples,
    };

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    match &args.output {
        Some(path) => std::fs::write(path, json).map_err(|e| e.to_string())?,
        None => println!("{json}"),
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("benchmark: {e}");
            ExitCode::FAILURE
        }
    }
}
