use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use wavelane_core::{
    ChannelLayout, CommonLayout, FileFormat, SampleEncoding, SampleFormat, SampleTypeConversion,
    SaveAsParameters, Session, SessionOptions,
    audio::decode_audio_file,
    diagnostics::init_tracing,
    export::write_audio,
    fixtures::build_demo_session,
    persistence::{list_templates, load_session},
    time::samples_to_seconds,
};

#[derive(Debug, Parser)]
#[command(name = "wavelane-cli")]
#[command(about = "Headless tools for Wavelane audio files and sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Prints the format of an audio file or the outline of a session file.
    Inspect { path: PathBuf },
    /// Re-encodes an audio file; the output container follows its extension.
    Convert {
        input: PathBuf,
        output: PathBuf,

        #[arg(long)]
        sample_rate: Option<u32>,

        /// A layout name from `layouts`, such as `stereo` or `surround51`.
        #[arg(long)]
        layout: Option<String>,

        #[arg(long)]
        bits: Option<u32>,

        #[arg(long)]
        ffmpeg: Option<PathBuf>,
    },
    /// Lists the built-in channel layouts.
    Layouts,
    /// Lists session templates in a directory.
    Templates {
        #[arg(long, default_value = "templates")]
        dir: PathBuf,
    },
    /// Writes the demo tone and mix to disk.
    DemoSession {
        #[arg(long, default_value = "data/demo")]
        output_dir: PathBuf,
    },
}

fn inspect(path: &Path) -> anyhow::Result<serde_json::Value> {
    if FileFormat::from_path(path) == Some(FileFormat::Session) {
        let session = load_session(path)?;
        let tracks: Vec<_> = session
            .tracks
            .iter()
            .map(|track| {
                json!({
                    "id": track.id.0,
                    "name": track.name,
                    "kind": track.kind(),
                    "layout": track.format.layout.description(),
                    "clips": track.clips.len(),
                })
            })
            .collect();
        return Ok(json!({
            "name": session.display_name,
            "sample_rate": session.sample_rate,
            "tracks": tracks,
            "markers": session.markers.len(),
        }));
    }

    let audio = decode_audio_file(path)?;
    Ok(json!({
        "sample_rate": audio.sample_rate,
        "channels": audio.channels,
        "layout": ChannelLayout::for_channel_count(audio.channels).description(),
        "encoding": audio.encoding,
        "frames": audio.frames(),
        "seconds": samples_to_seconds(audio.frames(), audio.sample_rate),
    }))
}

fn layout_name(layout: CommonLayout) -> String {
    serde_json::to_value(layout)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn parse_layout(name: &str) -> anyhow::Result<CommonLayout> {
    CommonLayout::ALL
        .into_iter()
        .find(|layout| layout_name(*layout).eq_ignore_ascii_case(name))
        .with_context(|| format!("unknown channel layout: {name}"))
}

fn convert(
    input: &Path,
    output: &Path,
    sample_rate: Option<u32>,
    layout: Option<&str>,
    bits: Option<u32>,
    ffmpeg: Option<&Path>,
) -> anyhow::Result<()> {
    let file_format = FileFormat::from_path(output)
        .filter(|format| format.is_audio())
        .with_context(|| format!("unsupported output extension: {}", output.display()))?;
    let audio = decode_audio_file(input)?;
    let source = SampleFormat::new(
        audio.sample_rate,
        audio.encoding,
        ChannelLayout::for_channel_count(audio.channels),
    )?;

    let mut conversion = SampleTypeConversion::keep_source();
    if let Some(rate) = sample_rate {
        conversion = conversion.with_sample_rate(rate);
    }
    if let Some(name) = layout {
        conversion = conversion.with_layout(ChannelLayout::common(parse_layout(name)?));
    }
    if let Some(bits) = bits {
        conversion = conversion.with_encoding(SampleEncoding::from_bits(bits)?);
    }
    let (target, samples) = conversion.apply(&source, &audio.samples)?;
    write_audio(output, file_format, &target, &samples, ffmpeg, &mut |_| {})?;
    tracing::info!(output = %output.display(), format = %target, "file converted");
    Ok(())
}

fn demo_session(output_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(output_dir)?;
    let session = Arc::new(Session::new(SessionOptions::default()));
    let demo = build_demo_session(&session)?;

    let tone = session.save_as(
        demo.tone,
        output_dir.join("demo-tone.wav"),
        SaveAsParameters::default(),
    )?;
    let tone_result = tone.wait();
    if !tone_result.is_success() {
        anyhow::bail!("demo tone failed to save: {:?}", tone_result.flags());
    }

    let mix = session.save_as(
        demo.multitrack,
        output_dir.join("demo-mix.wlsx"),
        SaveAsParameters::default(),
    )?;
    let mix_result = mix.wait();
    if !mix_result.is_success() {
        anyhow::bail!("demo mix failed to save: {:?}", mix_result.flags());
    }
    tracing::info!(output_dir = %output_dir.display(), "demo session written");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _telemetry = init_tracing(&cli.log_dir)?;

    match cli.command {
        Commands::Inspect { path } => {
            println!("{}", serde_json::to_string_pretty(&inspect(&path)?)?);
        }
        Commands::Convert {
            input,
            output,
            sample_rate,
            layout,
            bits,
            ffmpeg,
        } => convert(
            &input,
            &output,
            sample_rate,
            layout.as_deref(),
            bits,
            ffmpeg.as_deref(),
        )?,
        Commands::Layouts => {
            for preset in CommonLayout::ALL {
                let layout = ChannelLayout::common(preset);
                println!(
                    "{:<20} {:>2}  {}",
                    layout_name(preset),
                    layout.channel_count(),
                    layout.description()
                );
            }
        }
        Commands::Templates { dir } => {
            for name in list_templates(&dir)? {
                println!("{name}");
            }
        }
        Commands::DemoSession { output_dir } => demo_session(&output_dir)?,
    }

    Ok(())
}
