use anyhow::Result;
use clap::{Parser, Subcommand};
use fer_convert::format::{human_bytes, human_number};
use fer_convert::{ConversionOptions, Converter, EnvConfig, GgufFile, SUCCESS_MESSAGE};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fer-convert")]
#[command(version)]
#[command(about = "Convert a trained model from safetensors to GGUF for mobile inference", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a safetensors model to GGUF (the default when no command is given)
    Convert {
        source: Option<PathBuf>,
        output: Option<PathBuf>,
        #[arg(long)]
        alignment: Option<u64>,
    },
    /// Summarize a GGUF file
    Inspect {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let env = EnvConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env.log_filter()))
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        None => convert(ConversionOptions::from_env()),
        Some(Commands::Convert {
            source,
            output,
            alignment,
        }) => {
            let mut options = ConversionOptions::from_env();
            if let Some(source) = source {
                options.source = source;
            }
            if let Some(output) = output {
                options.output = output;
            }
            if let Some(alignment) = alignment {
                options.alignment = alignment;
            }
            convert(options)
        }
        Some(Commands::Inspect { file, json }) => inspect(&file, json),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn convert(options: ConversionOptions) -> Result<()> {
    let report = Converter::new(options).run()?;
    tracing::debug!(report = %serde_json::to_string(&report)?, "conversion report");
    println!("{}", SUCCESS_MESSAGE);
    Ok(())
}

#[derive(Serialize)]
struct InspectSummary<'a> {
    version: u32,
    architecture: Option<&'a str>,
    name: Option<&'a str>,
    file_size: u64,
    parameter_count: u64,
    tensors: Vec<TensorSummary<'a>>,
}

#[derive(Serialize)]
struct TensorSummary<'a> {
    name: &'a str,
    ggml_type: String,
    dims: &'a [u64],
    size: u64,
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let gguf = GgufFile::open(path)?;
    let summary = InspectSummary {
        version: gguf.version,
        architecture: gguf.architecture(),
        name: gguf.string("general.name"),
        file_size: gguf.file_size,
        parameter_count: gguf.parameter_count(),
        tensors: gguf
            .tensors
            .iter()
            .map(|t| TensorSummary {
                name: &t.name,
                ggml_type: t.ggml_type.name(),
                dims: &t.dims,
                size: t.size,
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("File:         {}", path.display());
    println!("GGUF version: {}", summary.version);
    println!("Architecture: {}", summary.architecture.unwrap_or("unknown"));
    println!("Name:         {}", summary.name.unwrap_or("unknown"));
    println!("Size:         {}", human_bytes(summary.file_size));
    println!("Parameters:   {}", human_number(summary.parameter_count));
    println!("Tensors:      {}", summary.tensors.len());
    for t in &summary.tensors {
        println!("  {:<40} {:<6} {:?}", t.name, t.ggml_type, t.dims);
    }
    Ok(())
}
