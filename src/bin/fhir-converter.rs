//! fhir-converter CLI - render HL7v2 or JSON input through a template directory
//!
//! Writes the rendered output to stdout and, on request, the conversion trace
//! as JSON to stderr.

use clap::{Parser, Subcommand};
use fhir_converter::{
    ConvertError, DirectoryTemplateProvider, Hl7v2Processor, InputFormat, JsonProcessor,
    ProcessorSettings, TraceInfo, TracingTelemetry,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fhir-converter")]
#[command(
    version,
    about = "Template-driven conversion of HL7v2 and JSON clinical data",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert one input file
    Convert {
        /// Input format (hl7v2, json)
        #[arg(short, long)]
        format: InputFormat,

        /// File holding the raw input
        #[arg(short, long)]
        input: PathBuf,

        /// Template directory
        #[arg(short, long, default_value = "templates")]
        templates: PathBuf,

        /// Name of the root template, relative to the template directory
        #[arg(short, long)]
        root: String,

        /// Processor settings file (YAML, or JSON by extension)
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Print the conversion trace as JSON to stderr
        #[arg(long)]
        trace: bool,
    },

    /// List the templates found in a template directory
    Templates {
        /// Template directory
        #[arg(short, long, default_value = "templates")]
        templates: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Convert {
            format,
            input,
            templates,
            root,
            settings,
            trace,
        } => convert(format, input, templates, root, settings, trace),
        Commands::Templates { templates } => list_templates(templates),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Convert one input file and print the result
fn convert(
    format: InputFormat,
    input: PathBuf,
    templates: PathBuf,
    root: String,
    settings: Option<PathBuf>,
    trace: bool,
) -> Result<(), String> {
    if !templates.is_dir() {
        return Err(format!("Template directory not found: {}", templates.display()));
    }

    let settings = match settings {
        Some(path) => ProcessorSettings::load_from_file(&path).map_err(|e| e.to_string())?,
        None => ProcessorSettings::default(),
    };
    let raw = std::fs::read_to_string(&input)
        .map_err(|e| format!("Failed to read input {}: {}", input.display(), e))?;

    let provider = DirectoryTemplateProvider::new(templates);
    let telemetry = Arc::new(TracingTelemetry);
    let mut trace_info = TraceInfo::for_format(format);
    let trace_sink = if trace { Some(&mut trace_info) } else { None };

    tracing::info!(%format, input = %input.display(), root = %root, "converting");
    let output = match format {
        InputFormat::Hl7v2 => Hl7v2Processor::new(settings)
            .with_telemetry(telemetry)
            .convert(&raw, &root, &provider, trace_sink),
        InputFormat::Json => JsonProcessor::new(settings)
            .with_telemetry(telemetry)
            .convert(&raw, &root, &provider, trace_sink),
    }
    .map_err(describe)?;

    println!("{}", output);

    if trace {
        let json = serde_json::to_string_pretty(&trace_info)
            .map_err(|e| format!("Failed to serialize trace: {}", e))?;
        eprintln!("{}", json);
    }
    Ok(())
}

/// List template names under a directory
fn list_templates(templates: PathBuf) -> Result<(), String> {
    if !templates.is_dir() {
        return Err(format!("Template directory not found: {}", templates.display()));
    }
    let provider = DirectoryTemplateProvider::new(templates);
    for name in provider.template_names() {
        println!("{}", name);
    }
    Ok(())
}

fn describe(err: ConvertError) -> String {
    format!("{} failed: {}", err.phase(), err)
}
