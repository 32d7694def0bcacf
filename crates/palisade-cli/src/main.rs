//! palisade CLI - compile and inspect syscall filter policies

use clap::{Parser, Subcommand, ValueEnum};
use palisade_core::arch::{self, ArchRef, BUILTIN};
use palisade_core::config::{PolicyConfig, default_policy_path};
use palisade_core::export::{self, CollectionExport};
use palisade_core::host::SystemHost;
use palisade_core::{ARG_COUNT_MAX, FilterCollection, FilterError};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "palisade")]
#[command(author, version, about = "Syscall filter policy compiler")]
struct Cli {
    /// Treat this architecture as native instead of the build architecture
    #[arg(long, global = true)]
    native: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Msgpack,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a policy and write the decision trees
    Compile {
        /// Policy file (defaults to PALISADE_POLICY env var or /etc/palisade/policy.json)
        #[arg(short, long)]
        policy: Option<PathBuf>,

        /// Output encoding
        #[arg(short, long, value_enum, default_value = "json")]
        format: Format,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Decide one syscall against a compiled policy
    Check {
        /// Policy file (defaults to PALISADE_POLICY env var or /etc/palisade/policy.json)
        #[arg(short, long)]
        policy: Option<PathBuf>,

        /// Architecture making the call (defaults to native)
        #[arg(short, long)]
        arch: Option<String>,

        /// Syscall name or number in that architecture's numbering
        syscall: String,

        /// Argument values, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_u64, num_args = 0..=ARG_COUNT_MAX)]
        args: Vec<u64>,
    },

    /// List built-in architectures
    Archs,

    /// Resolve a syscall name to its number on each architecture
    Resolve {
        /// Syscall name
        name: String,
    },
}

fn parse_u64(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid argument value '{text}': {e}"))
}

fn lookup_arch(name: &str) -> Result<ArchRef, FilterError> {
    arch::by_name(name).ok_or_else(|| FilterError::Config(format!("unknown architecture '{name}'")))
}

fn native_arch(name: Option<&str>) -> Result<ArchRef, FilterError> {
    match name {
        Some(name) => lookup_arch(name),
        None => arch::native().ok_or_else(|| {
            FilterError::Unsupported(format!(
                "no built-in description for {}, pass --native",
                std::env::consts::ARCH
            ))
        }),
    }
}

fn compile(policy: Option<PathBuf>, native: ArchRef) -> Result<FilterCollection, FilterError> {
    let path = policy.unwrap_or_else(default_policy_path);
    tracing::debug!(path = %path.display(), native = native.name(), "compiling policy");
    PolicyConfig::load(&path)?.build_with(native, Arc::new(SystemHost))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("palisade=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            policy,
            format,
            output,
        } => {
            let native = native_arch(cli.native.as_deref())?;
            let col = compile(policy, native)?;
            let view = CollectionExport::from_collection(&col);
            let bytes = match format {
                Format::Json => {
                    let mut text = export::to_json(&view)?;
                    text.push('\n');
                    text.into_bytes()
                }
                Format::Msgpack => export::encode(&view)?,
            };
            match output {
                Some(path) => std::fs::write(&path, &bytes)?,
                None => std::io::stdout().lock().write_all(&bytes)?,
            }
        }

        Commands::Check {
            policy,
            arch,
            syscall,
            args,
        } => {
            let native = native_arch(cli.native.as_deref())?;
            let target = match arch.as_deref() {
                Some(name) => lookup_arch(name)?,
                None => native,
            };
            let number = match syscall.parse::<i32>() {
                Ok(number) => number,
                Err(_) => target.resolve_name(&syscall).ok_or_else(|| {
                    FilterError::Config(format!("unknown syscall '{syscall}' on {}", target.name()))
                })?,
            };

            let col = compile(policy, native)?;
            let mut call = [0u64; ARG_COUNT_MAX];
            for (slot, value) in call.iter_mut().zip(&args) {
                *slot = *value;
            }
            let action = col.simulate(target.token(), number, &call);
            println!("{} {syscall}({number}) -> {action}", target.name());
        }

        Commands::Archs => {
            for arch in BUILTIN {
                let bits = match arch.word_size() {
                    arch::WordSize::Bits32 => 32,
                    arch::WordSize::Bits64 => 64,
                };
                let endian = match arch.endian() {
                    arch::Endian::Little => "little",
                    arch::Endian::Big => "big",
                };
                println!("{:<8} {} {bits}-bit {endian}-endian", arch.name(), arch.token());
            }
        }

        Commands::Resolve { name } => {
            let numbers: serde_json::Map<String, serde_json::Value> = BUILTIN
                .iter()
                .map(|arch| {
                    let number = arch
                        .resolve_name(&name)
                        .map_or(serde_json::Value::Null, serde_json::Value::from);
                    (arch.name().to_owned(), number)
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&numbers)?);
        }
    }

    Ok(())
}
