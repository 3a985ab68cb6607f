use anyhow::{bail, Context, Result};
use clap::Parser;
use std::{fs, path::PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use ulfreplay::{
    app::{
        memory::{AppModel, MemorySessionFactory, MemoryStore},
        Session, SessionFactory,
    },
    history::{History, ReplayedRow},
    process::{ColumnReport, DelimitedRecordReader, LineProcessor, StopReason},
    source::FileSource,
    ProcessorConfig, UlfInterpreter,
};

#[derive(Parser, Debug)]
#[command(name = "ulfreplay")]
#[command(about = "Replay ULF batch files against an application model")]
struct Args {
    /// ULF files to replay, in order
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Processor settings (YAML); flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Application model (YAML) describing the interactions
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Actor that owns the primary session
    #[arg(short, long, default_value = "batch")]
    user: String,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Keep going after a record fails instead of stopping
    #[arg(long)]
    keep_going: bool,

    #[arg(long)]
    line_limit: Option<usize>,

    /// Expected column headings of the first record, comma separated
    #[arg(long, value_delimiter = ',')]
    expect_header: Option<Vec<String>>,

    #[arg(long)]
    override_validations: bool,

    /// Directory of the replay ledger; replayed files are skipped
    #[arg(long)]
    history_dir: Option<PathBuf>,

    /// Replay files even when the ledger already lists them
    #[arg(long)]
    force: bool,

    /// Print each run report as JSON
    #[arg(long)]
    report: bool,

    /// Only report the widest value per column, replaying nothing
    #[arg(long)]
    inspect: bool,

    /// Write the committed rows as JSON after the last file
    #[arg(long)]
    dump_store: Option<PathBuf>,
}

impl Args {
    fn processor_config(&self) -> Result<ProcessorConfig> {
        let mut cfg = match &self.config {
            Some(path) => ProcessorConfig::from_yaml_file(path)?,
            None => ProcessorConfig::default(),
        };
        if let Some(n) = self.batch_size {
            cfg.batch_size = n;
        }
        if self.keep_going {
            cfg.stop_at_error = false;
        }
        if self.line_limit.is_some() {
            cfg.line_limit = self.line_limit;
        }
        if self.expect_header.is_some() {
            cfg.expected_header = self.expect_header.clone();
        }
        if self.override_validations {
            cfg.override_all_validations = true;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn inspect(args: &Args, cfg: &ProcessorConfig) {
    let processor = LineProcessor::new(cfg);
    for path in &args.files {
        let mut source = FileSource::new(path);
        let mut reader = DelimitedRecordReader::new();
        let mut report = ColumnReport::new(cfg.expected_header.clone());
        processor.run(&mut source, &mut reader, &mut report);
        println!("{} ({} records)", path.display(), report.records());
        for (name, width) in report.field_sizes() {
            println!("  {:<32} {}", name, width);
        }
    }
}

fn main() -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    let args = Args::parse();
    let cfg = args.processor_config()?;
    info!(?cfg, "startup");

    if args.inspect {
        inspect(&args, &cfg);
        return Ok(());
    }

    let model = match &args.model {
        Some(path) => AppModel::from_yaml_file(path)?,
        None => {
            warn!("no model given; every interaction will be unknown");
            AppModel::default()
        }
    };
    let history = args.history_dir.as_ref().map(History::new).transpose()?;
    let replayed = match &history {
        Some(h) => h.replayed_files()?,
        None => Default::default(),
    };
    info!("{} files already replayed", replayed.len());

    let store = MemoryStore::shared();
    let mut factory = MemorySessionFactory::new(store.clone(), model);
    let primary = factory.create(&args.user)?;
    let mut interpreter = UlfInterpreter::new(factory, primary, cfg);

    let mut failed = Vec::new();
    for path in &args.files {
        let name = file_name(path);
        let already = match &history {
            Some(h) if !args.force => h.is_replayed(&name)?,
            _ => false,
        };
        if already {
            info!(file = %name, "already replayed; skipping");
            continue;
        }

        let mut source = FileSource::new(path);
        let report = interpreter.replay(&mut source);
        if args.report {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        match report.stop_reason {
            StopReason::EndOfInput | StopReason::LineLimit | StopReason::HandlerStop => {
                if let Some(h) = &history {
                    h.record(&ReplayedRow::from_report(&name, &report))?;
                }
            }
            reason => {
                error!(file = %name, ?reason, "replay did not complete");
                failed.push(name);
            }
        }
    }

    interpreter.primary_mut().close();

    if let Some(path) = &args.dump_store {
        let json = store.borrow().to_json()?;
        fs::write(path, json).with_context(|| format!("writing store to {}", path.display()))?;
        info!(path = %path.display(), "store written");
    }

    if !failed.is_empty() {
        bail!("{} file(s) did not replay cleanly: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}
