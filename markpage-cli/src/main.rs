use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use markpage_core::{
    upload_with_retry, Command, DocumentSource, Editor, EditorConfig, FileStateStore, MarkEntry,
    PageStatus, RetryPolicy, StateStore, SubmissionMeta,
};
use markpage_render::AutoProvider;
use serde::Serialize;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

mod outbox;

use outbox::DirectoryUploader;

#[derive(Debug, Parser)]
#[command(
    name = "markpage",
    version,
    about = "Annotate and mark paginated documents from a scripted session"
)]
struct Args {
    /// PDF or image to annotate
    input: PathBuf,

    /// JSON file with the list of editor commands to replay
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// TOML file overriding the editor defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory receiving the annotated PDF and the marks file
    #[arg(short, long, default_value = ".")]
    out: PathBuf,

    /// Submission metadata used to name the outputs (repeatable)
    #[arg(short, long = "meta", value_name = "KEY=VALUE", value_parser = parse_meta)]
    meta: Vec<(String, String)>,

    /// Attempts per saved file before giving up
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Page to open on (1-based); overrides the remembered page
    #[arg(short, long)]
    page: Option<usize>,

    /// Directory for logs and remembered preferences
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct MarksReport<'a> {
    document: &'a str,
    marks: Vec<MarkEntry>,
    total: f32,
    orphaned_stamps: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if !args.input.exists() {
        bail!("input {:?} does not exist", args.input);
    }

    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => ProjectDirs::from("org", "markpage", "markpage")
            .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?
            .data_local_dir()
            .to_path_buf(),
    };
    let _log_guard = init_logging(&data_dir)?;
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(data_dir.join("state"))?);

    let config = match &args.config {
        Some(path) => EditorConfig::load(path)?,
        None => EditorConfig::default(),
    };
    let script = match &args.script {
        Some(path) => load_script(path)?,
        None => Vec::new(),
    };

    let provider = AutoProvider::new();
    let mut editor = Editor::open(&provider, DocumentSource::Path(args.input.clone()), config)
        .await
        .with_context(|| format!("failed to open {:?}", args.input))?;

    match store.load(editor.info()) {
        Ok(Some(saved)) => {
            editor.restore_preferences(&saved)?;
            editor.settle().await;
        }
        Ok(None) => {}
        Err(err) => warn!(%err, "ignoring unreadable preferences"),
    }
    if let Some(page) = args.page {
        editor.apply(Command::GotoPage { page })?;
        settle_or_warn(&mut editor).await;
    }

    for (step, command) in script.into_iter().enumerate() {
        editor
            .apply(command)
            .with_context(|| format!("script step {} failed", step + 1))?;
        settle_or_warn(&mut editor).await;
    }

    let pdf = editor.export_pdf().await?;
    let label = editor.info().label.clone();
    let report = MarksReport {
        document: &label,
        marks: editor.marks_distribution(),
        total: editor.ledger().total(),
        orphaned_stamps: editor.orphaned_stamps(),
    };
    let marks_json = serde_json::to_vec_pretty(&report)?;

    let mut meta = SubmissionMeta::new();
    for (key, value) in args.meta {
        meta.insert(key, value);
    }
    let stem = file_stem(&args.input);
    let uploader = DirectoryUploader::new(args.out.clone())?;
    let policy = RetryPolicy {
        attempts: args.retries,
        backoff: Duration::from_millis(250),
    };
    let document_ref =
        upload_with_retry(&uploader, &meta.document_name(&stem), pdf, policy).await?;
    let marks_ref = upload_with_retry(&uploader, &meta.marks_name(&stem), marks_json, policy).await?;

    if let Err(err) = store.save(editor.info(), &editor.preferences()) {
        warn!(%err, "failed to remember preferences");
    }
    info!(total = report.total, questions = report.marks.len(), "session saved");
    println!("{document_ref}");
    println!("{marks_ref}");
    Ok(())
}

async fn settle_or_warn(editor: &mut Editor) {
    if let PageStatus::Unavailable { reason } = editor.settle().await {
        warn!(page = editor.active_page() + 1, %reason, "active page could not be rendered");
    }
}

fn parse_meta(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("metadata key is empty in {raw:?}"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

fn parse_script(source: &str) -> Result<Vec<Command>> {
    serde_json::from_str(source).context("script must be a JSON array of commands")
}

fn load_script(path: &Path) -> Result<Vec<Command>> {
    let source =
        fs::read_to_string(path).with_context(|| format!("failed to read script {:?}", path))?;
    parse_script(&source).with_context(|| format!("invalid script {:?}", path))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}

fn init_logging(data_dir: &Path) -> Result<WorkerGuard> {
    let log_dir = data_dir.join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "markpage.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_pairs_are_split_on_the_first_equals() {
        assert_eq!(
            parse_meta("student = s=42").unwrap(),
            ("student".to_string(), "s=42".to_string())
        );
        assert!(parse_meta("student").is_err());
        assert!(parse_meta("=x").is_err());
    }

    #[test]
    fn scripts_decode_tagged_commands() {
        let script = parse_script(
            r##"[
                {"action": "set_tool", "tool": "highlighter"},
                {"action": "set_color", "color": "#00ff00"},
                {"action": "stroke", "points": [{"x": 1, "y": 1}, {"x": 8, "y": 2}]},
                {"action": "stamp", "x": 5, "y": 5, "value": "7.5", "question": "4"},
                {"action": "goto_page", "page": 2},
                {"action": "undo"}
            ]"##,
        )
        .unwrap();
        assert_eq!(script.len(), 6);
        assert!(matches!(script[4], Command::GotoPage { page: 2 }));
        assert!(matches!(
            &script[3],
            Command::Stamp { question: Some(q), .. } if q == "4"
        ));
    }

    #[test]
    fn unknown_actions_are_rejected() {
        assert!(parse_script(r#"[{"action": "explode"}]"#).is_err());
    }

    #[test]
    fn output_stem_falls_back_for_bare_roots() {
        assert_eq!(file_stem(Path::new("/tmp/answers.pdf")), "answers");
        assert_eq!(file_stem(Path::new("/")), "document");
    }
}
