//! Uploads a document and asks one question about it.
//!
//! Usage: ragbus_demo <file> <question> [config.yaml]

use anyhow::{bail, Context, Result};
use ragbus::{init_tracing, Pipeline, PipelineConfig, RequestStatus};
use tracing::Level;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(Level::INFO);

    let mut args = std::env::args().skip(1);
    let (Some(path), Some(question)) = (args.next(), args.next()) else {
        bail!("usage: ragbus_demo <file> <question> [config.yaml]");
    };
    let config = match args.next() {
        Some(config_path) => PipelineConfig::from_yaml_file(&config_path)?,
        None => PipelineConfig::default(),
    };

    let content = std::fs::read(&path).with_context(|| format!("reading {path}"))?;
    let filename = std::path::Path::new(&path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.clone());

    let pipeline = Pipeline::builder().with_config(config).build()?;

    let upload = pipeline.submit_document(filename, content);
    let record = pipeline.wait_default(&upload).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    if record.status != RequestStatus::Completed {
        bail!("upload did not complete");
    }

    let query = pipeline.submit_query(question, None);
    let record = pipeline.wait_default(&query).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    println!("{}", pipeline.trace_dot(&query));
    println!("{}", serde_json::to_string_pretty(&pipeline.stats())?);

    pipeline.shutdown().await;
    Ok(())
}
