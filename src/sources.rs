use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::ingest::build_pipeline;
use crate::models::{NewSource, Source, SourceKind};
use crate::sqlite_store::SqliteStore;
use crate::traits::SourceStore;

/// Resolve a source by name, falling back to id.
pub async fn resolve_source(store: &dyn SourceStore, name_or_id: &str) -> Result<Source> {
    if let Some(source) = store.find_source_by_name(name_or_id).await? {
        return Ok(source);
    }
    store
        .get_source(name_or_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Unknown source: '{}'", name_or_id))
}

pub async fn add_source(
    config: &Config,
    name: &str,
    path: Option<&Path>,
    url: Option<&str>,
    branch: Option<String>,
) -> Result<()> {
    let new = match (path, url) {
        (Some(path), None) => {
            let location = std::fs::canonicalize(path)
                .with_context(|| format!("Source path does not exist: {}", path.display()))?;
            NewSource {
                name: name.to_string(),
                kind: SourceKind::Local,
                location: location.to_string_lossy().to_string(),
                branch: None,
            }
        }
        (None, Some(url)) => NewSource {
            name: name.to_string(),
            kind: SourceKind::Remote,
            location: url.to_string(),
            branch,
        },
        _ => bail!("Specify exactly one of --path or --url"),
    };

    let store = SqliteStore::open(config).await?;
    let source = store.create_source(new).await?;
    println!(
        "Added {} source '{}' ({})",
        source.kind.as_str(),
        source.name,
        source.id
    );
    Ok(())
}

pub async fn list_sources(config: &Config) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let sources = store.list_sources().await?;
    if sources.is_empty() {
        println!("No sources registered.");
        return Ok(());
    }

    println!(
        "{:<20} {:<7} {:<8} {:<8} {:<8} LOCATION",
        "NAME", "KIND", "INDEX", "SNIPPET", "WIKI"
    );
    for source in sources {
        let location = match &source.branch {
            Some(branch) => format!("{} ({})", source.location, branch),
            None => source.location.clone(),
        };
        println!(
            "{:<20} {:<7} {:<8} {:<8} {:<8} {}",
            source.name,
            source.kind.as_str(),
            source.index_status.as_str(),
            source.snippet_status.as_str(),
            source.wiki_status.as_str(),
            location
        );
    }
    Ok(())
}

/// Purge a source's indexed data, then forget the source.
pub async fn remove_source(config: &Config, name: &str) -> Result<()> {
    let store = Arc::new(SqliteStore::open(config).await?);
    let source = resolve_source(store.as_ref(), name).await?;

    let pipeline = build_pipeline(config, store.clone())?;
    let (files, vectors) = pipeline.purge(&source.id).await?;
    store.remove_source(&source.id).await?;

    println!(
        "Removed source '{}': {} files, {} vectors",
        source.name, files, vectors
    );
    Ok(())
}
