//! Prints the Postbox OpenAPI document, or writes it to the given path.
//!
//! Usage: `export-openapi [--json] [OUTPUT]`. YAML is the default format;
//! an output path ending in `.json` also selects JSON.

use std::{env, fs, path::PathBuf};

use anyhow::{bail, Context, Result};
use postbox_daemon::server::docs::ApiDoc;
use utoipa::OpenApi;

fn main() -> Result<()> {
    let mut json = false;
    let mut output: Option<PathBuf> = None;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--json" => json = true,
            flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
            path if output.is_none() => output = Some(PathBuf::from(path)),
            extra => bail!("unexpected argument {extra}"),
        }
    }

    if let Some(path) = &output {
        json |= path.extension().is_some_and(|ext| ext == "json");
    }

    let openapi = ApiDoc::openapi();
    let document = if json {
        openapi
            .to_pretty_json()
            .context("failed to serialise OpenAPI as JSON")?
    } else {
        openapi
            .to_yaml()
            .context("failed to serialise OpenAPI as YAML")?
    };

    let Some(path) = output else {
        println!("{document}");
        return Ok(());
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory for {}", path.display()))?;
    }
    fs::write(&path, document).with_context(|| format!("failed to write {}", path.display()))?;
    eprintln!("wrote OpenAPI document to {}", path.display());
    Ok(())
}
