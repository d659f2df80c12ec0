//! Writes the OpenAPI document for the JSON API, by default to `openapi.json`.

use anyhow::Context;
use superconnector_api::router::ApiDoc;
use utoipa::OpenApi;

fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "openapi.json".to_string());
    let spec_json = ApiDoc::openapi().to_pretty_json()?;
    std::fs::write(&path, spec_json).with_context(|| format!("Failed to write {path}"))?;
    println!("Wrote {path}");
    Ok(())
}
