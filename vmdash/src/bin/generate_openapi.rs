use std::fs;
use utoipa::OpenApi;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let openapi = vmdash::handlers::ApiDoc::openapi();
    let yaml = serde_yaml::to_string(&openapi)?;

    let output_path = std::env::args().nth(1).unwrap_or_else(|| "openapi.yaml".into());
    fs::write(&output_path, yaml)?;

    println!("OpenAPI spec written to {}", output_path);

    Ok(())
}
