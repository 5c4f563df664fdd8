use std::path::PathBuf;

use clap::Parser;

/// Render one HTML document to a raster image over a shared headless browser.
#[derive(Parser)]
#[command(name = "htmlshot", version, about)]
struct Cli {
    /// HTML file to render
    input: PathBuf,

    /// Output image path
    #[arg(short, long, default_value = "out.png")]
    output: PathBuf,

    /// Requested canvas width in pixels
    #[arg(long, default_value_t = 800)]
    width: u32,

    /// Requested canvas height in pixels
    #[arg(long, default_value_t = 1200)]
    height: u32,

    /// Output format: png or jpeg
    #[arg(long, default_value = "png")]
    format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(feature = "cdp")]
async fn run(cli: Cli) -> anyhow::Result<()> {
    use htmlshot::{cdp, EngineConfig, ImageFormat, RenderRequest, SessionManager};

    let format = match cli.format.as_str() {
        "png" => ImageFormat::Png,
        "jpeg" | "jpg" => ImageFormat::Jpeg,
        other => anyhow::bail!("unsupported format '{other}' (expected png or jpeg)"),
    };

    let html = std::fs::read_to_string(&cli.input)?;

    let config = EngineConfig {
        format,
        ..Default::default()
    };
    let manager = SessionManager::new(config, cdp::driver_factory());

    manager.ensure_started().await?;
    let outcome = manager
        .render(RenderRequest::new(html, cli.width, cli.height))
        .await;
    manager.shutdown().await;

    let result = outcome?;
    std::fs::write(&cli.output, &result.bytes)?;

    println!(
        "{}",
        serde_json::json!({
            "output": cli.output,
            "format": result.format,
            "width": result.width,
            "height": result.height,
            "bytes": result.bytes.len(),
        })
    );
    Ok(())
}

#[cfg(not(feature = "cdp"))]
async fn run(_cli: Cli) -> anyhow::Result<()> {
    anyhow::bail!("htmlshot was built without the `cdp` feature; no rendering backend is available")
}
