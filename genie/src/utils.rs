use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_logging(debug: bool) -> anyhow::Result<()> {
    let base_level = if debug { "debug" } else { "info" };

    let filter = EnvFilter::new(base_level)
        .add_directive("tokenizers::tokenizer::serialization=error".parse()?);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)) // JSON output
        .try_init()?;

    Ok(())
}
