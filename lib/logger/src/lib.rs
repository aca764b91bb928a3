use anyhow::Context;
use armada_client::entities::logger::{LogConfig, StdioLogMode};
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
  Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

mod otel;

pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let log_level: tracing::Level = config.level.into();

  let registry =
    Registry::default().with(LevelFilter::from(log_level));

  macro_rules! make_otel {
    () => {
      (!config.otlp_endpoint.is_empty()).then(|| {
        OpenTelemetryLayer::new(otel::tracer(
          &config.otlp_endpoint,
          config.opentelemetry_service_name.clone(),
        ))
      })
    };
  }

  match (config.stdio, config.pretty) {
    (StdioLogMode::Standard, true) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .pretty()
          .with_file(false)
          .with_line_number(false),
      )
      .with(make_otel!())
      .try_init(),
    (StdioLogMode::Standard, false) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .with_file(false)
          .with_line_number(false),
      )
      .with(make_otel!())
      .try_init(),
    (StdioLogMode::Json, _) => registry
      .with(tracing_subscriber::fmt::layer().json())
      .with(make_otel!())
      .try_init(),
    (StdioLogMode::None, _) => {
      if config.otlp_endpoint.is_empty() {
        return Ok(());
      }
      registry.with(make_otel!()).try_init()
    }
  }
  .context("failed to init logger")
}
