use anyhow::bail;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        match s {
            "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            _ => bail!("Unrecognized log format '{s}'. Please specify 'plain' or 'json'"),
        }
    }
}

/// Initialize the process-wide tracing subscriber. `RUST_LOG` overrides the
/// default `info` filter.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let base_logger = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Json => base_logger.json().init(),
        LogFormat::Plain => base_logger.init(),
    }

    Ok(())
}

/// Replace the default panic hook with one that routes the panic through
/// tracing, so that it ends up in the same sink as everything else.
pub fn replace_panic_hook_with_tracing_panic_hook() {
    std::panic::set_hook(Box::new(tracing_panic_hook));
}

fn tracing_panic_hook(info: &std::panic::PanicInfo) {
    let location = info.location();
    let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
        Some(*s)
    } else {
        info.payload().downcast_ref::<String>().map(|s| s.as_str())
    };

    let backtrace = std::backtrace::Backtrace::capture();

    tracing::error!(
        panic.location = location.map(|l| l.to_string()),
        panic.payload = payload,
        "process panicked: {payload:?}\n{backtrace}"
    );
}
