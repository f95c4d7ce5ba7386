use anyhow::{bail, Context, Result};
use clap::Args;
use sbx_client::{ClientConfig, StreamLimits, DEFAULT_API_URL};
use url::Url;

/// Flags shared by every subcommand. Empty means "fall back to the env".
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    #[arg(long, global = true, default_value = "")]
    pub api_url: String,
    #[arg(long, global = true, default_value = "")]
    pub log_dir: String,
    #[arg(long, global = true, default_value_t = false)]
    pub debug: bool,
    #[arg(long, global = true, default_value = "")]
    pub max_malformed_frames: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub client: ClientConfig,
    pub log_dir: String,
    pub debug: bool,
}

pub fn load_config(args: &GlobalArgs) -> Result<Config> {
    let api_url = resolve(&args.api_url, "SBX_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let base_url = parse_api_url(&api_url)?;
    let limit = resolve(&args.max_malformed_frames, "SBX_MAX_MALFORMED_FRAMES");
    let stream = StreamLimits {
        max_malformed_frames: parse_frame_limit(limit.as_deref())?,
        ..StreamLimits::default()
    };
    Ok(Config {
        client: ClientConfig::new(base_url).with_stream_limits(stream),
        log_dir: resolve(&args.log_dir, "SBX_LOG_DIR").unwrap_or_default(),
        debug: args.debug || env_true("SBX_DEBUG"),
    })
}

pub fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_true(key: &str) -> bool {
    env_value(key).is_some_and(|value| is_truthy(&value))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn resolve(flag: &str, key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    env_value(key)
}

fn parse_api_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("invalid api url: {raw}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => bail!("api url must be http or https, got {other}"),
    }
}

fn parse_frame_limit(raw: Option<&str>) -> Result<Option<usize>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse::<usize>()
            .map(Some)
            .with_context(|| format!("invalid malformed frame limit: {value}")),
    }
}
