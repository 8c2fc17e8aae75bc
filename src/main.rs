use bulwark::config::{DurationValue, RateLimitConfig, ResilienceConfig, SlidingWindowConfig};
use bulwark::http::{Body, BoxError, boxed, empty_body, full_body};
use clap::Parser;
use http::{Request, Response, StatusCode};
use tower::{Service, ServiceExt};

#[derive(Parser)]
#[command(
    name = "bulwark",
    about = "Fire synthetic requests through a rate limiter and print what it answers"
)]
struct Cli {
    /// Path to TOML config file
    #[arg(short, long)]
    config: Option<String>,

    /// Fixed-window rate limit (e.g., "2/1s", "100/1m")
    #[arg(long = "rate-limit")]
    rate_limit: Option<String>,

    /// Sliding-window rate limit (e.g., "2/1s", "100/1m")
    #[arg(long = "sliding-window")]
    sliding_window: Option<String>,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 5)]
    requests: u32,

    /// Client address sent as x-forwarded-for
    #[arg(long, default_value = "127.0.0.1")]
    key: String,

    /// Pause between requests (e.g., "200ms")
    #[arg(long)]
    interval: Option<String>,

    /// Status returned by the stub handler
    #[arg(long, default_value_t = 200)]
    status: u16,

    /// Emit X-RateLimit-* headers as well
    #[arg(long)]
    legacy_headers: bool,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("bulwark=info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let mut config = if let Some(ref path) = cli.config {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {path}: {e}"))?;
        ResilienceConfig::from_toml(&content)?
    } else {
        ResilienceConfig::default()
    };

    // CLI flags override the config file
    if let Some(ref s) = cli.rate_limit {
        config.rate_limit = Some(parse_rate_limit(s, cli.legacy_headers)?);
    }
    if let Some(ref s) = cli.sliding_window {
        config.sliding_window = Some(SlidingWindowConfig(parse_rate_limit(s, cli.legacy_headers)?));
    }
    if config.rate_limit.is_none() && config.sliding_window.is_none() {
        anyhow::bail!("no limiter configured; pass --rate-limit, --sliding-window or --config");
    }
    config.validate()?;

    let status = StatusCode::from_u16(cli.status)
        .map_err(|e| anyhow::anyhow!("invalid status: {e}"))?;
    let mut service = config.apply_rate_limits(stub_handler(status))?;

    let interval = cli
        .interval
        .as_deref()
        .map(bulwark::config::parse_duration)
        .transpose()
        .map_err(|e| anyhow::anyhow!("invalid interval: {e}"))?;

    for i in 1..=cli.requests {
        let req = Request::builder()
            .uri("/")
            .header("x-forwarded-for", &cli.key)
            .body(empty_body())?;
        let response = service
            .ready()
            .await
            .map_err(|e| anyhow::anyhow!(e))?
            .call(req)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        println!("{}", describe(i, &response));

        if let Some(pause) = interval
            && i < cli.requests
        {
            tokio::time::sleep(pause).await;
        }
    }

    Ok(())
}

fn stub_handler(status: StatusCode) -> bulwark::http::HttpService {
    boxed(tower::service_fn(move |_req: Request<Body>| async move {
        let mut response = Response::new(full_body("ok"));
        *response.status_mut() = status;
        Ok::<_, BoxError>(response)
    }))
}

fn describe(i: u32, response: &Response<Body>) -> String {
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    };
    format!(
        "#{i:<3} {} remaining={} retry-after={}",
        response.status().as_u16(),
        header("ratelimit-remaining"),
        header("retry-after"),
    )
}

fn parse_rate_limit(s: &str, legacy_headers: bool) -> anyhow::Result<RateLimitConfig> {
    let (count_str, window_str) = s
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("rate limit must be count/window (e.g. 2/1s)"))?;
    let max: u64 = count_str
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid rate limit count: {e}"))?;
    let window = bulwark::config::parse_duration(window_str)
        .map_err(|e| anyhow::anyhow!("invalid rate limit window: {e}"))?;

    Ok(RateLimitConfig {
        max,
        window: DurationValue(window),
        max_keys: None,
        message: None,
        standard_headers: true,
        legacy_headers,
        skip_successful_requests: false,
        skip_failed_requests: false,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn parses_count_and_window() {
        let config = parse_rate_limit("30/1m", false).unwrap();
        assert_eq!(config.max, 30);
        assert_eq!(config.window.0, Duration::from_secs(60));
        assert!(parse_rate_limit("30", false).is_err());
        assert!(parse_rate_limit("x/1s", false).is_err());
    }
}
