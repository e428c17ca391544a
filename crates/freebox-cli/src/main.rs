use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use freebox_relay::{Relay, RelayConfig};
use freebox_spider::{
    DiskCache, LogNotifier, ProxyResponse, Site, SpiderConfig, SpiderDispatcher, SpiderError,
    SpiderLoader,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "freebox", author, version, about = "Run one spider capability and print its result")]
struct Cli {
    /// Site key, also the namespace of the script-local cache
    #[arg(long, default_value = "cli")]
    key: String,
    /// Script descriptor (`*.js`) or native spider name (`csp_*`)
    #[arg(long)]
    api: String,
    /// Native artifact descriptor
    #[arg(long, default_value = "")]
    jar: String,
    /// Extend argument passed to the spider's init
    #[arg(long, default_value = "")]
    ext: String,
    /// Base URL relative descriptors resolve against
    #[arg(long, env = "FREEBOX_API_URL")]
    api_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Home page categories
    Home {
        #[arg(long)]
        filter: bool,
    },
    /// Home page recommendations
    HomeVideo,
    /// One page of a category
    Category {
        tid: String,
        #[arg(default_value = "1")]
        page: String,
        #[arg(long)]
        filter: bool,
        /// Filter value as `name=value`, repeatable
        #[arg(long = "extend", value_parser = parse_pair)]
        extend: Vec<(String, String)>,
    },
    Detail {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    Search {
        keyword: String,
        #[arg(long)]
        quick: bool,
        #[arg(long)]
        page: Option<String>,
    },
    /// Resolve a play url
    Play {
        flag: String,
        id: String,
        #[arg(long = "vip-flag")]
        vip_flags: Vec<String>,
    },
    IsVideo {
        url: String,
    },
    /// Proxy request through the site's spider; the body goes to stdout
    Proxy {
        /// Request parameter as `name=value`
        #[arg(value_parser = parse_pair)]
        params: Vec<(String, String)>,
    },
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), SpiderError> {
    let config = SpiderConfig::from_env();
    let cache = Arc::new(DiskCache::new(config.kv_dir.clone()));
    let relay = Relay::new(RelayConfig::from_env())?;
    let loader = SpiderLoader::new(config, relay, cache, Arc::new(LogNotifier));
    if let Some(url) = cli.api_url {
        loader.set_api_url(url);
    }
    let dispatcher = SpiderDispatcher::new(Arc::new(loader));
    let site = Site {
        key: cli.key,
        api: cli.api,
        ext: cli.ext,
        jar: cli.jar,
    };

    let output = match cli.command {
        Command::Home { filter } => dispatcher.home(&site, filter).await,
        Command::HomeVideo => dispatcher.home_video(&site).await,
        Command::Category {
            tid,
            page,
            filter,
            extend,
        } => {
            let extend: HashMap<String, String> = extend.into_iter().collect();
            dispatcher.category(&site, &tid, &page, filter, &extend).await
        }
        Command::Detail { ids } => dispatcher.detail(&site, &ids).await,
        Command::Search {
            keyword,
            quick,
            page,
        } => dispatcher.search(&site, &keyword, quick, page.as_deref()).await,
        Command::Play { flag, id, vip_flags } => dispatcher.play(&site, &flag, &id, &vip_flags).await,
        Command::IsVideo { url } => dispatcher.is_video_format(&site, &url).await.to_string(),
        Command::Proxy { params } => {
            // Resolving the site makes it the proxy target.
            dispatcher.loader().get_spider(&site).await;
            let params: HashMap<String, String> = params.into_iter().collect();
            let response = dispatcher.proxy_response(&params).await;
            return write_proxy(&response);
        }
    };

    println!("{}", pretty(&output));
    Ok(())
}

/// Pretty-print JSON results, pass anything else through.
fn pretty(output: &str) -> String {
    serde_json::from_str::<serde_json::Value>(output)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| output.to_string())
}

fn write_proxy(response: &ProxyResponse) -> Result<(), SpiderError> {
    let Some(reply) = response.as_reply() else {
        tracing::warn!("proxy returned no response");
        return Ok(());
    };
    tracing::info!(
        status = reply.status,
        content_type = %reply.content_type,
        headers = ?reply.headers,
        bytes = reply.body.len(),
        "proxy response"
    );
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&reply.body)?;
    stdout.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair() {
        assert_eq!(
            parse_pair("url=a/b=c").unwrap(),
            ("url".to_string(), "a/b=c".to_string())
        );
        assert!(parse_pair("novalue").is_err());
    }

    #[test]
    fn test_pretty_passes_plain_text() {
        assert_eq!(pretty("true"), "true");
        assert_eq!(pretty("not json"), "not json");
        assert_eq!(pretty(r#"{"a":1}"#), "{\n  \"a\": 1\n}");
    }

    #[test]
    fn test_cli_parses_proxy_params() {
        let cli = Cli::try_parse_from([
            "freebox",
            "--api",
            "./s.js",
            "proxy",
            "from=catvod",
            "url=a/b/c",
        ])
        .unwrap();
        match cli.command {
            Command::Proxy { params } => assert_eq!(params.len(), 2),
            _ => panic!("expected proxy"),
        }
        assert_eq!(cli.key, "cli");
    }
}
