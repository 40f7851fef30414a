use std::env;
use std::error;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::process::exit;
use std::time::Duration;

use hyper::http::Uri;
use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::route::Router;
use crate::rule::{RuleConfig, RuleError};

#[derive(Debug, Deserialize)]
pub struct FallbackUri {
    #[serde(with = "http_serde::uri")]
    pub uri: Uri,
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    pub bind_to: String,
    pub metrics_prefix: String,
    #[serde(default = "upstream_timeout_ms_default")]
    pub upstream_timeout_ms: u64,
    #[serde(default = "max_body_size_default")]
    pub max_body_size: usize,
    #[serde(default)]
    pub fallback: Option<FallbackUri>,
    pub rewrites: Vec<RuleConfig>,
}

fn upstream_timeout_ms_default() -> u64 {
    30_000
}

fn max_body_size_default() -> usize {
    10 * 1024 * 1024
}

type Result<T> = std::result::Result<T, Box<dyn error::Error>>;

pub static RUNTIME_CONFIG: Lazy<RuntimeConfig> = Lazy::new(|| {
    let args: Vec<String> = env::args().collect();

    if args.len() != 2 {
        error!(
            "event='usage: {} runtime_config.yaml'",
            args.first().map(String::as_str).unwrap_or("rewrite-gateway")
        );
        exit(1);
    }

    match get_runtime_config(&args[1]) {
        Ok(x) => x,
        Err(e) => {
            error!("event='Runtime config is not valid: {e}'");
            exit(1);
        }
    }
});

fn get_runtime_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let runtime_config = serde_yaml::from_reader(reader)?;
    Ok(runtime_config)
}

impl RuntimeConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn build_router(&self) -> std::result::Result<Router, RuleError> {
        Router::from_config(&self.rewrites)
    }

    /// Fallback base URL without its trailing `/`, ready to prepend a path.
    pub fn fallback_base(&self) -> Option<String> {
        self.fallback
            .as_ref()
            .map(|fallback| fallback.uri.to_string().trim_end_matches('/').to_string())
    }
}
