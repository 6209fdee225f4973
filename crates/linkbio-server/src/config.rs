use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

use linkbio_api::directory::DirectoryConfig;

const DEV_JWT_SECRET: &str = "dev-secret-change-me";

pub struct Config {
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub qr_code_url: String,
    pub directory: DirectoryConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = var_or("LINKBIO_PORT", "3000");
        let port: u16 = port
            .parse()
            .with_context(|| format!("LINKBIO_PORT is not a port number: {port}"))?;

        let jwt_secret = var_or("LINKBIO_JWT_SECRET", DEV_JWT_SECRET);
        if jwt_secret == DEV_JWT_SECRET {
            warn!("LINKBIO_JWT_SECRET not set, using the development secret");
        }

        let directory = match env::var("LINKBIO_NOTABLE_PLATFORMS") {
            Ok(raw) => DirectoryConfig {
                notable_platforms: parse_list(&raw),
            },
            Err(_) => DirectoryConfig::default(),
        };

        Ok(Self {
            db_path: PathBuf::from(var_or("LINKBIO_DB_PATH", "linkbio.db")),
            host: var_or("LINKBIO_HOST", "0.0.0.0"),
            port,
            jwt_secret,
            qr_code_url: var_or("LINKBIO_QR_CODE_URL", "/qr-code/image"),
            directory,
        })
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    })
}

/// Comma separated, blanks dropped.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_trims_and_skips_blanks() {
        assert_eq!(
            parse_list(" twitter.com, ,github.com ,"),
            vec!["twitter.com", "github.com"]
        );
        assert!(parse_list("").is_empty());
    }
}
