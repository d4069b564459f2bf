use anyhow::{Context, Result, bail};
use reqwest::{Client, Url, header};
use std::{env, path::Path};
use tracing::info;

use crate::UploadArgs;
use crate::download::mk_client;

const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1/b";
const TOKEN_VARS: [&str; 2] = ["GCS_ACCESS_TOKEN", "GOOGLE_OAUTH_ACCESS_TOKEN"];

/// Media upload endpoint for `gs://<bucket>/<dest>`.
pub fn upload_url(bucket: &str, dest: &str) -> Result<Url> {
    if bucket.is_empty() || dest.is_empty() {
        bail!("bucket and destination object name must be non-empty");
    }
    let base = format!("{UPLOAD_BASE}/{bucket}/o");
    Ok(Url::parse_with_params(
        &base,
        &[("uploadType", "media"), ("name", dest)],
    )?)
}

/// First non-empty token among the supported variables.
pub fn access_token_from(lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    TOKEN_VARS
        .iter()
        .filter_map(|v| lookup(v))
        .find(|t| !t.trim().is_empty())
        .with_context(|| format!("no GCS access token; set {}", TOKEN_VARS.join(" or ")))
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

pub async fn upload_with_token(
    client: &Client,
    token: &str,
    bucket: &str,
    source: &Path,
    dest: &str,
) -> Result<()> {
    let url = upload_url(bucket, dest)?;
    let body = tokio::fs::read(source)
        .await
        .with_context(|| format!("read {}", source.display()))?;

    let resp = client
        .post(url)
        .bearer_auth(token)
        .header(header::CONTENT_TYPE, content_type(source))
        .body(body)
        .send()
        .await?;
    let status = resp.status();
    if !status.is_success() {
        let txt = resp.text().await.unwrap_or_default();
        bail!("upload to gs://{}/{} failed: HTTP {}; body: {}", bucket, dest, status, txt);
    }
    info!("uploaded {} to gs://{}/{}", source.display(), bucket, dest);
    Ok(())
}

/// Upload `source` to `gs://<bucket>/<dest>` with a bearer token from the environment.
pub async fn upload_file(bucket: &str, source: &Path, dest: &str) -> Result<()> {
    let token = access_token_from(|k| env::var(k).ok())?;
    let client = mk_client()?;
    upload_with_token(&client, &token, bucket, source, dest).await
}

pub async fn execute(args: &UploadArgs) -> Result<()> {
    upload_file(&args.bucket, &args.source, &args.dest).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encodes_object_name() {
        let url = upload_url("my-bucket", "backtests/day 1.ohlc.csv").unwrap();
        assert_eq!(url.path(), "/upload/storage/v1/b/my-bucket/o");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("uploadType".to_string(), "media".to_string()),
                ("name".to_string(), "backtests/day 1.ohlc.csv".to_string()),
            ]
        );
        assert!(upload_url("", "x").is_err());
    }

    #[test]
    fn token_lookup_order_and_missing() {
        let t = access_token_from(|k| match k {
            "GCS_ACCESS_TOKEN" => Some("  ".to_string()),
            "GOOGLE_OAUTH_ACCESS_TOKEN" => Some("ya29.token".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(t, "ya29.token");
        assert!(access_token_from(|_| None).is_err());
    }

    #[test]
    fn content_type_by_extension() {
        assert_eq!(content_type(Path::new("a/ohlc.csv")), "text/csv");
        assert_eq!(content_type(Path::new("stats.json")), "application/json");
        assert_eq!(content_type(Path::new("blob")), "application/octet-stream");
    }

    #[tokio::test]
    async fn missing_source_fails_before_any_request() {
        let client = mk_client().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = upload_with_token(&client, "t", "b", &dir.path().join("absent.csv"), "x")
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("absent.csv"));
    }
}
