//! Integration tests for the HTTP routes.

mod common;

use axum::http::{Method, StatusCode};
use common::{TEST_API_KEY, TestGateway, archive_etag, http_date, seeded_bytes, sha256_hex};
use exgate_core::CacheControlPolicy;
use exgate_core::config::BucketConfig;
use std::net::SocketAddr;
use std::time::{Duration, UNIX_EPOCH};

#[tokio::test]
async fn test_get_archive() {
    let gateway = TestGateway::new();
    let data = seeded_bytes(1, 200_000);
    gateway.write_artifact("builds/demo.zip", &data);

    let response = gateway.get("/exports/builds/demo.zip").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, data);
    assert_eq!(response.header("content-type"), Some("application/zip"));
    assert_eq!(response.header("content-length"), Some("200000"));
    assert_eq!(response.header("etag"), Some(archive_etag(&data).as_str()));
    assert_eq!(response.header("accept-ranges"), Some("bytes"));
    assert_eq!(response.header("cache-control"), Some("no-cache"));
    assert_eq!(response.header("vary"), Some("Accept-Encoding"));
    assert!(response.header("last-modified").is_some());
    assert_eq!(
        response.header("content-disposition"),
        Some("attachment; filename=\"demo.zip\"; filename*=UTF-8''demo.zip")
    );
}

#[tokio::test]
async fn test_head_archive_matches_get_headers() {
    let gateway = TestGateway::new();
    gateway.write_artifact("demo.zip", b"checksum");

    let get = gateway.get("/exports/demo.zip").await;
    let head = gateway.head("/exports/demo.zip").await;

    assert_eq!(head.status, StatusCode::OK);
    assert!(head.body.is_empty());
    assert_eq!(head.header("content-length"), Some("8"));
    assert_eq!(head.header("etag"), get.header("etag"));
    assert_eq!(head.header("last-modified"), get.header("last-modified"));
}

#[tokio::test]
async fn test_digest_manifest() {
    let gateway = TestGateway::new();
    gateway.write_artifact("demo.zip", b"checksum");

    let response = gateway.get("/exports/demo.zip.sha256").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        response.text(),
        format!("{}  demo.zip\n", sha256_hex(b"checksum"))
    );
    assert_eq!(
        response.header("content-type"),
        Some("text/plain; charset=utf-8")
    );
    assert!(response.header("accept-ranges").is_none());

    let archive = gateway.head("/exports/demo.zip").await;
    assert_ne!(response.header("etag"), archive.header("etag"));

    let head = gateway.head("/exports/demo.zip.sha256").await;
    assert_eq!(head.status, StatusCode::OK);
    assert!(head.body.is_empty());
    assert_eq!(head.header("etag"), response.header("etag"));
}

#[tokio::test]
async fn test_manifest_for_missing_archive() {
    let gateway = TestGateway::new();
    let response = gateway.get("/exports/absent.zip.sha256").await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_missing_artifact() {
    let gateway = TestGateway::new();
    let response = gateway.get("/exports/absent.zip").await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.json()["code"], "not_found");

    let head = gateway.head("/exports/absent.zip").await;
    assert_eq!(head.status, StatusCode::NOT_FOUND);
    assert!(head.body.is_empty());
}

#[tokio::test]
async fn test_non_artifact_paths_not_found() {
    let gateway = TestGateway::new();
    gateway.write_artifact("readme.txt", b"hello");
    std::fs::create_dir_all(gateway.root().join("dir.zip")).unwrap();

    for uri in [
        "/exports/readme.txt",
        "/exports/dir.zip",
        "/exports/",
        "/exports/.zip",
        "/other",
        "/",
    ] {
        let response = gateway.get(uri).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn test_query_string_ignored() {
    let gateway = TestGateway::new();
    gateway.write_artifact("demo.zip", b"checksum");
    let response = gateway.get("/exports/demo.zip?download=1").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, b"checksum".as_slice());
}

#[tokio::test]
async fn test_if_none_match() {
    let gateway = TestGateway::new();
    gateway.write_artifact("demo.zip", b"checksum");
    let etag = archive_etag(b"checksum");

    let response = gateway
        .get_with("/exports/demo.zip", &[("if-none-match", etag.as_str())])
        .await;
    assert_eq!(response.status, StatusCode::NOT_MODIFIED);
    assert!(response.body.is_empty());
    assert_eq!(response.header("etag"), Some(etag.as_str()));
    assert_eq!(response.header("cache-control"), Some("no-cache"));

    let weak = format!("W/{etag}");
    let listed = format!("\"other\", {etag}");
    for value in [weak.as_str(), listed.as_str(), "*"] {
        let response = gateway
            .get_with("/exports/demo.zip", &[("if-none-match", value)])
            .await;
        assert_eq!(response.status, StatusCode::NOT_MODIFIED, "{value}");
    }

    let response = gateway
        .get_with("/exports/demo.zip", &[("if-none-match", "\"stale\"")])
        .await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, b"checksum".as_slice());
}

#[tokio::test]
async fn test_if_modified_since() {
    let gateway = TestGateway::new();
    gateway.write_artifact("demo.zip", b"checksum");

    let first = gateway.get("/exports/demo.zip").await;
    let last_modified = first.header("last-modified").unwrap().to_string();

    let response = gateway
        .get_with("/exports/demo.zip", &[("if-modified-since", last_modified.as_str())])
        .await;
    assert_eq!(response.status, StatusCode::NOT_MODIFIED);

    let long_ago = http_date(UNIX_EPOCH + Duration::from_secs(1_000));
    let response = gateway
        .get_with("/exports/demo.zip", &[("if-modified-since", long_ago.as_str())])
        .await;
    assert_eq!(response.status, StatusCode::OK);

    let response = gateway
        .get_with("/exports/demo.zip", &[("if-modified-since", "not a date")])
        .await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_if_none_match_takes_precedence() {
    let gateway = TestGateway::new();
    gateway.write_artifact("demo.zip", b"checksum");
    let future = http_date(std::time::SystemTime::now() + Duration::from_secs(3600));

    let response = gateway
        .get_with(
            "/exports/demo.zip",
            &[("if-none-match", "\"stale\""), ("if-modified-since", future.as_str())],
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_traversal_blocked() {
    let gateway = TestGateway::new();
    gateway.write_artifact("demo.zip", b"checksum");

    for uri in [
        "/exports/../demo.zip",
        "/exports/%2e%2e/demo.zip",
        "/exports/a/../../etc/passwd.zip",
        "/exports/..%2f..%2fetc%2fpasswd.zip",
        "/exports/%2fetc%2fpasswd.zip",
        "/exports/a%5c..%5cdemo.zip",
    ] {
        let response = gateway.get(uri).await;
        assert_eq!(response.status, StatusCode::FORBIDDEN, "{uri}");
        assert_eq!(response.json()["code"], "forbidden");
        assert!(!response.text().contains("passwd"));
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlink_escape_blocked() {
    let gateway = TestGateway::new();
    let outside = tempfile::tempdir().unwrap();
    let target = outside.path().join("secret.zip");
    std::fs::write(&target, b"secret").unwrap();
    std::os::unix::fs::symlink(&target, gateway.root().join("link.zip")).unwrap();

    let response = gateway.get("/exports/link.zip").await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert!(response.body.len() < 100);
}

#[tokio::test]
async fn test_malformed_path_is_bad_request() {
    let gateway = TestGateway::new();
    let response = gateway.get("/exports/a//demo.zip").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["code"], "bad_request");

    let response = gateway.get("/exports/%ff.zip").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unauthorized_does_not_reveal_existence() {
    let gateway = TestGateway::new();
    gateway.write_artifact("demo.zip", b"checksum");

    let present = gateway
        .request(Method::GET, "/exports/demo.zip", &[])
        .await;
    let absent = gateway
        .request(Method::GET, "/exports/absent.zip", &[("x-api-key", "wrong")])
        .await;
    let traversal = gateway
        .request(Method::GET, "/exports/../etc/passwd.zip", &[])
        .await;

    for response in [&present, &absent, &traversal] {
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert!(response.header("www-authenticate").is_some());
    }
    assert_eq!(present.body, absent.body);
    assert_eq!(present.body, traversal.body);
}

#[tokio::test]
async fn test_bearer_token_accepted() {
    let gateway = TestGateway::new();
    gateway.write_artifact("demo.zip", b"checksum");

    let bearer = format!("Bearer {TEST_API_KEY}");
    let response = gateway
        .request(
            Method::GET,
            "/exports/demo.zip",
            &[("authorization", bearer.as_str())],
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_rotated_key_accepted() {
    let gateway = TestGateway::with_config(|config| {
        config.auth.rotated_api_keys = vec!["previous-key".to_string()];
    });
    gateway.write_artifact("demo.zip", b"checksum");

    let response = gateway
        .request(
            Method::GET,
            "/exports/demo.zip",
            &[("x-api-key", "previous-key")],
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_health_public() {
    let gateway = TestGateway::new();
    let response = gateway.request(Method::GET, "/healthz", &[]).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json()["status"], "ok");
    assert_eq!(response.header("cache-control"), Some("no-store"));

    let head = gateway.request(Method::HEAD, "/healthz", &[]).await;
    assert_eq!(head.status, StatusCode::OK);
    assert!(head.body.is_empty());
}

#[tokio::test]
async fn test_health_private() {
    let gateway = TestGateway::with_config(|config| config.auth.health_public = false);

    let response = gateway.request(Method::GET, "/healthz", &[]).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);

    let response = gateway.get("/healthz").await;
    assert_eq!(response.status, StatusCode::OK);
}

#[tokio::test]
async fn test_health_reports_unavailable_root() {
    let gateway = TestGateway::new();
    std::fs::remove_dir_all(gateway.root()).unwrap();

    let response = gateway.request(Method::GET, "/healthz", &[]).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!response.text().contains(gateway.root().to_str().unwrap()));
}

#[tokio::test]
async fn test_method_not_allowed() {
    let gateway = TestGateway::new();
    gateway.write_artifact("demo.zip", b"checksum");

    for method in [Method::POST, Method::PUT, Method::DELETE] {
        let response = gateway
            .request(method, "/exports/demo.zip", &[("x-api-key", TEST_API_KEY)])
            .await;
        assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.header("allow"), Some("GET, HEAD"));
    }

    let response = gateway
        .request(Method::HEAD, "/metrics", &[("x-api-key", TEST_API_KEY)])
        .await;
    assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.header("allow"), Some("GET"));
}

#[tokio::test]
async fn test_metrics_requires_auth() {
    let gateway = TestGateway::new();
    gateway.write_artifact("demo.zip", b"checksum");
    gateway.get("/exports/demo.zip").await;
    gateway.get("/exports/demo.zip").await;

    let response = gateway.request(Method::GET, "/metrics", &[]).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);

    let response = gateway.get("/metrics").await;
    assert_eq!(response.status, StatusCode::OK);
    let text = response.text();
    assert!(text.contains("requests_total 3"), "{text}");
    assert!(text.contains("responses_2xx_total 2"));
    assert!(text.contains("responses_4xx_total 1"));
    assert!(text.contains("digest_cache_misses_total 1"));
    assert!(text.contains("digest_cache_hits_total 1"));
}

#[tokio::test]
async fn test_metrics_disabled() {
    let gateway = TestGateway::with_config(|config| config.server.metrics_enabled = false);
    let response = gateway.get("/metrics").await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rate_limited() {
    let gateway = TestGateway::with_config(|config| {
        config.rate_limit.enabled = true;
        config.rate_limit.exports = BucketConfig::new(2, 0.5);
    });
    gateway.write_artifact("demo.zip", b"checksum");

    assert_eq!(gateway.get("/exports/demo.zip").await.status, StatusCode::OK);
    assert_eq!(gateway.get("/exports/demo.zip").await.status, StatusCode::OK);

    let response = gateway.get("/exports/demo.zip").await;
    assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.json()["code"], "rate_limited");
    let retry_after: u64 = response.header("retry-after").unwrap().parse().unwrap();
    assert!((1..=2).contains(&retry_after));

    // Health has its own bucket.
    let health = gateway.get("/healthz").await;
    assert_eq!(health.status, StatusCode::OK);
}

#[tokio::test]
async fn test_anonymous_rate_limit_per_client_address() {
    let gateway = TestGateway::with_config(|config| {
        config.rate_limit.enabled = true;
        config.rate_limit.health = BucketConfig::new(1, 0.01);
    });
    let first: SocketAddr = "192.0.2.1:40000".parse().unwrap();
    let second: SocketAddr = "192.0.2.2:40000".parse().unwrap();

    let ok = gateway.request_from(first, Method::GET, "/healthz", &[]).await;
    assert_eq!(ok.status, StatusCode::OK);
    let limited = gateway.request_from(first, Method::GET, "/healthz", &[]).await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);

    let other = gateway.request_from(second, Method::GET, "/healthz", &[]).await;
    assert_eq!(other.status, StatusCode::OK);
}

#[tokio::test]
async fn test_forwarded_address_from_trusted_proxy() {
    let gateway = TestGateway::with_config(|config| {
        config.rate_limit.enabled = true;
        config.rate_limit.health = BucketConfig::new(1, 0.01);
        config.rate_limit.trusted_proxies = vec!["10.0.0.0/8".to_string()];
    });
    let proxy: SocketAddr = "10.1.2.3:5000".parse().unwrap();
    let untrusted: SocketAddr = "192.0.2.9:5000".parse().unwrap();

    for client in ["198.51.100.1", "198.51.100.2"] {
        let response = gateway
            .request_from(proxy, Method::GET, "/healthz", &[("x-forwarded-for", client)])
            .await;
        assert_eq!(response.status, StatusCode::OK, "{client}");
    }

    // An untrusted peer cannot pick its identity with the header.
    let response = gateway
        .request_from(
            untrusted,
            Method::GET,
            "/healthz",
            &[("x-forwarded-for", "198.51.100.3")],
        )
        .await;
    assert_eq!(response.status, StatusCode::OK);
    let response = gateway
        .request_from(
            untrusted,
            Method::GET,
            "/healthz",
            &[("x-forwarded-for", "198.51.100.4")],
        )
        .await;
    assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_version_header() {
    let gateway = TestGateway::new();
    let response = gateway.request(Method::GET, "/healthz", &[]).await;
    assert_eq!(
        response.header("x-exgate-version"),
        Some(env!("CARGO_PKG_VERSION"))
    );

    let gateway = TestGateway::with_config(|config| config.server.version_header = false);
    let response = gateway.request(Method::GET, "/healthz", &[]).await;
    assert!(response.header("x-exgate-version").is_none());
}

#[tokio::test]
async fn test_cache_control_policy() {
    let gateway = TestGateway::with_config(|config| {
        config.exports.cache_control = CacheControlPolicy::Immutable;
    });
    gateway.write_artifact("demo.zip", b"checksum");

    let response = gateway.get("/exports/demo.zip").await;
    assert_eq!(
        response.header("cache-control"),
        Some("public, max-age=31536000, immutable")
    );
}

#[tokio::test]
async fn test_non_ascii_file_name() {
    let gateway = TestGateway::new();
    gateway.write_artifact("r\u{e9}sum\u{e9}.zip", b"checksum");

    let response = gateway.get("/exports/r%C3%A9sum%C3%A9.zip").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        response.header("content-disposition"),
        Some("attachment; filename=\"r_sum_.zip\"; filename*=UTF-8''r%C3%A9sum%C3%A9.zip")
    );
}

#[tokio::test]
async fn test_identical_content_shares_etag() {
    let gateway = TestGateway::new();
    gateway.write_artifact("a.zip", b"same bytes");
    gateway.write_artifact("nested/b.zip", b"same bytes");

    let a = gateway.head("/exports/a.zip").await;
    let b = gateway.head("/exports/nested/b.zip").await;
    assert_eq!(a.header("etag"), b.header("etag"));
    assert_eq!(a.header("etag"), Some(archive_etag(b"same bytes").as_str()));
}

#[tokio::test]
async fn test_replaced_artifact_gets_new_etag() {
    let gateway = TestGateway::new();
    let path = gateway.write_artifact("demo.zip", b"version one");
    let first = gateway.get("/exports/demo.zip").await;

    std::fs::write(&path, b"version two, longer").unwrap();
    let second = gateway.get("/exports/demo.zip").await;

    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.body, b"version two, longer".as_slice());
    assert_ne!(first.header("etag"), second.header("etag"));
    assert_eq!(
        second.header("etag"),
        Some(archive_etag(b"version two, longer").as_str())
    );
}

#[tokio::test]
async fn test_pre_epoch_mtime_is_served() {
    let gateway = TestGateway::with_config(|config| {
        config.audit.enabled = true;
    });
    let path = gateway.write_artifact("old.zip", b"checksum");
    std::fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(UNIX_EPOCH - Duration::from_secs(86_400))
        .unwrap();

    let response = gateway.get("/exports/old.zip").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(&response.body[..], b"checksum");
    assert_eq!(
        response.header("last-modified"),
        Some("Thu, 01 Jan 1970 00:00:00 GMT")
    );

    let head = gateway.head("/exports/old.zip.sha256").await;
    assert_eq!(head.status, StatusCode::OK);

    let conditional = gateway
        .get_with(
            "/exports/old.zip",
            &[("if-modified-since", "Thu, 01 Jan 1970 00:00:00 GMT")],
        )
        .await;
    assert_eq!(conditional.status, StatusCode::NOT_MODIFIED);

    gateway.flush_audit().await;
    let statuses: Vec<u64> = gateway
        .audit_sink
        .records()
        .iter()
        .map(|r| r["status"].as_u64().unwrap())
        .collect();
    assert_eq!(statuses, [200, 200, 304]);
}
