//! Conditional request evaluation.
//!
//! `If-None-Match` takes precedence: when present it alone decides the
//! outcome and `If-Modified-Since` is ignored. An unparsable or absent
//! `If-Modified-Since` places no constraint on the response.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Validators carried by a request.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestValidators<'a> {
    /// Raw `If-None-Match` header value.
    pub if_none_match: Option<&'a str>,
    /// Raw `If-Modified-Since` header value.
    pub if_modified_since: Option<&'a str>,
}

/// Outcome of evaluating request validators against a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// The client copy is stale (or absent); send the full representation.
    Fresh,
    /// The client copy is current; answer 304.
    NotModified,
}

impl RequestValidators<'_> {
    /// Evaluate the validators against a resource's entity tag and modification time.
    pub fn evaluate(&self, etag: &str, last_modified: SystemTime) -> Freshness {
        if let Some(if_none_match) = self.if_none_match {
            return if etag_matches(if_none_match, etag) {
                Freshness::NotModified
            } else {
                Freshness::Fresh
            };
        }

        match self.if_modified_since {
            Some(since) if unmodified_since(since, last_modified) => Freshness::NotModified,
            _ => Freshness::Fresh,
        }
    }
}

/// Check an `If-None-Match` header against a strong entity tag.
///
/// The header is a comma-separated list; `*` matches any current
/// representation and a client-side `W/` prefix is ignored.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if_none_match
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .any(|token| {
            if token == "*" {
                return true;
            }
            let token = token.strip_prefix("W/").unwrap_or(token);
            token == etag
        })
}

/// True when the resource has not changed since the given HTTP date.
///
/// Returns false for unparsable dates so they never produce a 304.
pub fn unmodified_since(if_modified_since: &str, last_modified: SystemTime) -> bool {
    match httpdate::parse_http_date(if_modified_since.trim()) {
        Ok(since) => truncate_to_seconds(last_modified) <= since,
        Err(_) => false,
    }
}

/// Latest instant an HTTP date can express, 9999-12-31T23:59:59Z.
const MAX_HTTP_DATE_SECS: u64 = 253_402_300_799;

/// Reduce a timestamp to what `Last-Modified` can express: whole seconds
/// between the Unix epoch and the end of year 9999.
pub fn truncate_to_seconds(time: SystemTime) -> SystemTime {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
        .min(MAX_HTTP_DATE_SECS);
    UNIX_EPOCH + Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ETAG: &str = "\"96fa8f226d3801741e807533552bc4b177ac4544d834073b6a5298934d34b40b\"";

    fn modified() -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(1_700_000_000_750)
    }

    #[test]
    fn test_no_validators_is_fresh() {
        let validators = RequestValidators::default();
        assert_eq!(validators.evaluate(ETAG, modified()), Freshness::Fresh);
    }

    #[test]
    fn test_exact_etag_match() {
        let validators = RequestValidators {
            if_none_match: Some(ETAG),
            if_modified_since: None,
        };
        assert_eq!(validators.evaluate(ETAG, modified()), Freshness::NotModified);
    }

    #[test]
    fn test_etag_list_with_weak_prefix() {
        let header = format!("\"other\", W/{ETAG}");
        assert!(etag_matches(&header, ETAG));
        assert!(etag_matches(" * ", ETAG));
        assert!(!etag_matches("\"other\", W/\"another\"", ETAG));
        assert!(!etag_matches("", ETAG));
    }

    #[test]
    fn test_unquoted_token_does_not_match() {
        assert!(!etag_matches(&ETAG[1..65], ETAG));
    }

    #[test]
    fn test_if_modified_since_truncates_resource_time() {
        // Resource modified at 22:13:20.750; a client holding 22:13:20 is current.
        let validators = RequestValidators {
            if_none_match: None,
            if_modified_since: Some("Tue, 14 Nov 2023 22:13:20 GMT"),
        };
        assert_eq!(validators.evaluate(ETAG, modified()), Freshness::NotModified);

        let older = RequestValidators {
            if_none_match: None,
            if_modified_since: Some("Tue, 14 Nov 2023 22:13:19 GMT"),
        };
        assert_eq!(older.evaluate(ETAG, modified()), Freshness::Fresh);
    }

    #[test]
    fn test_out_of_range_times_are_clamped() {
        let before_epoch = UNIX_EPOCH - Duration::from_secs(86_400);
        assert_eq!(truncate_to_seconds(before_epoch), UNIX_EPOCH);

        let far_future = UNIX_EPOCH + Duration::from_secs(MAX_HTTP_DATE_SECS + 3_600);
        assert_eq!(
            truncate_to_seconds(far_future),
            UNIX_EPOCH + Duration::from_secs(MAX_HTTP_DATE_SECS)
        );

        // The clamped value is what the client echoes back.
        assert!(unmodified_since(
            "Thu, 01 Jan 1970 00:00:00 GMT",
            before_epoch
        ));
    }

    #[test]
    fn test_unparsable_date_is_no_constraint() {
        let validators = RequestValidators {
            if_none_match: None,
            if_modified_since: Some("yesterday-ish"),
        };
        assert_eq!(validators.evaluate(ETAG, modified()), Freshness::Fresh);
    }

    #[test]
    fn test_if_none_match_takes_precedence() {
        // Mismatching tag wins over a satisfied date.
        let mismatch = RequestValidators {
            if_none_match: Some("\"stale\""),
            if_modified_since: Some("Tue, 14 Nov 2023 22:13:20 GMT"),
        };
        assert_eq!(mismatch.evaluate(ETAG, modified()), Freshness::Fresh);

        // Matching tag wins over a date that would say "modified".
        let matched = RequestValidators {
            if_none_match: Some(ETAG),
            if_modified_since: Some("Mon, 01 Jan 2001 00:00:00 GMT"),
        };
        assert_eq!(matched.evaluate(ETAG, modified()), Freshness::NotModified);
    }
}
