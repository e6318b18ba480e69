//! Task fingerprinting: deterministic identity for equivalent downloads.
//!
//! The fingerprint hashes the canonical URL (with volatile query parameters
//! stripped), the application tag, the requested byte range and the expected
//! digest. Requests that agree on all of these share one task; requests that
//! differ in any of them never alias each other.

use sha2::{Digest as _, Sha256};
use url::Url;

use super::{TaskError, TaskId, UrlMeta};

/// Computes the [`TaskId`] for a download request.
///
/// # Errors
/// - `TaskError::InvalidUrl` - The request URL does not parse.
pub fn task_id(raw_url: &str, meta: &UrlMeta) -> Result<TaskId, TaskError> {
    let filtered = filter_query(raw_url, &meta.filter)?;

    let mut hasher = Sha256::new();
    hasher.update(filtered.as_bytes());
    hasher.update([0u8]);
    hasher.update(meta.tag.as_bytes());
    hasher.update([0u8]);
    if let Some(range) = &meta.range {
        hasher.update(range.as_bytes());
    }
    hasher.update([0u8]);
    if let Some(digest) = &meta.digest {
        hasher.update(digest.as_bytes());
    }

    let digest = hasher.finalize();
    let mut id = String::with_capacity(digest.len() * 2);
    for byte in digest {
        id.push_str(&format!("{byte:02x}"));
    }
    Ok(TaskId::new(id))
}

/// Removes the query parameters named in `filter` (joined with `&`) from the
/// URL, preserving the order of the remaining parameters.
///
/// # Errors
/// - `TaskError::InvalidUrl` - The URL does not parse.
pub fn filter_query(raw_url: &str, filter: &str) -> Result<String, TaskError> {
    let mut url = Url::parse(raw_url)?;
    if filter.is_empty() || url.query().is_none() {
        return Ok(url.to_string());
    }

    let stripped: Vec<&str> = filter.split('&').filter(|k| !k.is_empty()).collect();
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !stripped.contains(&key.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        url.set_query(None);
    } else {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in &kept {
            pairs.append_pair(key, value);
        }
        drop(pairs);
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> UrlMeta {
        UrlMeta::default()
    }

    #[test]
    fn identical_requests_share_an_id() {
        let a = task_id("http://example.com/blob", &meta()).unwrap();
        let b = task_id("http://example.com/blob", &meta()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn filter_strips_volatile_parameters() {
        let mut m = meta();
        m.filter = "token&ts".to_string();
        let a = task_id("http://example.com/blob?token=aaa&ts=1", &m).unwrap();
        let b = task_id("http://example.com/blob?token=bbb&ts=2", &m).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unfiltered_parameters_still_distinguish() {
        let mut m = meta();
        m.filter = "token".to_string();
        let a = task_id("http://example.com/blob?token=aaa&v=1", &m).unwrap();
        let b = task_id("http://example.com/blob?token=aaa&v=2", &m).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tag_and_digest_participate() {
        let mut tagged = meta();
        tagged.tag = "registry".to_string();
        let a = task_id("http://example.com/blob", &meta()).unwrap();
        let b = task_id("http://example.com/blob", &tagged).unwrap();
        assert_ne!(a, b);

        let mut digested = meta();
        digested.digest = Some("sha256:cafe".to_string());
        let c = task_id("http://example.com/blob", &digested).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn range_participates_so_ranges_never_alias() {
        let mut ranged = meta();
        ranged.range = Some("bytes=0-1023".to_string());
        let whole = task_id("http://example.com/blob", &meta()).unwrap();
        let range = task_id("http://example.com/blob", &ranged).unwrap();
        assert_ne!(whole, range);
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(matches!(
            task_id("not a url", &meta()),
            Err(TaskError::InvalidUrl(_))
        ));
    }

    #[test]
    fn filter_removes_whole_query_when_everything_is_stripped() {
        let url = filter_query("http://example.com/blob?token=a", "token").unwrap();
        assert_eq!(url, "http://example.com/blob");
    }
}
