//! Remote file helpers for URL-backed resources.

use std::io::{Read, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::{Error, Result, fs};

/// Download read chunk size.
const CHUNK: usize = 64 * 1024;

/// Returns `true` if `s` looks like a URL the runtime can fetch.
pub fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Probes `url` with a HEAD request.
pub fn remote_exists(url: &str) -> bool {
    match ureq::head(url).call() {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            debug!("HEAD {url} failed: {e}");
            false
        }
    }
}

/// Downloads `url` into the file at `path`.
///
/// The target is created exclusively (it must not already exist). Progress
/// is logged at debug level roughly every tenth of the transfer when the
/// server reports a length, else every 8 MiB.
pub fn download(url: &str, path: &Path) -> Result<()> {
    if !is_url(url) {
        return Err(Error::InvalidArgument);
    }

    let mut resp = ureq::get(url).call().map_err(|e| {
        warn!("Could not fetch {url}: {e}");
        Error::RemoteIo
    })?;

    let total = resp
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let step = total.map_or(8 * 1024 * 1024, |t| (t / 10).max(CHUNK as u64));

    let mut file = fs::file_create(path)?;
    let mut reader = resp.body_mut().as_reader();
    let mut buf = vec![0u8; CHUNK];
    let mut written: u64 = 0;
    let mut next_mark = step;

    loop {
        let n = reader.read(&mut buf).map_err(Error::Io)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
        written += n as u64;
        if written >= next_mark {
            match total {
                Some(t) => debug!("Downloading {url}: {written}/{t} bytes"),
                None => debug!("Downloading {url}: {written} bytes"),
            }
            next_mark += step;
        }
    }
    file.flush()?;

    debug!("Downloaded {url} to {} ({written} bytes)", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_prefixes() {
        assert!(is_url("http://example.com/model.pb"));
        assert!(is_url("https://example.com/model.pb"));
        assert!(!is_url("ftp://example.com/model.pb"));
        assert!(!is_url("/var/lib/model.pb"));
    }

    #[test]
    fn download_rejects_non_url() {
        let scratch = tempfile::tempdir().unwrap();
        let out = scratch.path().join("out");
        assert!(matches!(
            download("/not/a/url", &out),
            Err(Error::InvalidArgument)
        ));
    }
}
