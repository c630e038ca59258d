//! Purpose: Map page keys to file names and rediscover page files in a cache directory.
//! Exports: `page_file_name`, `parse_page_file_name`, `scan_pages`, `now_millis`, `format_millis`.
//! Role: Thin filesystem collaborator used by the page directory at startup.
//! Invariants: Names are UTC with millisecond precision and sort in key order.
//! Invariants: Only canonical names are accepted; anything else in the directory is ignored.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::core::error::{Error, ErrorKind, io_error};

pub const PAGE_SUFFIX: &str = ".page";

const NAME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]T[hour][minute][second].[subsecond digits:3]Z");

fn to_datetime(timestamp_ms: u64) -> Result<OffsetDateTime, Error> {
    let nanos = i128::from(timestamp_ms) * 1_000_000;
    OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("timestamp out of range")
            .with_timestamp(timestamp_ms)
            .with_source(err)
    })
}

/// Canonical file name for a page keyed at `timestamp_ms` (milliseconds since the epoch).
pub fn page_file_name(timestamp_ms: u64) -> Result<String, Error> {
    let stem = to_datetime(timestamp_ms)?.format(NAME_FORMAT).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("timestamp cannot be encoded as a page name")
            .with_timestamp(timestamp_ms)
            .with_source(err)
    })?;
    Ok(format!("{stem}{PAGE_SUFFIX}"))
}

pub fn parse_page_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(PAGE_SUFFIX)?;
    let parsed = PrimitiveDateTime::parse(stem, NAME_FORMAT).ok()?.assume_utc();
    let millis = u64::try_from(parsed.unix_timestamp_nanos() / 1_000_000).ok()?;
    // reject lookalikes such as out-of-range fields the parser normalized
    if page_file_name(millis).ok()? != name {
        return None;
    }
    Some(millis)
}

/// Page files in `dir`, ordered by key ascending.
pub fn scan_pages(dir: &Path) -> Result<Vec<(u64, PathBuf)>, Error> {
    let entries = fs::read_dir(dir)
        .map_err(|err| io_error(dir, err).with_message("failed to list cache directory"))?;
    let mut pages = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| io_error(dir, err))?;
        let path = entry.path();
        let is_file = entry
            .file_type()
            .map(|kind| kind.is_file())
            .map_err(|err| io_error(&path, err))?;
        let key = entry
            .file_name()
            .to_str()
            .and_then(parse_page_file_name);
        match key {
            Some(key) if is_file => pages.push((key, path)),
            _ => tracing::trace!(path = %path.display(), "ignoring non-page entry"),
        }
    }
    pages.sort_by_key(|(key, _)| *key);
    Ok(pages)
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}

pub fn format_millis(timestamp_ms: u64) -> Result<String, Error> {
    to_datetime(timestamp_ms)?.format(&Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("timestamp format failed")
            .with_source(err)
    })
}

#[cfg(test)]
mod tests {
    use super::{format_millis, page_file_name, parse_page_file_name, scan_pages};

    #[test]
    fn names_are_utc_with_millis() {
        assert_eq!(page_file_name(0).expect("name"), "19700101T000000.000Z.page");
        assert_eq!(
            page_file_name(1_700_000_000_123).expect("name"),
            "20231114T221320.123Z.page"
        );
        assert_eq!(parse_page_file_name("20231114T221320.123Z.page"), Some(1_700_000_000_123));
    }

    #[test]
    fn names_sort_like_keys() {
        let keys = [5u64, 1_000, 59_999, 86_400_000, 1_700_000_000_123];
        let mut names = keys
            .iter()
            .map(|key| page_file_name(*key).expect("name"))
            .collect::<Vec<_>>();
        let expected = names.clone();
        names.sort();
        assert_eq!(names, expected);
    }

    #[test]
    fn foreign_names_are_rejected() {
        for name in [
            "writer.lock",
            "19700101T000000.000Z",
            "19700101T000000.000Z.page.tmp",
            "19700101T000000Z.page",
            "19701301T000000.000Z.page",
            "hello.page",
        ] {
            assert_eq!(parse_page_file_name(name), None, "{name}");
        }
    }

    #[test]
    fn far_future_timestamp_is_usage_error() {
        let err = page_file_name(u64::MAX).expect_err("range");
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Usage);
    }

    #[test]
    fn scan_orders_pages_and_skips_strangers() {
        let dir = tempfile::tempdir().expect("tempdir");
        for key in [30u64, 10, 20] {
            std::fs::write(dir.path().join(page_file_name(key).expect("name")), b"")
                .expect("write");
        }
        std::fs::write(dir.path().join("notes.txt"), b"").expect("write");
        std::fs::create_dir(dir.path().join(page_file_name(40).expect("name"))).expect("mkdir");

        let keys = scan_pages(dir.path())
            .expect("scan")
            .into_iter()
            .map(|(key, _)| key)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec![10, 20, 30]);
    }

    #[test]
    fn rfc3339_rendering() {
        assert_eq!(format_millis(1_500).expect("format"), "1970-01-01T00:00:01.5Z");
    }
}
