//! On-disk response cache filter. The composed cache key maps to a
//! path under the configured root; stored entries are a raw response
//! head followed by the body, so serving is a parse plus a file
//! window over the stored bytes. Stale entries switch the request
//! into revalidation mode: the stored mtime rides If-Modified-Since
//! upstream, and a 304 coming back refreshes and replays the entry.

use crate::error::HandlerResult;
use crate::http::date::format_http_time;
use crate::http::parse::{find_end_of_http_headers, parse_http_response};
use crate::http::{Content, FileMeta, Request, Response};
use crate::server::handler::{Filter, FilterData};
use crate::stream::FileWindow;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct FileCacheFilter {
    root: PathBuf,
}

/// One stored entry, read back in full: parsed head plus the raw
/// bytes (head + body) and the file's metadata.
struct StoredEntry {
    head: Response,
    body_start: usize,
    meta: FileMeta,
    data: Vec<u8>,
}

impl FileCacheFilter {
    pub fn new<P: Into<PathBuf>>(root: P) -> FileCacheFilter {
        FileCacheFilter { root: root.into() }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }

    fn read_entry(&self, path: &Path) -> Option<StoredEntry> {
        let meta = FileMeta::from_std(&fs::metadata(path).ok()?);
        let data = fs::read(path).ok()?;
        let (head_end, body_start) = find_end_of_http_headers(&data)?;
        let mut head = Response::new();
        parse_http_response(&mut head, &data[..head_end]).ok()?;
        Some(StoredEntry {
            head,
            body_start,
            meta,
            data,
        })
    }

    /// Point `resp` at the stored entry's body.
    fn apply_entry(entry: &StoredEntry, path: PathBuf, resp: &mut Response) {
        let head = &entry.head;
        resp.status_code = 200;
        resp.status = Some("OK".to_owned());
        resp.content_type = head.content_type.clone();
        resp.content_charset = head.content_charset.clone();
        resp.last_modified = head.last_modified.or(Some(entry.meta.mtime));
        resp.etag = head.etag.clone();
        resp.cache_control = head.cache_control.clone();
        resp.max_age = head.max_age;
        resp.gzip_encoded = head.extra_headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case("content-encoding") && value.eq_ignore_ascii_case("gzip")
        });
        resp.content_length = (entry.data.len() - entry.body_start) as i64;
        resp.content = Content::File(FileWindow::new(
            path.clone(),
            entry.body_start as u64,
            entry.data.len() as u64,
            entry.meta,
        ));
        resp.sendfile_path = Some(path);
    }

    /// Rewrite the entry in place so its mtime restarts the max-age
    /// clock (a 304 revalidation confirmed it).
    fn refresh_entry(path: &Path, entry: &StoredEntry) {
        let tmp = path.with_extension("tmp");
        if fs::write(&tmp, &entry.data).is_ok() {
            fs::rename(&tmp, path).ok();
        }
    }

    fn store(&self, resp: &Response, path: &Path) -> std::io::Result<()> {
        let body: Vec<u8> = match &resp.content {
            Content::Bytes(span) => resp.arena.bytes(*span).to_vec(),
            Content::Cached(rec) => rec.content.clone(),
            Content::File(fw) => {
                let data = fs::read(fw.path())?;
                let end = (fw.end as usize).min(data.len());
                let start = (fw.offset as usize).min(end);
                data[start..end].to_vec()
            }
            _ => return Ok(()), // streaming content is not storable
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            let mut head = String::new();
            head.push_str("HTTP/1.1 200 OK\r\n");
            head.push_str("Content-Type: ");
            head.push_str(resp.content_type.as_deref().unwrap_or("text/html"));
            if let Some(charset) = resp.content_charset.as_deref() {
                head.push_str("; charset=");
                head.push_str(charset);
            }
            head.push_str("\r\n");
            if let Some(lm) = resp.last_modified {
                head.push_str("Last-Modified: ");
                head.push_str(&format_http_time(lm));
                head.push_str("\r\n");
            }
            if let Some(etag) = resp.etag.as_deref() {
                head.push_str("ETag: ");
                head.push_str(etag);
                head.push_str("\r\n");
            }
            if let Some(cc) = resp.cache_control.as_deref() {
                head.push_str("Cache-Control: ");
                head.push_str(cc);
                head.push_str("\r\n");
            }
            if resp.gzip_encoded {
                head.push_str("Content-Encoding: gzip\r\n");
            }
            head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
            f.write_all(head.as_bytes())?;
            f.write_all(&body)?;
        }
        fs::rename(&tmp, path)
    }
}

impl Filter for FileCacheFilter {
    fn name(&self) -> &'static str {
        "file_cache"
    }

    fn translate_cache_key(
        &self,
        _req: &Request,
        fdata: &mut FilterData,
        key: &str,
    ) -> HandlerResult {
        // the composed key becomes an on-disk location
        let path = self.entry_path(key);
        fdata.cache_key = Some(path.to_string_lossy().into_owned());
        HandlerResult::Ok
    }

    fn serve_from_cache(
        &self,
        req: &mut Request,
        resp: &mut Response,
        fdata: &mut FilterData,
        check_time: u64,
    ) -> HandlerResult {
        let path = match fdata.cache_key.as_deref() {
            Some(path) => PathBuf::from(path),
            None => return HandlerResult::Next,
        };
        let entry = match self.read_entry(&path) {
            Some(entry) => entry,
            None => return HandlerResult::Next, // absent or corrupt
        };
        fdata.cache_key_finfo = Some(entry.meta);

        // freshness: stored max-age counts from the entry's mtime;
        // max_age == -1 means revalidate every time
        let expired = entry.head.max_age == -1
            || (entry.head.max_age > 0
                && entry.meta.mtime + entry.head.max_age as u64 <= check_time);
        if expired {
            fdata.revalidating = true;
            req.if_modified_since = entry.head.last_modified.or(Some(entry.meta.mtime));
            return HandlerResult::Revalidate;
        }

        Self::apply_entry(&entry, path, resp);
        HandlerResult::Ok
    }

    fn do_filter(
        &self,
        _req: &Request,
        resp: &mut Response,
        fdata: &mut FilterData,
    ) -> HandlerResult {
        if fdata.revalidating {
            if resp.status_code == 304 {
                // upstream confirmed our copy: restart its age and
                // replay it
                if let Some(path) = fdata.cache_key.as_deref() {
                    let path = PathBuf::from(path);
                    if let Some(entry) = self.read_entry(&path) {
                        Self::refresh_entry(&path, &entry);
                        Self::apply_entry(&entry, path, resp);
                    }
                }
                return HandlerResult::Next;
            }
            // upstream produced fresh content; store it below
        } else if fdata.cache_key_finfo.is_some() {
            return HandlerResult::Next; // served from this cache
        }
        let storable = (resp.status_code == 0 || resp.status_code == 200)
            && !resp.no_cache
            && !resp.cache_private
            && resp.content_length >= 0;
        if !storable {
            return HandlerResult::Next;
        }
        if let Some(path) = fdata.cache_key.as_deref() {
            let path = PathBuf::from(path);
            self.store(resp, &path).ok();
        }
        HandlerResult::Next
    }
}
