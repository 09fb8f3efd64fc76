//! Wikimedia Commons thumbnail URLs.
//!
//! Commons serves scaled renditions under a predictable path, so a much
//! smaller file can stand in for the original when only transparency matters.

/// Root of original Commons uploads.
pub const COMMONS_PREFIX: &str = "https://upload.wikimedia.org/wikipedia/commons/";

/// Thumbnail URL for a Commons original, or `None` if `url` is not one.
///
/// `.../commons/a/ab/File.png` becomes `.../commons/thumb/a/ab/File.png/<W>px-File.png`.
pub fn thumbnail_url(url: &str, width: u32) -> Option<String> {
    let rest = url.strip_prefix(COMMONS_PREFIX)?;
    let mut parts = rest.splitn(3, '/');
    let (a, ab, file) = (parts.next()?, parts.next()?, parts.next()?);
    if a.len() != 1 || ab.len() != 2 || !ab.starts_with(a) || file.is_empty() || file.contains('/')
    {
        return None;
    }
    Some(format!("{COMMONS_PREFIX}thumb/{a}/{ab}/{file}/{width}px-{file}"))
}

/// The URL to fetch for an image declared `declared_width` pixels wide.
///
/// Images no wider than the thumbnail are fetched directly.
pub fn fetch_url(url: &str, declared_width: u32, thumbnail_width: u32) -> String {
    if thumbnail_width == 0 || declared_width <= thumbnail_width {
        return url.to_string();
    }
    thumbnail_url(url, thumbnail_width).unwrap_or_else(|| url.to_string())
}
