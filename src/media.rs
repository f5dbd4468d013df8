//! Media types, `accept` media ranges and `accept-language` ranges.

use crate::Error;
use http::header::HeaderMap;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// `application/json`
pub const APPLICATION_JSON: &str = "application/json";
/// `application/octet-stream`
pub const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";
/// `application/x-www-form-urlencoded`
pub const APPLICATION_X_WWW_FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
/// `multipart/form-data`
pub const MULTIPART_FORM_DATA: &str = "multipart/form-data";
/// `text/event-stream`
pub const TEXT_EVENT_STREAM: &str = "text/event-stream";
/// `text/html`
pub const TEXT_HTML: &str = "text/html";
/// `text/plain`
pub const TEXT_PLAIN: &str = "text/plain";

/// A media type such as `text/html;charset=utf-8`.
///
/// Type, subtype and parameter names are lowercased. Either the type or the
/// subtype may be `*`, which makes the value usable as a range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaType {
    ty: String,
    subtype: String,
    params: Vec<(String, String)>,
}

impl MediaType {
    /// Parse a media type. Parameters named `q` are kept, see [`MediaRange`]
    /// for quality handling.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut parts = s.split(';');

        // invariant: split always yields at least one item.
        let essence = parts.next().unwrap_or("").trim();

        let (ty, subtype) = match essence.split_once('/') {
            Some((t, st)) if is_token(t) && is_token(st) => (t, st),
            _ => return Err(Error::User(format!("Invalid media type: {}", s))),
        };

        if ty == "*" && subtype != "*" {
            return Err(Error::User(format!("Invalid media type: {}", s)));
        }

        let mut params = vec![];
        for p in parts {
            let p = p.trim();
            if p.is_empty() {
                continue;
            }
            let (name, value) = p
                .split_once('=')
                .ok_or_else(|| Error::User(format!("Invalid media type parameter: {}", p)))?;
            let value = value.trim().trim_matches('"');
            params.push((name.trim().to_ascii_lowercase(), value.to_string()));
        }

        Ok(MediaType {
            ty: ty.to_ascii_lowercase(),
            subtype: subtype.to_ascii_lowercase(),
            params,
        })
    }

    /// The type, `text` in `text/html`.
    pub fn ty(&self) -> &str {
        &self.ty
    }

    /// The subtype, `html` in `text/html`.
    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    /// `type/subtype` without parameters.
    pub fn essence(&self) -> String {
        format!("{}/{}", self.ty, self.subtype)
    }

    /// A parameter value, the name compared without case.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All parameters, in their given order.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// `*/*` without parameters.
    pub fn is_any(&self) -> bool {
        self.ty == "*" && self.subtype == "*" && self.params.is_empty()
    }

    /// 0 for `*/*`, 1 for `type/*`, 2 for `type/subtype`.
    fn specificity(&self) -> u8 {
        if self.ty == "*" {
            0
        } else if self.subtype == "*" {
            1
        } else {
            2
        }
    }

    /// Whether this type, used as a range, includes `other`.
    ///
    /// Every parameter of the range must be present with the same value in `other`.
    pub fn includes(&self, other: &MediaType) -> bool {
        let ty = self.ty == "*" || self.ty == other.ty;
        let subtype = self.subtype == "*" || self.subtype == other.subtype;

        ty && subtype
            && self
                .params
                .iter()
                .filter(|(n, _)| n != "q")
                .all(|(n, v)| other.param(n).map(|o| o.eq_ignore_ascii_case(v)).unwrap_or(false))
    }

    /// Order by specificity, most specific first, then by number of parameters.
    pub fn compare_specificity(&self, other: &MediaType) -> Ordering {
        other
            .specificity()
            .cmp(&self.specificity())
            .then_with(|| other.params.len().cmp(&self.params.len()))
    }
}

impl FromStr for MediaType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MediaType::parse(s)
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ty, self.subtype)?;
        for (n, v) in &self.params {
            write!(f, ";{}={}", n, v)?;
        }
        Ok(())
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|c| c.is_ascii_alphanumeric() || b"!#$&-^_.+*".contains(&c))
}

fn parse_quality(s: &str) -> f32 {
    s.trim().parse::<f32>().map(|q| q.clamp(0.0, 1.0)).unwrap_or(1.0)
}

/// One media range of an `accept` header.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRange {
    media_type: MediaType,
    quality: f32,
}

impl MediaRange {
    /// Parse a range such as `text/*;q=0.5`. The `q` parameter is taken out.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut media_type = MediaType::parse(s)?;

        let mut quality = 1.0;
        if let Some(pos) = media_type.params.iter().position(|(n, _)| n == "q") {
            let (_, q) = media_type.params.remove(pos);
            quality = parse_quality(&q);
        }

        Ok(MediaRange {
            media_type,
            quality,
        })
    }

    /// The range, without `q`.
    pub fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    /// Quality between 0 and 1.
    pub fn quality(&self) -> f32 {
        self.quality
    }

    /// Whether `media_type` is in the range and acceptable.
    pub fn matches(&self, media_type: &MediaType) -> bool {
        self.quality > 0.0 && self.media_type.includes(media_type)
    }

    /// Best first: higher quality, then more specific, then more parameters.
    pub fn compare(&self, other: &MediaRange) -> Ordering {
        other
            .quality
            .partial_cmp(&self.quality)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.media_type.compare_specificity(&other.media_type))
    }
}

/// The merged `accept` headers of a request, ranges sorted best first.
#[derive(Debug, Clone)]
pub struct Accept {
    ranges: Vec<MediaRange>,
}

impl Accept {
    /// Parse one header value. Unparseable ranges are skipped.
    pub fn parse(value: &str) -> Self {
        Self::from_ranges(value.split(',').filter_map(|r| {
            let r = r.trim();
            if r.is_empty() {
                return None;
            }
            match MediaRange::parse(r) {
                Ok(r) => Some(r),
                Err(e) => {
                    debug!("Ignore accept range: {}", e);
                    None
                }
            }
        }))
    }

    /// Merge every `accept` header. Defaults to `*/*` when there is none.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let ranges: Vec<MediaRange> = headers
            .get_all(http::header::ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| Accept::parse(v).ranges)
            .collect();

        if ranges.is_empty() {
            Accept::any()
        } else {
            Self::from_ranges(ranges.into_iter())
        }
    }

    /// `*/*`
    pub fn any() -> Self {
        Accept {
            ranges: vec![MediaRange {
                media_type: MediaType {
                    ty: "*".into(),
                    subtype: "*".into(),
                    params: vec![],
                },
                quality: 1.0,
            }],
        }
    }

    fn from_ranges(ranges: impl Iterator<Item = MediaRange>) -> Self {
        let mut ranges: Vec<_> = ranges.collect();
        // stable, equal ranges keep header order.
        ranges.sort_by(|a, b| a.compare(b));
        Accept { ranges }
    }

    /// Ranges, best first.
    pub fn ranges(&self) -> &[MediaRange] {
        &self.ranges
    }

    /// Whether a plain `*/*` range is acceptable.
    pub fn accepts_any(&self) -> bool {
        self.ranges
            .iter()
            .any(|r| r.media_type.is_any() && r.quality > 0.0)
    }

    /// All `(range, target)` matches, best range first, targets in their
    /// given order within a range. Each target appears once, with its best range.
    pub fn find_all_match<'a, T>(
        &'a self,
        targets: &'a [(MediaType, T)],
    ) -> Vec<(&'a MediaRange, &'a (MediaType, T))> {
        let mut seen = vec![false; targets.len()];
        let mut matches = vec![];

        for range in &self.ranges {
            if range.quality <= 0.0 {
                continue;
            }
            for (i, target) in targets.iter().enumerate() {
                if !seen[i] && range.matches(&target.0) && !self.excludes(&target.0) {
                    seen[i] = true;
                    matches.push((range, target));
                }
            }
        }

        matches
    }

    /// A more specific range with `q=0` excludes a media type.
    fn excludes(&self, media_type: &MediaType) -> bool {
        self.ranges
            .iter()
            .filter(|r| r.media_type.includes(media_type))
            .max_by(|a, b| b.media_type.compare_specificity(&a.media_type))
            .map(|r| r.quality <= 0.0)
            .unwrap_or(false)
    }
}

/// Index of the first range in `ranges` that includes `content_type`.
///
/// `ranges` are expected sorted most specific first.
pub fn find_first_match<'a, T>(
    content_type: &MediaType,
    ranges: &'a [(MediaType, T)],
) -> Option<&'a (MediaType, T)> {
    ranges.iter().find(|(r, _)| r.includes(content_type))
}

/// One language range of an `accept-language` header.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageRange {
    tag: String,
    quality: f32,
}

impl LanguageRange {
    /// Parse a range such as `fr-CH;q=0.8`. `None` when malformed.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split(';');
        let tag = parts.next()?.trim().to_ascii_lowercase();
        if tag.is_empty() || !tag.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'*') {
            return None;
        }

        let quality = parts
            .filter_map(|p| p.trim().strip_prefix("q="))
            .map(parse_quality)
            .next()
            .unwrap_or(1.0);

        Some(LanguageRange { tag, quality })
    }

    /// The language tag, in lower case.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Quality between 0 and 1.
    pub fn quality(&self) -> f32 {
        self.quality
    }

    /// Basic filtering (RFC 4647): `*` matches anything, `fr` matches `fr` and `fr-fr`.
    pub fn matches(&self, language: &str) -> bool {
        if self.quality <= 0.0 {
            return false;
        }
        if self.tag == "*" {
            return true;
        }
        let language = language.to_ascii_lowercase();
        language == self.tag
            || (language.starts_with(&self.tag) && language.as_bytes().get(self.tag.len()) == Some(&b'-'))
    }

    fn specificity(&self) -> usize {
        if self.tag == "*" {
            0
        } else {
            self.tag.split('-').count()
        }
    }
}

/// Ranges of the merged `accept-language` headers, best first.
#[derive(Debug, Clone)]
pub struct AcceptLanguage {
    ranges: Vec<LanguageRange>,
}

impl AcceptLanguage {
    /// Merge every `accept-language` header.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut ranges: Vec<LanguageRange> = headers
            .get_all(http::header::ACCEPT_LANGUAGE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .filter_map(LanguageRange::parse)
            .collect();

        ranges.sort_by(|a, b| {
            b.quality
                .partial_cmp(&a.quality)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.specificity().cmp(&a.specificity()))
        });

        AcceptLanguage { ranges }
    }

    /// Whether the request names no language.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Targets matched by some range, best range first, each target once.
    pub fn find_all_match<'a, T>(&self, targets: &'a [(String, T)]) -> Vec<&'a (String, T)> {
        let mut seen = vec![false; targets.len()];
        let mut matches = vec![];

        for range in &self.ranges {
            for (i, target) in targets.iter().enumerate() {
                if !seen[i] && range.matches(&target.0) {
                    seen[i] = true;
                    matches.push(target);
                }
            }
        }

        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    fn mt(s: &str) -> MediaType {
        MediaType::parse(s).unwrap()
    }

    #[test]
    fn parse_media_type() {
        let m = mt("Text/HTML; Charset=\"utf-8\"");
        assert_eq!(m.essence(), "text/html");
        assert_eq!(m.param("charset"), Some("utf-8"));
        assert!(MediaType::parse("text").is_err());
        assert!(MediaType::parse("*/html").is_err());
    }

    #[test]
    fn range_includes() {
        assert!(mt("text/*").includes(&mt("text/plain")));
        assert!(mt("*/*").includes(&mt("application/json")));
        assert!(!mt("text/plain;charset=utf-8").includes(&mt("text/plain")));
        assert!(mt("text/plain").includes(&mt("text/plain;charset=utf-8")));
    }

    #[test]
    fn accept_sorted_by_quality_then_specificity() {
        let a = Accept::parse("*/*;q=0.1, text/*, text/html;q=0.5, application/json;q=0.9");
        let order: Vec<_> = a.ranges().iter().map(|r| r.media_type().essence()).collect();
        assert_eq!(order, vec!["text/*", "application/json", "text/html", "*/*"]);
    }

    #[test]
    fn find_all_match_best_first() {
        let a = Accept::parse("text/html;q=0.5, application/json;q=0.9");
        let targets = vec![(mt(TEXT_HTML), 1), (mt(APPLICATION_JSON), 2)];
        let found: Vec<_> = a.find_all_match(&targets).iter().map(|(_, t)| t.1).collect();
        assert_eq!(found, vec![2, 1]);
    }

    #[test]
    fn zero_quality_excludes() {
        let a = Accept::parse("text/*, text/plain;q=0");
        let targets = vec![(mt(TEXT_PLAIN), 1), (mt(TEXT_HTML), 2)];
        let found: Vec<_> = a.find_all_match(&targets).iter().map(|(_, t)| t.1).collect();
        assert_eq!(found, vec![2]);
    }

    #[test]
    fn merged_accept_headers() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/plain;q=0.2"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        let a = Accept::from_headers(&headers);
        assert_eq!(a.ranges()[0].media_type().essence(), "application/json");
        assert!(!a.accepts_any());

        assert!(Accept::from_headers(&HeaderMap::new()).accepts_any());
    }

    #[test]
    fn first_match_most_specific() {
        let ranges = vec![(mt("application/json"), 1), (mt("application/*"), 2)];
        let found = find_first_match(&mt("application/xml"), &ranges).map(|r| r.1);
        assert_eq!(found, Some(2));
    }

    #[test]
    fn language_matching() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "accept-language",
            HeaderValue::from_static("en;q=0.5, fr-FR, *;q=0.1"),
        );
        let a = AcceptLanguage::from_headers(&headers);
        let targets = vec![
            ("en-US".to_string(), 1),
            ("fr-FR".to_string(), 2),
            ("de".to_string(), 3),
        ];
        let found: Vec<_> = a.find_all_match(&targets).iter().map(|t| t.1).collect();
        assert_eq!(found, vec![2, 1, 3]);
    }
}
