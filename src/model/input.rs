use std::{
    collections::BTreeMap,
    fmt::Display,
    path::PathBuf,
    str::FromStr,
    sync::OnceLock,
};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{get_bool, get_int, get_str, Attr, Attrs, ParseError};

const INPUT_TYPE: &str = "git";
const DEFAULT_NAME: &str = "source";

const ALLOWED_ATTRIBUTES: &[&str] = &[
    "type",
    "url",
    "ref",
    "rev",
    "shallow",
    "submodules",
    "allRefs",
    "lastModified",
    "revCount",
    "narHash",
    "name",
];

const GIT_SCHEMES: &[&str] = &["git", "git+http", "git+https", "git+ssh", "git+file"];

// Rather than describing a valid ref, describe everything git refuses in one.
fn bad_git_ref_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"//|^[./]|/\.|\.\.|[\x00-\x20\x7f:?^~\[]|\\|\*|\.lock$|\.lock/|@\{|[/.]$|^@$|^$",
        )
        .expect("bad git ref regex is valid")
    })
}

pub fn is_valid_ref(reference: &str) -> bool {
    !bad_git_ref_regex().is_match(reference)
}

/// A full SHA-1 commit hash, normalised to lower case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rev(String);

impl Rev {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Rev {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.len() == 40 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Rev(value.to_ascii_lowercase()))
        } else {
            Err(ParseError::BadRev(value.to_owned()))
        }
    }
}

impl TryFrom<String> for Rev {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rev> for String {
    fn from(value: Rev) -> Self {
        value.0
    }
}

impl Display for Rev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request to fetch a Git repository.
///
/// The invariant that a `rev` is always accompanied by a `ref` is checked on
/// construction and preserved by every method that changes either of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    url: Url,
    reference: Option<String>,
    rev: Option<Rev>,
    shallow: Option<bool>,
    submodules: Option<bool>,
    all_refs: Option<bool>,
    last_modified: Option<u64>,
    rev_count: Option<u64>,
    nar_hash: Option<String>,
    name: Option<String>,
}

impl Input {
    /// Parses `git+<scheme>://...?ref=..&rev=..&shallow=1` style URLs.
    pub fn from_url(url: &str) -> Result<Input, ParseError> {
        let parsed = parse_url(url)?;
        let scheme = parsed.scheme().to_owned();
        if !GIT_SCHEMES.contains(&scheme.as_str()) {
            return Err(ParseError::UnsupportedScheme(scheme));
        }

        let mut base = match scheme.strip_prefix("git+") {
            Some(_) => parse_url(&parsed.as_str()["git+".len()..])?,
            None => parsed.clone(),
        };

        let mut attrs = Attrs::from([("type".to_owned(), Attr::from(INPUT_TYPE))]);
        let mut remaining = Vec::new();
        for (name, value) in parsed.query_pairs() {
            match name.as_ref() {
                "rev" | "ref" => {
                    attrs.insert(name.into_owned(), Attr::String(value.into_owned()));
                }
                "shallow" | "submodules" => {
                    attrs.insert(name.into_owned(), Attr::Bool(value == "1"));
                }
                _ => remaining.push((name.into_owned(), value.into_owned())),
            }
        }
        base.set_query(None);
        if !remaining.is_empty() {
            base.query_pairs_mut().extend_pairs(remaining);
        }
        attrs.insert("url".to_owned(), Attr::String(base.to_string()));

        Input::from_attrs(&attrs)
    }

    pub fn from_attrs(attrs: &Attrs) -> Result<Input, ParseError> {
        match get_str(attrs, "type")? {
            Some(INPUT_TYPE) => {}
            Some(other) => return Err(ParseError::UnsupportedType(other.to_owned())),
            None => return Err(ParseError::MissingAttribute("type".to_owned())),
        }

        if let Some(name) = attrs
            .keys()
            .find(|name| !ALLOWED_ATTRIBUTES.contains(&name.as_str()))
        {
            return Err(ParseError::UnsupportedAttribute(name.clone()));
        }

        let url = get_str(attrs, "url")?
            .ok_or_else(|| ParseError::MissingAttribute("url".to_owned()))?;

        let reference = get_str(attrs, "ref")?.map(str::to_owned);
        if let Some(reference) = &reference {
            if !is_valid_ref(reference) {
                return Err(ParseError::BadRef(reference.clone()));
            }
        }

        let input = Input {
            url: parse_url(url)?,
            reference,
            rev: get_str(attrs, "rev")?.map(Rev::from_str).transpose()?,
            shallow: get_bool(attrs, "shallow")?,
            submodules: get_bool(attrs, "submodules")?,
            all_refs: get_bool(attrs, "allRefs")?,
            last_modified: get_int(attrs, "lastModified")?,
            rev_count: get_int(attrs, "revCount")?,
            nar_hash: get_str(attrs, "narHash")?.map(str::to_owned),
            name: get_str(attrs, "name")?.map(str::to_owned),
        };
        input.check_rev_has_ref()?;
        Ok(input)
    }

    pub fn to_attrs(&self) -> Attrs {
        let mut attrs = Attrs::new();
        attrs.insert("type".to_owned(), Attr::from(INPUT_TYPE));
        attrs.insert("url".to_owned(), Attr::String(self.url.to_string()));
        let optional = [
            ("ref", self.reference.clone().map(Attr::String)),
            ("rev", self.rev.clone().map(|rev| Attr::String(rev.into()))),
            ("shallow", self.shallow.map(Attr::Bool)),
            ("submodules", self.submodules.map(Attr::Bool)),
            ("allRefs", self.all_refs.map(Attr::Bool)),
            ("lastModified", self.last_modified.map(Attr::Int)),
            ("revCount", self.rev_count.map(Attr::Int)),
            ("narHash", self.nar_hash.clone().map(Attr::String)),
            ("name", self.name.clone().map(Attr::String)),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                attrs.insert(name.to_owned(), value);
            }
        }
        attrs
    }

    /// Renders the input as a `git+` URL carrying `ref`, `rev` and `shallow`
    /// in the query string.
    pub fn to_url(&self) -> Result<Url, ParseError> {
        let rendered = if self.url.scheme() == INPUT_TYPE {
            self.url.to_string()
        } else {
            format!("git+{}", self.url)
        };
        let mut url = parse_url(&rendered)?;

        let mut query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
        if let Some(rev) = &self.rev {
            query.insert("rev".to_owned(), rev.to_string());
        }
        if let Some(reference) = &self.reference {
            query.insert("ref".to_owned(), reference.clone());
        }
        if self.is_shallow() {
            query.insert("shallow".to_owned(), "1".to_owned());
        }

        url.set_query(None);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Returns a copy with `reference` and/or `rev` replaced.
    pub fn apply_overrides(
        &self,
        reference: Option<&str>,
        rev: Option<&Rev>,
    ) -> Result<Input, ParseError> {
        let mut result = self.clone();
        if let Some(rev) = rev {
            result.rev = Some(rev.clone());
        }
        if let Some(reference) = reference {
            if !is_valid_ref(reference) {
                return Err(ParseError::BadRef(reference.to_owned()));
            }
            result.reference = Some(reference.to_owned());
        }
        result.check_rev_has_ref()?;
        Ok(result)
    }

    /// Whether the input is already fully resolved, i.e. fetching it again
    /// could not add information.
    pub fn has_all_info(&self) -> bool {
        let maybe_dirty = self.reference.is_none();
        self.last_modified.is_some()
            && (self.is_shallow() || maybe_dirty || self.rev_count.is_some())
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Path of a `file://` URL.
    pub fn file_path(&self) -> Option<PathBuf> {
        (self.url.scheme() == "file")
            .then(|| {
                self.url
                    .to_file_path()
                    .unwrap_or_else(|_| PathBuf::from(self.url.path()))
            })
    }

    pub fn git_ref(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn rev(&self) -> Option<&Rev> {
        self.rev.as_ref()
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_NAME)
    }

    pub fn is_shallow(&self) -> bool {
        self.shallow.unwrap_or(false)
    }

    pub fn has_submodules(&self) -> bool {
        self.submodules.unwrap_or(false)
    }

    pub fn all_refs(&self) -> bool {
        self.all_refs.unwrap_or(false)
    }

    pub fn last_modified(&self) -> Option<u64> {
        self.last_modified
    }

    pub fn rev_count(&self) -> Option<u64> {
        self.rev_count
    }

    pub fn nar_hash(&self) -> Option<&str> {
        self.nar_hash.as_deref()
    }

    pub fn with_shallow(mut self, shallow: bool) -> Self {
        self.shallow = Some(shallow);
        self
    }

    pub fn with_submodules(mut self, submodules: bool) -> Self {
        self.submodules = Some(submodules);
        self
    }

    pub fn with_all_refs(mut self, all_refs: bool) -> Self {
        self.all_refs = Some(all_refs);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub(crate) fn set_ref(&mut self, reference: String) {
        self.reference = Some(reference);
    }

    pub(crate) fn set_rev(&mut self, rev: Rev) {
        debug_assert!(self.reference.is_some());
        self.rev = Some(rev);
    }

    pub(crate) fn set_last_modified(&mut self, last_modified: u64) {
        self.last_modified = Some(last_modified);
    }

    pub(crate) fn set_rev_count(&mut self, rev_count: u64) {
        self.rev_count = Some(rev_count);
    }

    fn check_rev_has_ref(&self) -> Result<(), ParseError> {
        if self.rev.is_some() && self.reference.is_none() {
            return Err(ParseError::RevWithoutRef(self.to_string()));
        }
        Ok(())
    }
}

impl Display for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_url() {
            Ok(url) => write!(f, "{url}"),
            Err(_) => write!(f, "{}", self.url),
        }
    }
}

fn parse_url(url: &str) -> Result<Url, ParseError> {
    Url::parse(url).map_err(|source| ParseError::Url {
        url: url.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    const REV: &str = "0123456789abcdef0123456789abcdef01234567";

    fn attrs(pairs: &[(&str, Attr)]) -> Attrs {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn from_url_extracts_fetch_parameters() {
        let input = Input::from_url(&format!(
            "git+https://example.com/org/repo?ref=main&rev={REV}&shallow=1&dir=sub"
        ))
        .unwrap();

        assert_eq!(input.url().as_str(), "https://example.com/org/repo?dir=sub");
        assert_eq!(input.git_ref(), Some("main"));
        assert_eq!(input.rev().map(Rev::as_str), Some(REV));
        assert!(input.is_shallow());
        assert!(!input.has_submodules());
    }

    #[test]
    fn from_url_rejects_foreign_schemes() {
        let error = Input::from_url("https://example.com/repo").unwrap_err();
        assert!(matches!(error, ParseError::UnsupportedScheme(scheme) if scheme == "https"));
    }

    #[test]
    fn to_url_round_trips() {
        let input = Input::from_url(&format!("git+file:///srv/repo?ref=main&rev={REV}")).unwrap();
        let url = input.to_url().unwrap();
        assert_eq!(
            url.as_str(),
            format!("git+file:///srv/repo?ref=main&rev={REV}")
        );
        assert_eq!(Input::from_url(url.as_str()).unwrap(), input);
    }

    #[test]
    fn plain_git_scheme_is_kept() {
        let input = Input::from_url("git://example.com/repo").unwrap();
        assert_eq!(input.to_url().unwrap().as_str(), "git://example.com/repo");
    }

    #[test]
    fn rejects_unknown_attributes() {
        let error = Input::from_attrs(&attrs(&[
            ("type", Attr::from("git")),
            ("url", Attr::from("https://example.com/repo")),
            ("owner", Attr::from("someone")),
        ]))
        .unwrap_err();
        assert!(matches!(error, ParseError::UnsupportedAttribute(name) if name == "owner"));
    }

    #[test]
    fn rejects_rev_without_ref() {
        let error = Input::from_attrs(&attrs(&[
            ("type", Attr::from("git")),
            ("url", Attr::from("https://example.com/repo")),
            ("rev", Attr::from(REV)),
        ]))
        .unwrap_err();
        assert!(matches!(error, ParseError::RevWithoutRef(_)));
    }

    #[test]
    fn rejects_bad_refs() {
        for reference in [
            "", "@", "-/..", "a//b", ".hidden", "a/.b", "a..b", "a b", "a:b", "x.lock", "a.lock/b",
            "a@{b", "trailing/", "trailing.", "star*", "back\\slash", "tab\t",
        ] {
            assert!(!is_valid_ref(reference), "{reference:?} should be rejected");
        }
        for reference in ["main", "release/1.0", "refs/heads/main", "v1.2.3", "HEAD"] {
            assert!(is_valid_ref(reference), "{reference:?} should be accepted");
        }
    }

    #[test]
    fn rejects_short_revs() {
        let error = Input::from_url("git+https://example.com/repo?ref=main&rev=abc").unwrap_err();
        assert!(matches!(error, ParseError::BadRev(_)));
    }

    #[test]
    fn apply_overrides_enforces_ref_for_rev() {
        let input = Input::from_url("git+https://example.com/repo").unwrap();
        let rev: Rev = REV.parse().unwrap();

        assert!(matches!(
            input.apply_overrides(None, Some(&rev)),
            Err(ParseError::RevWithoutRef(_))
        ));

        let overridden = input.apply_overrides(Some("main"), Some(&rev)).unwrap();
        assert_eq!(overridden.git_ref(), Some("main"));
        assert_eq!(overridden.rev(), Some(&rev));
        assert_eq!(input.git_ref(), None);
    }

    #[test]
    fn attrs_round_trip() {
        let original = attrs(&[
            ("type", Attr::from("git")),
            ("url", Attr::from("https://example.com/repo")),
            ("ref", Attr::from("main")),
            ("rev", Attr::from(REV)),
            ("allRefs", Attr::from(true)),
            ("lastModified", Attr::from(1_700_000_000u64)),
            ("revCount", Attr::from(12u64)),
            ("name", Attr::from("src")),
        ]);
        let input = Input::from_attrs(&original).unwrap();
        assert_eq!(input.to_attrs(), original);
        assert_eq!(input.name(), "src");
    }

    #[test]
    fn has_all_info_depends_on_shallowness() {
        let mut input = Input::from_url("git+https://example.com/repo?ref=main").unwrap();
        assert!(!input.has_all_info());
        input.set_last_modified(1);
        assert!(!input.has_all_info());
        input.set_rev_count(3);
        assert!(input.has_all_info());

        let mut shallow = Input::from_url("git+https://example.com/repo?ref=main&shallow=1").unwrap();
        shallow.set_last_modified(1);
        assert!(shallow.has_all_info());
    }
}
