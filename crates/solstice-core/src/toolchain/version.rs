//! Compiler versions and pragma constraint resolution.
//!
//! Constraints follow the npm-style range grammar accepted by
//! `pragma solidity`: comparators (`=`, `>`, `>=`, `<`, `<=`, `^`, `~`),
//! partial versions (`0.8` means any `0.8.x`), hyphen ranges, AND by
//! whitespace or comma and OR by `||`. Every constraint is lowered to a
//! union of half-open intervals so that constraints of several sources can
//! be intersected into one set.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::errors::{SolsticeError, SolsticeResult};
use crate::models::Source;

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a full `major.minor.patch` version. A leading `v` and any
    /// pre-release or build suffix (`0.8.5+commit.a4f2e591`) are ignored.
    pub fn parse(text: &str) -> SolsticeResult<Self> {
        let partial = Partial::parse(text)?;
        match partial {
            Partial {
                major: Some(major),
                minor: Some(minor),
                patch: Some(patch),
            } => Ok(Self::new(major, minor, patch)),
            _ => Err(SolsticeError::InvalidConstraint(format!(
                "{text:?} is not a full version"
            ))),
        }
    }
}

impl FromStr for Version {
    type Err = SolsticeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ---------------------------------------------------------------------------
// Partial versions and comparators
// ---------------------------------------------------------------------------

/// A version with trailing wildcard components (`0.8`, `1.x`, `*`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Partial {
    major: Option<u64>,
    minor: Option<u64>,
    patch: Option<u64>,
}

impl Partial {
    fn parse(text: &str) -> SolsticeResult<Self> {
        let invalid = || SolsticeError::InvalidConstraint(format!("invalid version {text:?}"));
        let trimmed = text.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let core = trimmed
            .split(['+', '-'])
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(invalid)?;

        let mut parts = [None; 3];
        let mut wildcard = false;
        let mut count = 0;
        for (index, component) in core.split('.').enumerate() {
            if index >= 3 {
                return Err(invalid());
            }
            count += 1;
            if matches!(component, "*" | "x" | "X") {
                wildcard = true;
                continue;
            }
            if wildcard {
                // `1.x.3` is not a valid partial
                return Err(invalid());
            }
            parts[index] = Some(component.parse::<u64>().map_err(|_| invalid())?);
        }
        if count == 0 {
            return Err(invalid());
        }
        Ok(Self {
            major: parts[0],
            minor: parts[1],
            patch: parts[2],
        })
    }

    /// Lowest version matched, missing components as zero.
    fn floor(&self) -> Version {
        Version::new(
            self.major.unwrap_or(0),
            self.minor.unwrap_or(0),
            self.patch.unwrap_or(0),
        )
    }

    /// First version past everything the partial matches.
    fn ceiling(&self) -> SolsticeResult<Option<Version>> {
        let Some(major) = self.major else {
            return Ok(None);
        };
        Ok(Some(match (self.minor, self.patch) {
            (None, _) => Version::new(bump(major)?, 0, 0),
            (Some(minor), None) => Version::new(major, bump(minor)?, 0),
            (Some(minor), Some(patch)) => Version::new(major, minor, bump(patch)?),
        }))
    }

    fn is_full(&self) -> bool {
        self.patch.is_some()
    }
}

/// Next value of a version component.
fn bump(component: u64) -> SolsticeResult<u64> {
    component.checked_add(1).ok_or_else(|| {
        SolsticeError::InvalidConstraint(format!("version component {component} is out of range"))
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Exact,
    Gt,
    Ge,
    Lt,
    Le,
    Caret,
    Tilde,
}

const OPERATORS: &[(&str, Op)] = &[
    (">=", Op::Ge),
    ("<=", Op::Le),
    (">", Op::Gt),
    ("<", Op::Lt),
    ("=", Op::Exact),
    ("^", Op::Caret),
    ("~", Op::Tilde),
];

fn is_operator_only(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| matches!(c, '<' | '>' | '=' | '^' | '~'))
}

fn parse_comparator(token: &str) -> SolsticeResult<Range> {
    let (op, rest) = OPERATORS
        .iter()
        .find_map(|(prefix, op)| token.strip_prefix(prefix).map(|rest| (*op, rest)))
        .unwrap_or((Op::Exact, token));
    comparator_range(op, Partial::parse(rest)?)
}

fn comparator_range(op: Op, partial: Partial) -> SolsticeResult<Range> {
    if partial.major.is_none() {
        // `*` and friends: only `<*` excludes everything, treat the rest as any
        return Ok(match op {
            Op::Lt | Op::Gt => Range::empty(),
            _ => Range::any(),
        });
    }
    let floor = partial.floor();
    Ok(match op {
        Op::Exact if partial.is_full() => Range::between(
            Bound::inclusive(floor),
            Bound::inclusive(floor),
        ),
        Op::Exact => Range::from_bounds(
            Some(Bound::inclusive(floor)),
            partial.ceiling()?.map(Bound::exclusive),
        ),
        Op::Ge => Range::from_bounds(Some(Bound::inclusive(floor)), None),
        Op::Gt if partial.is_full() => Range::from_bounds(Some(Bound::exclusive(floor)), None),
        Op::Gt => Range::from_bounds(partial.ceiling()?.map(Bound::inclusive), None),
        Op::Lt => Range::from_bounds(None, Some(Bound::exclusive(floor))),
        Op::Le if partial.is_full() => Range::from_bounds(None, Some(Bound::inclusive(floor))),
        Op::Le => Range::from_bounds(None, partial.ceiling()?.map(Bound::exclusive)),
        Op::Caret => {
            let upper = match (partial.major, partial.minor, partial.patch) {
                (Some(major), _, _) if major > 0 => Version::new(bump(major)?, 0, 0),
                (Some(_), None, _) => Version::new(1, 0, 0),
                (Some(_), Some(minor), _) if minor > 0 => Version::new(0, bump(minor)?, 0),
                (Some(_), Some(_), None) => Version::new(0, 1, 0),
                (Some(_), Some(_), Some(patch)) => Version::new(0, 0, bump(patch)?),
                (None, _, _) => return Ok(Range::any()),
            };
            Range::from_bounds(Some(Bound::inclusive(floor)), Some(Bound::exclusive(upper)))
        }
        Op::Tilde => {
            let upper = match (partial.major, partial.minor) {
                (Some(major), None) => Version::new(bump(major)?, 0, 0),
                (Some(major), Some(minor)) => Version::new(major, bump(minor)?, 0),
                (None, _) => return Ok(Range::any()),
            };
            Range::from_bounds(Some(Bound::inclusive(floor)), Some(Bound::exclusive(upper)))
        }
    })
}

// ---------------------------------------------------------------------------
// Intervals
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Bound {
    version: Version,
    inclusive: bool,
}

impl Bound {
    fn inclusive(version: Version) -> Self {
        Self {
            version,
            inclusive: true,
        }
    }

    fn exclusive(version: Version) -> Self {
        Self {
            version,
            inclusive: false,
        }
    }
}

/// One interval; `None` on either side means unbounded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Range {
    lower: Option<Bound>,
    upper: Option<Bound>,
    empty: bool,
}

impl Range {
    fn any() -> Self {
        Self {
            lower: None,
            upper: None,
            empty: false,
        }
    }

    fn empty() -> Self {
        Self {
            lower: None,
            upper: None,
            empty: true,
        }
    }

    fn between(lower: Bound, upper: Bound) -> Self {
        Self::from_bounds(Some(lower), Some(upper))
    }

    fn from_bounds(lower: Option<Bound>, upper: Option<Bound>) -> Self {
        let mut range = Self {
            lower,
            upper,
            empty: false,
        };
        range.empty = range.has_no_versions();
        range
    }

    fn has_no_versions(&self) -> bool {
        match (self.lower, self.upper) {
            (Some(lo), Some(hi)) => match lo.version.cmp(&hi.version) {
                Ordering::Greater => true,
                Ordering::Equal => !(lo.inclusive && hi.inclusive),
                Ordering::Less => false,
            },
            _ => false,
        }
    }

    fn contains(&self, v: &Version) -> bool {
        if self.empty {
            return false;
        }
        let above = match self.lower {
            Some(b) if b.inclusive => *v >= b.version,
            Some(b) => *v > b.version,
            None => true,
        };
        let below = match self.upper {
            Some(b) if b.inclusive => *v <= b.version,
            Some(b) => *v < b.version,
            None => true,
        };
        above && below
    }

    fn intersect(&self, other: &Range) -> Range {
        if self.empty || other.empty {
            return Range::empty();
        }
        let lower = match (self.lower, other.lower) {
            (Some(a), Some(b)) => Some(match a.version.cmp(&b.version) {
                Ordering::Greater => a,
                Ordering::Less => b,
                Ordering::Equal => Bound {
                    version: a.version,
                    inclusive: a.inclusive && b.inclusive,
                },
            }),
            (a, b) => a.or(b),
        };
        let upper = match (self.upper, other.upper) {
            (Some(a), Some(b)) => Some(match a.version.cmp(&b.version) {
                Ordering::Less => a,
                Ordering::Greater => b,
                Ordering::Equal => Bound {
                    version: a.version,
                    inclusive: a.inclusive && b.inclusive,
                },
            }),
            (a, b) => a.or(b),
        };
        Range::from_bounds(lower, upper)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.empty {
            return f.write_str("<empty>");
        }
        match (self.lower, self.upper) {
            (None, None) => f.write_str("*"),
            (Some(lo), Some(hi)) if lo == hi && lo.inclusive => write!(f, "={}", lo.version),
            (lower, upper) => {
                let mut parts = Vec::new();
                if let Some(b) = lower {
                    parts.push(format!("{}{}", if b.inclusive { ">=" } else { ">" }, b.version));
                }
                if let Some(b) = upper {
                    parts.push(format!("{}{}", if b.inclusive { "<=" } else { "<" }, b.version));
                }
                f.write_str(&parts.join(" "))
            }
        }
    }
}

fn parse_conjunction(text: &str) -> SolsticeResult<Range> {
    let invalid = || SolsticeError::InvalidConstraint(format!("invalid constraint {text:?}"));
    let tokens: Vec<&str> = text
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .collect();

    let mut range = Range::any();
    let mut i = 0;
    while i < tokens.len() {
        let mut token = tokens[i].to_string();
        if is_operator_only(&token) {
            // `>= 0.8.0` with whitespace between operator and version
            i += 1;
            token.push_str(tokens.get(i).ok_or_else(invalid)?);
        }
        if tokens.get(i + 1) == Some(&"-") {
            let upper = tokens.get(i + 2).ok_or_else(invalid)?;
            let lower = comparator_range(Op::Ge, Partial::parse(&token)?)?;
            let upper = comparator_range(Op::Le, Partial::parse(upper)?)?;
            range = range.intersect(&lower).intersect(&upper);
            i += 3;
            continue;
        }
        range = range.intersect(&parse_comparator(&token)?);
        i += 1;
    }
    Ok(range)
}

// ---------------------------------------------------------------------------
// VersionReq
// ---------------------------------------------------------------------------

/// A version constraint: a union of intervals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionReq {
    ranges: Vec<Range>,
}

impl VersionReq {
    /// The constraint every version satisfies.
    pub fn any() -> Self {
        Self {
            ranges: vec![Range::any()],
        }
    }

    pub fn parse(text: &str) -> SolsticeResult<Self> {
        if text.trim().is_empty() {
            return Err(SolsticeError::InvalidConstraint("empty constraint".into()));
        }
        let mut ranges = Vec::new();
        for alternative in text.split("||") {
            let range = parse_conjunction(alternative)?;
            if !range.empty {
                ranges.push(range);
            }
        }
        Ok(Self { ranges })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.ranges.iter().any(|r| r.contains(version))
    }

    /// Constraint satisfied exactly by versions satisfying both inputs.
    pub fn intersect(&self, other: &VersionReq) -> VersionReq {
        let mut ranges = Vec::new();
        for a in &self.ranges {
            for b in &other.ranges {
                let range = a.intersect(b);
                if !range.empty && !ranges.contains(&range) {
                    ranges.push(range);
                }
            }
        }
        VersionReq { ranges }
    }

    pub fn is_unsatisfiable(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl FromStr for VersionReq {
    type Err = SolsticeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return f.write_str("<unsatisfiable>");
        }
        let rendered: Vec<String> = self.ranges.iter().map(|r| r.to_string()).collect();
        f.write_str(&rendered.join(" || "))
    }
}

// ---------------------------------------------------------------------------
// Component resolution
// ---------------------------------------------------------------------------

/// Intersect the pragmas of every member of a component and check the
/// configured compiler version against the result.
pub fn resolve_component(members: &[&Source], target: &Version) -> SolsticeResult<VersionReq> {
    let mut combined = VersionReq::any();
    for source in members {
        let pragma = source
            .pragma()
            .ok_or_else(|| SolsticeError::MissingPragma(source.path()))?;
        let req = VersionReq::parse(&pragma).map_err(|e| {
            SolsticeError::InvalidConstraint(format!("{} (in {})", e_message(&e), source.path()))
        })?;
        combined = combined.intersect(&req);
    }
    if !combined.matches(target) {
        return Err(SolsticeError::VersionMismatch {
            version: target.to_string(),
            constraint: combined.to_string(),
        });
    }
    Ok(combined)
}

fn e_message(err: &SolsticeError) -> String {
    match err {
        SolsticeError::InvalidConstraint(msg) => msg.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(text: &str) -> Version {
        Version::parse(text).unwrap()
    }

    fn req(text: &str) -> VersionReq {
        VersionReq::parse(text).unwrap()
    }

    fn source(path: &str, pragma: &str) -> Source {
        let key = crate::models::SourceKey::from_path(path);
        Source {
            dir: key.dir,
            filename: key.filename,
            mod_time: 0,
            tainted: true,
            version: pragma.split_whitespace().map(String::from).collect(),
            imports: vec![],
            ast: None,
            unit: None,
        }
    }

    #[test]
    fn version_parse_ignores_build_suffix() {
        assert_eq!(v("0.8.5+commit.a4f2e591"), Version::new(0, 8, 5));
        assert_eq!(v("v0.7.6"), Version::new(0, 7, 6));
        assert!(Version::parse("0.8").is_err());
        assert!(Version::parse("latest").is_err());
    }

    #[test]
    fn caret_on_zero_major_locks_minor() {
        let r = req("^0.8.0");
        assert!(r.matches(&v("0.8.0")));
        assert!(r.matches(&v("0.8.25")));
        assert!(!r.matches(&v("0.9.0")));
        assert!(!r.matches(&v("0.7.6")));
        assert_eq!(r.to_string(), ">=0.8.0 <0.9.0");
    }

    #[test]
    fn caret_edge_cases() {
        assert!(req("^1.2.3").matches(&v("1.9.0")));
        assert!(!req("^1.2.3").matches(&v("2.0.0")));
        assert!(req("^0.0.3").matches(&v("0.0.3")));
        assert!(!req("^0.0.3").matches(&v("0.0.4")));
        assert!(req("^0.8").matches(&v("0.8.9")));
    }

    #[test]
    fn tilde_allows_patch_updates() {
        let r = req("~0.8.1");
        assert!(r.matches(&v("0.8.9")));
        assert!(!r.matches(&v("0.8.0")));
        assert!(!r.matches(&v("0.9.0")));
    }

    #[test]
    fn conjunction_by_space_or_comma() {
        for text in [">=0.4.22 <0.6.0", ">=0.4.22, <0.6.0", ">= 0.4.22 < 0.6.0"] {
            let r = req(text);
            assert!(r.matches(&v("0.5.17")), "{text}");
            assert!(!r.matches(&v("0.6.0")), "{text}");
            assert!(!r.matches(&v("0.4.21")), "{text}");
        }
    }

    #[test]
    fn exact_and_partial_versions() {
        assert!(req("0.8.4").matches(&v("0.8.4")));
        assert!(!req("0.8.4").matches(&v("0.8.5")));
        assert!(req("=0.8.4").matches(&v("0.8.4")));
        assert!(req("0.8").matches(&v("0.8.30")));
        assert!(!req("0.8").matches(&v("0.9.0")));
        assert!(req("<=0.8").matches(&v("0.8.30")));
        assert!(!req(">0.8").matches(&v("0.8.30")));
        assert!(req(">0.8").matches(&v("0.9.0")));
    }

    #[test]
    fn disjunction_and_hyphen_range() {
        let r = req("^0.7.0 || ^0.8.0");
        assert!(r.matches(&v("0.7.6")));
        assert!(r.matches(&v("0.8.5")));
        assert!(!r.matches(&v("0.6.12")));

        let r = req("0.6.0 - 0.7");
        assert!(r.matches(&v("0.6.0")));
        assert!(r.matches(&v("0.7.6")));
        assert!(!r.matches(&v("0.8.0")));
    }

    #[test]
    fn wildcard_matches_everything() {
        assert!(req("*").matches(&v("0.4.0")));
        assert!(req("0.x").matches(&v("0.8.1")));
    }

    #[test]
    fn invalid_constraints_are_rejected() {
        assert!(VersionReq::parse("").is_err());
        assert!(VersionReq::parse(">=").is_err());
        assert!(VersionReq::parse("^abc").is_err());
        assert!(VersionReq::parse("1.x.3").is_err());
    }

    #[test]
    fn overflowing_components_are_rejected() {
        let max = u64::MAX;
        for text in [
            format!("^{max}.0.0"),
            format!("~0.{max}.0"),
            format!("^0.0.{max}"),
            format!("<={max}"),
            format!("{max}"),
        ] {
            assert!(
                matches!(VersionReq::parse(&text), Err(SolsticeError::InvalidConstraint(_))),
                "{text}"
            );
        }
        assert!(req(&format!(">={max}")).matches(&Version::new(max, 0, 0)));
        assert!(req(&format!("={max}.{max}.{max}")).matches(&Version::new(max, max, max)));
    }

    #[test]
    fn intersection_narrows_range() {
        let combined = req(">=0.6.0").intersect(&req("<0.8.0")).intersect(&req("^0.7.0"));
        assert_eq!(combined.to_string(), ">=0.7.0 <0.8.0");
        assert!(combined.matches(&v("0.7.6")));
    }

    #[test]
    fn disjoint_intersection_is_unsatisfiable() {
        let combined = req("^0.4.0").intersect(&req("^0.8.0"));
        assert!(combined.is_unsatisfiable());
        assert_eq!(combined.to_string(), "<unsatisfiable>");
    }

    #[test]
    fn component_with_matching_pragmas_resolves() {
        let a = source("contracts/a.sol", "^0.8.0");
        let b = source("contracts/b.sol", "^0.8.0");
        let combined = resolve_component(&[&a, &b], &v("0.8.5")).unwrap();
        assert!(combined.matches(&v("0.8.5")));
    }

    #[test]
    fn component_with_old_pragma_mismatches() {
        let c = source("contracts/c.sol", "^0.4.0");
        let err = resolve_component(&[&c], &v("0.8.5")).unwrap_err();
        match err {
            SolsticeError::VersionMismatch {
                version,
                constraint,
            } => {
                assert_eq!(version, "0.8.5");
                assert_eq!(constraint, ">=0.4.0 <0.5.0");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn component_without_pragma_fails() {
        let d = source("contracts/d.sol", "");
        let err = resolve_component(&[&d], &v("0.8.5")).unwrap_err();
        assert!(matches!(err, SolsticeError::MissingPragma(p) if p == "contracts/d.sol"));
    }

    #[test]
    fn invalid_pragma_names_file() {
        let e = source("contracts/e.sol", "^zero");
        let err = resolve_component(&[&e], &v("0.8.5")).unwrap_err();
        assert!(matches!(err, SolsticeError::InvalidConstraint(msg) if msg.contains("contracts/e.sol")));
    }
}
