//! Version parsing, comparison, and range matching for feature pack builds.
//!
//! Two independent total orders live here:
//! - [`Version`] ranks builds the way release streams publish them: numeric
//!   segments compare as numbers and a trailing qualifier ranks on the fixed
//!   scale `alpha < beta < milestone < rc < snapshot < "" (final) < sp`,
//!   where the snapshot of a version sorts immediately below that version.
//! - [`CoreVersion`] is the simpler epoch-aware comparator used only to gate
//!   the minimum engine version a feature pack requires.

use std::cmp::Ordering;
use std::fmt;

use caravel_util::errors::{CaravelError, CaravelResult};

/// A parsed build version with comparable segments.
#[derive(Debug, Clone)]
pub struct Version {
    pub original: String,
    segments: Vec<Segment>,
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

#[derive(Debug, Clone, Eq, PartialEq)]
enum Segment {
    Numeric(u64),
    Qualifier(Qualifier),
    Text(String),
}

/// Well-known release qualifiers with defined ordering.
///
/// A version without a qualifier ranks as [`Qualifier::Final`]; `ga` and
/// `final` are the same rank. The enum doubles as the "qualifier floor" used
/// when selecting the latest build on a channel: a candidate qualifies iff
/// its qualifier is at or above the floor.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum Qualifier {
    Alpha,
    Beta,
    Milestone,
    Rc,
    Snapshot,
    Final,
    Sp,
}

impl Qualifier {
    /// Map a channel frequency name to its qualifier floor.
    ///
    /// An absent frequency means "final": snapshots and pre-releases are
    /// rejected.
    pub fn from_frequency(frequency: Option<&str>) -> CaravelResult<Qualifier> {
        let Some(freq) = frequency else {
            return Ok(Qualifier::Final);
        };
        match freq.to_lowercase().as_str() {
            "alpha" => Ok(Qualifier::Alpha),
            "beta" => Ok(Qualifier::Beta),
            "milestone" => Ok(Qualifier::Milestone),
            "rc" | "cr" => Ok(Qualifier::Rc),
            "snapshot" => Ok(Qualifier::Snapshot),
            "final" | "ga" => Ok(Qualifier::Final),
            other => Err(CaravelError::Config {
                message: format!("unknown frequency `{other}`"),
            }
            .into()),
        }
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Qualifier::Alpha => "alpha",
            Qualifier::Beta => "beta",
            Qualifier::Milestone => "milestone",
            Qualifier::Rc => "rc",
            Qualifier::Snapshot => "snapshot",
            Qualifier::Final => "final",
            Qualifier::Sp => "sp",
        };
        f.write_str(s)
    }
}

impl Version {
    pub fn parse(version: &str) -> Self {
        Self {
            original: version.to_string(),
            segments: parse_segments(version),
        }
    }

    /// The effective qualifier: the classification of the trailing segment,
    /// or `Final` when the version ends in a number.
    pub fn qualifier(&self) -> Qualifier {
        match self.segments.last() {
            Some(Segment::Qualifier(q)) => *q,
            Some(Segment::Text(_)) => Qualifier::Alpha,
            _ => Qualifier::Final,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.qualifier() == Qualifier::Snapshot
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let max_len = self.segments.len().max(other.segments.len());
        for i in 0..max_len {
            let ord = compare_segments(self.segments.get(i), other.segments.get(i));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn compare_segments(a: Option<&Segment>, b: Option<&Segment>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (Some(s), None) => compare_segment_to_empty(s),
        (None, Some(s)) => compare_segment_to_empty(s).reverse(),
        (Some(a), Some(b)) => compare_two_segments(a, b),
    }
}

fn compare_segment_to_empty(seg: &Segment) -> Ordering {
    match seg {
        Segment::Numeric(0) => Ordering::Equal,
        Segment::Numeric(_) => Ordering::Greater,
        Segment::Qualifier(q) => q.cmp(&Qualifier::Final),
        Segment::Text(s) if s.is_empty() => Ordering::Equal,
        Segment::Text(_) => Ordering::Less,
    }
}

fn compare_two_segments(a: &Segment, b: &Segment) -> Ordering {
    match (a, b) {
        (Segment::Numeric(a), Segment::Numeric(b)) => a.cmp(b),
        (Segment::Qualifier(a), Segment::Qualifier(b)) => a.cmp(b),
        (Segment::Numeric(_), Segment::Qualifier(_)) => Ordering::Greater,
        (Segment::Qualifier(_), Segment::Numeric(_)) => Ordering::Less,
        (Segment::Numeric(_), Segment::Text(_)) => Ordering::Greater,
        (Segment::Text(_), Segment::Numeric(_)) => Ordering::Less,
        (Segment::Text(a), Segment::Text(b)) => a.to_lowercase().cmp(&b.to_lowercase()),
        (Segment::Qualifier(q), Segment::Text(_)) => {
            if *q >= Qualifier::Final {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (Segment::Text(_), Segment::Qualifier(q)) => {
            if *q >= Qualifier::Final {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
    }
}

fn parse_segments(version: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current = String::new();

    for ch in version.chars() {
        if ch == '.' || ch == '-' {
            if !current.is_empty() {
                segments.push(classify(&current));
                current.clear();
            }
        } else {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        segments.push(classify(&current));
    }

    segments
}

fn classify(token: &str) -> Segment {
    if let Ok(n) = token.parse::<u64>() {
        return Segment::Numeric(n);
    }
    // `Alpha2`, `rc1` etc. classify by their qualifier word.
    let word = token.trim_end_matches(|c: char| c.is_ascii_digit());
    match word.to_lowercase().as_str() {
        "alpha" | "a" => Segment::Qualifier(Qualifier::Alpha),
        "beta" | "b" => Segment::Qualifier(Qualifier::Beta),
        "milestone" | "m" => Segment::Qualifier(Qualifier::Milestone),
        "rc" | "cr" => Segment::Qualifier(Qualifier::Rc),
        "snapshot" => Segment::Qualifier(Qualifier::Snapshot),
        "" | "ga" | "final" | "release" => Segment::Qualifier(Qualifier::Final),
        "sp" => Segment::Qualifier(Qualifier::Sp),
        _ => Segment::Text(token.to_string()),
    }
}

/// The epoch-aware comparator used for the minimum-engine-version gate.
///
/// An optional `epoch:` numeric prefix dominates the comparison; the
/// remainder is split into alternating digit runs and literal runs, digit
/// runs comparing numerically and literal runs lexicographically.
#[derive(Debug, Clone)]
pub struct CoreVersion {
    pub original: String,
    epoch: u64,
    runs: Vec<Run>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum Run {
    Digits(String),
    Literal(String),
}

impl CoreVersion {
    pub fn parse(version: &str) -> Self {
        let (epoch, rest) = match version.split_once(':') {
            Some((e, rest)) if e.chars().all(|c| c.is_ascii_digit()) && !e.is_empty() => {
                (e.parse().unwrap_or(0), rest)
            }
            _ => (0, version),
        };

        let mut runs = Vec::new();
        let mut current = String::new();
        let mut current_digits = false;
        for ch in rest.chars() {
            let digit = ch.is_ascii_digit();
            if !current.is_empty() && digit != current_digits {
                runs.push(finish_run(&current, current_digits));
                current.clear();
            }
            current_digits = digit;
            current.push(ch);
        }
        if !current.is_empty() {
            runs.push(finish_run(&current, current_digits));
        }

        Self {
            original: version.to_string(),
            epoch,
            runs,
        }
    }
}

fn finish_run(text: &str, digits: bool) -> Run {
    if digits {
        Run::Digits(text.to_string())
    } else {
        Run::Literal(text.to_string())
    }
}

impl fmt::Display for CoreVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl PartialEq for CoreVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CoreVersion {}

impl Ord for CoreVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.epoch != other.epoch {
            return self.epoch.cmp(&other.epoch);
        }
        let max_len = self.runs.len().max(other.runs.len());
        for i in 0..max_len {
            let ord = match (self.runs.get(i), other.runs.get(i)) {
                (None, None) => Ordering::Equal,
                // A missing trailing run sorts below a present one.
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (Some(a), Some(b)) => compare_runs(a, b),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for CoreVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn compare_runs(a: &Run, b: &Run) -> Ordering {
    match (a, b) {
        (Run::Digits(a), Run::Digits(b)) => {
            let a = a.trim_start_matches('0');
            let b = b.trim_start_matches('0');
            a.len().cmp(&b.len()).then_with(|| a.cmp(b))
        }
        (Run::Literal(a), Run::Literal(b)) => a.cmp(b),
        // Digit runs outrank literal runs when the shapes diverge.
        (Run::Digits(_), Run::Literal(_)) => Ordering::Greater,
        (Run::Literal(_), Run::Digits(_)) => Ordering::Less,
    }
}

/// A version range: the union of one or more restrictions.
///
/// Parses the bracket grammar including unions and the exact form:
/// `[1.0,2.0)`, `[1.0,]`, `(,2.0)`, `[1.5]`, `[1.0,2.0),[3.0,)`.
#[derive(Debug, Clone)]
pub struct VersionRange {
    pub original: String,
    restrictions: Vec<Restriction>,
}

/// One contiguous interval with optionally unbounded, open or closed ends.
#[derive(Debug, Clone)]
pub struct Restriction {
    pub lower: Option<Bound>,
    pub upper: Option<Bound>,
}

#[derive(Debug, Clone)]
pub struct Bound {
    pub version: Version,
    pub inclusive: bool,
}

/// Outcome of a "latest version honoring a floor" query.
#[derive(Debug, Clone)]
pub struct LatestInRange {
    /// Highest qualifying member, if any.
    pub version: Option<Version>,
    /// True when members of the range exist but all sit below the floor.
    pub below_floor: bool,
}

impl VersionRange {
    /// Range accepting every version: `[0,)` semantics, rendered as `(,)`.
    pub fn any() -> Self {
        Self {
            original: "(,)".to_string(),
            restrictions: vec![Restriction {
                lower: None,
                upper: None,
            }],
        }
    }

    pub fn parse(spec: &str) -> CaravelResult<Self> {
        let text = spec.trim();
        let mut restrictions = Vec::new();
        let mut rest = text;

        while !rest.is_empty() {
            let open = rest.chars().next().unwrap();
            if open != '[' && open != '(' {
                return Err(malformed(text, "restriction must start with `[` or `(`"));
            }
            let close_at = rest
                .find([']', ')'])
                .ok_or_else(|| malformed(text, "unterminated restriction"))?;
            let close = rest.as_bytes()[close_at] as char;
            let inner = &rest[1..close_at];

            restrictions.push(parse_restriction(text, inner, open == '[', close == ']')?);

            rest = &rest[close_at + 1..];
            if let Some(stripped) = rest.strip_prefix(',') {
                rest = stripped.trim_start();
                if rest.is_empty() {
                    return Err(malformed(text, "trailing `,`"));
                }
            } else if !rest.is_empty() {
                return Err(malformed(text, "expected `,` between restrictions"));
            }
        }

        if restrictions.is_empty() {
            return Err(malformed(text, "empty range"));
        }

        Ok(Self {
            original: text.to_string(),
            restrictions,
        })
    }

    /// Union membership across all restrictions.
    pub fn contains(&self, version: &Version) -> bool {
        self.restrictions.iter().any(|r| r.contains(version))
    }

    /// Highest member of `candidates` inside the range whose qualifier is at
    /// or above `floor`; reports whether candidates in range existed below
    /// the floor, so callers can distinguish "range empty" from "floor too
    /// high".
    pub fn latest<'a, I>(&self, candidates: I, floor: Qualifier) -> LatestInRange
    where
        I: IntoIterator<Item = &'a Version>,
    {
        let mut best: Option<&Version> = None;
        let mut below_floor = false;
        for v in candidates {
            if !self.contains(v) {
                continue;
            }
            if v.qualifier() < floor {
                below_floor = true;
                continue;
            }
            if best.map_or(true, |b| v > b) {
                best = Some(v);
            }
        }
        LatestInRange {
            version: best.cloned(),
            below_floor: below_floor && best.is_none(),
        }
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl Restriction {
    pub fn contains(&self, version: &Version) -> bool {
        if let Some(ref lower) = self.lower {
            let cmp = version.cmp(&lower.version);
            if lower.inclusive {
                if cmp == Ordering::Less {
                    return false;
                }
            } else if cmp != Ordering::Greater {
                return false;
            }
        }
        if let Some(ref upper) = self.upper {
            let cmp = version.cmp(&upper.version);
            if upper.inclusive {
                if cmp == Ordering::Greater {
                    return false;
                }
            } else if cmp != Ordering::Less {
                return false;
            }
        }
        true
    }
}

fn parse_restriction(
    range: &str,
    inner: &str,
    open_inclusive: bool,
    close_inclusive: bool,
) -> CaravelResult<Restriction> {
    if let Some((lower, upper)) = inner.split_once(',') {
        let lower = lower.trim();
        let upper = upper.trim();
        Ok(Restriction {
            lower: (!lower.is_empty()).then(|| Bound {
                version: Version::parse(lower),
                inclusive: open_inclusive,
            }),
            upper: (!upper.is_empty()).then(|| Bound {
                version: Version::parse(upper),
                inclusive: close_inclusive,
            }),
        })
    } else {
        // Exact version: [1.5] means exactly 1.5.
        if !open_inclusive || !close_inclusive {
            return Err(malformed(range, "exact restriction must be `[version]`"));
        }
        if inner.trim().is_empty() {
            return Err(malformed(range, "empty restriction"));
        }
        let v = Version::parse(inner.trim());
        Ok(Restriction {
            lower: Some(Bound {
                version: v.clone(),
                inclusive: true,
            }),
            upper: Some(Bound {
                version: v,
                inclusive: true,
            }),
        })
    }
}

fn malformed(text: &str, reason: &str) -> miette::Report {
    CaravelError::MalformedRange {
        text: text.to_string(),
        reason: reason.to_string(),
    }
    .into()
}
