use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel used by OSV for "introduced at the beginning of history".
const OSV_INTRODUCED_ZERO: &str = "0";

/// A reported vulnerability, as fetched from the vulnerability source.
///
/// Records are immutable once fetched; every pipeline stage reads from them
/// without modifying them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityRecord {
    /// The record identifier (e.g. `OSV-2021-1361`).
    pub id: String,
    pub aliases: Vec<String>,
    /// Name of the affected OSS-Fuzz project.
    pub project: String,
    /// Git repository the introduced/fixed commits belong to.
    pub repository: Option<String>,
    pub introduced: Option<String>,
    pub fixed: Option<String>,
    pub severity: Option<String>,
    /// Free-text crash description as published with the record.
    pub details: String,
    /// Structured fields recovered from `details` and database-specific data.
    pub issue: IssueReport,
}

/// Fields of an OSS-Fuzz issue report.
///
/// Every field is optional: upstream text is parsed best-effort and its format
/// is not assumed to be stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueReport {
    pub project: Option<String>,
    pub fuzzing_engine: Option<String>,
    pub fuzz_target: Option<String>,
    pub job_type: Option<String>,
    pub platform_id: Option<String>,
    pub sanitizer: Option<String>,
    pub severity: Option<String>,
    pub testcase_id: Option<String>,
    pub regressed_url: Option<String>,
    pub fixed_url: Option<String>,
    pub crash_type: Option<String>,
    pub crash_address: Option<String>,
    pub crash_state: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Project,
    FuzzingEngine,
    FuzzTarget,
    JobType,
    PlatformId,
    Sanitizer,
    Severity,
    Testcase,
    Regressed,
    Fixed,
    CrashType,
    CrashAddress,
    CrashState,
    Ignored,
}

impl Field {
    fn from_key(key: &str) -> Self {
        match key {
            "project" => Field::Project,
            "fuzzing_engine" => Field::FuzzingEngine,
            "fuzz_target" | "fuzzer_binary" => Field::FuzzTarget,
            "job_type" => Field::JobType,
            "platform_id" => Field::PlatformId,
            "sanitizer" => Field::Sanitizer,
            "severity" | "recommended_security_severity" => Field::Severity,
            "reproducer_testcase" | "testcase" | "testcase_url" | "testcase_id" => Field::Testcase,
            "regressed" | "regressed_url" => Field::Regressed,
            "fixed" | "fixed_url" => Field::Fixed,
            "crash_type" => Field::CrashType,
            "crash_address" => Field::CrashAddress,
            "crash_state" => Field::CrashState,
            _ => Field::Ignored,
        }
    }
}

/// Splits `Key Name: value` into a normalized key (`key_name`) and the value.
///
/// Lines such as URLs or C++ symbols (`Foo::bar`) are not fields.
fn split_field(line: &str) -> Option<(String, &str)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphabetic() || c == ' ') {
        return None;
    }
    if !(value.is_empty() || value.starts_with(' ')) {
        return None;
    }
    Some((key.to_ascii_lowercase().replace(' ', "_"), value.trim()))
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Extracts a testcase identifier from a ClusterFuzz download URL or a bare id.
fn testcase_id_from(value: &str) -> Option<String> {
    if let Some((_, rest)) = value.split_once("testcase_id=") {
        let id: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect();
        return non_empty(&id);
    }
    let last = value.trim_end_matches('/').rsplit('/').next()?;
    non_empty(last)
}

impl IssueReport {
    /// Parses the text of an OSS-Fuzz report.
    ///
    /// Unknown lines are ignored. `Crash State:` is followed by one frame per
    /// line (indented or not) until a blank line or the next field; indented
    /// lines after `Crash Type:` continue the crash type.
    pub fn parse(text: &str) -> Self {
        let mut report = IssueReport::default();
        let mut current = Field::Ignored;

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.starts_with("```") {
                continue;
            }
            if line.is_empty() {
                current = Field::Ignored;
                continue;
            }

            if let Some((key, value)) = split_field(line) {
                let field = Field::from_key(&key);
                if field != Field::Ignored {
                    current = field;
                    report.set(field, value);
                    continue;
                }
            }

            match current {
                Field::CrashState => report.crash_state.push(line.to_string()),
                Field::CrashType => {
                    let joined = match report.crash_type.take() {
                        Some(existing) => format!("{existing} {line}"),
                        None => line.to_string(),
                    };
                    report.crash_type = Some(joined);
                }
                _ => current = Field::Ignored,
            }
        }
        report
    }

    fn set(&mut self, field: Field, value: &str) {
        match field {
            Field::Project => self.project = non_empty(value),
            Field::FuzzingEngine => self.fuzzing_engine = non_empty(value),
            Field::FuzzTarget => self.fuzz_target = non_empty(value),
            Field::JobType => self.job_type = non_empty(value),
            Field::PlatformId => self.platform_id = non_empty(value),
            Field::Sanitizer => self.sanitizer = non_empty(value),
            Field::Severity => self.severity = non_empty(value),
            Field::Testcase => self.testcase_id = testcase_id_from(value),
            Field::Regressed => self.regressed_url = non_empty(value),
            Field::Fixed => self.fixed_url = non_empty(value),
            Field::CrashType => self.crash_type = non_empty(value),
            Field::CrashAddress => self.crash_address = non_empty(value),
            Field::CrashState => {
                self.crash_state.clear();
                if let Some(first) = non_empty(value) {
                    self.crash_state.push(first);
                }
            }
            Field::Ignored => {}
        }
    }

    /// Fills fields still missing from string entries of a JSON object, e.g.
    /// an OSV `database_specific` block.
    fn fill_from_json(&mut self, value: &Value) {
        let Some(map) = value.as_object() else {
            return;
        };
        for (key, entry) in map {
            let field = Field::from_key(&key.to_ascii_lowercase());
            match (field, entry) {
                (Field::CrashState, Value::Array(frames)) if self.crash_state.is_empty() => {
                    self.crash_state = frames
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect();
                }
                (field, Value::String(s)) if field != Field::Ignored && self.is_unset(field) => {
                    self.set(field, s);
                }
                _ => {}
            }
        }
    }

    fn is_unset(&self, field: Field) -> bool {
        match field {
            Field::Project => self.project.is_none(),
            Field::FuzzingEngine => self.fuzzing_engine.is_none(),
            Field::FuzzTarget => self.fuzz_target.is_none(),
            Field::JobType => self.job_type.is_none(),
            Field::PlatformId => self.platform_id.is_none(),
            Field::Sanitizer => self.sanitizer.is_none(),
            Field::Severity => self.severity.is_none(),
            Field::Testcase => self.testcase_id.is_none(),
            Field::Regressed => self.regressed_url.is_none(),
            Field::Fixed => self.fixed_url.is_none(),
            Field::CrashType => self.crash_type.is_none(),
            Field::CrashAddress => self.crash_address.is_none(),
            Field::CrashState => self.crash_state.is_empty(),
            Field::Ignored => false,
        }
    }
}

#[derive(Deserialize, Debug)]
struct OsvDocument {
    id: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    details: String,
    #[serde(default)]
    affected: Vec<OsvAffected>,
    #[serde(default)]
    database_specific: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct OsvAffected {
    #[serde(default)]
    package: Option<OsvPackage>,
    #[serde(default)]
    ranges: Vec<OsvRange>,
    #[serde(default)]
    ecosystem_specific: Option<Value>,
    #[serde(default)]
    database_specific: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct OsvPackage {
    name: String,
}

#[derive(Deserialize, Debug)]
struct OsvRange {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    repo: Option<String>,
    #[serde(default)]
    events: Vec<OsvEvent>,
}

#[derive(Deserialize, Debug)]
struct OsvEvent {
    #[serde(default)]
    introduced: Option<String>,
    #[serde(default)]
    fixed: Option<String>,
}

struct GitRange {
    repository: Option<String>,
    introduced: Option<String>,
    fixed: Option<String>,
}

/// Picks the first git range carrying both ends; otherwise the most complete
/// one so the resolver can report what is missing.
fn select_git_range(affected: &[OsvAffected]) -> Option<GitRange> {
    let mut best: Option<GitRange> = None;
    for range in affected
        .iter()
        .flat_map(|a| a.ranges.iter())
        .filter(|r| r.kind.eq_ignore_ascii_case("git"))
    {
        let introduced = range
            .events
            .iter()
            .filter_map(|e| e.introduced.as_deref())
            .find(|v| *v != OSV_INTRODUCED_ZERO)
            .map(str::to_string);
        let fixed = range.events.iter().find_map(|e| e.fixed.clone());
        let candidate = GitRange {
            repository: range.repo.clone(),
            introduced,
            fixed,
        };
        if candidate.introduced.is_some() && candidate.fixed.is_some() {
            return Some(candidate);
        }
        let score = |r: &GitRange| r.introduced.is_some() as u8 + r.fixed.is_some() as u8;
        if best.as_ref().is_none_or(|b| score(&candidate) > score(b)) {
            best = Some(candidate);
        }
    }
    best
}

impl VulnerabilityRecord {
    /// Builds a record from an OSV JSON document.
    pub fn from_osv_json(json: &str) -> Result<Self, serde_json::Error> {
        let doc: OsvDocument = serde_json::from_str(json)?;

        let mut issue = IssueReport::parse(&doc.details);
        for affected in &doc.affected {
            for extra in [&affected.database_specific, &affected.ecosystem_specific]
                .into_iter()
                .flatten()
            {
                issue.fill_from_json(extra);
            }
        }
        if let Some(extra) = &doc.database_specific {
            issue.fill_from_json(extra);
        }

        let project = doc
            .affected
            .iter()
            .find_map(|a| a.package.as_ref().map(|p| p.name.clone()))
            .or_else(|| issue.project.clone())
            .unwrap_or_default();

        let severity = doc
            .affected
            .iter()
            .filter_map(|a| a.ecosystem_specific.as_ref())
            .find_map(|v| v.get("severity").and_then(Value::as_str).map(str::to_string))
            .or_else(|| issue.severity.clone());

        let range = select_git_range(&doc.affected);
        let (repository, introduced, fixed) = match range {
            Some(r) => (r.repository, r.introduced, r.fixed),
            None => (None, None, None),
        };

        Ok(VulnerabilityRecord {
            id: doc.id,
            aliases: doc.aliases,
            project,
            repository,
            introduced,
            fixed,
            severity,
            details: doc.details,
            issue,
        })
    }
}
