use crate::record::IssueReport;
use crate::resolver::normalize_sanitizer;
use crate::signature::{Access, CrashKind, CrashSignature, is_runtime_frame, normalize_symbol};
use thiserror::Error;

/// Depth of an OSS-Fuzz crash state.
pub const DEFAULT_FRAME_DEPTH: usize = 3;

/// How many lines after the fatal marker may carry the access description.
const ACCESS_LOOKAHEAD: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Nothing recognizable as a crash report; lowers confidence, never fatal.
    #[error("Unparsable crash output: {0}")]
    Unparsable(String),
}

struct FatalMarker<'a> {
    index: usize,
    sanitizer: Option<String>,
    description: &'a str,
}

fn sanitizer_short_name(tool: &str) -> String {
    match tool {
        "AddressSanitizer" => "address".to_string(),
        "MemorySanitizer" => "memory".to_string(),
        "UndefinedBehaviorSanitizer" => "undefined".to_string(),
        "ThreadSanitizer" => "thread".to_string(),
        "HWAddressSanitizer" => "hwaddress".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

/// Finds the first `==PID==ERROR: Tool: description` or `runtime error:` line.
fn find_fatal_marker<'a>(lines: &[&'a str]) -> Option<FatalMarker<'a>> {
    lines.iter().enumerate().find_map(|(index, raw)| {
        let line = raw.trim();
        if line.starts_with("==") {
            let (_, after) = line.split_once("ERROR:")?;
            let after = after.trim();
            return Some(match after.split_once(": ") {
                Some((tool, description)) => FatalMarker {
                    index,
                    sanitizer: Some(sanitizer_short_name(tool.trim())),
                    description: description.trim(),
                },
                None => FatalMarker {
                    index,
                    sanitizer: None,
                    description: after,
                },
            });
        }
        let (_, description) = line.split_once("runtime error:")?;
        Some(FatalMarker {
            index,
            sanitizer: Some("undefined".to_string()),
            description: description.trim(),
        })
    })
}

/// `heap-buffer-overflow on address 0x..` -> `heap-buffer-overflow`.
fn class_from_description(description: &str) -> &str {
    let mut end = description.len();
    for stop in [" on address", " on unknown address", " at pc", ":", " (pc "] {
        if let Some(pos) = description.find(stop) {
            end = end.min(pos);
        }
    }
    description[..end].trim()
}

/// OSS-Fuzz crash types for UBSan `runtime error:` descriptions, most
/// specific first.
const UBSAN_CLASSES: &[(&str, &str)] = &[
    ("unsigned integer overflow", "Unsigned-integer-overflow"),
    ("signed integer overflow", "Integer-overflow"),
    ("negation of", "Integer-overflow"),
    ("out of bounds for type", "Index-out-of-bounds"),
    ("division by zero", "Divide-by-zero"),
    ("misaligned address", "Misaligned-address"),
    ("shift exponent", "Invalid-shift"),
    ("left shift of", "Invalid-shift"),
    ("not a valid value for type 'bool'", "Invalid-bool-value"),
    ("not a valid value for type", "Invalid-enum-value"),
    ("null pointer passed as argument", "Invalid-null-argument"),
    ("null pointer returned", "Invalid-null-return"),
    ("offset to null pointer", "Pointer-overflow"),
    ("null pointer", "Null-dereference"),
    ("pointer index expression", "Pointer-overflow"),
    ("applying non-zero offset", "Pointer-overflow"),
    ("downcast of", "Bad-cast"),
    ("upcast of", "Bad-cast"),
    ("dynamic type", "Bad-cast"),
    ("through pointer to incorrect function type", "Incorrect-function-pointer-type"),
    ("outside the range of representable values", "Float-cast-overflow"),
    ("variable length array bound", "Non-positive-vla-bound-value"),
    ("implicit conversion", "Implicit-conversion"),
    ("unreachable program point", "Unreachable-code"),
    ("object size", "Object-size"),
];

/// Maps a UBSan description to its OSS-Fuzz crash type. Unknown descriptions
/// keep their wording with operand values and quoted types removed.
fn ubsan_class(description: &str) -> String {
    if let Some((_, class)) = UBSAN_CLASSES
        .iter()
        .find(|(needle, _)| description.contains(needle))
    {
        return class.to_string();
    }
    let mut words = Vec::new();
    let mut in_quote = false;
    for word in description.split_whitespace() {
        let quotes = word.matches('\'').count();
        let quoted = in_quote || quotes > 0;
        if quotes % 2 == 1 {
            in_quote = !in_quote;
        }
        if quoted || word.chars().any(|c| c.is_ascii_digit()) {
            continue;
        }
        words.push(word.trim_end_matches(',').trim_end_matches('.'));
    }
    words.join(" ")
}

/// Reads `WRITE of size 1 at ..` or `The signal is caused by a READ memory access.`
fn access_from_line(line: &str) -> Option<(Access, Option<u64>)> {
    let words: Vec<&str> = line.split_whitespace().collect();
    words.iter().enumerate().find_map(|(i, word)| {
        let access = Access::from_token(word.trim_end_matches('.'))?;
        match words.get(i + 1..i + 4) {
            Some([of, size_kw, size]) if *of == "of" && *size_kw == "size" => {
                Some((access, size.parse().ok()))
            }
            _ if words.get(i + 1) == Some(&"memory") => Some((access, None)),
            _ => None,
        }
    })
}

/// Splits the part of a frame line after ` in ` into symbol and location.
///
/// The symbol ends at the first whitespace outside parentheses and angle
/// brackets, so demangled argument lists stay attached to it.
fn split_frame(rest: &str) -> (&str, &str) {
    let mut depth = 0usize;
    for (i, c) in rest.char_indices() {
        match c {
            '(' | '<' => depth += 1,
            ')' | '>' => depth = depth.saturating_sub(1),
            c if c.is_whitespace() && depth == 0 => {
                return (&rest[..i], rest[i..].trim());
            }
            _ => {}
        }
    }
    (rest, "")
}

/// Frame lines of the first stack trace after `start`.
fn first_stack_trace<'a>(lines: &[&'a str], start: usize) -> Vec<&'a str> {
    let mut frames = Vec::new();
    for raw in lines.iter().skip(start) {
        let line = raw.trim();
        if line.starts_with("SUMMARY:") {
            break;
        }
        if line.starts_with('#') {
            frames.push(line);
        } else if !frames.is_empty() && !line.starts_with("DEDUP_TOKEN:") {
            break;
        }
    }
    frames
}

/// Extracts canonical crash signatures from sanitizer output and OSS-Fuzz
/// reports, and compares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashVerifier {
    frame_depth: usize,
}

impl Default for CrashVerifier {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_DEPTH)
    }
}

impl CrashVerifier {
    pub fn new(frame_depth: usize) -> Self {
        Self {
            frame_depth: frame_depth.max(1),
        }
    }

    pub fn frame_depth(&self) -> usize {
        self.frame_depth
    }

    /// Parses captured run output into a signature.
    ///
    /// Runtime frames are dropped before the top `frame_depth` frames are
    /// kept. Output with no fatal-error marker is
    /// [`SignatureError::Unparsable`].
    pub fn extract(&self, output: &str) -> Result<CrashSignature, SignatureError> {
        let lines: Vec<&str> = output.lines().collect();
        let marker = find_fatal_marker(&lines).ok_or_else(|| {
            SignatureError::Unparsable("no sanitizer error marker in output".to_string())
        })?;

        let class = match marker.sanitizer.as_deref() {
            Some("undefined") => ubsan_class(class_from_description(marker.description)),
            _ => class_from_description(marker.description).to_string(),
        };
        if class.is_empty() {
            return Err(SignatureError::Unparsable(format!(
                "empty crash description on line {}",
                marker.index + 1
            )));
        }
        let mut kind = CrashKind::new(&class);
        if let Some((access, size)) = lines
            .iter()
            .skip(marker.index + 1)
            .take(ACCESS_LOOKAHEAD)
            .find_map(|line| access_from_line(line))
        {
            kind = kind.with_access(access);
            if let Some(size) = size {
                kind = kind.with_size(size);
            }
        }

        let frames: Vec<String> = first_stack_trace(&lines, marker.index + 1)
            .into_iter()
            .filter_map(|line| line.split_once(" in ").map(|(_, rest)| split_frame(rest)))
            .filter(|(symbol, location)| !is_runtime_frame(symbol, location))
            .map(|(symbol, _)| normalize_symbol(symbol))
            .filter(|symbol| !symbol.is_empty())
            .take(self.frame_depth)
            .collect();

        tracing::debug!(
            kind = %kind,
            frames = frames.len(),
            "Extracted crash signature"
        );
        Ok(CrashSignature::new(kind, frames, marker.sanitizer))
    }

    /// Builds the expected signature from an OSS-Fuzz report.
    ///
    /// `Crash Type: Heap-buffer-overflow WRITE 1` gives the kind and the
    /// `Crash State` lines give the frames.
    pub fn expected_from_report(
        &self,
        report: &IssueReport,
    ) -> Result<CrashSignature, SignatureError> {
        let crash_type = report
            .crash_type
            .as_deref()
            .ok_or_else(|| SignatureError::Unparsable("report has no crash type".to_string()))?;
        let mut tokens = crash_type.split_whitespace();
        let class = tokens
            .next()
            .ok_or_else(|| SignatureError::Unparsable("crash type is empty".to_string()))?;
        let mut kind = CrashKind::new(class);
        let mut rest = tokens.peekable();
        while let Some(token) = rest.next() {
            if let Some(access) = Access::from_token(token) {
                kind = kind.with_access(access);
                if let Some(size) = rest.peek().and_then(|s| s.parse::<u64>().ok()) {
                    kind = kind.with_size(size);
                    rest.next();
                }
                break;
            }
        }

        let frames: Vec<String> = report
            .crash_state
            .iter()
            .map(|frame| normalize_symbol(frame))
            .filter(|frame| !frame.is_empty())
            .collect();
        if frames.is_empty() {
            return Err(SignatureError::Unparsable(
                "report has no crash state".to_string(),
            ));
        }

        let sanitizer = Some(normalize_sanitizer(
            report.sanitizer.as_deref(),
            report.job_type.as_deref(),
        ));
        Ok(CrashSignature::new(kind, frames, sanitizer))
    }

    /// Whether an observed signature agrees with the expected one.
    ///
    /// The observation is cut to the expectation's depth first.
    pub fn verify(&self, observed: &CrashSignature, expected: &CrashSignature) -> bool {
        observed
            .truncated(expected.frames.len())
            .matches(expected)
    }
}
