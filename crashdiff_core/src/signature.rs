use serde::{Deserialize, Serialize};
use std::fmt;

/// Symbol prefixes of sanitizer runtime frames, which never identify a crash.
const RUNTIME_SYMBOL_PREFIXES: &[&str] = &[
    "__asan_",
    "__msan_",
    "__ubsan_",
    "__tsan_",
    "__hwasan_",
    "__sanitizer_",
    "__interceptor_",
];

const DEGRADED_CLASS: &str = "unparsed-fault";

/// Direction of the faulting memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Access {
    Read,
    Write,
}

impl Access {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "READ" => Some(Access::Read),
            "WRITE" => Some(Access::Write),
            _ => None,
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => f.write_str("READ"),
            Access::Write => f.write_str("WRITE"),
        }
    }
}

/// What kind of fault happened: a normalized class plus the access details
/// when the sanitizer reported them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrashKind {
    pub class: String,
    pub access: Option<Access>,
    pub size: Option<u64>,
}

impl CrashKind {
    /// Normalizes `class`: lower-cased, spaces turned into dashes, and the
    /// SEGV family (`SEGV`, `UNKNOWN`, `Null-dereference`) folded into `segv`.
    pub fn new(class: &str) -> Self {
        let normalized = class.trim().to_ascii_lowercase().replace(' ', "-");
        let class = if normalized == "unknown"
            || normalized.starts_with("segv")
            || normalized.starts_with("null-dereference")
        {
            "segv".to_string()
        } else {
            normalized
        };
        Self {
            class,
            access: None,
            size: None,
        }
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = Some(access);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Class must be equal; access and size only count when both sides know them.
    pub fn matches(&self, other: &CrashKind) -> bool {
        fn agree<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
        self.class == other.class
            && agree(&self.access, &other.access)
            && agree(&self.size, &other.size)
    }
}

impl fmt::Display for CrashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class)?;
        if let Some(access) = self.access {
            write!(f, " {access}")?;
        }
        if let Some(size) = self.size {
            write!(f, " {size}")?;
        }
        Ok(())
    }
}

/// Canonical fingerprint of one crash.
///
/// Equality covers the kind and the ordered frame list only; the sanitizer
/// that produced the report is informational. Addresses, offsets and thread
/// ids are never stored, so they cannot influence equality.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct CrashSignature {
    pub kind: CrashKind,
    pub frames: Vec<String>,
    pub sanitizer: Option<String>,
}

impl PartialEq for CrashSignature {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.frames == other.frames
    }
}

impl CrashSignature {
    pub fn new(kind: CrashKind, frames: Vec<String>, sanitizer: Option<String>) -> Self {
        Self {
            kind,
            frames,
            sanitizer,
        }
    }

    /// A placeholder for a fault whose report could not be parsed.
    pub fn degraded(sanitizer: Option<String>) -> Self {
        Self {
            kind: CrashKind::new(DEGRADED_CLASS),
            frames: Vec::new(),
            sanitizer,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.kind.class == DEGRADED_CLASS
    }

    /// Keeps at most the top `depth` frames.
    pub fn truncated(&self, depth: usize) -> Self {
        Self {
            kind: self.kind.clone(),
            frames: self.frames.iter().take(depth).cloned().collect(),
            sanitizer: self.sanitizer.clone(),
        }
    }

    /// Tolerant comparison used for verdicts.
    ///
    /// Kinds must [`CrashKind::matches`] and frame lists must be equal in
    /// order. Degraded or frameless signatures match nothing.
    pub fn matches(&self, other: &CrashSignature) -> bool {
        !self.is_degraded()
            && !other.is_degraded()
            && !self.frames.is_empty()
            && !other.frames.is_empty()
            && self.kind.matches(&other.kind)
            && self.frames == other.frames
    }
}

impl fmt::Display for CrashSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.kind, self.frames.join(" <- "))
    }
}

/// Whether a stack frame belongs to a sanitizer runtime rather than the target.
pub fn is_runtime_frame(symbol: &str, location: &str) -> bool {
    RUNTIME_SYMBOL_PREFIXES
        .iter()
        .any(|prefix| symbol.starts_with(prefix))
        || location.contains("compiler-rt")
}

/// Reduces a demangled symbol to its bare qualified name.
///
/// `ns::Foo<int>::bar(char const*) const` becomes `ns::Foo::bar`, and
/// `(anonymous namespace)::` qualifiers are dropped.
pub fn normalize_symbol(symbol: &str) -> String {
    let symbol = symbol.replace("(anonymous namespace)::", "");
    let mut out = String::with_capacity(symbol.len());
    let mut angle = 0usize;
    let mut paren = 0usize;
    for c in symbol.chars() {
        match c {
            '<' => angle += 1,
            '>' if angle > 0 => angle -= 1,
            '(' => paren += 1,
            ')' if paren > 0 => paren -= 1,
            _ if angle == 0 && paren == 0 => out.push(c),
            _ => {}
        }
    }
    let out = out.trim();
    out.strip_suffix(" const").unwrap_or(out).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn segv_family_is_one_class() {
        assert_eq!(CrashKind::new("SEGV").class, "segv");
        assert_eq!(CrashKind::new("UNKNOWN").class, "segv");
        assert_eq!(CrashKind::new("Null-dereference").class, "segv");
        assert_eq!(
            CrashKind::new("Heap-buffer-overflow").class,
            "heap-buffer-overflow"
        );
    }

    #[test]
    fn kind_ignores_access_details_known_on_one_side_only() {
        let reported = CrashKind::new("UNKNOWN").with_access(Access::Write);
        let observed = CrashKind::new("SEGV").with_access(Access::Write).with_size(8);
        assert!(reported.matches(&observed));

        let other_direction = CrashKind::new("SEGV").with_access(Access::Read);
        assert!(!reported.matches(&other_direction));
    }

    #[test]
    fn matching_is_order_sensitive() {
        let kind = CrashKind::new("heap-buffer-overflow");
        let a = CrashSignature::new(kind.clone(), frames(&["a", "b", "c"]), None);
        let b = CrashSignature::new(kind, frames(&["b", "a", "c"]), None);
        assert!(!a.matches(&b), "Reordered frames must not match");
        assert_ne!(a, b);
    }

    #[test]
    fn equality_ignores_sanitizer() {
        let kind = CrashKind::new("heap-use-after-free");
        let a = CrashSignature::new(kind.clone(), frames(&["f"]), Some("address".into()));
        let b = CrashSignature::new(kind, frames(&["f"]), None);
        assert_eq!(a, b);
    }

    #[test]
    fn degraded_signature_matches_nothing() {
        let degraded = CrashSignature::degraded(Some("address".into()));
        assert!(degraded.is_degraded());
        assert!(!degraded.matches(&degraded.clone()));
    }

    #[test]
    fn normalizes_cpp_symbols() {
        assert_eq!(
            normalize_symbol("ns::Foo<int, std::vector<char> >::bar(char const*) const"),
            "ns::Foo::bar"
        );
        assert_eq!(
            normalize_symbol("(anonymous namespace)::Parser::step()"),
            "Parser::step"
        );
        assert_eq!(normalize_symbol("MqttClient_DecodePacket"), "MqttClient_DecodePacket");
    }

    #[test]
    fn detects_runtime_frames() {
        assert!(is_runtime_frame("__asan_memcpy", "/src/foo.c:1"));
        assert!(is_runtime_frame(
            "memcpy",
            "/src/llvm-project/compiler-rt/lib/asan/asan_interceptors.cpp:22"
        ));
        assert!(!is_runtime_frame("MqttProps_Free", "/src/wolfmqtt/src/mqtt_packet.c:10"));
    }
}
