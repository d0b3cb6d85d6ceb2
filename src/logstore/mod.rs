//! Append-only, span-indexed log buffer with retroactive secret scrubbing
//! (spec.md §4.1).

use serde::{Deserialize, Serialize};

use crate::domain::ManifestName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One appended log segment. `checkpoint` is this segment's position in the
/// store, handed back by `append` so a caller can later scrub from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSegment {
    pub checkpoint: usize,
    pub manifest_name: Option<ManifestName>,
    pub span_id: String,
    pub level: LogLevel,
    pub fields: Vec<(String, String)>,
    pub text: String,
}

/// The single authoritative, in-memory log stream. Component-level loggers
/// are adapters that ultimately call `append` (in the real system, via a
/// `LogAction` dispatched through the reducer).
#[derive(Debug, Default)]
pub struct LogStore {
    segments: Vec<LogSegment>,
    min_secret_len: usize,
}

impl LogStore {
    pub fn new(min_secret_len: usize) -> Self {
        Self {
            segments: Vec::new(),
            min_secret_len,
        }
    }

    pub fn append(
        &mut self,
        manifest_name: Option<ManifestName>,
        span_id: impl Into<String>,
        level: LogLevel,
        fields: Vec<(String, String)>,
        text: impl Into<String>,
    ) -> usize {
        let checkpoint = self.segments.len();
        let span_id = span_id.into();
        let text = text.into();

        let _span = tracing::info_span!("build", span_id = %span_id).entered();
        match level {
            LogLevel::Debug => tracing::debug!(%span_id, "{text}"),
            LogLevel::Info => tracing::info!(%span_id, "{text}"),
            LogLevel::Warn => tracing::warn!(%span_id, "{text}"),
            LogLevel::Error => tracing::error!(%span_id, "{text}"),
        }

        self.segments.push(LogSegment {
            checkpoint,
            manifest_name,
            span_id,
            level,
            fields,
            text,
        });
        checkpoint
    }

    pub fn span_log(&self, span_id: &str) -> String {
        self.segments
            .iter()
            .filter(|s| s.span_id == span_id)
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn manifest_log(&self, name: &ManifestName) -> String {
        self.segments
            .iter()
            .filter(|s| s.manifest_name.as_ref() == Some(name))
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }

    /// All text from `checkpoint` (inclusive) forward, in append order.
    pub fn continuing_string(&self, checkpoint: usize) -> String {
        self.segments
            .iter()
            .filter(|s| s.checkpoint >= checkpoint)
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Rewrites every byte range matching a literal secret value in segments
    /// at-or-after `checkpoint`, leaving a redaction marker. Secrets shorter
    /// than `min_secret_len` are left alone.
    pub fn scrub_secrets_starting_at(&mut self, secrets: &[String], checkpoint: usize) {
        let candidates: Vec<&String> = secrets
            .iter()
            .filter(|s| s.len() >= self.min_secret_len)
            .collect();
        if candidates.is_empty() {
            return;
        }
        for segment in self.segments.iter_mut().filter(|s| s.checkpoint >= checkpoint) {
            for secret in &candidates {
                if segment.text.contains(secret.as_str()) {
                    segment.text = segment.text.replace(secret.as_str(), "[scrubbed secret]");
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuing_string_only_includes_later_segments() {
        let mut store = LogStore::new(4);
        store.append(None, "s1", LogLevel::Info, vec![], "first ");
        let checkpoint = store.len();
        store.append(None, "s1", LogLevel::Info, vec![], "second");
        assert_eq!(store.continuing_string(checkpoint), "second");
        assert_eq!(store.continuing_string(0), "first second");
    }

    #[test]
    fn scrubbing_respects_minimum_length_and_checkpoint() {
        let mut store = LogStore::new(4);
        store.append(None, "s1", LogLevel::Info, vec![], "token=abc");
        let checkpoint = store.len();
        store.append(None, "s1", LogLevel::Info, vec![], "token=abcd1234");

        store.scrub_secrets_starting_at(&["abc".to_string(), "abcd1234".to_string()], checkpoint);

        assert_eq!(store.continuing_string(0), "token=abctoken=[scrubbed secret]");
    }

    #[test]
    fn manifest_log_filters_by_manifest() {
        let mut store = LogStore::new(4);
        let foo = ManifestName::new("foo");
        let bar = ManifestName::new("bar");
        store.append(Some(foo.clone()), "s1", LogLevel::Info, vec![], "foo line\n");
        store.append(Some(bar), "s2", LogLevel::Info, vec![], "bar line\n");
        assert_eq!(store.manifest_log(&foo), "foo line\n");
    }
}
