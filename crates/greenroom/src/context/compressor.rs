//! Multi-format content compression.
//!
//! The compressor shrinks context segments toward a token target while
//! preserving the parts an agent needs most:
//!
//! - Rust source: imports verbatim, signatures always, bodies elided at
//!   higher levels
//! - Test source: fixtures and a bounded sample of assertions survive
//! - Markdown: headings preserved, paragraph bodies reduced per level
//! - JSON: values beyond a depth bound replaced by a type schema
//! - Config/text: comments and section headers preserved, values type-tagged
//!
//! Compression never fails a request: structural parse anomalies fall back
//! to generic text compression, and a final truncation safety net enforces
//! the token target when structure alone is not enough.

use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use regex::Regex;

use crate::context::token_estimator::TokenEstimator;
use crate::context::types::{
    CompressionEstimate, CompressionLevel, CompressionOutcome, ContentType,
};

// ============================================================================
// Constants
// ============================================================================

/// Percentage of lines kept from the head when omitting a middle section
const HEAD_RATIO: f64 = 0.6;

/// Placeholder emitted in place of an elided body
const BODY_PLACEHOLDER: &str = "{ /* ... */ }";

/// Marker appended when the truncation safety net fires
const TRUNCATION_MARKER: &str = "… [truncated to fit token budget]";

/// Maximum lines a signature may span before parsing gives up
const MAX_SIGNATURE_LINES: usize = 16;

/// Function signature detector (on a trimmed line)
static FN_SIG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(pub(\([^)]*\))?\s+)?(default\s+)?(const\s+)?(async\s+)?(unsafe\s+)?(extern\s+"[^"]*"\s+)?fn\s+[A-Za-z_][A-Za-z0-9_]*"#,
    )
    .expect("invalid fn signature regex")
});

/// Type declaration detector (on a trimmed line)
static TYPE_SIG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(pub(\([^)]*\))?\s+)?(struct|enum|union)\s+[A-Za-z_]")
        .expect("invalid type signature regex")
});

/// `key = value` / `key: value` detector for config-like lines
static KEY_VALUE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*[A-Za-z0-9_.\-]+\s*[:=])\s*(.+)$").expect("invalid key-value regex")
});

/// Estimator hook, injectable for planning and tests.
pub type EstimatorFn = Arc<dyn Fn(&str) -> usize + Send + Sync>;

// ============================================================================
// Configuration and Statistics
// ============================================================================

/// Tunables for the compressor.
#[derive(Debug, Clone)]
pub struct CompressorConfig {
    /// JSON nesting depth preserved before values become type tags
    pub json_schema_depth: usize,

    /// Array elements kept before summarizing as "N items"
    pub json_array_sample: usize,

    /// Assertions kept per test function before the count annotation
    pub assertion_sample: usize,

    /// List items kept per markdown list before sampling
    pub list_sample: usize,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            json_schema_depth: 2,
            json_array_sample: 3,
            assertion_sample: 5,
            list_sample: 5,
        }
    }
}

/// Rolling compression statistics.
#[derive(Debug, Clone, Default)]
pub struct CompressorStats {
    /// Number of compression invocations
    pub invocations: u64,

    /// Invocations where structural parsing fell back to generic handling
    pub fallbacks: u64,

    /// Total tokens seen before compression
    pub original_tokens: u64,

    /// Total tokens produced after compression
    pub compressed_tokens: u64,
}

impl CompressorStats {
    /// Average token ratio across all invocations; 1.0 when nothing was seen.
    pub fn average_ratio(&self) -> f64 {
        if self.original_tokens == 0 {
            1.0
        } else {
            self.compressed_tokens as f64 / self.original_tokens as f64
        }
    }
}

// ============================================================================
// ContextCompressor
// ============================================================================

/// Stateless-per-call content compressor with rolling statistics.
pub struct ContextCompressor {
    config: CompressorConfig,
    estimator: EstimatorFn,
    stats: Mutex<CompressorStats>,
}

impl Default for ContextCompressor {
    fn default() -> Self {
        Self::new(CompressorConfig::default())
    }
}

impl ContextCompressor {
    /// Create a compressor using the standard token estimator.
    pub fn new(config: CompressorConfig) -> Self {
        Self {
            config,
            estimator: Arc::new(TokenEstimator::estimate_tokens),
            stats: Mutex::new(CompressorStats::default()),
        }
    }

    /// Create a compressor with a custom token estimator.
    pub fn with_estimator(config: CompressorConfig, estimator: EstimatorFn) -> Self {
        Self {
            config,
            estimator,
            stats: Mutex::new(CompressorStats::default()),
        }
    }

    /// Snapshot of the rolling statistics.
    pub fn stats(&self) -> CompressorStats {
        self.stats.lock().clone()
    }

    /// Compress `content` according to its type and the requested level,
    /// optionally enforcing a hard token target.
    ///
    /// Never fails: parse anomalies degrade to generic compression, and an
    /// output that would be larger than the input is replaced by the input.
    /// Empty input returns `("", 1.0)`.
    pub fn compress(
        &self,
        content: &str,
        content_type: ContentType,
        level: CompressionLevel,
        target_tokens: Option<usize>,
    ) -> CompressionOutcome {
        if content.is_empty() {
            return CompressionOutcome::unchanged("");
        }

        let original_tokens = (self.estimator)(content);

        let mut text = if level == CompressionLevel::None {
            content.to_string()
        } else {
            match content_type {
                ContentType::RustSource => match self.compress_rust(content, level) {
                    Some(out) => out,
                    None => {
                        self.stats.lock().fallbacks += 1;
                        self.compress_generic(content, level)
                    }
                },
                ContentType::TestSource => self.compress_tests(content, level),
                ContentType::Markdown => self.compress_markdown(content, level),
                ContentType::Json => match self.compress_json(content, level) {
                    Some(out) => out,
                    None => {
                        self.stats.lock().fallbacks += 1;
                        self.compress_generic(content, level)
                    }
                },
                ContentType::Config | ContentType::Text => self.compress_generic(content, level),
            }
        };

        // Compression that enlarges content is pointless; keep the original.
        if target_tokens.is_none() && (self.estimator)(&text) >= original_tokens {
            text = content.to_string();
        }

        // Truncation safety net.
        if let Some(target) = target_tokens {
            if (self.estimator)(&text) > target {
                text = self.truncate_to_tokens(&text, target);
            }
        }

        let compressed_tokens = (self.estimator)(&text);
        {
            let mut stats = self.stats.lock();
            stats.invocations += 1;
            stats.original_tokens += original_tokens as u64;
            stats.compressed_tokens += compressed_tokens as u64;
        }

        CompressionOutcome::new(text, original_tokens, compressed_tokens)
    }

    /// Project the effect of compressing `content` without building the
    /// compressed text; used by the manager to plan segment budgets.
    pub fn estimate_compression_potential(
        &self,
        content: &str,
        content_type: ContentType,
        level: CompressionLevel,
    ) -> CompressionEstimate {
        if content.is_empty() || level == CompressionLevel::None {
            return CompressionEstimate {
                projected_ratio: 1.0,
                compressible_elements: Vec::new(),
            };
        }

        let mut elements = Vec::new();
        match content_type {
            ContentType::RustSource | ContentType::TestSource => {
                let fns = content.matches("fn ").count();
                if fns > 0 {
                    elements.push(format!("{fns} function bodies"));
                }
                let imports = content
                    .lines()
                    .filter(|l| l.trim_start().starts_with("use "))
                    .count();
                if imports > 0 {
                    elements.push(format!("{imports} import lines (preserved)"));
                }
                if content_type == ContentType::TestSource {
                    let asserts = content
                        .lines()
                        .filter(|l| l.trim_start().starts_with("assert"))
                        .count();
                    if asserts > 0 {
                        elements.push(format!("{asserts} assertions"));
                    }
                }
            }
            ContentType::Markdown => {
                let headings = content
                    .lines()
                    .filter(|l| l.trim_start().starts_with('#'))
                    .count();
                if headings > 0 {
                    elements.push(format!("{headings} headings (preserved)"));
                }
                let paragraphs = content
                    .split("\n\n")
                    .filter(|p| !p.trim().is_empty())
                    .count();
                if paragraphs > 0 {
                    elements.push(format!("{paragraphs} paragraphs"));
                }
            }
            ContentType::Json => {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(content) {
                    if let Some(obj) = value.as_object() {
                        elements.push(format!("{} top-level keys", obj.len()));
                    } else if let Some(arr) = value.as_array() {
                        elements.push(format!("array of {} items", arr.len()));
                    }
                }
            }
            ContentType::Config | ContentType::Text => {
                let kv = content
                    .lines()
                    .filter(|l| KEY_VALUE_REGEX.is_match(l))
                    .count();
                if kv > 0 {
                    elements.push(format!("{kv} key-value lines"));
                }
            }
        }

        let projected_ratio = if elements.is_empty() {
            1.0
        } else {
            match level {
                CompressionLevel::None => 1.0,
                CompressionLevel::Low => 0.9,
                CompressionLevel::Moderate => 0.6,
                CompressionLevel::High => 0.4,
                CompressionLevel::Extreme => 0.25,
            }
        };

        CompressionEstimate {
            projected_ratio,
            compressible_elements: elements,
        }
    }

    // ========================================================================
    // Rust Source Compression
    // ========================================================================

    /// Structural Rust compression. Returns `None` when the content does not
    /// scan cleanly (unbalanced braces, runaway signature), in which case the
    /// caller falls back to generic compression.
    fn compress_rust(&self, content: &str, level: CompressionLevel) -> Option<String> {
        let elide_fn_bodies = level >= CompressionLevel::Moderate;
        let elide_type_bodies = level >= CompressionLevel::High;
        let keep_docs = level < CompressionLevel::High;
        let signatures_only = level >= CompressionLevel::Extreme;

        if !elide_fn_bodies {
            // Low keeps docstrings and bodies intact.
            return Some(content.to_string());
        }

        let lines: Vec<&str> = content.lines().collect();
        let mut out: Vec<String> = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];
            let trimmed = line.trim_start();

            if Self::is_import_line(trimmed) {
                out.push(line.to_string());
                i += 1;
                continue;
            }

            if trimmed.starts_with("///") || trimmed.starts_with("//!") {
                if keep_docs {
                    out.push(line.to_string());
                }
                i += 1;
                continue;
            }

            if trimmed.starts_with("//") {
                if !signatures_only {
                    out.push(line.to_string());
                }
                i += 1;
                continue;
            }

            if FN_SIG_REGEX.is_match(trimmed) {
                i = self.elide_body(&lines, i, &mut out)?;
                continue;
            }

            if elide_type_bodies && TYPE_SIG_REGEX.is_match(trimmed) && !trimmed.ends_with(';') {
                i = self.elide_body(&lines, i, &mut out)?;
                continue;
            }

            if signatures_only && trimmed.is_empty() {
                i += 1;
                continue;
            }

            out.push(line.to_string());
            i += 1;
        }

        Some(out.join("\n"))
    }

    fn is_import_line(trimmed: &str) -> bool {
        trimmed.starts_with("use ")
            || trimmed.starts_with("pub use ")
            || trimmed.starts_with("extern crate ")
            || trimmed.starts_with("#![")
            || ((trimmed.starts_with("mod ") || trimmed.starts_with("pub mod "))
                && trimmed.ends_with(';'))
    }

    /// Emit a signature (possibly spanning lines) with its body replaced by a
    /// placeholder, returning the index of the first line after the body.
    fn elide_body(&self, lines: &[&str], start: usize, out: &mut Vec<String>) -> Option<usize> {
        // Find the line holding the opening brace (or a bodyless `;`).
        let limit = (start + MAX_SIGNATURE_LINES).min(lines.len());
        let mut sig_end = None;
        for (idx, line) in lines.iter().enumerate().take(limit).skip(start) {
            if line.contains('{') {
                sig_end = Some((idx, true));
                break;
            }
            if line.trim_end().ends_with(';') {
                sig_end = Some((idx, false));
                break;
            }
        }
        let (sig_end, has_body) = sig_end?;

        if !has_body {
            // Trait method declaration or similar; keep verbatim.
            for line in lines.iter().take(sig_end + 1).skip(start) {
                out.push(line.to_string());
            }
            return Some(sig_end + 1);
        }

        for line in lines.iter().take(sig_end).skip(start) {
            out.push(line.to_string());
        }
        let brace_line = lines[sig_end];
        let brace_pos = brace_line.find('{')?;
        out.push(format!("{}{}", &brace_line[..brace_pos], BODY_PLACEHOLDER));

        let end = Self::find_block_end(lines, sig_end, brace_pos)?;
        Some(end + 1)
    }

    /// Index of the line on which the brace opened at (`start_line`,
    /// `open_col`) closes. `None` when braces never balance.
    fn find_block_end(lines: &[&str], start_line: usize, open_col: usize) -> Option<usize> {
        let mut depth: i32 = 0;
        for (idx, line) in lines.iter().enumerate().skip(start_line) {
            let slice: &str = if idx == start_line {
                &line[open_col..]
            } else {
                line
            };
            for c in slice.chars() {
                match c {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(idx);
                        }
                    }
                    _ => {}
                }
            }
        }
        None
    }

    // ========================================================================
    // Test Source Compression
    // ========================================================================

    /// Assertion-aware test compression: fixtures stay, test bodies keep a
    /// bounded sample of assertions with a count annotation.
    fn compress_tests(&self, content: &str, level: CompressionLevel) -> String {
        if level < CompressionLevel::Moderate {
            return content.to_string();
        }

        let lines: Vec<&str> = content.lines().collect();
        let mut out: Vec<String> = Vec::new();
        let mut i = 0;
        let mut pending_test_attr = false;

        while i < lines.len() {
            let line = lines[i];
            let trimmed = line.trim_start();

            if trimmed.starts_with("#[") {
                pending_test_attr = pending_test_attr
                    || trimmed.contains("test")
                    || trimmed.contains("proptest");
                out.push(line.to_string());
                i += 1;
                continue;
            }

            if FN_SIG_REGEX.is_match(trimmed) && pending_test_attr {
                pending_test_attr = false;
                match self.compress_test_fn(&lines, i, level, &mut out) {
                    Some(next) => {
                        i = next;
                        continue;
                    }
                    None => {
                        // Scan failure: keep the rest untouched.
                        for rest in lines.iter().skip(i) {
                            out.push(rest.to_string());
                        }
                        return out.join("\n");
                    }
                }
            }

            if !trimmed.starts_with("#[") {
                pending_test_attr = pending_test_attr && trimmed.is_empty();
            }
            out.push(line.to_string());
            i += 1;
        }

        out.join("\n")
    }

    /// Compress one test function body, keeping setup and sampled assertions.
    fn compress_test_fn(
        &self,
        lines: &[&str],
        start: usize,
        level: CompressionLevel,
        out: &mut Vec<String>,
    ) -> Option<usize> {
        let limit = (start + MAX_SIGNATURE_LINES).min(lines.len());
        let mut brace = None;
        for (idx, line) in lines.iter().enumerate().take(limit).skip(start) {
            if line.contains('{') {
                brace = Some(idx);
                break;
            }
        }
        let brace_idx = brace?;
        let brace_pos = lines[brace_idx].find('{')?;
        let end = Self::find_block_end(lines, brace_idx, brace_pos)?;

        for line in lines.iter().take(brace_idx + 1).skip(start) {
            out.push(line.to_string());
        }

        let keep_setup = level <= CompressionLevel::Moderate;
        let mut kept_assertions = 0usize;
        let mut skipped_assertions = 0usize;
        let mut collapsed = false;

        for line in lines.iter().take(end).skip(brace_idx + 1) {
            let trimmed = line.trim_start();
            let is_assertion = trimmed.starts_with("assert")
                || trimmed.starts_with("prop_assert")
                || trimmed.starts_with("debug_assert");

            if is_assertion {
                if kept_assertions < self.config.assertion_sample {
                    out.push(line.to_string());
                    kept_assertions += 1;
                } else {
                    skipped_assertions += 1;
                }
            } else if keep_setup && (trimmed.starts_with("let ") || trimmed.starts_with("let(")) {
                out.push(line.to_string());
            } else if !collapsed && !trimmed.is_empty() {
                out.push("    // ...".to_string());
                collapsed = true;
            }
        }

        if skipped_assertions > 0 {
            out.push(format!("    // … (+{skipped_assertions} more assertions)"));
        }
        out.push(lines[end].to_string());
        Some(end + 1)
    }

    // ========================================================================
    // Markdown Compression
    // ========================================================================

    fn compress_markdown(&self, content: &str, level: CompressionLevel) -> String {
        let fence_max_lines = match level {
            CompressionLevel::None | CompressionLevel::Low => 50,
            CompressionLevel::Moderate => 20,
            CompressionLevel::High => 10,
            CompressionLevel::Extreme => 4,
        };

        let mut out: Vec<String> = Vec::new();
        let mut paragraph: Vec<&str> = Vec::new();
        let mut fence: Option<Vec<&str>> = None;

        for line in content.lines() {
            let trimmed = line.trim_start();

            if let Some(block) = fence.as_mut() {
                if trimmed.starts_with("```") {
                    let body = block.join("\n");
                    out.push(Self::compress_line_block(&body, fence_max_lines));
                    out.push(line.to_string());
                    fence = None;
                } else {
                    block.push(line);
                }
                continue;
            }

            if trimmed.starts_with("```") {
                self.flush_paragraph(&mut paragraph, level, &mut out);
                out.push(line.to_string());
                fence = Some(Vec::new());
                continue;
            }

            if trimmed.starts_with('#') {
                self.flush_paragraph(&mut paragraph, level, &mut out);
                out.push(line.to_string());
                continue;
            }

            if trimmed.is_empty() {
                self.flush_paragraph(&mut paragraph, level, &mut out);
                out.push(String::new());
                continue;
            }

            paragraph.push(line);
        }

        // Unterminated fence: emit what we collected.
        if let Some(block) = fence {
            out.push(Self::compress_line_block(&block.join("\n"), fence_max_lines));
        }
        self.flush_paragraph(&mut paragraph, level, &mut out);

        out.join("\n")
    }

    fn flush_paragraph(
        &self,
        paragraph: &mut Vec<&str>,
        level: CompressionLevel,
        out: &mut Vec<String>,
    ) {
        if paragraph.is_empty() {
            return;
        }
        let lines = std::mem::take(paragraph);

        let is_list = lines
            .iter()
            .all(|l| matches!(l.trim_start().chars().next(), Some('-') | Some('*') | Some('>')));

        if level < CompressionLevel::Moderate {
            out.extend(lines.iter().map(|l| l.to_string()));
            return;
        }

        if is_list {
            let keep = self.config.list_sample.min(lines.len());
            out.extend(lines.iter().take(keep).map(|l| l.to_string()));
            if lines.len() > keep {
                out.push(format!("… (+{} more items)", lines.len() - keep));
            }
            return;
        }

        if level >= CompressionLevel::Extreme {
            return;
        }

        let joined = lines.join(" ");
        let first = Self::first_sentence(&joined);
        if first.len() < joined.len() {
            out.push(format!("{first} …"));
        } else {
            out.push(joined);
        }
    }

    fn first_sentence(text: &str) -> String {
        match text.find(". ") {
            Some(pos) => text[..pos + 1].to_string(),
            None => text.to_string(),
        }
    }

    // ========================================================================
    // JSON Compression
    // ========================================================================

    /// Depth-bounded JSON schema-ification. `None` for invalid JSON.
    fn compress_json(&self, content: &str, level: CompressionLevel) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(content).ok()?;
        let depth = match level {
            CompressionLevel::None | CompressionLevel::Low => self.config.json_schema_depth + 2,
            CompressionLevel::Moderate => self.config.json_schema_depth,
            CompressionLevel::High => 1,
            CompressionLevel::Extreme => 0,
        };
        let shrunk = Self::schematize(&value, depth, self.config.json_array_sample);
        serde_json::to_string_pretty(&shrunk).ok()
    }

    fn schematize(value: &serde_json::Value, depth: usize, sample: usize) -> serde_json::Value {
        use serde_json::Value;

        if depth == 0 {
            return Value::String(Self::type_tag(value));
        }

        match value {
            Value::Object(map) => {
                let shrunk: serde_json::Map<String, Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), Self::schematize(v, depth - 1, sample)))
                    .collect();
                Value::Object(shrunk)
            }
            Value::Array(items) if items.len() > sample => {
                let mut shrunk: Vec<Value> = items
                    .iter()
                    .take(sample)
                    .map(|v| Self::schematize(v, depth - 1, sample))
                    .collect();
                shrunk.push(Value::String(format!("… {} items total", items.len())));
                Value::Array(shrunk)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| Self::schematize(v, depth - 1, sample))
                    .collect(),
            ),
            scalar => scalar.clone(),
        }
    }

    fn type_tag(value: &serde_json::Value) -> String {
        use serde_json::Value;
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(_) => "boolean".to_string(),
            Value::Number(_) => "number".to_string(),
            Value::String(_) => "string".to_string(),
            Value::Array(items) => format!("array({} items)", items.len()),
            Value::Object(map) => format!("object({} keys)", map.len()),
        }
    }

    // ========================================================================
    // Generic / Config Compression
    // ========================================================================

    fn compress_generic(&self, content: &str, level: CompressionLevel) -> String {
        let type_tag_values = level >= CompressionLevel::Moderate;

        let processed: Vec<String> = content
            .lines()
            .map(|line| {
                let trimmed = line.trim_start();
                let is_comment = trimmed.starts_with('#')
                    || trimmed.starts_with("//")
                    || trimmed.starts_with(';');
                let is_section = trimmed.starts_with('[') && trimmed.ends_with(']');

                if is_comment || is_section || !type_tag_values {
                    return line.to_string();
                }

                match KEY_VALUE_REGEX.captures(line) {
                    Some(caps) => {
                        let tag = Self::value_type_tag(caps[2].trim());
                        format!("{} <{}>", &caps[1], tag)
                    }
                    None => line.to_string(),
                }
            })
            .collect();

        let joined = processed.join("\n");
        match Self::max_lines_for(level) {
            Some(max) => Self::compress_line_block(&joined, max),
            None => joined,
        }
    }

    fn value_type_tag(value: &str) -> &'static str {
        if value.parse::<f64>().is_ok() {
            "number"
        } else if value == "true" || value == "false" {
            "boolean"
        } else if value.starts_with('[') {
            "list"
        } else if value.starts_with('{') {
            "table"
        } else {
            "string"
        }
    }

    fn max_lines_for(level: CompressionLevel) -> Option<usize> {
        match level {
            CompressionLevel::None => None,
            CompressionLevel::Low => Some(400),
            CompressionLevel::Moderate => Some(160),
            CompressionLevel::High => Some(64),
            CompressionLevel::Extreme => Some(24),
        }
    }

    /// Head/tail line compression with an explicit omission marker.
    fn compress_line_block(text: &str, max_lines: usize) -> String {
        let lines: Vec<&str> = text.lines().collect();
        let total = lines.len();
        if total <= max_lines {
            return text.to_string();
        }

        let head = ((max_lines as f64) * HEAD_RATIO).ceil() as usize;
        let head = head.min(total);
        let tail = max_lines.saturating_sub(head).min(total - head);
        let omitted = total - head - tail;

        let mut out: Vec<&str> = lines.iter().take(head).copied().collect();
        let marker = format!("... [{omitted} lines omitted] ...");
        let mut result: Vec<String> = out.drain(..).map(|s| s.to_string()).collect();
        result.push(marker);
        result.extend(lines.iter().skip(total - tail).map(|s| s.to_string()));
        result.join("\n")
    }

    // ========================================================================
    // Truncation Safety Net
    // ========================================================================

    /// Truncate at a line boundary so the result fits `target` tokens, with
    /// an explicit truncation marker appended.
    fn truncate_to_tokens(&self, text: &str, target: usize) -> String {
        let marker_cost = (self.estimator)(TRUNCATION_MARKER) + 1;
        let budget = target.saturating_sub(marker_cost);

        let mut out: Vec<&str> = Vec::new();
        let mut used = 0usize;
        for line in text.lines() {
            let cost = (self.estimator)(line) + 1;
            if used + cost > budget {
                break;
            }
            out.push(line);
            used += cost;
        }

        let mut result: Vec<String> = out.into_iter().map(|s| s.to_string()).collect();
        result.push(TRUNCATION_MARKER.to_string());
        result.join("\n")
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const RUST_SAMPLE: &str = r#"use std::collections::HashMap;
use serde::Serialize;

/// A widget registry.
pub struct Registry {
    widgets: HashMap<String, Widget>,
}

impl Registry {
    /// Look up a widget by name.
    pub fn lookup(&self, name: &str) -> Option<&Widget> {
        let key = name.trim();
        self.widgets.get(key)
    }

    pub fn insert(&mut self, name: String, widget: Widget) {
        self.widgets.insert(name, widget);
    }
}

fn helper(count: usize) -> usize {
    count * 2
}
"#;

    #[test]
    fn test_compress_empty_input() {
        let compressor = ContextCompressor::default();
        let outcome = compressor.compress(
            "",
            ContentType::RustSource,
            CompressionLevel::Moderate,
            None,
        );
        assert_eq!(outcome.text, "");
        assert_eq!(outcome.ratio, 1.0);
    }

    #[test]
    fn test_rust_moderate_preserves_imports_and_names() {
        let compressor = ContextCompressor::default();
        let outcome = compressor.compress(
            RUST_SAMPLE,
            ContentType::RustSource,
            CompressionLevel::Moderate,
            None,
        );

        assert!(outcome.text.contains("use std::collections::HashMap;"));
        assert!(outcome.text.contains("use serde::Serialize;"));
        assert!(outcome.text.contains("pub struct Registry"));
        assert!(outcome.text.contains("pub fn lookup"));
        assert!(outcome.text.contains("pub fn insert"));
        assert!(outcome.text.contains("fn helper"));
        // Bodies are elided
        assert!(outcome.text.contains(BODY_PLACEHOLDER));
        assert!(!outcome.text.contains("self.widgets.get(key)"));
        assert!(outcome.ratio < 1.0);
    }

    #[test]
    fn test_rust_low_keeps_bodies() {
        let compressor = ContextCompressor::default();
        let outcome = compressor.compress(
            RUST_SAMPLE,
            ContentType::RustSource,
            CompressionLevel::Low,
            None,
        );
        assert!(outcome.text.contains("self.widgets.get(key)"));
        assert_eq!(outcome.ratio, 1.0);
    }

    #[test]
    fn test_rust_high_drops_docs_and_type_bodies() {
        let compressor = ContextCompressor::default();
        let outcome = compressor.compress(
            RUST_SAMPLE,
            ContentType::RustSource,
            CompressionLevel::High,
            None,
        );
        assert!(!outcome.text.contains("A widget registry"));
        assert!(!outcome.text.contains("widgets: HashMap"));
        assert!(outcome.text.contains("pub struct Registry"));
    }

    #[test]
    fn test_rust_unbalanced_braces_falls_back() {
        let compressor = ContextCompressor::default();
        let broken = "pub fn broken() {\n    let x = 1;\n"; // no closing brace
        let outcome = compressor.compress(
            broken,
            ContentType::RustSource,
            CompressionLevel::Moderate,
            None,
        );
        // Fallback still returns a valid pair.
        assert!(outcome.ratio > 0.0 && outcome.ratio <= 1.0);
        assert_eq!(compressor.stats().fallbacks, 1);
    }

    #[test]
    fn test_mocked_estimator_ratio() {
        // Scenario: estimator reports 1000 tokens before and 600 after.
        let sample = RUST_SAMPLE.to_string();
        let original = sample.clone();
        let estimator: EstimatorFn = Arc::new(move |text: &str| {
            if text == original {
                1000
            } else {
                600
            }
        });
        let compressor = ContextCompressor::with_estimator(CompressorConfig::default(), estimator);
        let outcome = compressor.compress(
            &sample,
            ContentType::RustSource,
            CompressionLevel::Moderate,
            None,
        );
        assert!((outcome.ratio - 0.6).abs() < 1e-9);
        assert!(outcome.text.contains("use std::collections::HashMap;"));
        assert!(outcome.text.contains("pub struct Registry"));
        assert!(outcome.text.contains("fn helper"));
    }

    #[test]
    fn test_test_source_keeps_sampled_assertions() {
        let test_src = r#"use super::*;

fn setup() -> Registry {
    Registry::default()
}

#[test]
fn test_lookup_behavior() {
    let registry = setup();
    let value = registry.lookup("a");
    assert!(value.is_none());
    assert_eq!(registry.len(), 0);
    assert!(registry.is_empty());
    assert_eq!(registry.capacity(), 0);
    assert!(!registry.contains("a"));
    assert!(!registry.contains("b"));
    assert!(!registry.contains("c"));
}
"#;
        let compressor = ContextCompressor::default();
        let outcome = compressor.compress(
            test_src,
            ContentType::TestSource,
            CompressionLevel::Moderate,
            None,
        );

        // Fixture survives in full.
        assert!(outcome.text.contains("fn setup() -> Registry"));
        assert!(outcome.text.contains("Registry::default()"));
        // Sampled assertions plus count annotation.
        assert!(outcome.text.contains("assert!(value.is_none());"));
        assert!(outcome.text.contains("(+2 more assertions)"));
    }

    #[test]
    fn test_markdown_preserves_headings() {
        let md = "# Title\n\nFirst sentence here. Second sentence with more detail that gets dropped.\n\n## Section\n\nAnother paragraph. More trailing detail.\n";
        let compressor = ContextCompressor::default();
        let outcome = compressor.compress(
            md,
            ContentType::Markdown,
            CompressionLevel::Moderate,
            None,
        );
        assert!(outcome.text.contains("# Title"));
        assert!(outcome.text.contains("## Section"));
        assert!(outcome.text.contains("First sentence here."));
        assert!(!outcome.text.contains("gets dropped"));
        assert!(outcome.text.contains('…'));
    }

    #[test]
    fn test_json_schema_beyond_depth() {
        let json = r#"{"server": {"host": "example.com", "limits": {"rps": 500, "burst": 50}}, "items": [1, 2, 3, 4, 5, 6, 7]}"#;
        let compressor = ContextCompressor::default();
        let outcome = compressor.compress(
            json,
            ContentType::Json,
            CompressionLevel::Moderate,
            None,
        );

        // Depth 2: server.limits is replaced by a type tag.
        assert!(outcome.text.contains("object(2 keys)"));
        // Long array summarized.
        assert!(outcome.text.contains("7 items total"));
    }

    #[test]
    fn test_invalid_json_falls_back() {
        let compressor = ContextCompressor::default();
        let outcome = compressor.compress(
            "{not json at all",
            ContentType::Json,
            CompressionLevel::Moderate,
            None,
        );
        assert!(outcome.ratio > 0.0 && outcome.ratio <= 1.0);
        assert_eq!(compressor.stats().fallbacks, 1);
    }

    #[test]
    fn test_config_values_type_tagged() {
        let config = "# tuning\nmax_connections = 100\nverbose = true\nname = \"greenroom\"\n";
        let compressor = ContextCompressor::default();
        let outcome = compressor.compress(
            config,
            ContentType::Config,
            CompressionLevel::Moderate,
            None,
        );
        assert!(outcome.text.contains("# tuning"));
        assert!(outcome.text.contains("max_connections = <number>"));
        assert!(outcome.text.contains("verbose = <boolean>"));
        assert!(outcome.text.contains("name = <string>"));
    }

    #[test]
    fn test_truncation_safety_net() {
        let long_text: String = (0..500)
            .map(|i| format!("line number {i} with some filler text"))
            .collect::<Vec<_>>()
            .join("\n");
        let compressor = ContextCompressor::default();
        let outcome = compressor.compress(
            &long_text,
            ContentType::Text,
            CompressionLevel::None,
            Some(100),
        );

        assert!(outcome.text.contains(TRUNCATION_MARKER));
        assert!(TokenEstimator::estimate_tokens(&outcome.text) <= 120);
        // Truncation keeps whole lines.
        for line in outcome.text.lines() {
            assert!(line == TRUNCATION_MARKER || long_text.contains(line));
        }
    }

    #[test]
    fn test_estimate_compression_potential() {
        let compressor = ContextCompressor::default();
        let estimate = compressor.estimate_compression_potential(
            RUST_SAMPLE,
            ContentType::RustSource,
            CompressionLevel::Moderate,
        );
        assert!(estimate.projected_ratio < 1.0);
        assert!(estimate
            .compressible_elements
            .iter()
            .any(|e| e.contains("function bodies")));

        let empty = compressor.estimate_compression_potential(
            "",
            ContentType::Text,
            CompressionLevel::Moderate,
        );
        assert_eq!(empty.projected_ratio, 1.0);
        assert!(empty.compressible_elements.is_empty());
    }

    #[test]
    fn test_rolling_stats_accumulate() {
        let compressor = ContextCompressor::default();
        compressor.compress(
            RUST_SAMPLE,
            ContentType::RustSource,
            CompressionLevel::Moderate,
            None,
        );
        compressor.compress(
            "plain text content",
            ContentType::Text,
            CompressionLevel::Moderate,
            None,
        );

        let stats = compressor.stats();
        assert_eq!(stats.invocations, 2);
        assert!(stats.average_ratio() > 0.0);
        assert!(stats.average_ratio() <= 1.0);
    }

    #[test]
    fn test_line_block_compression_marks_omission() {
        let lines: Vec<String> = (0..100).map(|i| format!("line {i}")).collect();
        let text = lines.join("\n");
        let result = ContextCompressor::compress_line_block(&text, 50);

        assert!(result.contains("line 0"));
        assert!(result.contains("lines omitted"));
        assert!(result.contains("line 99"));
        assert!(!result.contains("line 50\n"));
    }
}
